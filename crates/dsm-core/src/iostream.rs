//! Buffered stream over an [`IoChannel`].
//!
//! `IoStream` batches physical reads and writes through a sliding-window
//! buffer of twice the channel's preferred transfer size:
//!
//! ```text
//!  0            tail               head              capacity
//!  |  consumed   |   available      |    free space    |
//! ```
//!
//! Compaction (moving `tail..head` to the front) happens only when free space
//! runs out, so its cost is amortised over many records. The buffer grows when
//! a single write is larger than the whole buffer and never shrinks.
//!
//! # Writes
//!
//! Writes are atomic-or-nothing: either the whole (possibly gathered) record is
//! copied into the buffer or nothing is and `Ok(0)` is returned, in which case
//! the caller retries later with the same record. Buffered data is written to
//! the channel once at least half the buffer is full or
//! `max_time_between_writes` has elapsed since the last physical write.
//!
//! # Transient conditions
//!
//! Would-block and interrupted channel calls count as zero bytes transferred.
//! Every other channel error is returned as [`DsmError::Io`]; the stream
//! itself stays usable.

use std::io::{self, IoSlice};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::IoChannel;
use crate::error::{DsmError, Result};

/// Default upper bound on the time buffered output may wait.
pub const DEFAULT_MAX_TIME_BETWEEN_WRITES: Duration = Duration::from_millis(250);

/// Attempts made by [`IoStream::flush`] before giving up on a stalled channel.
const FLUSH_TRIES: usize = 5;

/// Zero-byte writes between two warnings.
const WOULD_BLOCK_WARN_INTERVAL: u64 = 100;

/// Tunables for an [`IoStream`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IoStreamConfig {
    /// Preferred transfer size; the channel's own size is used when unset.
    pub buffer_size: Option<usize>,

    /// Longest time buffered output may wait before being written.
    #[serde(with = "humantime_serde")]
    pub max_time_between_writes: Duration,
}

impl Default for IoStreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            max_time_between_writes: DEFAULT_MAX_TIME_BETWEEN_WRITES,
        }
    }
}

/// Sliding-window buffered reader/writer over an [`IoChannel`].
pub struct IoStream<C> {
    channel: C,
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
    max_time_between_writes: Duration,
    last_write: Instant,
    new_input: bool,
    eof: bool,
    bytes_in: u64,
    bytes_out: u64,
    zero_writes: u64,
    closed: bool,
}

impl<C: IoChannel> IoStream<C> {
    /// Stream with a buffer of twice the channel's preferred size.
    pub fn new(channel: C) -> Self {
        let size = channel.buffer_size();
        Self::with_buffer_size(channel, size)
    }

    /// Stream with a buffer of `2 * buffer_size` bytes.
    pub fn with_buffer_size(channel: C, buffer_size: usize) -> Self {
        Self {
            channel,
            buffer: vec![0; buffer_size.max(1) * 2],
            head: 0,
            tail: 0,
            max_time_between_writes: DEFAULT_MAX_TIME_BETWEEN_WRITES,
            last_write: Instant::now(),
            new_input: false,
            eof: false,
            bytes_in: 0,
            bytes_out: 0,
            zero_writes: 0,
            closed: false,
        }
    }

    /// Stream configured from an [`IoStreamConfig`].
    pub fn with_config(channel: C, config: &IoStreamConfig) -> Self {
        let size = config.buffer_size.unwrap_or_else(|| channel.buffer_size());
        let mut stream = Self::with_buffer_size(channel, size);
        stream.max_time_between_writes = config.max_time_between_writes;
        stream
    }

    /// Set the longest time buffered output may wait.
    pub fn set_max_time_between_writes(&mut self, max: Duration) {
        self.max_time_between_writes = max;
    }

    /// Name of the underlying channel.
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Mutable access to the underlying channel.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Current buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes buffered: unread input, or output not yet written.
    pub fn available(&self) -> usize {
        self.head - self.tail
    }

    /// Unread bytes currently buffered.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.tail..self.head]
    }

    /// Mark `n` buffered bytes as read (bounded by [`available`](Self::available)).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available());
        self.tail += n;
        self.check();
    }

    /// True when the last physical read started a new input.
    pub fn is_new_input(&self) -> bool {
        self.new_input
    }

    /// True when the channel reported end of file and nothing is buffered.
    pub fn at_eof(&self) -> bool {
        self.eof && self.available() == 0
    }

    /// Total bytes physically read from the channel.
    pub fn num_input_bytes(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes physically written to the channel.
    pub fn num_output_bytes(&self) -> u64 {
        self.bytes_out
    }

    /// Physical writes that transferred nothing (would-block).
    pub fn num_would_block(&self) -> u64 {
        self.zero_writes
    }

    #[inline]
    fn check(&self) {
        debug_assert!(
            self.tail <= self.head && self.head <= self.buffer.len(),
            "IoStream cursors out of order: tail={} head={} capacity={}",
            self.tail,
            self.head,
            self.buffer.len()
        );
    }

    fn compact(&mut self) {
        if self.tail > 0 {
            self.buffer.copy_within(self.tail..self.head, 0);
            self.head -= self.tail;
            self.tail = 0;
        }
        self.check();
    }

    /// One physical read into the free space after compaction.
    fn fill(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.new_input = false;
        self.compact();
        if self.head == self.buffer.len() {
            return Ok(0);
        }
        let n = match self.channel.read(&mut self.buffer[self.head..]) {
            Ok(0) => {
                self.eof = true;
                0
            }
            Ok(n) => {
                self.eof = false;
                n
            }
            Err(e) if is_transient(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        if n > 0 && self.channel.is_new_input() {
            if self.available() > 0 {
                debug!(
                    name = self.channel.name(),
                    discarded = self.available(),
                    "new input, discarding rest of previous input"
                );
            }
            self.tail = self.head;
            self.new_input = true;
        }
        self.head += n;
        self.bytes_in += n as u64;
        self.check();
        Ok(n)
    }

    /// Do one physical read, but only if the buffer is empty.
    ///
    /// Returns the number of bytes read. `Ok(0)` means end of file, no data
    /// on a non-blocking channel, or data was already buffered; use
    /// [`at_eof`](Self::at_eof) to tell end of file apart.
    pub fn read(&mut self) -> Result<usize> {
        if self.available() > 0 {
            self.new_input = false;
            return Ok(0);
        }
        self.fill()
    }

    /// Copy up to `buf.len()` buffered bytes without any physical read.
    pub fn read_buf(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.available());
        buf[..n].copy_from_slice(&self.buffer[self.tail..self.tail + n]);
        self.tail += n;
        n
    }

    /// Read `buf.len()` bytes, doing as many physical reads as needed.
    ///
    /// Returns fewer bytes only at end of file or when the channel would block.
    pub fn read_exact_or_less(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = self.read_buf(buf);
        while done < buf.len() {
            if self.fill()? == 0 {
                break;
            }
            done += self.read_buf(&mut buf[done..]);
        }
        Ok(done)
    }

    /// Discard up to `n` bytes, doing physical reads as needed.
    pub fn skip(&mut self, n: usize) -> Result<usize> {
        let mut done = 0;
        loop {
            let step = (n - done).min(self.available());
            self.tail += step;
            done += step;
            if done == n || self.fill()? == 0 {
                break;
            }
        }
        Ok(done)
    }

    /// Copy bytes through the first `term` (inclusive) or until `buf` is full.
    ///
    /// If end of file, a would-block, or a new input is hit before the
    /// terminator, the partial fragment read so far is discarded and `Ok(0)`
    /// is returned. Line-oriented instrument protocols tolerate this; callers
    /// needing every byte should use [`read_exact_or_less`](Self::read_exact_or_less).
    pub fn read_until(&mut self, buf: &mut [u8], term: u8) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut out = 0;
        loop {
            while self.tail < self.head {
                let b = self.buffer[self.tail];
                self.tail += 1;
                buf[out] = b;
                out += 1;
                if b == term || out == buf.len() {
                    return Ok(out);
                }
            }
            let n = self.fill()?;
            if n == 0 || self.new_input {
                if out > 0 {
                    debug!(
                        name = self.channel.name(),
                        discarded = out,
                        "discarding unterminated fragment"
                    );
                }
                if n == 0 {
                    return Ok(0);
                }
                out = 0;
            }
        }
    }

    /// Push back up to `n` consumed bytes in front of the read cursor.
    ///
    /// Only bytes consumed since the last physical read can be restored;
    /// returns how many were.
    pub fn backup(&mut self, n: usize) -> usize {
        let n = n.min(self.tail);
        self.tail -= n;
        n
    }

    /// Atomic buffered write of one record. See [`write_vectored`](Self::write_vectored).
    pub fn write(&mut self, buf: &[u8], flush: bool) -> Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)], flush)
    }

    /// Atomic buffered write of a gathered record.
    ///
    /// Returns the record length when it was buffered, or `Ok(0)` when it did
    /// not fit even after writing out buffered data; pending bytes are left
    /// untouched in that case. With `flush`, buffered data is pushed to the
    /// channel after the record is accepted.
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flush: bool) -> Result<usize> {
        self.ensure_open()?;
        let tlen: usize = bufs.iter().map(|b| b.len()).sum();
        if tlen > self.buffer.len() {
            self.grow(tlen + self.available());
        }
        let halflen = self.buffer.len() / 2;

        let now = Instant::now();
        let mut wlen = self.available();
        if wlen >= halflen
            || (wlen > 0 && now.duration_since(self.last_write) >= self.max_time_between_writes)
        {
            // Streaming small records: write at most half a buffer per call.
            if tlen < halflen && wlen > halflen {
                wlen = halflen;
            }
            let n = self.write_pending(wlen, tlen)?;
            self.tail += n;
            if self.tail == self.head {
                self.tail = 0;
                self.head = 0;
            }
            self.last_write = now;
        }

        if self.buffer.len() - self.head < tlen {
            if self.tail == 0 {
                return Ok(0);
            }
            self.compact();
            if self.buffer.len() - self.head < tlen {
                return Ok(0);
            }
        }

        for buf in bufs {
            self.buffer[self.head..self.head + buf.len()].copy_from_slice(buf);
            self.head += buf.len();
        }
        self.check();
        if flush {
            self.flush()?;
        }
        Ok(tlen)
    }

    fn grow(&mut self, len: usize) {
        self.compact();
        debug!(
            name = self.channel.name(),
            from = self.buffer.len(),
            to = len,
            "growing IoStream buffer"
        );
        self.buffer.resize(len, 0);
    }

    /// One physical write of `len` pending bytes; would-block counts as 0.
    fn write_pending(&mut self, len: usize, record_len: usize) -> Result<usize> {
        let n = match self.channel.write(&self.buffer[self.tail..self.tail + len]) {
            Ok(n) => n,
            Err(e) if is_transient(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            self.zero_writes += 1;
            if self.zero_writes % WOULD_BLOCK_WARN_INTERVAL == 1 {
                warn!(
                    name = self.channel.name(),
                    would_block = self.zero_writes,
                    pending = len,
                    record_len,
                    "channel not accepting output"
                );
            }
        }
        self.bytes_out += n as u64;
        Ok(n)
    }

    /// Write out buffered data, then flush the channel.
    ///
    /// Makes a bounded number of attempts; data the channel keeps refusing
    /// with would-block stays buffered. Other errors are returned.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        for _ in 0..FLUSH_TRIES {
            let wlen = self.available();
            if wlen == 0 {
                break;
            }
            let n = self.write_pending(wlen, 0)?;
            self.tail += n;
            if self.tail == self.head {
                self.tail = 0;
                self.head = 0;
            }
        }
        match self.channel.flush() {
            Err(e) if !is_transient(&e) => return Err(e.into()),
            _ => {}
        }
        self.last_write = Instant::now();
        Ok(())
    }

    /// Flush buffered output and close the channel.
    ///
    /// Closing again does nothing. Reads, writes and flushes on a closed
    /// stream fail with [`DsmError::ChannelClosed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush();
        self.channel.close()?;
        self.closed = true;
        flushed
    }

    /// True once [`close`](Self::close) has succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DsmError::ChannelClosed {
                name: self.channel.name().to_string(),
            });
        }
        Ok(())
    }

    /// Recover the channel. Buffered data is dropped.
    pub fn into_inner(self) -> C {
        self.channel
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use tracing_test::traced_test;

    fn stream(data: &[u8], chunk: usize, size: usize) -> IoStream<MockChannel> {
        let ch = MockChannel::from_bytes("test", data).with_read_limit(chunk);
        IoStream::with_buffer_size(ch, size)
    }

    #[test]
    fn read_only_when_empty() {
        let mut s = stream(b"abcdef", 4, 8);
        assert_eq!(s.capacity(), 16);
        assert_eq!(s.read().unwrap(), 4);
        assert_eq!(s.read().unwrap(), 0);
        assert!(!s.at_eof());
        assert_eq!(s.buffered(), b"abcd");
        s.consume(4);
        assert_eq!(s.read().unwrap(), 2);
        s.consume(2);
        assert_eq!(s.read().unwrap(), 0);
        assert!(s.at_eof());
        assert_eq!(s.num_input_bytes(), 6);
    }

    #[test]
    fn read_exact_spans_physical_reads() {
        let mut s = stream(b"0123456789", 3, 4);
        let mut buf = [0u8; 7];
        assert_eq!(s.read_exact_or_less(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"0123456");
        assert_eq!(s.read_exact_or_less(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
        assert!(s.at_eof());
    }

    #[test]
    fn read_exact_stops_on_would_block() {
        let ch = MockChannel::new("nb");
        let h = ch.handle();
        h.push_input(b"ab");
        let mut s = IoStream::with_buffer_size(ch, 8);
        let mut buf = [0u8; 4];
        assert_eq!(s.read_exact_or_less(&mut buf).unwrap(), 2);
        assert!(!s.at_eof());
    }

    #[test]
    fn skip_and_read_buf() {
        let mut s = stream(b"0123456789", 4, 8);
        assert_eq!(s.skip(6).unwrap(), 6);
        let mut buf = [0u8; 8];
        assert_eq!(s.read_buf(&mut buf[..1]), 1);
        assert_eq!(buf[0], b'6');
        assert_eq!(s.read_exact_or_less(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
    }

    #[test]
    fn read_until_terminator_and_full_buffer() {
        let mut s = stream(b"line one\nsecond\n", 5, 8);
        let mut buf = [0u8; 32];
        let n = s.read_until(&mut buf, b'\n').unwrap();
        assert_eq!(&buf[..n], b"line one\n");
        let mut small = [0u8; 3];
        let n = s.read_until(&mut small, b'\n').unwrap();
        assert_eq!(&small[..n], b"sec");
        let n = s.read_until(&mut buf, b'\n').unwrap();
        assert_eq!(&buf[..n], b"ond\n");
    }

    #[test]
    fn read_until_discards_fragment_at_eof() {
        let mut s = stream(b"ok\npartial", 4, 8);
        let mut buf = [0u8; 32];
        assert_eq!(s.read_until(&mut buf, b'\n').unwrap(), 3);
        assert_eq!(s.read_until(&mut buf, b'\n').unwrap(), 0);
        assert!(s.at_eof());
    }

    #[test]
    fn read_until_discards_fragment_at_would_block() {
        let ch = MockChannel::new("nb");
        let h = ch.handle();
        h.push_input(b"abc");
        let mut s = IoStream::with_buffer_size(ch, 8);
        let mut buf = [0u8; 16];
        assert_eq!(s.read_until(&mut buf, b'\n').unwrap(), 0);
        h.push_input(b"def\n");
        let n = s.read_until(&mut buf, b'\n').unwrap();
        assert_eq!(&buf[..n], b"def\n");
    }

    #[test]
    fn backup_bounded_by_consumed() {
        let mut s = stream(b"abcdefgh", 8, 8);
        let mut buf = [0u8; 3];
        s.read_exact_or_less(&mut buf).unwrap();
        assert_eq!(s.backup(10), 3);
        assert_eq!(s.buffered(), b"abcdefgh");
        assert_eq!(s.backup(1), 0);
    }

    #[test]
    fn new_input_flag_follows_channel() {
        let ch = MockChannel::new("files");
        let h = ch.handle();
        h.push_input(b"one");
        h.push_new_input();
        h.push_input(b"two");
        h.set_eof(true);
        let mut s = IoStream::with_buffer_size(ch, 8);
        assert_eq!(s.read().unwrap(), 3);
        assert!(!s.is_new_input());
        s.consume(3);
        assert_eq!(s.read().unwrap(), 3);
        assert!(s.is_new_input());
        assert_eq!(s.buffered(), b"two");
    }

    #[test]
    fn hard_read_error_propagates_stream_usable() {
        let ch = MockChannel::new("err");
        let h = ch.handle();
        h.push_read_error(io::ErrorKind::ConnectionReset);
        h.push_input(b"x");
        let mut s = IoStream::with_buffer_size(ch, 8);
        assert!(s.read().unwrap_err().is_io());
        assert_eq!(s.read().unwrap(), 1);
    }

    #[test]
    fn small_writes_are_buffered_until_half_full() {
        let ch = MockChannel::new("out");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 8);
        s.set_max_time_between_writes(Duration::from_secs(3600));
        assert_eq!(s.write(b"abcd", false).unwrap(), 4);
        assert_eq!(s.write(b"efgh", false).unwrap(), 4);
        assert_eq!(h.physical_writes(), 0);
        // 8 pending >= half of 16: this call writes them first
        assert_eq!(s.write(b"ij", false).unwrap(), 2);
        assert_eq!(h.output(), b"abcdefgh");
        assert_eq!(s.available(), 2);
        s.flush().unwrap();
        assert_eq!(h.output(), b"abcdefghij");
        assert_eq!(s.num_output_bytes(), 10);
        assert_eq!(h.flushes(), 1);
    }

    #[test]
    fn elapsed_time_triggers_write() {
        let ch = MockChannel::new("out");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 64);
        s.set_max_time_between_writes(Duration::ZERO);
        s.write(b"a", false).unwrap();
        s.write(b"b", false).unwrap();
        assert_eq!(h.output(), b"a");
    }

    #[test]
    fn failed_write_leaves_pending_bytes_unchanged() {
        let ch = MockChannel::new("full");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 8);
        s.set_max_time_between_writes(Duration::from_secs(3600));
        assert_eq!(s.write(b"0123456", false).unwrap(), 7);
        let before = s.buffered().to_vec();

        // 7 pending < half, so no physical write; 10 more do not fit
        assert_eq!(s.write(b"ABCDEFGHIJ", false).unwrap(), 0);
        assert_eq!(s.buffered(), &before[..]);

        h.push_write_would_block();
        s.write(b"7", false).unwrap();
        // 8 pending >= half, write attempt blocks, record does not fit
        assert_eq!(s.write(b"ABCDEFGHIJ", false).unwrap(), 0);
        assert_eq!(s.buffered(), b"01234567");
        assert_eq!(s.num_would_block(), 1);
        assert_eq!(h.physical_writes(), 0);
    }

    #[test]
    fn vectored_write_is_contiguous() {
        let ch = MockChannel::new("vec");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 16);
        let n = s
            .write_vectored(&[IoSlice::new(b"head"), IoSlice::new(b"payload")], true)
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(h.output(), b"headpayload");
    }

    #[test]
    fn oversize_record_grows_buffer() {
        let ch = MockChannel::new("big");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 4);
        let record = vec![7u8; 100];
        assert_eq!(s.write(&record, true).unwrap(), 100);
        assert!(s.capacity() >= 100);
        assert_eq!(h.output(), record);
    }

    #[test]
    fn partial_channel_writes_are_resumed_by_flush() {
        let ch = MockChannel::new("slow");
        let h = ch.handle();
        h.set_write_limit(Some(3));
        let mut s = IoStream::with_buffer_size(ch, 16);
        s.write(b"abcdefghij", false).unwrap();
        s.flush().unwrap();
        // 5 tries of 3 bytes
        assert_eq!(h.output(), b"abcdefghij");
    }

    #[test]
    fn flush_propagates_hard_errors() {
        let ch = MockChannel::new("broken");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 16);
        s.write(b"abc", false).unwrap();
        h.push_write_error(io::ErrorKind::BrokenPipe);
        assert!(s.flush().is_err());
        assert_eq!(s.available(), 3);
        s.flush().unwrap();
        assert_eq!(h.output(), b"abc");
    }

    #[test]
    #[traced_test]
    fn would_block_is_warned_not_failed() {
        let ch = MockChannel::new("stalled");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 16);
        s.write(b"abc", false).unwrap();
        h.push_write_would_block();
        h.push_write_would_block();
        s.flush().unwrap();
        assert_eq!(s.num_would_block(), 2);
        assert!(logs_contain("channel not accepting output"));
        assert_eq!(h.output(), b"abc");
    }

    #[test]
    fn close_flushes_and_closes() {
        let ch = MockChannel::new("c");
        let h = ch.handle();
        let mut s = IoStream::with_buffer_size(ch, 16);
        s.write(b"bye", false).unwrap();
        s.close().unwrap();
        assert_eq!(h.output(), b"bye");
        assert!(h.is_closed());
    }

    #[test]
    fn closed_stream_refuses_io() {
        let ch = MockChannel::from_bytes("gone", b"unread");
        let mut s = IoStream::with_buffer_size(ch, 16);
        s.close().unwrap();
        assert!(s.is_closed());
        assert!(matches!(s.write(b"x", false), Err(DsmError::ChannelClosed { name }) if name == "gone"));
        assert!(matches!(s.flush(), Err(DsmError::ChannelClosed { .. })));
        assert!(matches!(s.read(), Err(DsmError::ChannelClosed { .. })));
        s.close().unwrap();
    }

    #[test]
    fn config_defaults_round_trip() {
        let cfg: IoStreamConfig = toml::from_str("max_time_between_writes = \"1s\"").unwrap();
        assert_eq!(cfg.max_time_between_writes, Duration::from_secs(1));
        assert_eq!(cfg.buffer_size, None);
        let s = IoStream::with_config(MockChannel::new("c").with_buffer_size(32), &cfg);
        assert_eq!(s.capacity(), 64);
    }
}
