//! Scripted in-memory channel.
//!
//! Reads are served from a queue of events (data, would-block, errors, new
//! input markers); writes are captured into a buffer. A cloneable
//! [`MockHandle`] gives tests access to both sides after the channel has been
//! moved into an [`IoStream`](crate::IoStream).

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{closed_error, IoChannel, DEFAULT_BUFFER_SIZE};

enum ReadEvent {
    Data(Vec<u8>),
    WouldBlock,
    Error(io::ErrorKind),
    NewInput,
}

enum WriteEvent {
    WouldBlock,
    Error(io::ErrorKind),
}

#[derive(Default)]
struct MockState {
    input: VecDeque<ReadEvent>,
    eof: bool,
    read_limit: Option<usize>,
    output: Vec<u8>,
    write_events: VecDeque<WriteEvent>,
    write_limit: Option<usize>,
    physical_reads: usize,
    physical_writes: usize,
    flushes: usize,
    closed: bool,
}

/// In-memory [`IoChannel`] driven by a script.
pub struct MockChannel {
    name: String,
    buffer_size: usize,
    new_input: bool,
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle to a [`MockChannel`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// Empty channel. With no scripted input, reads would block.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            new_input: false,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Channel that yields `data` and then end of file.
    pub fn from_bytes(name: impl Into<String>, data: &[u8]) -> Self {
        let channel = Self::new(name);
        let handle = channel.handle();
        handle.push_input(data);
        handle.set_eof(true);
        channel
    }

    /// Set the preferred transfer size.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Limit every physical read to `limit` bytes.
    #[must_use]
    pub fn with_read_limit(self, limit: usize) -> Self {
        self.state.lock().read_limit = Some(limit.max(1));
        self
    }

    /// Handle to script input and inspect output.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn write_slices(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error(&self.name));
        }
        match state.write_events.pop_front() {
            Some(WriteEvent::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(WriteEvent::Error(kind)) => return Err(kind.into()),
            None => {}
        }
        state.physical_writes += 1;
        let mut room = state.write_limit.unwrap_or(usize::MAX);
        let mut written = 0;
        for buf in bufs {
            let n = buf.len().min(room);
            state.output.extend_from_slice(&buf[..n]);
            written += n;
            room -= n;
            if room == 0 {
                break;
            }
        }
        Ok(written)
    }
}

impl IoChannel for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error(&self.name));
        }
        self.new_input = false;
        let mut marker = false;
        loop {
            match state.input.front_mut() {
                None => {
                    return if state.eof {
                        Ok(0)
                    } else {
                        Err(io::ErrorKind::WouldBlock.into())
                    };
                }
                Some(ReadEvent::NewInput) => {
                    marker = true;
                    state.input.pop_front();
                }
                Some(ReadEvent::WouldBlock) => {
                    state.input.pop_front();
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                Some(ReadEvent::Error(kind)) => {
                    let kind = *kind;
                    state.input.pop_front();
                    return Err(kind.into());
                }
                Some(ReadEvent::Data(_)) => break,
            }
        }
        let limit = state.read_limit.unwrap_or(usize::MAX);
        let Some(ReadEvent::Data(data)) = state.input.front_mut() else {
            return Ok(0);
        };
        let n = data.len().min(buf.len()).min(limit);
        buf[..n].copy_from_slice(&data[..n]);
        if n == data.len() {
            state.input.pop_front();
        } else {
            data.drain(..n);
        }
        state.physical_reads += 1;
        self.new_input = marker;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_slices(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.write_slices(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn is_new_input(&self) -> bool {
        self.new_input
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MockHandle {
    /// Queue bytes for reading. Empty slices are ignored.
    pub fn push_input(&self, data: &[u8]) {
        if !data.is_empty() {
            self.state.lock().input.push_back(ReadEvent::Data(data.to_vec()));
        }
    }

    /// Queue one would-block result.
    pub fn push_would_block(&self) {
        self.state.lock().input.push_back(ReadEvent::WouldBlock);
    }

    /// Queue one read error.
    pub fn push_read_error(&self, kind: io::ErrorKind) {
        self.state.lock().input.push_back(ReadEvent::Error(kind));
    }

    /// Mark the next queued data as the start of a new input.
    pub fn push_new_input(&self) {
        self.state.lock().input.push_back(ReadEvent::NewInput);
    }

    /// When set, an exhausted input reports end of file instead of would-block.
    pub fn set_eof(&self, eof: bool) {
        self.state.lock().eof = eof;
    }

    /// Accept at most `limit` bytes per physical write.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    /// Make the next physical write report would-block.
    pub fn push_write_would_block(&self) {
        self.state.lock().write_events.push_back(WriteEvent::WouldBlock);
    }

    /// Make the next physical write fail with `kind`.
    pub fn push_write_error(&self, kind: io::ErrorKind) {
        self.state.lock().write_events.push_back(WriteEvent::Error(kind));
    }

    /// Copy of everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }

    /// Take everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().output)
    }

    /// Number of successful physical reads.
    pub fn physical_reads(&self) -> usize {
        self.state.lock().physical_reads
    }

    /// Number of successful physical writes.
    pub fn physical_writes(&self) -> usize {
        self.state.lock().physical_writes
    }

    /// Number of `flush()` calls that reached the channel.
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// True once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
