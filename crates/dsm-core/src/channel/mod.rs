//! Byte-stream channels.
//!
//! An [`IoChannel`] is the only view the engine has of a device, file or
//! socket: a blocking or non-blocking byte stream with a preferred chunk size.
//! Kernel drivers, serial ports and network connections all look the same
//! from here.
//!
//! # Implementations
//!
//! - [`StreamChannel`]: any `Read + Write` type (files, pipes, `TcpStream`)
//! - [`FileSetChannel`]: a sequence of archive files read back to back
//! - [`MockChannel`]: scripted in-memory channel for tests and tools
//! - `SerialChannel` (feature `serial`): serial-attached instruments
//!
//! # Transient conditions
//!
//! `io::ErrorKind::WouldBlock` means "no data right now" and `Interrupted`
//! means "try again"; [`IoStream`](crate::IoStream) treats both as zero bytes
//! transferred. `Ok(0)` from [`IoChannel::read`] is end of file.

use std::io::{self, IoSlice, Read, Write};

mod file_set;
mod mock;
#[cfg(feature = "serial")]
mod serial;

pub use file_set::FileSetChannel;
pub use mock::{MockChannel, MockHandle};
#[cfg(feature = "serial")]
pub use serial::{SerialChannel, SerialConfig};

/// Default preferred physical read/write size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

// =============================================================================
// Channel Trait
// =============================================================================

/// A byte-stream device seen by an [`IoStream`](crate::IoStream).
pub trait IoChannel: Send {
    /// Read into `buf`. `Ok(0)` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Gathered write, returning the number of bytes accepted.
    ///
    /// The default writes the slices in order and stops at the first short
    /// write. An error after some bytes went out is left for the next call.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs.iter().filter(|b| !b.is_empty()) {
            match self.write(buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(_) if total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Push any data buffered below this channel to the device.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the device.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// True when the data returned by the last read starts a new input
    /// (next file of a set, reconnected socket): a discontinuity.
    fn is_new_input(&self) -> bool {
        false
    }

    /// Preferred physical transfer size.
    fn buffer_size(&self) -> usize {
        DEFAULT_BUFFER_SIZE
    }

    /// Human readable name, for logs.
    fn name(&self) -> &str;
}

impl<C: IoChannel + ?Sized> IoChannel for Box<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        (**self).write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn is_new_input(&self) -> bool {
        (**self).is_new_input()
    }

    fn buffer_size(&self) -> usize {
        (**self).buffer_size()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

pub(crate) fn closed_error(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("channel {name} is closed"))
}

// =============================================================================
// Stream Channel
// =============================================================================

/// Channel over any `Read + Write` stream.
///
/// Read-only sources such as files opened for reading fail on write with the
/// error the stream reports.
pub struct StreamChannel<T> {
    name: String,
    inner: Option<T>,
    buffer_size: usize,
}

impl<T: Read + Write + Send> StreamChannel<T> {
    /// Wrap `inner` using the default buffer size.
    pub fn new(name: impl Into<String>, inner: T) -> Self {
        Self::with_buffer_size(name, inner, DEFAULT_BUFFER_SIZE)
    }

    /// Wrap `inner` with an explicit preferred transfer size (minimum 1).
    pub fn with_buffer_size(name: impl Into<String>, inner: T, buffer_size: usize) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Borrow the wrapped stream, unless closed.
    pub fn get_ref(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    /// Unwrap the stream, unless closed.
    pub fn into_inner(self) -> Option<T> {
        self.inner
    }

    fn stream(&mut self) -> io::Result<&mut T> {
        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(closed_error(&self.name)),
        }
    }
}

impl<T: Read + Write + Send> IoChannel for StreamChannel<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream()?.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.flush()?;
        }
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stream_channel_reads_and_writes() {
        let mut ch = StreamChannel::with_buffer_size("cursor", Cursor::new(Vec::new()), 16);
        assert_eq!(ch.buffer_size(), 16);
        assert_eq!(ch.write(b"hello").unwrap(), 5);
        let written = ch.get_ref().unwrap().get_ref().clone();
        assert_eq!(written, b"hello");
    }

    #[test]
    fn stream_channel_closed_errors() {
        let mut ch = StreamChannel::new("cursor", Cursor::new(b"abc".to_vec()));
        ch.close().unwrap();
        let mut buf = [0u8; 4];
        let err = ch.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(ch.into_inner().is_none());
    }

    /// Accepts `room` bytes in total, then would-block.
    struct Limited {
        room: usize,
        written: Vec<u8>,
    }

    impl IoChannel for Limited {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.written.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn name(&self) -> &str {
            "limited"
        }
    }

    #[test]
    fn default_gathered_write_covers_every_slice() {
        let mut ch = Limited {
            room: 64,
            written: Vec::new(),
        };
        let bufs = [IoSlice::new(b"ab"), IoSlice::new(b""), IoSlice::new(b"cdef"), IoSlice::new(b"gh")];
        assert_eq!(ch.write_vectored(&bufs).unwrap(), 8);
        assert_eq!(ch.written, b"abcdefgh");
    }

    #[test]
    fn default_gathered_write_stops_when_short() {
        let mut ch = Limited {
            room: 5,
            written: Vec::new(),
        };
        let bufs = [IoSlice::new(b"ab"), IoSlice::new(b"cdef"), IoSlice::new(b"gh")];
        assert_eq!(ch.write_vectored(&bufs).unwrap(), 5);
        assert_eq!(ch.written, b"abcde");
        let err = ch.write_vectored(&bufs).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn boxed_channel_forwards() {
        let mut ch: Box<dyn IoChannel> =
            Box::new(StreamChannel::new("boxed", Cursor::new(b"xyz".to_vec())));
        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&mut buf).unwrap(), 3);
        assert_eq!(ch.name(), "boxed");
        assert!(!ch.is_new_input());
    }
}
