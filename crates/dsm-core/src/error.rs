//! Error type for the sample I/O engine.
//!
//! `DsmError` covers the failures that callers must act on: hard I/O errors
//! from a channel, records that cannot be encoded, malformed stream preambles
//! and a sorter that can no longer accept data.
//!
//! Transient conditions are *not* errors. `io::ErrorKind::WouldBlock` and
//! `Interrupted` are absorbed by [`IoStream`](crate::IoStream) and reported as
//! "0 bytes", and protocol anomalies (bad headers, unknown type codes,
//! truncated trailing records, late or evicted samples) are counted and
//! logged at a throttled rate instead of being returned.

use thiserror::Error;

use dsm_pool::DsmTime;

/// Convenience alias for results using [`DsmError`].
pub type Result<T> = std::result::Result<T, DsmError>;

/// Primary error type of the sample I/O engine.
#[derive(Error, Debug)]
pub enum DsmError {
    /// Standard I/O operation failed on a channel or file.
    ///
    /// **Error Type**: Usually permanent for the channel (device unplugged,
    /// connection reset, permission denied). The `IoStream` itself stays
    /// usable; the caller decides whether to reopen the channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a channel that was already closed.
    #[error("channel '{name}' is closed")]
    ChannelClosed {
        /// Channel name.
        name: String,
    },

    /// Sample length cannot be represented in the selected header format.
    #[error("sample length {length} exceeds maximum {max}")]
    SampleTooLong {
        /// Payload length in bytes.
        length: usize,
        /// Largest length the writer accepts.
        max: usize,
    },

    /// Timestamp cannot be represented relative to the stream epoch.
    #[error("timestamp {timestamp} out of range for stream epoch {epoch}")]
    TimestampOutOfRange {
        /// Sample timestamp, microseconds since 1970.
        timestamp: DsmTime,
        /// Stream epoch, microseconds since 1970.
        epoch: DsmTime,
    },

    /// Stream preamble started but could not be parsed.
    #[error("invalid stream preamble: {0}")]
    InvalidPreamble(String),

    /// The sorter has been finished and no longer accepts samples.
    #[error("sorter '{0}' is stopped")]
    SorterStopped(String),

    /// A worker thread panicked.
    #[error("thread '{0}' panicked")]
    ThreadPanicked(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DsmError {
    /// True for errors caused by the underlying device or connection.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, DsmError::Io(_) | DsmError::ChannelClosed { .. })
    }
}
