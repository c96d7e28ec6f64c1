//! `dsm-core`
//!
//! Buffered sample I/O for DSM data acquisition: byte-stream channels, the
//! raw sample framing protocol, sample fan-out and time ordering.
//!
//! ## Data Flow
//!
//! ```text
//!  IoChannel ─▶ IoStream ─▶ SampleInputStream ─▶ SampleSorter ─▶ clients
//!  (device)     (buffer)     (header+payload)     (time order)    (archive,
//!                                                                  dispatch)
//! ```
//!
//! ## Key Types
//!
//! - [`IoStream`]: sliding-window buffer over an [`IoChannel`], atomic writes
//! - [`SampleInputStream`] / [`SampleOutputStream`]: framing reader and writer
//! - [`SampleSource`] / [`SampleClient`]: fan-out graph with reference-counted samples
//! - [`SampleSorter`]: bounded-memory time-ordering buffer with a flush thread
//! - [`SensorDispatcher`]: sample-id keyed routing to [`SampleProcessor`]s
//! - [`DsmError`]: error type; transient conditions are never errors
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dsm_core::{
//!     IoStream, MockChannel, SampleClient, SampleCollector, SampleInputStream,
//!     SampleOutputStream, SampleSource,
//! };
//! use dsm_pool::{Sample, SampleId, SampleType};
//!
//! # fn main() -> dsm_core::Result<()> {
//! let channel = MockChannel::new("loopback");
//! let wire = channel.handle();
//! let writer = SampleOutputStream::new(IoStream::new(channel));
//! writer.receive(&Sample::standalone(1_000, SampleId::new(1, 2), SampleType::Char, b"hi"));
//! writer.flush()?;
//!
//! let mut reader = SampleInputStream::new(IoStream::new(MockChannel::from_bytes("in", &wire.output())));
//! let sink = Arc::new(SampleCollector::new());
//! reader.add_sample_client(sink.clone());
//! reader.read_all()?;
//! assert_eq!(sink.samples()[0].data(), b"hi");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod framing;
pub mod input;
pub mod iostream;
pub mod output;
pub mod pipeline;
pub mod preamble;
pub mod sorter;
pub mod source;

pub use channel::{FileSetChannel, IoChannel, MockChannel, MockHandle, StreamChannel, DEFAULT_BUFFER_SIZE};
#[cfg(feature = "serial")]
pub use channel::{SerialChannel, SerialConfig};
pub use dispatch::{DispatchStats, SampleProcessor, SensorDispatcher};
pub use error::{DsmError, Result};
pub use filter::{HeaderFilter, SampleTypeName, DEFAULT_MAX_SAMPLE_LENGTH};
pub use framing::{HeaderFormat, SampleHeader, COMPACT_HEADER_LEN, FULL_HEADER_LEN, MAX_HEADER_LEN};
pub use input::{InputConfig, InputStats, PreambleMode, SampleInputStream};
pub use iostream::{IoStream, IoStreamConfig, DEFAULT_MAX_TIME_BETWEEN_WRITES};
pub use output::{OutputConfig, OutputStats, SampleOutputStream};
pub use pipeline::{PipelineConfig, PipelineStats, SamplePipeline};
pub use preamble::{StreamPreamble, ARCHIVE_VERSION, PREAMBLE_MAGIC};
pub use sorter::{ClockMode, OverflowPolicy, SampleSorter, SorterConfig, SorterState, SorterStats};
pub use source::{
    ClientFn, ClientHandle, DistributorStats, SampleClient, SampleCollector, SampleDistributor,
    SampleSource,
};
