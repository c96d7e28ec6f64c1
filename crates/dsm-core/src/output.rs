//! Writing framed samples to a byte stream.
//!
//! [`SampleOutputStream`] is a [`SampleClient`]: register it with any
//! [`SampleSource`](crate::SampleSource) and every sample it receives is
//! encoded as header + payload and written through an [`IoStream`].
//!
//! Each record is handed to the stream in one gathered write, so a record is
//! either buffered completely or not at all. On a non-blocking channel that
//! cannot keep up, records are discarded and counted rather than blocking the
//! producer.

use std::collections::BTreeMap;
use std::io::IoSlice;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use dsm_pool::{DsmTime, Sample, USECS_PER_SEC};

use crate::channel::IoChannel;
use crate::error::{DsmError, Result};
use crate::filter::DEFAULT_MAX_SAMPLE_LENGTH;
use crate::framing::{HeaderFormat, SampleHeader, MAX_HEADER_LEN};
use crate::iostream::IoStream;
use crate::preamble::StreamPreamble;
use crate::source::SampleClient;

const WARN_INTERVAL: u64 = 1000;

/// Writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Header format of written records.
    pub header_format: HeaderFormat,
    /// Compact-header epoch. When unset, the first sample's timestamp
    /// truncated to the whole second is used.
    pub epoch: Option<DsmTime>,
    /// Start the stream with a preamble.
    pub preamble: bool,
    /// Longest payload written. Keep it within the readers' filter
    /// `max_length`, or they resynchronise through the record.
    pub max_length: u32,
    /// Extra preamble property lines.
    pub properties: BTreeMap<String, String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            header_format: HeaderFormat::Full,
            epoch: None,
            preamble: true,
            max_length: DEFAULT_MAX_SAMPLE_LENGTH,
            properties: BTreeMap::new(),
        }
    }
}

/// Writer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Records accepted by the stream.
    pub samples_written: u64,
    /// Record bytes accepted, headers included.
    pub bytes_written: u64,
    /// Records dropped because the channel was not accepting output.
    pub discarded: u64,
    /// Records that could not be encoded in the header format.
    pub encode_errors: u64,
    /// A hard channel error stopped the writer.
    pub failed: bool,
}

struct OutputState<C: IoChannel> {
    iostream: IoStream<C>,
    epoch: Option<DsmTime>,
    preamble_pending: bool,
    stats: OutputStats,
}

impl<C: IoChannel> OutputState<C> {
    fn resolve_epoch(&mut self, first: Option<DsmTime>) -> DsmTime {
        *self.epoch.get_or_insert_with(|| {
            first.map_or(0, |t| t.div_euclid(USECS_PER_SEC) * USECS_PER_SEC)
        })
    }
}

/// Sample client that frames samples onto a channel.
pub struct SampleOutputStream<C: IoChannel> {
    name: String,
    format: HeaderFormat,
    max_length: usize,
    properties: BTreeMap<String, String>,
    state: Mutex<OutputState<C>>,
}

impl<C: IoChannel> SampleOutputStream<C> {
    /// Writer with default settings: full headers after a preamble.
    pub fn new(iostream: IoStream<C>) -> Self {
        Self::with_config(iostream, OutputConfig::default())
    }

    /// Writer with explicit settings.
    pub fn with_config(iostream: IoStream<C>, config: OutputConfig) -> Self {
        let name = format!("output:{}", iostream.name());
        Self {
            name,
            format: config.header_format,
            max_length: config.header_format.max_length().min(config.max_length as usize),
            properties: config.properties,
            state: Mutex::new(OutputState {
                iostream,
                epoch: config.epoch,
                preamble_pending: config.preamble,
                stats: OutputStats::default(),
            }),
        }
    }

    /// Header format of written records.
    pub fn header_format(&self) -> HeaderFormat {
        self.format
    }

    /// Longest payload this writer accepts.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Epoch in use, once known.
    pub fn epoch(&self) -> Option<DsmTime> {
        self.state.lock().epoch
    }

    /// Counters.
    pub fn stats(&self) -> OutputStats {
        self.state.lock().stats.clone()
    }

    /// Returns false when the preamble could not be buffered yet.
    fn write_preamble(&self, state: &mut OutputState<C>, first: Option<DsmTime>) -> Result<bool> {
        if !state.preamble_pending {
            return Ok(true);
        }
        let epoch = state.resolve_epoch(first);
        let mut preamble = StreamPreamble::new(self.format, epoch);
        preamble.properties = self.properties.clone();
        if state.iostream.write(&preamble.to_bytes(), false)? == 0 {
            return Ok(false);
        }
        debug!(name = %self.name, format = %self.format, epoch, "wrote stream preamble");
        state.preamble_pending = false;
        Ok(true)
    }

    fn write_sample(&self, state: &mut OutputState<C>, sample: &Sample) -> Result<bool> {
        if sample.len() > self.max_length {
            return Err(DsmError::SampleTooLong {
                length: sample.len(),
                max: self.max_length,
            });
        }
        if !self.write_preamble(state, Some(sample.timestamp()))? {
            return Ok(false);
        }
        let epoch = state.resolve_epoch(Some(sample.timestamp()));
        let mut header = [0u8; MAX_HEADER_LEN];
        let hlen = SampleHeader::for_sample(sample).encode(self.format, epoch, &mut header)?;
        let bufs = [IoSlice::new(&header[..hlen]), IoSlice::new(sample.data())];
        let n = state.iostream.write_vectored(&bufs, false)?;
        if n > 0 {
            state.stats.samples_written += 1;
            state.stats.bytes_written += n as u64;
        }
        Ok(n > 0)
    }

    /// Write out buffered records.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.stats.failed {
            return Ok(());
        }
        let state = &mut *state;
        self.write_preamble(state, None)?;
        state.iostream.flush()
    }

    /// Flush and close the channel.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !state.stats.failed {
            self.write_preamble(state, None)?;
        }
        state.iostream.close()
    }
}

impl<C: IoChannel> SampleClient for SampleOutputStream<C> {
    fn receive(&self, sample: &Sample) -> bool {
        let mut state = self.state.lock();
        if state.stats.failed {
            return false;
        }
        let state = &mut *state;
        match self.write_sample(state, sample) {
            Ok(true) => true,
            Ok(false) => {
                state.stats.discarded += 1;
                if state.stats.discarded % WARN_INTERVAL == 1 {
                    warn!(
                        name = %self.name,
                        discarded = state.stats.discarded,
                        "output not keeping up, discarding samples"
                    );
                }
                false
            }
            Err(e) if e.is_io() => {
                error!(name = %self.name, error = %e, "sample output failed");
                state.stats.failed = true;
                false
            }
            Err(e) => {
                state.stats.encode_errors += 1;
                if state.stats.encode_errors % WARN_INTERVAL == 1 {
                    warn!(
                        name = %self.name,
                        sample_id = %sample.id(),
                        error = %e,
                        "cannot encode sample"
                    );
                }
                false
            }
        }
    }

    fn finish(&self) {
        if let Err(e) = self.flush() {
            error!(name = %self.name, error = %e, "flush on finish failed");
            self.state.lock().stats.failed = true;
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::framing::FULL_HEADER_LEN;
    use crate::input::SampleInputStream;
    use dsm_pool::{SampleId, SampleType};
    use std::io;
    use tracing_test::traced_test;

    fn sample(t: DsmTime, payload: &[u8]) -> Sample {
        Sample::standalone(t, SampleId::new(1, 10), SampleType::Char, payload)
    }

    #[test]
    fn writes_preamble_then_records() {
        let ch = MockChannel::new("out");
        let h = ch.handle();
        let out = SampleOutputStream::new(IoStream::with_buffer_size(ch, 64));
        assert!(out.receive(&sample(1_700_000_000_500_000, b"abc")));
        out.flush().unwrap();

        let bytes = h.output();
        let preamble = StreamPreamble::new(HeaderFormat::Full, 1_700_000_000_000_000).to_bytes();
        assert!(bytes.starts_with(&preamble));
        assert_eq!(bytes.len(), preamble.len() + FULL_HEADER_LEN + 3);
        assert_eq!(out.stats().samples_written, 1);
    }

    #[test]
    fn compact_output_reads_back() {
        let ch = MockChannel::new("out");
        let h = ch.handle();
        let config = OutputConfig {
            header_format: HeaderFormat::Compact,
            ..OutputConfig::default()
        };
        let out = SampleOutputStream::with_config(IoStream::with_buffer_size(ch, 64), config);
        let t0 = 1_700_000_123_000_000;
        for i in 0..20 {
            assert!(out.receive(&sample(t0 + i * 1_000, &[i as u8; 5])));
        }
        out.close().unwrap();
        assert_eq!(out.epoch(), Some(1_700_000_123_000_000));

        let mut input = SampleInputStream::new(IoStream::new(MockChannel::from_bytes("in", &h.output())));
        let mut n = 0;
        while let Some(s) = input.read_sample().unwrap() {
            assert_eq!(s.timestamp(), t0 + n * 1_000);
            assert_eq!(s.data(), &[n as u8; 5]);
            n += 1;
        }
        assert_eq!(n, 20);
        assert_eq!(input.header_format(), HeaderFormat::Compact);
    }

    #[test]
    fn raw_output_without_preamble() {
        let ch = MockChannel::new("raw");
        let h = ch.handle();
        let config = OutputConfig {
            preamble: false,
            ..OutputConfig::default()
        };
        let out = SampleOutputStream::with_config(IoStream::new(ch), config);
        out.receive(&sample(5, b"x"));
        out.flush().unwrap();
        assert_eq!(h.output().len(), FULL_HEADER_LEN + 1);
    }

    #[test]
    #[traced_test]
    fn would_block_discards_and_counts() {
        let ch = MockChannel::new("slow");
        let h = ch.handle();
        let config = OutputConfig {
            preamble: false,
            ..OutputConfig::default()
        };
        // Capacity 40: two records of 18 bytes fill it.
        let out = SampleOutputStream::with_config(IoStream::with_buffer_size(ch, 20), config);
        for _ in 0..5 {
            h.push_write_would_block();
        }
        let results: Vec<bool> = (0..4).map(|t| out.receive(&sample(t, b"z"))).collect();
        assert_eq!(results, vec![true, true, false, false]);
        let stats = out.stats();
        assert_eq!(stats.samples_written, 2);
        assert_eq!(stats.discarded, 2);
        assert!(!stats.failed);
        assert!(logs_contain("output not keeping up"));
    }

    #[test]
    fn hard_error_fails_the_writer() {
        let ch = MockChannel::new("broken");
        let h = ch.handle();
        let config = OutputConfig {
            preamble: false,
            ..OutputConfig::default()
        };
        let out = SampleOutputStream::with_config(IoStream::with_buffer_size(ch, 20), config);
        h.push_write_error(io::ErrorKind::BrokenPipe);
        assert!(out.receive(&sample(1, b"a")));
        assert!(out.receive(&sample(2, b"b")));
        // Third record forces a physical write, which fails.
        assert!(!out.receive(&sample(3, b"c")));
        assert!(out.stats().failed);
        assert!(!out.receive(&sample(4, b"d")));
    }

    #[test]
    #[traced_test]
    fn closed_writer_refuses_samples() {
        let ch = MockChannel::new("done");
        let h = ch.handle();
        let out = SampleOutputStream::new(IoStream::new(ch));
        assert!(out.receive(&sample(1_700_000_000_000_000, b"a")));
        out.close().unwrap();
        let written = h.output().len();

        assert!(matches!(out.flush(), Err(DsmError::ChannelClosed { .. })));
        assert!(!out.receive(&sample(1_700_000_000_000_001, b"b")));
        let stats = out.stats();
        assert!(stats.failed);
        assert_eq!(stats.samples_written, 1);
        assert_eq!(h.output().len(), written);
        assert!(logs_contain("is closed"));
        out.close().unwrap();
    }

    #[test]
    fn unencodable_samples_are_counted() {
        let config = OutputConfig {
            header_format: HeaderFormat::Compact,
            epoch: Some(1_000_000_000),
            preamble: false,
            ..OutputConfig::default()
        };
        let out = SampleOutputStream::with_config(IoStream::new(MockChannel::new("c")), config);
        assert!(!out.receive(&sample(0, b"early")));
        let long = Sample::standalone(2_000_000_000, SampleId::new(1, 1), SampleType::Char, &vec![0u8; 70_000]);
        assert!(!out.receive(&long));
        let stats = out.stats();
        assert_eq!(stats.encode_errors, 2);
        assert!(!stats.failed);
    }

    #[test]
    fn over_length_sample_is_refused_before_the_preamble() {
        let ch = MockChannel::new("out");
        let h = ch.handle();
        let out = SampleOutputStream::new(IoStream::new(ch));
        assert_eq!(out.max_length(), DEFAULT_MAX_SAMPLE_LENGTH as usize);
        let too_long = vec![0u8; DEFAULT_MAX_SAMPLE_LENGTH as usize + 1];
        assert!(!out.receive(&sample(1_700_000_000_000_000, &too_long)));
        assert_eq!(out.stats().encode_errors, 1);
        assert_eq!(out.epoch(), None);

        assert!(out.receive(&sample(1_700_000_005_000_000, b"ok")));
        out.flush().unwrap();
        assert_eq!(out.epoch(), Some(1_700_000_005_000_000));
        assert_eq!(out.stats().samples_written, 1);
        let preamble = StreamPreamble::new(HeaderFormat::Full, 1_700_000_005_000_000).to_bytes();
        assert!(h.output().starts_with(&preamble));
    }

    #[test]
    fn compact_format_caps_the_configured_length() {
        let config = OutputConfig {
            header_format: HeaderFormat::Compact,
            max_length: 100_000,
            ..OutputConfig::default()
        };
        let out = SampleOutputStream::with_config(IoStream::new(MockChannel::new("c")), config);
        assert_eq!(out.max_length(), 65_535);
    }
}
