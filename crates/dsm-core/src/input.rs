//! Reading framed samples from a byte stream.
//!
//! [`SampleInputStream`] pulls bytes through an [`IoStream`] and runs them
//! through a small state machine:
//!
//! ```text
//!  Probe ──magic line──▶ Preamble ──"end header"──▶ Header ◀──────┐
//!    │                                               │            │
//!    └──────────── not a preamble ─────────────────▶ │ complete   │
//!                                                    ▼            │
//!                                                 Payload ── full ┘
//! ```
//!
//! Headers and payloads may be split across any number of physical reads.
//! A header that fails the [`HeaderFilter`] is not trusted: its first byte
//! is dropped and decoding resumes one byte further on, so the reader
//! resynchronises on the next plausible header after corruption.
//!
//! A record cut short by end of file is counted and dropped; the stream then
//! reports a clean end of data.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dsm_pool::{DsmTime, PooledSample, Sample, SamplePools, SampleType};

use crate::channel::IoChannel;
use crate::error::{DsmError, Result};
use crate::filter::HeaderFilter;
use crate::framing::{HeaderFormat, SampleHeader, MAX_HEADER_LEN};
use crate::iostream::IoStream;
use crate::preamble::{PreambleParser, StreamPreamble, MAX_PREAMBLE_LINE, PREAMBLE_MAGIC};
use crate::source::{SampleDistributor, SampleSource};

/// Anomalies between two warnings.
const WARN_INTERVAL: u64 = 1000;

/// How a reader treats the optional stream preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreambleMode {
    /// Parse a preamble when the stream starts with the magic line.
    #[default]
    Auto,
    /// Treat every byte as sample data.
    Never,
}

/// Reader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Header format when the stream has no preamble.
    pub header_format: HeaderFormat,
    /// Compact-header epoch when the stream has no preamble.
    pub epoch: DsmTime,
    /// Preamble handling.
    pub preamble: PreambleMode,
    /// Header plausibility screen.
    pub filter: HeaderFilter,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            header_format: HeaderFormat::Full,
            epoch: 0,
            preamble: PreambleMode::Auto,
            filter: HeaderFilter::default(),
        }
    }
}

/// Reader counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputStats {
    /// Complete samples decoded.
    pub samples_read: u64,
    /// Headers rejected by the filter (one per resync step).
    pub bad_headers: u64,
    /// Samples delivered with an unknown type code.
    pub unrecognized_types: u64,
    /// Partial records dropped at end of file.
    pub truncated_records: u64,
    /// Preambles parsed.
    pub preambles: u64,
    /// Bytes read from the channel.
    pub bytes_read: u64,
}

enum DecodeState {
    Probe { matched: usize },
    Preamble { line: Vec<u8>, parser: PreambleParser },
    Header,
    Payload { sample: PooledSample, filled: usize },
}

/// Byte-at-a-time framing state machine, independent of any I/O.
struct FrameDecoder {
    config: InputConfig,
    format: HeaderFormat,
    epoch: DsmTime,
    state: DecodeState,
    header: [u8; MAX_HEADER_LEN],
    have: usize,
    pools: Option<Arc<SamplePools>>,
    preamble: Option<StreamPreamble>,
    stats: InputStats,
}

impl FrameDecoder {
    fn new(config: InputConfig, pools: Option<Arc<SamplePools>>) -> Self {
        let mut decoder = Self {
            format: config.header_format,
            epoch: config.epoch,
            config,
            state: DecodeState::Header,
            header: [0; MAX_HEADER_LEN],
            have: 0,
            pools,
            preamble: None,
            stats: InputStats::default(),
        };
        decoder.restart();
        decoder
    }

    fn initial_state(&self) -> DecodeState {
        match self.config.preamble {
            PreambleMode::Auto => DecodeState::Probe { matched: 0 },
            PreambleMode::Never => DecodeState::Header,
        }
    }

    /// Forget any partial record and expect a new stream.
    fn restart(&mut self) {
        self.format = self.config.header_format;
        self.epoch = self.config.epoch;
        self.have = 0;
        self.state = self.initial_state();
    }

    fn has_partial(&self) -> bool {
        match &self.state {
            DecodeState::Probe { matched } => *matched > 0,
            DecodeState::Header => self.have > 0,
            DecodeState::Preamble { .. } | DecodeState::Payload { .. } => true,
        }
    }

    /// End of file: drop and count a partial record.
    fn end_of_input(&mut self) {
        if self.has_partial() {
            self.stats.truncated_records += 1;
            warn!(
                truncated = self.stats.truncated_records,
                "dropping partial record at end of input"
            );
            self.have = 0;
            self.state = DecodeState::Header;
        }
    }

    fn feed(&mut self, mut input: &[u8], out: &mut VecDeque<Sample>) -> Result<()> {
        while let Some(&byte) = input.first() {
            match &mut self.state {
                DecodeState::Probe { matched } => {
                    if byte == PREAMBLE_MAGIC[*matched] {
                        *matched += 1;
                        input = &input[1..];
                        if *matched == PREAMBLE_MAGIC.len() {
                            self.state = DecodeState::Preamble {
                                line: Vec::new(),
                                parser: PreambleParser::default(),
                            };
                        }
                    } else {
                        // Not a preamble: the bytes matched so far are sample data.
                        let replay = &PREAMBLE_MAGIC[..*matched];
                        self.state = DecodeState::Header;
                        self.have = 0;
                        self.feed(replay, out)?;
                    }
                }
                DecodeState::Preamble { line, parser } => {
                    input = &input[1..];
                    if byte != b'\n' {
                        if line.len() >= MAX_PREAMBLE_LINE {
                            self.state = DecodeState::Header;
                            return Err(DsmError::InvalidPreamble("preamble line too long".into()));
                        }
                        line.push(byte);
                        continue;
                    }
                    let parsed = std::str::from_utf8(line.as_slice())
                        .map_err(|_| DsmError::InvalidPreamble("preamble is not ASCII".into()))
                        .and_then(|text| parser.line(text));
                    line.clear();
                    match parsed {
                        Ok(false) => {}
                        Ok(true) => {
                            let DecodeState::Preamble { parser, .. } =
                                std::mem::replace(&mut self.state, DecodeState::Header)
                            else {
                                continue;
                            };
                            self.apply_preamble(parser.finish());
                        }
                        Err(e) => {
                            self.state = DecodeState::Header;
                            return Err(e);
                        }
                    }
                }
                DecodeState::Header => {
                    let hlen = self.format.header_len();
                    let n = (hlen - self.have).min(input.len());
                    self.header[self.have..self.have + n].copy_from_slice(&input[..n]);
                    self.have += n;
                    input = &input[n..];
                    if self.have == hlen {
                        self.header_complete(out);
                    }
                }
                DecodeState::Payload { sample, filled } => {
                    let n = (sample.len() - *filled).min(input.len());
                    sample.data_mut()[*filled..*filled + n].copy_from_slice(&input[..n]);
                    *filled += n;
                    input = &input[n..];
                    if *filled == sample.len() {
                        if let DecodeState::Payload { sample, .. } =
                            std::mem::replace(&mut self.state, DecodeState::Header)
                        {
                            self.emit(sample, out);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_preamble(&mut self, preamble: StreamPreamble) {
        info!(
            format = %preamble.format,
            epoch = preamble.epoch,
            version = preamble.version,
            "sample stream preamble"
        );
        self.format = preamble.format;
        self.epoch = preamble.epoch;
        self.stats.preambles += 1;
        self.have = 0;
        self.preamble = Some(preamble);
    }

    fn header_complete(&mut self, out: &mut VecDeque<Sample>) {
        let hlen = self.format.header_len();
        let decoded = SampleHeader::decode(self.format, self.epoch, &self.header[..hlen]);
        let header = match decoded {
            Some(header) if self.config.filter.is_valid(&header) => header,
            rejected => {
                self.stats.bad_headers += 1;
                if self.stats.bad_headers % WARN_INTERVAL == 1 {
                    let reason = match &rejected {
                        Some(header) => self.config.filter.explain(header),
                        None => format!("time offset overflows epoch {}", self.epoch),
                    };
                    warn!(
                        bad_headers = self.stats.bad_headers,
                        reason = %reason,
                        "bad sample header, resynchronising"
                    );
                }
                // Slide the window one byte and wait for the next byte.
                self.header.copy_within(1..hlen, 0);
                self.have = hlen - 1;
                return;
            }
        };

        let sample_type = match header.sample_type() {
            Some(t) => t,
            None => {
                self.stats.unrecognized_types += 1;
                if self.stats.unrecognized_types % WARN_INTERVAL == 1 {
                    warn!(
                        type_code = header.type_code,
                        sample_id = %header.id,
                        count = self.stats.unrecognized_types,
                        "unrecognised sample type"
                    );
                }
                SampleType::Unknown
            }
        };

        let length = header.length as usize;
        let mut sample = match &self.pools {
            Some(pools) => pools.get_sample(sample_type, length),
            None => PooledSample::standalone(sample_type, length),
        };
        sample.set_timestamp(header.timestamp);
        sample.set_id(header.id);
        self.have = 0;
        if length == 0 {
            self.emit(sample, out);
        } else {
            self.state = DecodeState::Payload { sample, filled: 0 };
        }
    }

    fn emit(&mut self, sample: PooledSample, out: &mut VecDeque<Sample>) {
        self.stats.samples_read += 1;
        out.push_back(sample.freeze());
    }
}

/// Source of samples decoded from a byte-stream channel.
pub struct SampleInputStream<C: IoChannel> {
    iostream: IoStream<C>,
    decoder: FrameDecoder,
    pending: VecDeque<Sample>,
    distributor: SampleDistributor,
}

impl<C: IoChannel> SampleInputStream<C> {
    /// Reader with default settings and standalone (unpooled) samples.
    pub fn new(iostream: IoStream<C>) -> Self {
        Self::with_config(iostream, InputConfig::default(), None)
    }

    /// Reader with explicit settings, allocating samples from `pools`.
    pub fn with_config(
        iostream: IoStream<C>,
        config: InputConfig,
        pools: Option<Arc<SamplePools>>,
    ) -> Self {
        let name = format!("input:{}", iostream.name());
        debug!(name = %name, format = %config.header_format, "sample input stream created");
        Self {
            iostream,
            decoder: FrameDecoder::new(config, pools),
            pending: VecDeque::new(),
            distributor: SampleDistributor::new(name),
        }
    }

    /// Header format currently in effect (from the preamble, if any).
    pub fn header_format(&self) -> HeaderFormat {
        self.decoder.format
    }

    /// Compact-header epoch currently in effect.
    pub fn epoch(&self) -> DsmTime {
        self.decoder.epoch
    }

    /// Most recent preamble read from the stream.
    pub fn preamble(&self) -> Option<&StreamPreamble> {
        self.decoder.preamble.as_ref()
    }

    /// Counters.
    pub fn stats(&self) -> InputStats {
        InputStats {
            bytes_read: self.iostream.num_input_bytes(),
            ..self.decoder.stats.clone()
        }
    }

    /// True once the channel is exhausted and every decoded sample was taken.
    pub fn at_eof(&self) -> bool {
        self.iostream.at_eof() && self.pending.is_empty()
    }

    /// The underlying stream.
    pub fn iostream(&self) -> &IoStream<C> {
        &self.iostream
    }

    /// One physical read, decoding everything it delivered into `pending`.
    fn fill(&mut self) -> Result<usize> {
        let n = self.iostream.read()?;
        if self.iostream.is_new_input() {
            if self.decoder.has_partial() {
                debug!(name = self.iostream.name(), "new input, dropping partial record");
            }
            self.decoder.restart();
        }
        let data = self.iostream.buffered();
        let len = data.len();
        let decoded = self.decoder.feed(data, &mut self.pending);
        self.iostream.consume(len);
        decoded?;
        if n == 0 && self.iostream.at_eof() {
            self.decoder.end_of_input();
        }
        Ok(n)
    }

    /// Do one physical read and distribute every sample it completed.
    ///
    /// Returns the number of samples distributed. Zero samples with
    /// [`at_eof`](Self::at_eof) false means no data was available yet.
    pub fn read_samples(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            self.fill()?;
        }
        let count = self.pending.len();
        for sample in self.pending.drain(..) {
            self.distributor.distribute(sample);
        }
        Ok(count)
    }

    /// Return the next sample, reading as needed.
    ///
    /// `Ok(None)` at end of file, or when a non-blocking channel has no data
    /// (check [`at_eof`](Self::at_eof)).
    pub fn read_sample(&mut self) -> Result<Option<Sample>> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Ok(Some(sample));
            }
            if self.fill()? == 0 {
                return Ok(self.pending.pop_front());
            }
        }
    }

    /// Skip samples earlier than `time`.
    ///
    /// Returns true when positioned at a sample with timestamp `>= time`,
    /// which is the next one returned or distributed.
    pub fn search(&mut self, time: DsmTime) -> Result<bool> {
        while let Some(sample) = self.read_sample()? {
            if sample.timestamp() >= time {
                self.pending.push_front(sample);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read and distribute until end of file, then ask clients to flush.
    ///
    /// Returns the number of samples distributed. Only suitable for blocking
    /// channels: on a non-blocking channel it spins while no data arrives.
    pub fn read_all(&mut self) -> Result<u64> {
        let mut total = 0u64;
        while !self.at_eof() {
            total += self.read_samples()? as u64;
        }
        self.distributor.flush();
        Ok(total)
    }

    /// Close the channel.
    pub fn close(&mut self) -> Result<()> {
        self.iostream.close()
    }
}

impl<C: IoChannel> SampleSource for SampleInputStream<C> {
    fn distributor(&self) -> &SampleDistributor {
        &self.distributor
    }
}
