//! Human-readable sample listing for `dsm dump`.
//!
//! One line per sample:
//!
//! ```text
//! 2024 01 15 12:00:00.125      10  1,2           8        1.5      -2.25
//! ```
//!
//! date and time (UTC), milliseconds since the previous listed sample,
//! `dsm,sps` id, payload length in bytes, then the payload rendered in the
//! selected [`DumpFormat`].

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write;

use chrono::DateTime;
use clap::ValueEnum;
use dsm_core::SampleClient;
use dsm_pool::{DsmTime, Sample, SampleId, SampleType, USECS_PER_MSEC};
use parking_lot::Mutex;
use tracing::warn;

/// Payload rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DumpFormat {
    /// Hex bytes
    Hex,
    /// Printable text, control characters escaped
    Ascii,
    /// Little-endian signed 16-bit words
    Signed,
    /// Little-endian unsigned 16-bit words
    Unsigned,
    /// Little-endian 32-bit floats
    Float,
    /// Chosen from each sample's element type
    #[default]
    Auto,
}

impl DumpFormat {
    fn for_type(sample_type: SampleType) -> Self {
        match sample_type {
            SampleType::Char => Self::Ascii,
            SampleType::UChar | SampleType::Unknown => Self::Hex,
            SampleType::Short => Self::Signed,
            SampleType::UShort => Self::Unsigned,
            SampleType::Float => Self::Float,
            // decoded through values_f64
            SampleType::Int32 | SampleType::UInt32 | SampleType::Double | SampleType::Int64 => Self::Auto,
        }
    }
}

/// Which samples a [`DumpClient`] lists.
#[derive(Debug, Clone, Default)]
pub struct DumpSelection {
    /// Exact ids; empty means all.
    pub ids: HashSet<SampleId>,
    /// Only this DSM.
    pub dsm_id: Option<u16>,
    /// Stop listing after this many samples.
    pub limit: Option<u64>,
}

impl DumpSelection {
    fn matches(&self, id: SampleId) -> bool {
        if self.dsm_id.is_some_and(|d| d != id.dsm_id()) {
            return false;
        }
        self.ids.is_empty() || self.ids.contains(&id)
    }
}

struct DumpState {
    out: Box<dyn Write + Send>,
    last_time: Option<DsmTime>,
    listed: u64,
    failed: bool,
}

/// Sample client that prints every selected sample.
pub struct DumpClient {
    format: DumpFormat,
    selection: DumpSelection,
    hex_ids: bool,
    state: Mutex<DumpState>,
}

impl DumpClient {
    /// List to `out`.
    pub fn new(out: Box<dyn Write + Send>, format: DumpFormat, selection: DumpSelection) -> Self {
        Self {
            format,
            selection,
            hex_ids: false,
            state: Mutex::new(DumpState {
                out,
                last_time: None,
                listed: 0,
                failed: false,
            }),
        }
    }

    /// Print SPS ids in hex.
    #[must_use]
    pub fn with_hex_ids(mut self, hex_ids: bool) -> Self {
        self.hex_ids = hex_ids;
        self
    }

    /// Column header line.
    pub fn write_header(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        writeln!(state.out, "|--- date time ---------|  deltaT   id        len bytes")
    }

    /// Samples listed so far.
    pub fn listed(&self) -> u64 {
        self.state.lock().listed
    }

    /// True once the selection limit has been reached.
    pub fn limit_reached(&self) -> bool {
        self.selection.limit.is_some_and(|l| self.listed() >= l)
    }

    fn format_line(&self, sample: &Sample, delta_ms: DsmTime) -> String {
        let mut line = String::with_capacity(64 + sample.len() * 3);
        match DateTime::from_timestamp_micros(sample.timestamp()) {
            Some(t) => {
                let _ = write!(line, "{}", t.format("%Y %m %d %H:%M:%S%.3f"));
            }
            None => {
                let _ = write!(line, "{:>23}", sample.timestamp());
            }
        }
        let _ = write!(line, " {delta_ms:>7} {:>2},", sample.dsm_id());
        if self.hex_ids {
            let _ = write!(line, "0x{:04x}", sample.sps_id());
        } else {
            let _ = write!(line, "{:<6}", sample.sps_id());
        }
        let _ = write!(line, " {:>7} ", sample.len());

        let format = match self.format {
            DumpFormat::Auto => DumpFormat::for_type(sample.sample_type()),
            other => other,
        };
        render_payload(&mut line, format, sample);
        line
    }
}

fn render_payload(line: &mut String, format: DumpFormat, sample: &Sample) {
    let data = sample.data();
    match format {
        DumpFormat::Hex => {
            for b in data {
                let _ = write!(line, "{b:02x} ");
            }
        }
        DumpFormat::Ascii => {
            let text = data
                .iter()
                .rposition(|&b| b != 0 && b != b'\n' && b != b'\r')
                .map_or(&data[..0], |end| &data[..=end]);
            line.extend(text.escape_ascii().map(char::from));
        }
        DumpFormat::Signed => {
            for w in data.chunks_exact(2) {
                let _ = write!(line, "{:>6} ", i16::from_le_bytes([w[0], w[1]]));
            }
        }
        DumpFormat::Unsigned => {
            for w in data.chunks_exact(2) {
                let _ = write!(line, "{:>6} ", u16::from_le_bytes([w[0], w[1]]));
            }
        }
        DumpFormat::Float => {
            for w in data.chunks_exact(4) {
                let _ = write!(line, "{:>10} ", f32::from_le_bytes([w[0], w[1], w[2], w[3]]));
            }
        }
        DumpFormat::Auto => {
            for v in sample.values_f64() {
                let _ = write!(line, "{v} ");
            }
        }
    }
    let trimmed = line.trim_end().len();
    line.truncate(trimmed);
}

impl SampleClient for DumpClient {
    fn receive(&self, sample: &Sample) -> bool {
        if !self.selection.matches(sample.id()) {
            return false;
        }
        let mut state = self.state.lock();
        if state.failed || self.selection.limit.is_some_and(|l| state.listed >= l) {
            return false;
        }
        let delta_ms = state
            .last_time
            .map_or(0, |prev| sample.timestamp().saturating_sub(prev) / USECS_PER_MSEC);
        let line = self.format_line(sample, delta_ms);
        if let Err(e) = writeln!(state.out, "{line}") {
            // Broken pipe from `dsm dump | head` lands here too
            warn!(error = %e, "dump output failed, no further samples will be listed");
            state.failed = true;
            return false;
        }
        state.last_time = Some(sample.timestamp());
        state.listed += 1;
        true
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        if let Err(e) = state.out.flush() {
            warn!(error = %e, "dump output flush failed");
        }
    }

    fn name(&self) -> &str {
        "dump"
    }
}
