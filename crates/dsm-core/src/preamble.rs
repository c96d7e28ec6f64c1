//! ASCII preamble at the start of archive files and sample sockets.
//!
//! ```text
//! DSM SAMPLE STREAM
//! archive version: 1
//! header format: full
//! epoch: 1700000000000000
//! project: CAESAR
//! end header
//! ```
//!
//! The preamble is optional. A reader that does not find the magic line
//! treats the stream as raw samples in its configured header format.

use std::collections::BTreeMap;

use dsm_pool::DsmTime;

use crate::error::{DsmError, Result};
use crate::framing::HeaderFormat;

/// First line of every preamble, terminator included.
pub const PREAMBLE_MAGIC: &[u8] = b"DSM SAMPLE STREAM\n";

/// Archive version written by this crate.
pub const ARCHIVE_VERSION: u32 = 1;

/// Longest accepted preamble line.
pub const MAX_PREAMBLE_LINE: usize = 256;

const END_LINE: &str = "end header";

/// Parsed stream preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPreamble {
    /// Archive version.
    pub version: u32,
    /// Header format of the samples that follow.
    pub format: HeaderFormat,
    /// Epoch of compact-header timestamps, microseconds since 1970.
    pub epoch: DsmTime,
    /// Any other `key: value` lines.
    pub properties: BTreeMap<String, String>,
}

impl StreamPreamble {
    /// Preamble for the current archive version.
    #[must_use]
    pub fn new(format: HeaderFormat, epoch: DsmTime) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            format,
            epoch,
            properties: BTreeMap::new(),
        }
    }

    /// Add a free-form property line.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Encoded preamble text.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut text = String::from_utf8_lossy(PREAMBLE_MAGIC).into_owned();
        text.push_str(&format!("archive version: {}\n", self.version));
        text.push_str(&format!("header format: {}\n", self.format));
        text.push_str(&format!("epoch: {}\n", self.epoch));
        for (key, value) in &self.properties {
            text.push_str(&format!("{key}: {value}\n"));
        }
        text.push_str(END_LINE);
        text.push('\n');
        text.into_bytes()
    }
}

/// Incremental parser for the lines after the magic line.
#[derive(Debug, Default)]
pub(crate) struct PreambleParser {
    version: Option<u32>,
    format: Option<HeaderFormat>,
    epoch: Option<DsmTime>,
    properties: BTreeMap<String, String>,
}

impl PreambleParser {
    /// Feed one line without its terminator. Returns true at the end line.
    pub(crate) fn line(&mut self, line: &str) -> Result<bool> {
        let line = line.trim_end_matches('\r').trim();
        if line == END_LINE {
            return Ok(true);
        }
        if line.is_empty() {
            return Ok(false);
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(DsmError::InvalidPreamble(format!("malformed line '{line}'")));
        };
        let value = value.trim();
        match key.trim() {
            "archive version" => {
                let version: u32 = value
                    .parse()
                    .map_err(|_| DsmError::InvalidPreamble(format!("bad version '{value}'")))?;
                if version > ARCHIVE_VERSION {
                    return Err(DsmError::InvalidPreamble(format!(
                        "unsupported archive version {version}"
                    )));
                }
                self.version = Some(version);
            }
            "header format" => {
                self.format = Some(
                    value
                        .parse()
                        .map_err(|_| DsmError::InvalidPreamble(format!("bad header format '{value}'")))?,
                );
            }
            "epoch" => {
                self.epoch = Some(
                    value
                        .parse()
                        .map_err(|_| DsmError::InvalidPreamble(format!("bad epoch '{value}'")))?,
                );
            }
            key => {
                self.properties.insert(key.to_string(), value.to_string());
            }
        }
        Ok(false)
    }

    pub(crate) fn finish(self) -> StreamPreamble {
        StreamPreamble {
            version: self.version.unwrap_or(ARCHIVE_VERSION),
            format: self.format.unwrap_or_default(),
            epoch: self.epoch.unwrap_or(0),
            properties: self.properties,
        }
    }
}
