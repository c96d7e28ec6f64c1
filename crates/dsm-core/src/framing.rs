//! Raw sample header codec.
//!
//! Every sample on the wire or in an archive is a fixed-size little-endian
//! header followed immediately by `length` payload bytes. There is no
//! padding, trailer or checksum; corruption is detected only by header
//! plausibility checks (see [`HeaderFilter`](crate::HeaderFilter)).
//!
//! | format | timestamp | id | type | length | size |
//! |---|---|---|---|---|---|
//! | [`HeaderFormat::Full`] | i64 µs since 1970 | u32 | u8 | u32 | 17 |
//! | [`HeaderFormat::Compact`] | u32 ms since stream epoch | u32 | u8 | u16 | 11 |

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use dsm_pool::{DsmTime, Sample, SampleId, SampleType, USECS_PER_MSEC};

use crate::error::{DsmError, Result};

/// Size of a [`HeaderFormat::Full`] header.
pub const FULL_HEADER_LEN: usize = 8 + 4 + 1 + 4;

/// Size of a [`HeaderFormat::Compact`] header.
pub const COMPACT_HEADER_LEN: usize = 4 + 4 + 1 + 2;

/// Largest header of any format.
pub const MAX_HEADER_LEN: usize = FULL_HEADER_LEN;

/// Header layout of a sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    /// Absolute microsecond timestamps, 32-bit lengths.
    #[default]
    Full,
    /// Millisecond offsets from the stream epoch, 16-bit lengths.
    Compact,
}

impl HeaderFormat {
    /// Encoded header size in bytes.
    #[must_use]
    pub const fn header_len(self) -> usize {
        match self {
            HeaderFormat::Full => FULL_HEADER_LEN,
            HeaderFormat::Compact => COMPACT_HEADER_LEN,
        }
    }

    /// Largest payload length the format can carry.
    #[must_use]
    pub const fn max_length(self) -> usize {
        match self {
            HeaderFormat::Full => u32::MAX as usize,
            HeaderFormat::Compact => u16::MAX as usize,
        }
    }

    /// Name used in stream preambles and configuration.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            HeaderFormat::Full => "full",
            HeaderFormat::Compact => "compact",
        }
    }
}

impl fmt::Display for HeaderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HeaderFormat {
    type Err = DsmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "full" => Ok(HeaderFormat::Full),
            "compact" => Ok(HeaderFormat::Compact),
            other => Err(DsmError::Configuration(format!(
                "unknown header format '{other}', expected full or compact"
            ))),
        }
    }
}

/// Decoded sample header.
///
/// `type_code` is kept raw so that unknown codes can be reported; use
/// [`sample_type`](Self::sample_type) to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleHeader {
    /// Microseconds since 1970.
    pub timestamp: DsmTime,
    /// Sample id.
    pub id: SampleId,
    /// Raw type code.
    pub type_code: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl SampleHeader {
    /// Header describing `sample`.
    #[must_use]
    pub fn for_sample(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp(),
            id: sample.id(),
            type_code: sample.sample_type().code(),
            length: u32::try_from(sample.len()).unwrap_or(u32::MAX),
        }
    }

    /// Element type, `None` for unrecognised codes.
    #[must_use]
    pub fn sample_type(&self) -> Option<SampleType> {
        SampleType::from_code(self.type_code)
    }

    /// Encode into the front of `out`, returning the header length.
    ///
    /// `out` must hold at least `format.header_len()` bytes. Fails when the
    /// timestamp or length does not fit the format.
    pub fn encode(&self, format: HeaderFormat, epoch: DsmTime, out: &mut [u8]) -> Result<usize> {
        let len = format.header_len();
        let mut dst = &mut out[..len];
        match format {
            HeaderFormat::Full => {
                dst.put_i64_le(self.timestamp);
                dst.put_u32_le(self.id.raw());
                dst.put_u8(self.type_code);
                dst.put_u32_le(self.length);
            }
            HeaderFormat::Compact => {
                let offset = self
                    .timestamp
                    .checked_sub(epoch)
                    .map(|d| d.div_euclid(USECS_PER_MSEC))
                    .and_then(|ms| u32::try_from(ms).ok())
                    .ok_or(DsmError::TimestampOutOfRange {
                        timestamp: self.timestamp,
                        epoch,
                    })?;
                let length = u16::try_from(self.length).map_err(|_| DsmError::SampleTooLong {
                    length: self.length as usize,
                    max: format.max_length(),
                })?;
                dst.put_u32_le(offset);
                dst.put_u32_le(self.id.raw());
                dst.put_u8(self.type_code);
                dst.put_u16_le(length);
            }
        }
        Ok(len)
    }

    /// Decode a header from the front of `buf` (at least `format.header_len()` bytes).
    ///
    /// `None` when a compact offset added to `epoch` does not fit a [`DsmTime`].
    #[must_use]
    pub fn decode(format: HeaderFormat, epoch: DsmTime, buf: &[u8]) -> Option<Self> {
        let mut src = &buf[..format.header_len()];
        match format {
            HeaderFormat::Full => Some(Self {
                timestamp: src.get_i64_le(),
                id: SampleId::from_raw(src.get_u32_le()),
                type_code: src.get_u8(),
                length: src.get_u32_le(),
            }),
            HeaderFormat::Compact => {
                let offset = i64::from(src.get_u32_le());
                let timestamp = offset
                    .checked_mul(USECS_PER_MSEC)
                    .and_then(|d| epoch.checked_add(d))?;
                Some(Self {
                    timestamp,
                    id: SampleId::from_raw(src.get_u32_le()),
                    type_code: src.get_u8(),
                    length: u32::from(src.get_u16_le()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SampleHeader {
        SampleHeader {
            timestamp: 1_700_000_000_123_456,
            id: SampleId::new(2, 300),
            type_code: SampleType::Float.code(),
            length: 12,
        }
    }

    #[test]
    fn full_layout_is_little_endian() {
        let mut buf = [0u8; FULL_HEADER_LEN];
        assert_eq!(header().encode(HeaderFormat::Full, 0, &mut buf).unwrap(), 17);
        assert_eq!(&buf[..8], &1_700_000_000_123_456i64.to_le_bytes());
        assert_eq!(&buf[8..12], &SampleId::new(2, 300).raw().to_le_bytes());
        assert_eq!(buf[12], 6);
        assert_eq!(&buf[13..], &12u32.to_le_bytes());
        assert_eq!(SampleHeader::decode(HeaderFormat::Full, 0, &buf), Some(header()));
    }

    #[test]
    fn compact_truncates_to_milliseconds() {
        let epoch = 1_700_000_000_000_000;
        let mut buf = [0u8; COMPACT_HEADER_LEN];
        header().encode(HeaderFormat::Compact, epoch, &mut buf).unwrap();
        assert_eq!(&buf[..4], &123u32.to_le_bytes());
        let back = SampleHeader::decode(HeaderFormat::Compact, epoch, &buf).unwrap();
        assert_eq!(back.timestamp, epoch + 123_000);
        assert_eq!(back.length, 12);
        assert_eq!(back.id, header().id);
    }

    #[test]
    fn compact_rejects_out_of_range() {
        let mut buf = [0u8; COMPACT_HEADER_LEN];
        let h = header();
        assert!(matches!(
            h.encode(HeaderFormat::Compact, h.timestamp + 1, &mut buf),
            Err(DsmError::TimestampOutOfRange { .. })
        ));
        let long = SampleHeader { length: 70_000, ..h };
        assert!(matches!(
            long.encode(HeaderFormat::Compact, h.timestamp, &mut buf),
            Err(DsmError::SampleTooLong { length: 70_000, max: 65_535 })
        ));
    }

    #[test]
    fn compact_offset_past_time_range_does_not_decode() {
        let buf = [0xffu8; COMPACT_HEADER_LEN];
        assert_eq!(SampleHeader::decode(HeaderFormat::Compact, DsmTime::MAX - 10, &buf), None);
        let near = SampleHeader::decode(HeaderFormat::Compact, DsmTime::MAX - i64::from(u32::MAX) * 1_000, &buf);
        assert_eq!(near.map(|h| h.timestamp), Some(DsmTime::MAX));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("compact".parse::<HeaderFormat>().unwrap(), HeaderFormat::Compact);
        assert_eq!(HeaderFormat::Full.to_string(), "full");
        assert!("wide".parse::<HeaderFormat>().is_err());
        assert_eq!(HeaderFormat::Compact.header_len(), 11);
    }
}
