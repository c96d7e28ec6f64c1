//! Plausibility screen for decoded sample headers.
//!
//! A byte stream has no framing markers, so a corrupted byte makes the reader
//! decode garbage headers. The filter rejects headers whose fields cannot be
//! right; the reader then slides forward one byte and tries again.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use dsm_pool::{DsmTime, SampleType};

use crate::error::DsmError;
use crate::framing::SampleHeader;

/// Default largest plausible payload length.
pub const DEFAULT_MAX_SAMPLE_LENGTH: u32 = 32768;

/// Header plausibility limits.
///
/// `max_length` is always enforced. The other limits, and rejection of
/// unknown type codes, apply only when `enabled` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderFilter {
    /// Apply the full set of limits.
    pub enabled: bool,
    /// Smallest accepted DSM id.
    pub min_dsm_id: u16,
    /// Largest accepted DSM id.
    pub max_dsm_id: u16,
    /// Smallest accepted payload length.
    pub min_length: u32,
    /// Largest accepted payload length.
    pub max_length: u32,
    /// Earliest accepted timestamp.
    pub min_time: DsmTime,
    /// Latest accepted timestamp.
    pub max_time: DsmTime,
    /// Only accept this element type.
    pub sample_type: Option<SampleTypeName>,
}

/// Serialisable element type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum SampleTypeName {
    Char,
    UChar,
    Short,
    UShort,
    Int32,
    UInt32,
    Float,
    Double,
    Int64,
}

impl From<SampleTypeName> for SampleType {
    fn from(name: SampleTypeName) -> Self {
        match name {
            SampleTypeName::Char => SampleType::Char,
            SampleTypeName::UChar => SampleType::UChar,
            SampleTypeName::Short => SampleType::Short,
            SampleTypeName::UShort => SampleType::UShort,
            SampleTypeName::Int32 => SampleType::Int32,
            SampleTypeName::UInt32 => SampleType::UInt32,
            SampleTypeName::Float => SampleType::Float,
            SampleTypeName::Double => SampleType::Double,
            SampleTypeName::Int64 => SampleType::Int64,
        }
    }
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            min_dsm_id: 1,
            max_dsm_id: 1023,
            min_length: 1,
            max_length: DEFAULT_MAX_SAMPLE_LENGTH,
            min_time: DsmTime::MIN,
            max_time: DsmTime::MAX,
            sample_type: None,
        }
    }
}

impl HeaderFilter {
    /// Filter with every limit enabled at its default.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Widen unset time limits to one day around `[start, end]`.
    pub fn set_default_time_range(&mut self, start: DsmTime, end: DsmTime) {
        const USECS_PER_DAY: DsmTime = 86_400_000_000;
        if self.min_time == DsmTime::MIN {
            self.min_time = start.saturating_sub(USECS_PER_DAY);
        }
        if self.max_time == DsmTime::MAX {
            self.max_time = end.saturating_add(USECS_PER_DAY);
        }
    }

    /// True when `header` passes the screen.
    #[must_use]
    pub fn is_valid(&self, header: &SampleHeader) -> bool {
        if header.length > self.max_length {
            return false;
        }
        if !self.enabled {
            return true;
        }
        let dsm = header.id.dsm_id();
        let type_ok = match (header.sample_type(), self.sample_type) {
            (None | Some(SampleType::Unknown), _) => false,
            (Some(t), Some(limit)) => t == SampleType::from(limit),
            (Some(_), None) => true,
        };
        type_ok
            && (self.min_dsm_id..=self.max_dsm_id).contains(&dsm)
            && header.length >= self.min_length
            && (self.min_time..=self.max_time).contains(&header.timestamp)
    }

    /// Human readable list of the limits `header` violates.
    #[must_use]
    pub fn explain(&self, header: &SampleHeader) -> String {
        let mut msg = String::from("invalid sample header fields: ");
        if header.length > self.max_length || (self.enabled && header.length < self.min_length) {
            let _ = write!(msg, "length out of range: {}; ", header.length);
        }
        if self.enabled {
            match header.sample_type() {
                None | Some(SampleType::Unknown) => {
                    let _ = write!(msg, "type invalid: {}; ", header.type_code);
                }
                Some(t) => {
                    if let Some(limit) = self.sample_type {
                        if t != SampleType::from(limit) {
                            let _ = write!(msg, "type not accepted: {t}; ");
                        }
                    }
                }
            }
            let dsm = header.id.dsm_id();
            if !(self.min_dsm_id..=self.max_dsm_id).contains(&dsm) {
                let _ = write!(msg, "dsm id out of range: {dsm}; ");
            }
            if !(self.min_time..=self.max_time).contains(&header.timestamp) {
                let _ = write!(msg, "time out of range: {}; ", header.timestamp);
            }
        }
        msg
    }
}

/// Parses `key=value` lists such as `mindsm=1,maxdsm=20,maxlen=8192`.
///
/// Keys: `on`/`off`, `mindsm`, `maxdsm`, `minlen`, `maxlen`, `mintime`,
/// `maxtime` (microseconds since 1970), `type`. Any limit enables the filter.
impl FromStr for HeaderFilter {
    type Err = DsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T, DsmError> {
            value
                .parse()
                .map_err(|_| DsmError::Configuration(format!("filter {key}: cannot parse '{value}'")))
        }

        let mut filter = HeaderFilter::default();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            match key {
                "on" => filter.enabled = true,
                "off" => filter.enabled = false,
                "mindsm" => filter.min_dsm_id = num(key, value)?,
                "maxdsm" => filter.max_dsm_id = num(key, value)?,
                "minlen" => filter.min_length = num(key, value)?,
                "maxlen" => filter.max_length = num(key, value)?,
                "mintime" => filter.min_time = num(key, value)?,
                "maxtime" => filter.max_time = num(key, value)?,
                "type" => {
                    filter.sample_type = Some(
                        parse_type_name(value).ok_or_else(|| {
                            DsmError::Configuration(format!("filter type: unknown type '{value}'"))
                        })?,
                    )
                }
                other => {
                    return Err(DsmError::Configuration(format!(
                        "unknown filter key '{other}'"
                    )))
                }
            }
            if !matches!(key, "on" | "off") {
                filter.enabled = true;
            }
        }
        Ok(filter)
    }
}

fn parse_type_name(value: &str) -> Option<SampleTypeName> {
    let name = match value {
        "char" => SampleTypeName::Char,
        "uchar" => SampleTypeName::UChar,
        "short" => SampleTypeName::Short,
        "ushort" => SampleTypeName::UShort,
        "int32" => SampleTypeName::Int32,
        "uint32" => SampleTypeName::UInt32,
        "float" => SampleTypeName::Float,
        "double" => SampleTypeName::Double,
        "int64" => SampleTypeName::Int64,
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_pool::SampleId;

    fn header(dsm: u16, type_code: u8, length: u32) -> SampleHeader {
        SampleHeader {
            timestamp: 1_000,
            id: SampleId::new(dsm, 1),
            type_code,
            length,
        }
    }

    #[test]
    fn disabled_filter_only_checks_length() {
        let f = HeaderFilter::default();
        assert!(f.is_valid(&header(0, 42, 10)));
        assert!(!f.is_valid(&header(1, 0, DEFAULT_MAX_SAMPLE_LENGTH + 1)));
    }

    #[test]
    fn enabled_filter_checks_every_field() {
        let f = HeaderFilter::enabled();
        assert!(f.is_valid(&header(1, 0, 10)));
        assert!(!f.is_valid(&header(0, 0, 10)));
        assert!(!f.is_valid(&header(1, 9, 10)));
        assert!(!f.is_valid(&header(1, 77, 10)));
        assert!(!f.is_valid(&header(1, 0, 0)));
    }

    #[test]
    fn explain_lists_violations() {
        let f = HeaderFilter::enabled();
        let msg = f.explain(&header(0, 77, 0));
        assert!(msg.contains("length out of range: 0"));
        assert!(msg.contains("type invalid: 77"));
        assert!(msg.contains("dsm id out of range: 0"));
    }

    #[test]
    fn parse_filter_spec() {
        let f: HeaderFilter = "mindsm=2,maxdsm=20,maxlen=1024,type=float".parse().unwrap();
        assert!(f.enabled);
        assert_eq!((f.min_dsm_id, f.max_dsm_id, f.max_length), (2, 20, 1024));
        assert!(f.is_valid(&header(2, SampleType::Float.code(), 8)));
        assert!(!f.is_valid(&header(2, SampleType::Char.code(), 8)));

        let f: HeaderFilter = "maxlen=10,off".parse().unwrap();
        assert!(!f.enabled);
        assert!("bogus=1".parse::<HeaderFilter>().is_err());
        assert!("maxlen=x".parse::<HeaderFilter>().is_err());
    }

    #[test]
    fn default_time_range_only_fills_unset() {
        let mut f = HeaderFilter::enabled();
        f.max_time = 5;
        f.set_default_time_range(100_000_000_000, 200_000_000_000);
        assert_eq!(f.min_time, 100_000_000_000 - 86_400_000_000);
        assert_eq!(f.max_time, 5);
    }
}
