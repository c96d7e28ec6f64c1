//! Configuration loading using Figment
//!
//! Settings are merged from, in increasing priority:
//! 1. built-in defaults (`DsmConfig::default()`, where the `[sorter]` used by
//!    `dsm sort` blocks on overflow instead of evicting)
//! 2. a TOML file (`dsm.toml` unless another path is given)
//! 3. environment variables prefixed with `DSM_`, nested with `__`
//!
//! Durations are humantime strings (`"250ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use dsm_daq::config::DsmConfig;
//!
//! // DSM_SORTER__LENGTH="2s" overrides [sorter] length from the file
//! let config = DsmConfig::load()?;
//! println!("sorter length: {:?}", config.sorter.length);
//! # Ok::<(), dsm_daq::config::ConfigError>(())
//! ```

use std::path::Path;

use dsm_core::{
    DsmError, InputConfig, IoStreamConfig, OutputConfig, OverflowPolicy, PipelineConfig, SorterConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{parse_log_level, LoggingConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "dsm.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DSM_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed.
    #[error("failed to load configuration: {0}")]
    Figment(#[from] figment::Error),

    /// A value parsed but makes no sense.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A section rejected its values.
    #[error(transparent)]
    Core(#[from] DsmError),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmConfig {
    /// Log output
    pub logging: LoggingConfig,
    /// Buffering of every channel
    pub iostream: IoStreamConfig,
    /// Archive and socket readers
    pub input: InputConfig,
    /// Archive writers
    pub output: OutputConfig,
    /// Stand-alone sorter (`dsm sort`)
    pub sorter: SorterConfig,
    /// Raw → processed pipeline
    pub pipeline: PipelineConfig,
}

impl Default for DsmConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            iostream: IoStreamConfig::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            // `dsm sort` reads faster than the window ages out; never evict
            sorter: SorterConfig {
                overflow: OverflowPolicy::Block,
                ..SorterConfig::default()
            },
            pipeline: PipelineConfig::default(),
        }
    }
}

impl DsmConfig {
    /// Load from `dsm.toml` in the working directory plus the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file plus the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider chain, exposed for callers that add their own layers.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values that deserialize but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_log_level(&self.logging.level).map_err(ConfigError::Invalid)?;

        if self.iostream.buffer_size == Some(0) {
            return Err(ConfigError::Invalid("iostream buffer_size must be positive".into()));
        }

        if self.output.max_length == 0 {
            return Err(ConfigError::Invalid("output max_length must be positive".into()));
        }

        let filter = &self.input.filter;
        if filter.max_length == 0 {
            return Err(ConfigError::Invalid("input filter max_length must be positive".into()));
        }
        if filter.enabled && filter.min_dsm_id > filter.max_dsm_id {
            return Err(ConfigError::Invalid(format!(
                "input filter dsm id range {}..={} is empty",
                filter.min_dsm_id, filter.max_dsm_id
            )));
        }
        if filter.enabled && filter.min_time > filter.max_time {
            return Err(ConfigError::Invalid("input filter time range is empty".into()));
        }

        self.sorter.validate()?;
        self.pipeline.raw_sorter.validate()?;
        self.pipeline.processed_sorter.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_core::{HeaderFormat, OverflowPolicy};
    use serial_test::serial;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    #[serial]
    fn test_load_config() {
        let (_dir, path) = write_config(
            r#"
[logging]
level = "debug"
format = "json"

[iostream]
buffer_size = 4096
max_time_between_writes = "100ms"

[input]
header_format = "compact"

[sorter]
length = "1s"
heap_max = 1000000
overflow = "block"
"#,
        );
        let config = DsmConfig::load_from(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.iostream.buffer_size, Some(4096));
        assert_eq!(config.iostream.max_time_between_writes, Duration::from_millis(100));
        assert_eq!(config.input.header_format, HeaderFormat::Compact);
        assert_eq!(config.sorter.length, Duration::from_secs(1));
        assert_eq!(config.sorter.overflow, OverflowPolicy::Block);
        // untouched sections keep their defaults
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DsmConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DsmConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let (_dir, path) = write_config("[sorter]\nlength = \"1s\"\n");
        std::env::set_var("DSM_SORTER__LENGTH", "2s");
        std::env::set_var("DSM_OUTPUT__PREAMBLE", "false");
        let config = DsmConfig::load_from(&path);
        std::env::remove_var("DSM_SORTER__LENGTH");
        std::env::remove_var("DSM_OUTPUT__PREAMBLE");

        let config = config.unwrap();
        assert_eq!(config.sorter.length, Duration::from_secs(2));
        assert!(!config.output.preamble);
    }

    #[test]
    #[serial]
    fn test_invalid_log_level() {
        let (_dir, path) = write_config("[logging]\nlevel = \"chatty\"\n");
        let err = DsmConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    #[serial]
    fn test_sort_sorter_blocks_unless_overridden() {
        let (_dir, path) = write_config("[sorter]\nlength = \"1s\"\n");
        let config = DsmConfig::load_from(&path).unwrap();
        assert_eq!(config.sorter.overflow, OverflowPolicy::Block);
        assert_eq!(config.sorter.length, Duration::from_secs(1));
        assert_eq!(config.pipeline.raw_sorter.overflow, OverflowPolicy::EvictOldest);

        let (_dir, path) = write_config("[sorter]\noverflow = \"evict_oldest\"\n");
        let config = DsmConfig::load_from(&path).unwrap();
        assert_eq!(config.sorter.overflow, OverflowPolicy::EvictOldest);
    }

    #[test]
    fn test_zero_output_max_length_rejected() {
        let mut config = DsmConfig::default();
        config.output.max_length = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_heap_rejected() {
        let mut config = DsmConfig::default();
        config.pipeline.processed_sorter.heap_max = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Core(DsmError::Configuration(_)))));
    }

    #[test]
    fn test_empty_dsm_range_rejected() {
        let mut config = DsmConfig::default();
        config.input.filter.enabled = true;
        config.input.filter.min_dsm_id = 10;
        config.input.filter.max_dsm_id = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_bad_duration_is_figment_error() {
        let (_dir, path) = write_config("[sorter]\nlength = \"soon\"\n");
        assert!(matches!(DsmConfig::load_from(&path), Err(ConfigError::Figment(_))));
    }
}
