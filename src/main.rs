//! `dsm` command-line tool
//!
//! ```bash
//! # list samples of DSM 3, hex payloads
//! dsm dump --dsm 3 --format hex archive_20240115_120000.dat
//!
//! # time-sort two archives into one, 2 second window
//! dsm sort --output sorted.dat --sorter-length 2000 a.dat b.dat
//! ```

use std::collections::HashSet;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dsm_core::HeaderFormat;
use dsm_daq::commands::{dump_archives, sort_archives};
use dsm_daq::config::{DsmConfig, DEFAULT_CONFIG_FILE};
use dsm_daq::dump::{DumpClient, DumpFormat, DumpSelection};
use dsm_daq::logging;
use dsm_pool::SampleId;

#[derive(Parser)]
#[command(name = "dsm")]
#[command(about = "Read, list and time-sort DSM sample archives", long_about = None)]
struct Cli {
    /// Configuration file (TOML); DSM_* environment variables override it
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum HeaderArg {
    Full,
    Compact,
}

impl From<HeaderArg> for HeaderFormat {
    fn from(arg: HeaderArg) -> Self {
        match arg {
            HeaderArg::Full => HeaderFormat::Full,
            HeaderArg::Compact => HeaderFormat::Compact,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List samples, one line each
    Dump {
        /// Archive files, read in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Only this sample id, as DSM,SPS (repeatable)
        #[arg(long = "id", value_parser = parse_sample_id)]
        ids: Vec<SampleId>,

        /// Only samples from this DSM
        #[arg(long)]
        dsm: Option<u16>,

        /// Payload rendering
        #[arg(long, value_enum, default_value_t = DumpFormat::Auto)]
        format: DumpFormat,

        /// Header format of archives without a preamble
        #[arg(long, value_enum)]
        header_format: Option<HeaderArg>,

        /// Print SPS ids in hex
        #[arg(long)]
        hex_ids: bool,

        /// Stop after this many samples
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Time-sort archives into a new archive
    Sort {
        /// Archive files, read in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Sorted archive to write
        #[arg(long, short)]
        output: PathBuf,

        /// Sorter window in milliseconds
        #[arg(long)]
        sorter_length: Option<u64>,
    },
}

fn parse_sample_id(s: &str) -> Result<SampleId, String> {
    let (dsm, sps) = s
        .split_once(',')
        .ok_or_else(|| format!("'{s}' is not DSM,SPS"))?;
    let dsm: u16 = dsm.trim().parse().map_err(|e| format!("bad DSM id '{dsm}': {e}"))?;
    if dsm > SampleId::MAX_DSM_ID {
        return Err(format!("DSM id {dsm} exceeds {}", SampleId::MAX_DSM_ID));
    }
    let sps = sps.trim();
    let sps: u16 = match sps.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => sps.parse(),
    }
    .map_err(|e| format!("bad SPS id '{sps}': {e}"))?;
    Ok(SampleId::new(dsm, sps))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DsmConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init(&config.logging).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Dump {
            files,
            ids,
            dsm,
            format,
            header_format,
            hex_ids,
            limit,
        } => {
            if let Some(h) = header_format {
                config.input.header_format = h.into();
            }
            let selection = DumpSelection {
                ids: ids.into_iter().collect::<HashSet<_>>(),
                dsm_id: dsm,
                limit,
            };
            let out = Box::new(BufWriter::new(io::stdout()));
            let dump = Arc::new(DumpClient::new(out, format, selection).with_hex_ids(hex_ids));
            dump.write_header()?;
            dump_archives(&files, &config, dump)?;
        }
        Commands::Sort {
            files,
            output,
            sorter_length,
        } => {
            if let Some(ms) = sorter_length {
                config.sorter.length = Duration::from_millis(ms);
            }
            let summary = sort_archives(&files, &output, &config)?;
            eprintln!(
                "{} samples read, {} written to {} ({} late dropped, {} evicted)",
                summary.input.samples_read,
                summary.output.samples_written,
                output.display(),
                summary.sorter.late_dropped,
                summary.sorter.evicted_samples,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_id() {
        assert_eq!(parse_sample_id("1,2").unwrap(), SampleId::new(1, 2));
        assert_eq!(parse_sample_id(" 3 , 0x8001").unwrap(), SampleId::new(3, 0x8001));
        assert!(parse_sample_id("12").is_err());
        assert!(parse_sample_id("2000,1").is_err());
        assert!(parse_sample_id("1,x").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["dsm", "dump", "--id", "1,2", "--id", "1,3", "--format", "hex", "a.dat"]).unwrap();
        match cli.command {
            Commands::Dump { ids, format, .. } => {
                assert_eq!(ids.len(), 2);
                assert_eq!(format, DumpFormat::Hex);
            }
            Commands::Sort { .. } => panic!("wrong subcommand"),
        }
        assert!(Cli::try_parse_from(["dsm", "sort", "a.dat"]).is_err());
    }
}
