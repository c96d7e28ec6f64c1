//! The work behind each `dsm` subcommand, callable without the CLI.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dsm_core::{
    FileSetChannel, InputStats, IoStream, OutputStats, SampleClient, SampleInputStream, SampleOutputStream,
    SampleSorter, SampleSource, SorterStats, StreamChannel,
};
use tracing::{info, instrument};

use crate::config::DsmConfig;
use crate::dump::DumpClient;

fn open_archives(files: &[PathBuf], config: &DsmConfig) -> Result<SampleInputStream<FileSetChannel>> {
    if files.is_empty() {
        bail!("no input files given");
    }
    if let Some(missing) = files.iter().find(|f| !f.is_file()) {
        bail!("input file {} not found", missing.display());
    }
    let channel = FileSetChannel::new(files.iter().cloned());
    Ok(SampleInputStream::with_config(
        IoStream::with_config(channel, &config.iostream),
        config.input.clone(),
        None,
    ))
}

/// List samples from `files` through `dump` until end of data or the dump
/// limit. Returns the reader's counters.
#[instrument(skip_all, fields(files = files.len()))]
pub fn dump_archives(files: &[PathBuf], config: &DsmConfig, dump: Arc<DumpClient>) -> Result<InputStats> {
    let mut reader = open_archives(files, config)?;
    reader.add_sample_client(dump.clone());

    while !reader.at_eof() && !dump.limit_reached() {
        reader.read_samples().context("reading archives")?;
    }
    dump.finish();
    reader.close()?;

    let stats = reader.stats();
    info!(
        samples = stats.samples_read,
        listed = dump.listed(),
        bad_headers = stats.bad_headers,
        "dump complete"
    );
    Ok(stats)
}

/// Counters from one `sort_archives` run.
#[derive(Debug, Clone)]
pub struct SortSummary {
    /// Reader counters.
    pub input: InputStats,
    /// Sorter counters.
    pub sorter: SorterStats,
    /// Writer counters.
    pub output: OutputStats,
}

/// Read `files`, time-order them through a sorter configured from
/// `config.sorter` and write a new archive to `output`.
#[instrument(skip(files, config), fields(files = files.len()))]
pub fn sort_archives(files: &[PathBuf], output: &Path, config: &DsmConfig) -> Result<SortSummary> {
    let mut reader = open_archives(files, config)?;

    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let writer = Arc::new(SampleOutputStream::with_config(
        IoStream::with_config(StreamChannel::new(output.display().to_string(), file), &config.iostream),
        config.output.clone(),
    ));

    let sorter = Arc::new(SampleSorter::new("sort", config.sorter.clone()));
    sorter.add_sample_client(writer.clone());
    reader.add_sample_client(sorter.clone());

    // read_all ends with finish() on the sorter, which drains into the writer
    reader.read_all().context("reading archives")?;
    sorter.finish()?;
    writer.close().with_context(|| format!("closing {}", output.display()))?;
    reader.close()?;

    let summary = SortSummary {
        input: reader.stats(),
        sorter: sorter.stats(),
        output: writer.stats(),
    };
    if summary.output.failed {
        bail!("writing {} failed", output.display());
    }
    info!(
        read = summary.input.samples_read,
        written = summary.output.samples_written,
        late_dropped = summary.sorter.late_dropped,
        evicted = summary.sorter.evicted_samples,
        "sort complete"
    );
    Ok(summary)
}
