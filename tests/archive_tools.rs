//! `dsm sort` / `dsm dump` work on real archive files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dsm_daq::commands::{dump_archives, sort_archives};
use dsm_daq::config::DsmConfig;
use dsm_daq::dsm_core::{
    FileSetChannel, IoStream, OutputConfig, OverflowPolicy, SampleClient, SampleCollector, SampleInputStream,
    SampleOutputStream, SampleSource, StreamChannel,
};
use dsm_daq::dsm_pool::{DsmTime, Sample, SampleId, SampleType, USECS_PER_MSEC};
use dsm_daq::dump::{DumpClient, DumpFormat, DumpSelection};
use parking_lot::Mutex;

const T0: DsmTime = 1_705_320_000_000_000;

fn write_archive(path: &Path, samples: &[Sample]) {
    let file = std::fs::File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    let writer = SampleOutputStream::with_config(IoStream::new(StreamChannel::new("w", file)), OutputConfig::default());
    for s in samples {
        assert!(writer.receive(s));
    }
    writer.close().unwrap();
}

fn at_ms(ms: DsmTime, sps: u16) -> Sample {
    Sample::standalone(T0 + ms * USECS_PER_MSEC, SampleId::new(1, sps), SampleType::Float, &1.0f32.to_le_bytes())
}

fn read_back(path: &Path) -> Vec<Sample> {
    let mut reader = SampleInputStream::new(IoStream::new(FileSetChannel::new([path])));
    let sink = Arc::new(SampleCollector::new());
    reader.add_sample_client(sink.clone());
    reader.read_all().unwrap();
    sink.take()
}

#[test]
fn sort_merges_two_archives_in_time_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.dat");
    let b = dir.path().join("b.dat");
    write_archive(&a, &[at_ms(900, 1), at_ms(100, 1), at_ms(1_500, 1)]);
    write_archive(&b, &[at_ms(400, 2), at_ms(1_200, 2)]);
    let sorted = dir.path().join("sorted.dat");

    let mut config = DsmConfig::default();
    config.sorter.length = std::time::Duration::from_secs(5);
    let summary = sort_archives(&[a, b], &sorted, &config).unwrap();
    assert_eq!(summary.input.samples_read, 5);
    assert_eq!(summary.output.samples_written, 5);
    assert_eq!(summary.sorter.late_dropped, 0);

    let order: Vec<DsmTime> = read_back(&sorted)
        .iter()
        .map(|s| (s.timestamp() - T0) / USECS_PER_MSEC)
        .collect();
    assert_eq!(order, vec![100, 400, 900, 1_200, 1_500]);
}

#[test]
fn sort_with_tiny_heap_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jittered.dat");
    // Neighbouring pairs swapped: 10, 0, 30, 20, ...
    let samples: Vec<Sample> = (0..300).map(|i| at_ms((i ^ 1) * 10, 3)).collect();
    write_archive(&path, &samples);
    let sorted = dir.path().join("sorted.dat");

    let mut config = DsmConfig::default();
    assert_eq!(config.sorter.overflow, OverflowPolicy::Block);
    config.sorter.length = Duration::from_millis(50);
    config.sorter.heap_max = 100;
    config.sorter.flush_interval = Some(Duration::from_millis(1));
    let summary = sort_archives(&[path], &sorted, &config).unwrap();
    assert_eq!(summary.sorter.evicted_samples, 0);
    assert_eq!(summary.sorter.late_dropped, 0);
    assert_eq!(summary.output.samples_written, 300);

    let order: Vec<DsmTime> = read_back(&sorted).iter().map(|s| s.timestamp()).collect();
    assert_eq!(order.len(), 300);
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn sort_rejects_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let missing: PathBuf = dir.path().join("nope.dat");
    let err = sort_archives(&[missing], &dir.path().join("out.dat"), &DsmConfig::default()).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn dump_stops_at_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.dat");
    let samples: Vec<Sample> = (0..100).map(|i| at_ms(i, 7)).collect();
    write_archive(&path, &samples);

    let out = Captured::default();
    let selection = DumpSelection {
        limit: Some(3),
        ..Default::default()
    };
    let dump = Arc::new(DumpClient::new(Box::new(out.clone()), DumpFormat::Float, selection));
    dump_archives(&[path], &DsmConfig::default(), dump.clone()).unwrap();

    assert_eq!(dump.listed(), 3);
    let text = String::from_utf8(out.0.lock().clone()).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.lines().all(|l| l.contains(" 1,7 ")));
}
