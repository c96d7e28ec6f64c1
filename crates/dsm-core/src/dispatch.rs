//! Routing raw samples to sensor processors.
//!
//! A [`SensorDispatcher`] sits downstream of a raw source (usually a sorter)
//! and looks up the [`SampleProcessor`] registered for each sample id. The
//! processor turns the raw sample into zero or more processed samples, which
//! the dispatcher distributes to its own clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use dsm_pool::{Sample, SampleId};

use crate::source::{SampleClient, SampleDistributor, SampleSource};

const WARN_INTERVAL: u64 = 1000;

/// Converts raw samples of one sensor into processed samples.
///
/// Processors are shared between threads and called concurrently when the
/// dispatcher has several upstream sources; keep mutable state behind a lock.
pub trait SampleProcessor: Send + Sync {
    /// Decode `raw`, appending processed samples to `out`.
    ///
    /// Returns false when the raw sample could not be decoded. Samples
    /// already appended are still distributed.
    fn process(&self, raw: &Sample, out: &mut Vec<Sample>) -> bool;

    /// Descriptive name for logs.
    fn name(&self) -> &str;
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Raw samples handed to a processor.
    pub dispatched: u64,
    /// Raw samples with no registered processor.
    pub unmatched: u64,
    /// `process` calls that returned false.
    pub process_failures: u64,
    /// Processed samples distributed.
    pub produced: u64,
}

/// Sample-id keyed dispatch table, a client of raw sources and a source of
/// processed samples.
pub struct SensorDispatcher {
    name: String,
    sensors: RwLock<HashMap<SampleId, Arc<dyn SampleProcessor>>>,
    distributor: SampleDistributor,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    process_failures: AtomicU64,
    produced: AtomicU64,
}

impl SensorDispatcher {
    /// Empty dispatch table.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            distributor: SampleDistributor::new(name.clone()),
            name,
            sensors: RwLock::new(HashMap::new()),
            dispatched: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            process_failures: AtomicU64::new(0),
            produced: AtomicU64::new(0),
        }
    }

    /// Route raw samples with `id` to `processor`, replacing any previous one.
    pub fn add_sensor(
        &self,
        id: SampleId,
        processor: Arc<dyn SampleProcessor>,
    ) -> Option<Arc<dyn SampleProcessor>> {
        debug!(dispatcher = %self.name, sensor = processor.name(), sample_id = %id, "sensor added");
        self.sensors.write().insert(id, processor)
    }

    /// Stop routing `id`.
    pub fn remove_sensor(&self, id: SampleId) -> Option<Arc<dyn SampleProcessor>> {
        self.sensors.write().remove(&id)
    }

    /// Number of registered sensors.
    pub fn sensor_count(&self) -> usize {
        self.sensors.read().len()
    }

    /// Counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            process_failures: self.process_failures.load(Ordering::Relaxed),
            produced: self.produced.load(Ordering::Relaxed),
        }
    }
}

impl SampleClient for SensorDispatcher {
    fn receive(&self, sample: &Sample) -> bool {
        let processor = self.sensors.read().get(&sample.id()).cloned();
        let Some(processor) = processor else {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let mut out = Vec::new();
        let ok = processor.process(sample, &mut out);
        if !ok {
            let failures = self.process_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures % WARN_INTERVAL == 1 {
                warn!(
                    dispatcher = %self.name,
                    sensor = processor.name(),
                    sample_id = %sample.id(),
                    failures,
                    "sensor could not process sample"
                );
            }
        }
        self.produced.fetch_add(out.len() as u64, Ordering::Relaxed);
        self.distributor.distribute_all(out);
        ok
    }

    fn finish(&self) {
        self.distributor.flush();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl SampleSource for SensorDispatcher {
    fn distributor(&self) -> &SampleDistributor {
        &self.distributor
    }
}
