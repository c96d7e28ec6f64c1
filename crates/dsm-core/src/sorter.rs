//! Time-ordering buffer between a source and its clients.
//!
//! A [`SampleSorter`] is a [`SampleClient`] of one or more raw sources and a
//! [`SampleSource`] for everything downstream. Samples are held in an ordered
//! set keyed by `(timestamp, arrival sequence)` and released in ascending
//! order once they are older than the sorter length relative to a reference
//! clock. Everything downstream of a sorter sees non-decreasing timestamps.
//!
//! # Threads
//!
//! ```text
//!  producer threads                     sorter-<name> thread
//!  ────────────────                     ────────────────────
//!  receive() ─ lock set, insert ─┐
//!            ─ try_send(Wake) ───┼────▶ recv_timeout(flush_interval)
//!                                │        lock set, take aged entries
//!                                │        unlock, distribute() to clients
//!  finish()  ─ send(Finish) ─────┴────▶ drain everything, exit
//! ```
//!
//! The set lock is taken by every `receive` and briefly by the flush thread;
//! it is never held while clients run. Overflow eviction happens inside
//! `receive`, so buffered bytes never exceed `heap_max`.
//!
//! # Losses
//!
//! Overflow and lateness never produce errors. They are counted in
//! [`SorterStats`] and logged at a throttled rate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use dsm_pool::{DsmTime, Sample, SamplePools, USECS_PER_SEC};

use crate::error::{DsmError, Result};
use crate::framing::FULL_HEADER_LEN;
use crate::source::{SampleClient, SampleDistributor, SampleSource};

/// Default sorter length.
pub const DEFAULT_SORTER_LENGTH: Duration = Duration::from_millis(250);

/// Default bound on buffered bytes.
pub const DEFAULT_HEAP_MAX: usize = 50_000_000;

/// Default number of recently released timestamps remembered for late samples.
pub const DEFAULT_LATE_CACHE_SIZE: usize = 16;

/// Default future limit in [`ClockMode::SystemClock`] mode.
pub const DEFAULT_FUTURE_LIMIT: Duration = Duration::from_secs(2);

/// Bytes charged per buffered sample on top of its payload.
const ENTRY_OVERHEAD: usize = FULL_HEADER_LEN;

const WARN_INTERVAL: u64 = 1000;

// =============================================================================
// Configuration
// =============================================================================

/// What `receive` does when a sample would push buffered bytes over `heap_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered samples until the new one fits.
    #[default]
    EvictOldest,
    /// Block the producer until the flush thread has made room. When nothing
    /// is old enough to release, the flush thread raises `heap_max` by half.
    Block,
}

/// Reference clock for aging samples out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Newest buffered timestamp (skipping `screen_count` outliers).
    #[default]
    DataTime,
    /// Wall clock. Samples too far in the future are discarded.
    SystemClock,
}

/// Sorter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// How long a sample is held before release.
    #[serde(with = "humantime_serde")]
    pub length: Duration,
    /// Bound on buffered payload plus header bytes.
    pub heap_max: usize,
    /// Overflow handling.
    pub overflow: OverflowPolicy,
    /// Reference clock.
    pub clock: ClockMode,
    /// Newest samples ignored when taking the data-time reference, so a
    /// single bad timestamp far in the future cannot flush the whole set.
    pub screen_count: usize,
    /// Released timestamps remembered to re-admit late samples; 0 drops
    /// every late sample.
    pub late_cache_size: usize,
    /// With [`ClockMode::SystemClock`], discard samples further ahead than this.
    #[serde(with = "humantime_serde")]
    pub realtime_future_limit: Duration,
    /// Timer period of the flush thread; a quarter of `length` when unset.
    #[serde(default, with = "humantime_serde")]
    pub flush_interval: Option<Duration>,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_SORTER_LENGTH,
            heap_max: DEFAULT_HEAP_MAX,
            overflow: OverflowPolicy::EvictOldest,
            clock: ClockMode::DataTime,
            screen_count: 0,
            late_cache_size: DEFAULT_LATE_CACHE_SIZE,
            realtime_future_limit: DEFAULT_FUTURE_LIMIT,
            flush_interval: None,
        }
    }
}

impl SorterConfig {
    /// Sorter with the given length and otherwise default settings.
    #[must_use]
    pub fn with_length(length: Duration) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }

    /// Effective timer period.
    #[must_use]
    pub fn effective_flush_interval(&self) -> Duration {
        self.flush_interval
            .unwrap_or(self.length / 4)
            .clamp(Duration::from_millis(1), Duration::from_secs(1))
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.heap_max == 0 {
            return Err(DsmError::Configuration("sorter heap_max must be positive".into()));
        }
        if i64::try_from(self.length.as_micros()).is_err() {
            return Err(DsmError::Configuration("sorter length out of range".into()));
        }
        Ok(())
    }
}

fn micros(d: Duration) -> DsmTime {
    i64::try_from(d.as_micros()).unwrap_or(DsmTime::MAX)
}

// =============================================================================
// State
// =============================================================================

/// Sorter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SorterState {
    /// Nothing buffered.
    #[default]
    Idle,
    /// Samples buffered, flush thread running.
    Accumulating,
    /// `finish` is releasing everything.
    Draining,
    /// Finished; no further samples accepted.
    Stopped,
}

/// Sorter counters. All counts only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SorterStats {
    /// Lifecycle state.
    pub state: SorterState,
    /// Samples accepted into the set.
    pub input_samples: u64,
    /// Payload bytes accepted.
    pub input_bytes: u64,
    /// Samples released to clients.
    pub output_samples: u64,
    /// Oldest samples evicted on overflow.
    pub evicted_samples: u64,
    /// Samples larger than `heap_max` on their own.
    pub oversize_discards: u64,
    /// Late samples outside the late cache.
    pub late_dropped: u64,
    /// Late samples re-stamped and re-inserted.
    pub late_reinserted: u64,
    /// Samples beyond the future limit.
    pub future_samples: u64,
    /// Samples offered after `finish`.
    pub rejected_after_stop: u64,
    /// Times `heap_max` was raised under [`OverflowPolicy::Block`].
    pub heap_increases: u64,
    /// Samples currently buffered.
    pub buffered: usize,
    /// Bytes currently buffered.
    pub heap_size: usize,
    /// Current bound on buffered bytes.
    pub heap_max: usize,
    /// Newest timestamp received.
    pub last_input: Option<DsmTime>,
    /// Newest timestamp released.
    pub last_output: Option<DsmTime>,
}

struct SortedSet {
    entries: BTreeMap<(DsmTime, u64), Sample>,
    seq: u64,
    released: VecDeque<DsmTime>,
    blocked_producers: usize,
    stats: SorterStats,
}

impl SortedSet {
    fn new(heap_max: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
            released: VecDeque::new(),
            blocked_producers: 0,
            stats: SorterStats {
                heap_max,
                ..SorterStats::default()
            },
        }
    }

    fn insert(&mut self, timestamp: DsmTime, sample: Sample) {
        self.stats.heap_size += entry_size(&sample);
        self.stats.input_samples += 1;
        self.stats.input_bytes += sample.len() as u64;
        self.entries.insert((timestamp, self.seq), sample);
        self.seq += 1;
        self.stats.buffered = self.entries.len();
        if self.stats.state == SorterState::Idle {
            self.stats.state = SorterState::Accumulating;
        }
    }

    fn evict_oldest(&mut self) -> Option<Sample> {
        let (_, sample) = self.entries.pop_first()?;
        self.stats.heap_size -= entry_size(&sample);
        self.stats.evicted_samples += 1;
        self.stats.buffered = self.entries.len();
        Some(sample)
    }

    /// Remove entries with timestamp below `threshold` (all when `None`), oldest first.
    fn take_older_than(&mut self, threshold: Option<DsmTime>, late_cache_size: usize) -> Vec<Sample> {
        let mut batch = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (timestamp, _) = *entry.key();
            if threshold.is_some_and(|limit| timestamp >= limit) {
                break;
            }
            let sample = entry.remove();
            self.stats.heap_size -= entry_size(&sample);
            self.stats.last_output = Some(timestamp);
            if late_cache_size > 0 {
                if self.released.len() == late_cache_size {
                    self.released.pop_front();
                }
                self.released.push_back(timestamp);
            }
            batch.push(sample);
        }
        self.stats.output_samples += batch.len() as u64;
        self.stats.buffered = self.entries.len();
        if self.entries.is_empty() && self.stats.state == SorterState::Accumulating {
            self.stats.state = SorterState::Idle;
        }
        batch
    }

    fn data_time_reference(&self, screen_count: usize) -> Option<DsmTime> {
        self.entries.keys().rev().nth(screen_count).map(|(t, _)| *t)
    }
}

fn entry_size(sample: &Sample) -> usize {
    sample.len() + ENTRY_OVERHEAD
}

fn system_time_now() -> DsmTime {
    chrono::Utc::now().timestamp_micros()
}

// =============================================================================
// Shared core
// =============================================================================

struct SorterShared {
    name: String,
    config: SorterConfig,
    set: Mutex<SortedSet>,
    room: Condvar,
    // Held from taking a batch until it is distributed, so batches released
    // by different threads cannot overtake each other.
    release: Mutex<()>,
    distributor: SampleDistributor,
}

impl SorterShared {
    fn threshold(&self, set: &SortedSet) -> Option<DsmTime> {
        let reference = match self.config.clock {
            ClockMode::DataTime => set.data_time_reference(self.config.screen_count)?,
            ClockMode::SystemClock => system_time_now(),
        };
        Some(reference.saturating_sub(micros(self.config.length)))
    }

    /// One timer or wake-up pass: release aged samples.
    fn release_aged(&self) -> usize {
        let _release = self.release.lock();
        let batch = {
            let mut set = self.set.lock();
            let batch = match self.threshold(&set) {
                Some(threshold) => set.take_older_than(Some(threshold), self.config.late_cache_size),
                None => Vec::new(),
            };
            if set.blocked_producers > 0 {
                if batch.is_empty() {
                    let grown = set.stats.heap_max + set.stats.heap_max / 2;
                    warn!(
                        name = %self.name,
                        heap_max = grown,
                        heap_size = set.stats.heap_size,
                        "sorter full with nothing to release, raising heap limit"
                    );
                    set.stats.heap_max = grown;
                    set.stats.heap_increases += 1;
                }
                self.room.notify_all();
            }
            batch
        };
        let n = batch.len();
        self.distributor.distribute_all(batch);
        n
    }

    /// Release everything regardless of age.
    fn release_all(&self) -> usize {
        let _release = self.release.lock();
        let batch = {
            let mut set = self.set.lock();
            let batch = set.take_older_than(None, self.config.late_cache_size);
            self.room.notify_all();
            batch
        };
        let n = batch.len();
        self.distributor.distribute_all(batch);
        n
    }
}

enum Control {
    Wake,
    Finish,
    Shutdown,
}

struct Worker {
    control: Sender<Control>,
    handle: JoinHandle<()>,
}

fn run_flush_thread(shared: Arc<SorterShared>, control: crossbeam_channel::Receiver<Control>) {
    let interval = shared.config.effective_flush_interval();
    debug!(name = %shared.name, ?interval, "sorter flush thread started");
    loop {
        match control.recv_timeout(interval) {
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {
                shared.release_aged();
            }
            Ok(Control::Finish) => {
                let n = shared.release_all();
                debug!(name = %shared.name, released = n, "sorter drained");
                break;
            }
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(name = %shared.name, "sorter flush thread exiting");
}

// =============================================================================
// SampleSorter
// =============================================================================

/// Time-ordering buffer.
pub struct SampleSorter {
    shared: Arc<SorterShared>,
    worker: Mutex<Option<Worker>>,
    pools: Option<Arc<SamplePools>>,
}

impl SampleSorter {
    /// New sorter. The flush thread is started by the first sample.
    pub fn new(name: impl Into<String>, config: SorterConfig) -> Self {
        let name = name.into();
        let heap_max = config.heap_max.max(1);
        Self {
            shared: Arc::new(SorterShared {
                distributor: SampleDistributor::new(name.clone()),
                name,
                config,
                set: Mutex::new(SortedSet::new(heap_max)),
                room: Condvar::new(),
                release: Mutex::new(()),
            }),
            worker: Mutex::new(None),
            pools: None,
        }
    }

    /// Allocate re-stamped copies of late samples from `pools`.
    #[must_use]
    pub fn with_pools(mut self, pools: Arc<SamplePools>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Sorter name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Settings.
    pub fn config(&self) -> &SorterConfig {
        &self.shared.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> SorterState {
        self.shared.set.lock().stats.state
    }

    /// Counters.
    pub fn stats(&self) -> SorterStats {
        self.shared.set.lock().stats.clone()
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.shared.set.lock().entries.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every aged sample now, on the calling thread.
    ///
    /// The flush thread does this on its own; this is for callers that want
    /// deterministic release points.
    pub fn release_aged(&self) -> usize {
        self.shared.release_aged()
    }

    /// Start the flush thread if needed; returns its control channel.
    fn ensure_worker(&self) -> Option<Sender<Control>> {
        let mut worker = self.worker.lock();
        if let Some(w) = worker.as_ref() {
            return Some(w.control.clone());
        }
        let (tx, rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("sorter-{}", self.shared.name))
            .spawn(move || run_flush_thread(shared, rx));
        match spawned {
            Ok(handle) => {
                *worker = Some(Worker {
                    control: tx.clone(),
                    handle,
                });
                Some(tx)
            }
            Err(e) => {
                error!(name = %self.shared.name, error = %e, "cannot start sorter flush thread");
                None
            }
        }
    }

    fn late_copy(&self, sample: &Sample, timestamp: DsmTime) -> Sample {
        match &self.pools {
            Some(pools) => {
                let mut copy = sample.copy_into(pools);
                copy.set_timestamp(timestamp);
                copy.freeze()
            }
            None => Sample::standalone(timestamp, sample.id(), sample.sample_type(), sample.data()),
        }
    }

    /// Screen a late sample. Returns the sample and key to insert, if any.
    fn admit_late(&self, set: &mut SortedSet, sample: &Sample) -> Option<(DsmTime, Sample)> {
        let last_output = set.stats.last_output?;
        if sample.timestamp() >= last_output {
            return Some((sample.timestamp(), sample.clone()));
        }
        let in_cache = set
            .released
            .front()
            .is_some_and(|&oldest| sample.timestamp() >= oldest);
        if in_cache {
            set.stats.late_reinserted += 1;
            debug!(
                name = %self.shared.name,
                sample_id = %sample.id(),
                timestamp = sample.timestamp(),
                restamped = last_output,
                "late sample re-stamped"
            );
            return Some((last_output, self.late_copy(sample, last_output)));
        }
        set.stats.late_dropped += 1;
        if set.stats.late_dropped % WARN_INTERVAL == 1 {
            warn!(
                name = %self.shared.name,
                sample_id = %sample.id(),
                lateness_us = last_output.saturating_sub(sample.timestamp()),
                dropped = set.stats.late_dropped,
                "late sample dropped"
            );
        }
        None
    }

    /// Make room for `size` bytes. Returns false when the sample must be dropped.
    fn make_room(&self, set: &mut MutexGuard<'_, SortedSet>, size: usize, worker: bool) -> bool {
        if size > set.stats.heap_max {
            set.stats.oversize_discards += 1;
            warn!(
                name = %self.shared.name,
                size,
                heap_max = set.stats.heap_max,
                "sample larger than sorter heap, discarded"
            );
            return false;
        }
        match self.shared.config.overflow {
            OverflowPolicy::Block if worker => {
                let interval = self.shared.config.effective_flush_interval();
                while set.stats.heap_size + size > set.stats.heap_max {
                    if matches!(set.stats.state, SorterState::Draining | SorterState::Stopped) {
                        return false;
                    }
                    set.blocked_producers += 1;
                    self.shared.room.wait_for(set, interval);
                    set.blocked_producers -= 1;
                }
            }
            _ => {
                while set.stats.heap_size + size > set.stats.heap_max {
                    let Some(evicted) = set.evict_oldest() else {
                        break;
                    };
                    if set.stats.evicted_samples % WARN_INTERVAL == 1 {
                        warn!(
                            name = %self.shared.name,
                            sample_id = %evicted.id(),
                            timestamp = evicted.timestamp(),
                            evicted = set.stats.evicted_samples,
                            "sorter heap full, evicting oldest samples"
                        );
                    }
                }
            }
        }
        true
    }

    /// Release every buffered sample in order, call `finish` on every client
    /// and stop the flush thread. Later samples are rejected.
    ///
    /// Calling it again does nothing.
    pub fn finish(&self) -> Result<()> {
        {
            let mut set = self.shared.set.lock();
            match set.stats.state {
                SorterState::Draining | SorterState::Stopped => return Ok(()),
                _ => set.stats.state = SorterState::Draining,
            }
            self.shared.room.notify_all();
        }

        let mut result = Ok(());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let thread_name = format!("sorter-{}", self.shared.name);
            // A dead thread has dropped its receiver; the drain below still runs.
            let _ = worker.control.send(Control::Finish);
            if worker.handle.join().is_err() {
                error!(name = %self.shared.name, "sorter flush thread panicked");
                result = Err(DsmError::ThreadPanicked(thread_name));
            }
        }
        self.shared.release_all();
        self.shared.distributor.flush();

        let stats = {
            let mut set = self.shared.set.lock();
            set.stats.state = SorterState::Stopped;
            set.stats.clone()
        };
        info!(
            name = %self.shared.name,
            input = stats.input_samples,
            output = stats.output_samples,
            evicted = stats.evicted_samples,
            late_dropped = stats.late_dropped,
            late_reinserted = stats.late_reinserted,
            "sorter finished"
        );
        result
    }

    /// Buffer `sample` for ordered release.
    ///
    /// `Ok(false)` when the sample was screened out (late, in the future,
    /// larger than the heap); [`DsmError::SorterStopped`] once
    /// [`finish`](Self::finish) has begun.
    pub fn push(&self, sample: &Sample) -> Result<bool> {
        let mut set = self.shared.set.lock();
        match set.stats.state {
            SorterState::Draining | SorterState::Stopped => {
                set.stats.rejected_after_stop += 1;
                return Err(DsmError::SorterStopped(self.shared.name.clone()));
            }
            SorterState::Idle | SorterState::Accumulating => {}
        }

        if self.shared.config.clock == ClockMode::SystemClock {
            let limit = system_time_now().saturating_add(micros(self.shared.config.realtime_future_limit));
            if sample.timestamp() > limit {
                set.stats.future_samples += 1;
                if set.stats.future_samples % WARN_INTERVAL == 1 {
                    warn!(
                        name = %self.shared.name,
                        sample_id = %sample.id(),
                        ahead_s = (sample.timestamp() - limit) / USECS_PER_SEC,
                        "sample timestamp in the future, discarded"
                    );
                }
                return Ok(false);
            }
        }

        let (timestamp, entry) = if set.stats.last_output.is_some() {
            match self.admit_late(&mut set, sample) {
                Some(admitted) => admitted,
                None => return Ok(false),
            }
        } else {
            (sample.timestamp(), sample.clone())
        };

        let control = self.ensure_worker();
        if !self.make_room(&mut set, entry_size(&entry), control.is_some()) {
            if set.stats.state == SorterState::Draining || set.stats.state == SorterState::Stopped {
                set.stats.rejected_after_stop += 1;
                return Err(DsmError::SorterStopped(self.shared.name.clone()));
            }
            return Ok(false);
        }
        let max_input = set.stats.last_input.map_or(timestamp, |t| t.max(timestamp));
        set.stats.last_input = Some(max_input);
        set.insert(timestamp, entry);
        drop(set);

        if let Some(control) = control {
            match control.try_send(Control::Wake) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    debug!(name = %self.shared.name, "sorter flush thread gone");
                }
            }
        }
        Ok(true)
    }
}

impl SampleClient for SampleSorter {
    fn receive(&self, sample: &Sample) -> bool {
        self.push(sample).unwrap_or(false)
    }

    fn finish(&self) {
        if let Err(e) = SampleSorter::finish(self) {
            error!(name = %self.shared.name, error = %e, "sorter finish failed");
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl SampleSource for SampleSorter {
    fn distributor(&self) -> &SampleDistributor {
        &self.shared.distributor
    }
}

impl Drop for SampleSorter {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.control.send(Control::Shutdown);
            if worker.handle.join().is_err() {
                error!(name = %self.shared.name, "sorter flush thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SampleCollector;
    use dsm_pool::{SampleId, SampleType};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use tracing_test::traced_test;

    const MS: DsmTime = 1_000;

    fn sample(t: DsmTime) -> Sample {
        Sample::standalone(t, SampleId::new(1, 1), SampleType::Char, b"0123456789")
    }

    fn sorter(config: SorterConfig) -> (SampleSorter, Arc<SampleCollector>) {
        let sorter = SampleSorter::new("test", config);
        let sink = Arc::new(SampleCollector::new());
        sorter.add_sample_client(sink.clone());
        (sorter, sink)
    }

    fn timestamps(sink: &SampleCollector) -> Vec<DsmTime> {
        sink.samples().iter().map(Sample::timestamp).collect()
    }

    #[test]
    fn releases_in_timestamp_order() {
        let (s, sink) = sorter(SorterConfig::with_length(Duration::from_secs(1)));
        for t in [900 * MS, 100 * MS, 1_500 * MS] {
            assert!(s.receive(&sample(t)));
        }
        s.finish().unwrap();
        assert_eq!(timestamps(&sink), vec![100 * MS, 900 * MS, 1_500 * MS]);
        assert_eq!(s.state(), SorterState::Stopped);
        assert_eq!(sink.finish_count(), 1);
    }

    #[test]
    fn shuffled_input_is_monotonic() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut times: Vec<DsmTime> = (0..2_000).map(|i| i * MS).collect();
        // Bounded skew: shuffle within windows of 50 samples.
        for chunk in times.chunks_mut(50) {
            chunk.shuffle(&mut rng);
        }
        let config = SorterConfig {
            flush_interval: Some(Duration::from_millis(1)),
            ..SorterConfig::with_length(Duration::from_millis(100))
        };
        let (s, sink) = sorter(config);
        for t in &times {
            s.receive(&sample(*t));
            if rng.gen_ratio(1, 20) {
                s.release_aged();
            }
        }
        s.finish().unwrap();
        let out = timestamps(&sink);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
        let stats = s.stats();
        assert_eq!(stats.output_samples as usize, out.len());
        assert_eq!(stats.output_samples, stats.input_samples);
        assert_eq!(stats.input_samples + stats.late_dropped, times.len() as u64);
    }

    #[test]
    fn heap_never_exceeds_max() {
        let size = 10 + ENTRY_OVERHEAD;
        let config = SorterConfig {
            heap_max: size * 10,
            ..SorterConfig::with_length(Duration::from_secs(3600))
        };
        let (s, sink) = sorter(config);
        let mut last_evicted = 0;
        for i in 0..100 {
            assert!(s.receive(&sample(i * MS)));
            let stats = s.stats();
            assert!(stats.heap_size <= stats.heap_max);
            assert!(stats.evicted_samples >= last_evicted);
            last_evicted = stats.evicted_samples;
        }
        assert_eq!(last_evicted, 90);
        s.finish().unwrap();
        // The newest ten survive.
        assert_eq!(timestamps(&sink), (90..100).map(|i| i * MS).collect::<Vec<_>>());
    }

    #[test]
    #[traced_test]
    fn oversize_sample_is_discarded() {
        let config = SorterConfig {
            heap_max: 20,
            ..SorterConfig::default()
        };
        let (s, _sink) = sorter(config);
        assert!(!s.receive(&sample(1)));
        assert_eq!(s.stats().oversize_discards, 1);
        assert!(logs_contain("larger than sorter heap"));
    }

    #[test]
    fn late_samples_use_the_cache() {
        let config = SorterConfig {
            late_cache_size: 2,
            ..SorterConfig::with_length(Duration::from_millis(10))
        };
        let (s, sink) = sorter(config);
        for t in [0, 5 * MS, 6 * MS, 7 * MS, 30 * MS] {
            s.receive(&sample(t));
        }
        s.release_aged();
        // Released 0, 5, 6, 7 ms; cache holds 6 and 7 ms.
        assert_eq!(s.stats().last_output, Some(7 * MS));

        assert!(s.receive(&sample(6 * MS + 500)));
        assert!(!s.receive(&sample(MS)));
        let stats = s.stats();
        assert_eq!(stats.late_reinserted, 1);
        assert_eq!(stats.late_dropped, 1);

        s.finish().unwrap();
        assert_eq!(timestamps(&sink), vec![0, 5 * MS, 6 * MS, 7 * MS, 7 * MS, 30 * MS]);
    }

    #[test]
    fn zero_late_cache_drops_every_late_sample() {
        let config = SorterConfig {
            late_cache_size: 0,
            ..SorterConfig::with_length(Duration::from_millis(10))
        };
        let (s, _sink) = sorter(config);
        s.receive(&sample(0));
        s.receive(&sample(5 * MS));
        s.receive(&sample(30 * MS));
        s.release_aged();
        assert!(!s.receive(&sample(5 * MS - 1)));
        assert_eq!(s.stats().late_dropped, 1);
    }

    #[test]
    fn screen_count_ignores_outliers() {
        let config = SorterConfig {
            screen_count: 1,
            ..SorterConfig::with_length(Duration::from_millis(10))
        };
        let (s, sink) = sorter(config);
        s.receive(&sample(0));
        s.receive(&sample(5 * MS));
        s.receive(&sample(1_000_000 * MS));
        s.release_aged();
        assert!(sink.is_empty());
        s.finish().unwrap();
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn finish_is_idempotent_and_rejects_later_samples() {
        let (s, sink) = sorter(SorterConfig::default());
        s.receive(&sample(1));
        s.finish().unwrap();
        s.finish().unwrap();
        assert_eq!(sink.finish_count(), 1);
        assert!(!s.receive(&sample(2)));
        assert!(matches!(s.push(&sample(3)), Err(DsmError::SorterStopped(name)) if name == "test"));
        assert_eq!(s.stats().rejected_after_stop, 2);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn push_reports_screened_samples() {
        let (s, _sink) = sorter(SorterConfig {
            heap_max: 5,
            ..SorterConfig::default()
        });
        assert!(!s.push(&sample(1)).unwrap());
        assert_eq!(s.stats().oversize_discards, 1);
    }

    #[test]
    #[traced_test]
    fn extreme_late_sample_is_dropped() {
        let (s, _sink) = sorter(SorterConfig::with_length(Duration::from_millis(10)));
        s.receive(&sample(0));
        s.receive(&sample(DsmTime::MAX));
        s.release_aged();
        assert_eq!(s.stats().last_output, Some(0));
        assert!(!s.receive(&sample(DsmTime::MIN)));
        assert_eq!(s.stats().late_dropped, 1);
        assert!(logs_contain("late sample dropped"));
    }

    #[test]
    fn flush_thread_releases_on_its_own() {
        let config = SorterConfig {
            flush_interval: Some(Duration::from_millis(1)),
            ..SorterConfig::with_length(Duration::from_millis(1))
        };
        let (s, sink) = sorter(config);
        s.receive(&sample(0));
        s.receive(&sample(10 * MS));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(timestamps(&sink), vec![0]);
        drop(s);
    }

    #[test]
    fn block_policy_raises_heap_when_nothing_ages() {
        let size = 10 + ENTRY_OVERHEAD;
        let config = SorterConfig {
            heap_max: size * 4,
            overflow: OverflowPolicy::Block,
            flush_interval: Some(Duration::from_millis(1)),
            ..SorterConfig::with_length(Duration::from_secs(3600))
        };
        let (s, sink) = sorter(config);
        for i in 0..10 {
            assert!(s.receive(&sample(i * MS)));
        }
        let stats = s.stats();
        assert_eq!(stats.evicted_samples, 0);
        assert!(stats.heap_increases > 0);
        assert!(stats.heap_size <= stats.heap_max);
        s.finish().unwrap();
        assert_eq!(sink.len(), 10);
    }

    #[test]
    fn system_clock_discards_future_samples() {
        let config = SorterConfig {
            clock: ClockMode::SystemClock,
            ..SorterConfig::default()
        };
        let (s, _sink) = sorter(config);
        let now = system_time_now();
        assert!(s.receive(&sample(now)));
        assert!(!s.receive(&sample(now + 60 * USECS_PER_SEC)));
        assert_eq!(s.stats().future_samples, 1);
    }

    #[test]
    fn drop_returns_buffered_samples_to_pools() {
        let pools = SamplePools::new();
        let s = SampleSorter::new("drop", SorterConfig::default());
        let mut p = pools.get_sample(SampleType::Char, 4);
        p.set_timestamp(1);
        let sample = p.freeze();
        s.receive(&sample);
        drop(sample);
        assert_eq!(pools.outstanding(), 1);
        drop(s);
        assert_eq!(pools.outstanding(), 0);
    }

    #[test]
    fn config_durations_are_human_readable() {
        let config: SorterConfig =
            toml::from_str("length = \"2s\"\nflush_interval = \"50ms\"\noverflow = \"block\"").unwrap();
        assert_eq!(config.length, Duration::from_secs(2));
        assert_eq!(config.effective_flush_interval(), Duration::from_millis(50));
        assert_eq!(config.overflow, OverflowPolicy::Block);
        assert_eq!(
            SorterConfig::with_length(Duration::from_secs(60)).effective_flush_interval(),
            Duration::from_secs(1)
        );
        assert!(SorterConfig { heap_max: 0, ..SorterConfig::default() }.validate().is_err());
    }
}
