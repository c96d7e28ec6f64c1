//! Per-type sample pools with small/medium/large free lists.
//!
//! Each [`SamplePool`] keeps its free buffers in three lock-free queues,
//! tiered by element count. A request is normally served from the tier that
//! matches its size; when that tier is empty it borrows from a larger tier
//! only if the larger tiers have buffers to spare, otherwise it allocates.
//!
//! Accounting: every buffer ever allocated is either in a free list or held
//! by a live sample, so `allocated == small + medium + large + outstanding`
//! whenever no acquire/return is in flight. [`PoolStats::is_balanced`] checks
//! this, and debug builds assert that a pool never gets back more samples
//! than it handed out (reference counting misuse).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use crate::sample::{PooledSample, SampleType};

/// Largest element count (exclusive) served from the small tier.
pub const SMALL_SAMPLE_MAX_ELEMENTS: usize = 64;

/// Largest element count (exclusive) served from the medium tier.
pub const MEDIUM_SAMPLE_MAX_ELEMENTS: usize = 512;

/// Shared state of one pool; referenced by every sample it hands out.
pub(crate) struct PoolShared {
    sample_type: SampleType,
    small: SegQueue<Vec<u8>>,
    medium: SegQueue<Vec<u8>>,
    large: SegQueue<Vec<u8>>,
    allocated: AtomicUsize,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl PoolShared {
    fn tier_for(&self, elements: usize) -> &SegQueue<Vec<u8>> {
        if elements < SMALL_SAMPLE_MAX_ELEMENTS {
            &self.small
        } else if elements < MEDIUM_SAMPLE_MAX_ELEMENTS {
            &self.medium
        } else {
            &self.large
        }
    }

    /// Return a buffer released by the last reference to a sample.
    pub(crate) fn put(&self, buffer: Vec<u8>) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            prev > 0,
            "{} pool got back more samples than it handed out",
            self.sample_type
        );
        let elements = buffer.len() / self.sample_type.element_size();
        self.tier_for(elements).push(buffer);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool of sample buffers for one [`SampleType`].
#[derive(Clone)]
pub struct SamplePool {
    shared: Arc<PoolShared>,
}

impl SamplePool {
    /// Create an empty pool for `sample_type`. Buffers are allocated on demand.
    #[must_use]
    pub fn new(sample_type: SampleType) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                sample_type,
                small: SegQueue::new(),
                medium: SegQueue::new(),
                large: SegQueue::new(),
                allocated: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Element type served by this pool.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.shared.sample_type
    }

    /// Get a sample whose payload holds at least `byte_len` bytes.
    ///
    /// The returned sample has `len() == byte_len`; the content of reused
    /// buffers is not cleared.
    #[must_use]
    pub fn get_sample(&self, byte_len: usize) -> PooledSample {
        let shared = &self.shared;
        let elements = byte_len.div_ceil(shared.sample_type.element_size());
        let (nsmall, nmedium, nlarge) = (shared.small.len(), shared.medium.len(), shared.large.len());

        // Use the matching tier unless it is empty and the next larger
        // tiers have buffers to spare.
        let queue = if elements < SMALL_SAMPLE_MAX_ELEMENTS && (nsmall > 0 || nmedium + nlarge < 4) {
            &shared.small
        } else if elements < MEDIUM_SAMPLE_MAX_ELEMENTS && (nmedium > 0 || nlarge < 2) {
            &shared.medium
        } else {
            &shared.large
        };

        let buffer = match queue.pop() {
            Some(mut buffer) => {
                if buffer.len() < byte_len {
                    buffer.resize(byte_len, 0);
                }
                buffer
            }
            None => {
                shared.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; byte_len]
            }
        };

        let out = shared.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        shared.high_water.fetch_max(out, Ordering::Relaxed);
        shared.total_acquires.fetch_add(1, Ordering::Relaxed);

        PooledSample::from_buffer(shared.sample_type, buffer, byte_len, Some(Arc::clone(shared)))
    }

    /// Samples currently held outside the pool.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            sample_type: s.sample_type,
            allocated: s.allocated.load(Ordering::Relaxed),
            outstanding: s.outstanding.load(Ordering::Acquire),
            small_in: s.small.len(),
            medium_in: s.medium.len(),
            large_in: s.large.len(),
            high_water: s.high_water.load(Ordering::Relaxed),
            total_acquires: s.total_acquires.load(Ordering::Relaxed),
            total_returns: s.total_returns.load(Ordering::Relaxed),
        }
    }

    /// Free every cached buffer. Returns how many were released.
    pub fn clear(&self) -> usize {
        let s = &self.shared;
        let mut freed = 0;
        for queue in [&s.small, &s.medium, &s.large] {
            while queue.pop().is_some() {
                freed += 1;
            }
        }
        s.allocated.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}

/// Counters of one [`SamplePool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Element type of the pool.
    pub sample_type: SampleType,
    /// Buffers allocated and not yet freed.
    pub allocated: usize,
    /// Samples held by producers or clients.
    pub outstanding: usize,
    /// Buffers in the small free list.
    pub small_in: usize,
    /// Buffers in the medium free list.
    pub medium_in: usize,
    /// Buffers in the large free list.
    pub large_in: usize,
    /// Maximum of `outstanding` seen so far.
    pub high_water: usize,
    /// Samples handed out since creation.
    pub total_acquires: u64,
    /// Samples returned since creation.
    pub total_returns: u64,
}

impl PoolStats {
    /// Conservation of buffers: allocated == free lists + outstanding.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.allocated == self.small_in + self.medium_in + self.large_in + self.outstanding
    }
}

/// One [`SamplePool`] per [`SampleType`].
///
/// Shared as `Arc<SamplePools>` by everything that creates samples.
pub struct SamplePools {
    pools: [SamplePool; 10],
}

impl SamplePools {
    /// Create empty pools for every sample type.
    #[must_use]
    pub fn new() -> Self {
        debug!("sample pools created");
        Self {
            pools: SampleType::ALL.map(SamplePool::new),
        }
    }

    /// Pool serving `sample_type`.
    #[must_use]
    pub fn pool(&self, sample_type: SampleType) -> &SamplePool {
        &self.pools[usize::from(sample_type.code())]
    }

    /// Get a sample of `sample_type` holding `byte_len` payload bytes.
    #[must_use]
    pub fn get_sample(&self, sample_type: SampleType, byte_len: usize) -> PooledSample {
        self.pool(sample_type).get_sample(byte_len)
    }

    /// Samples outstanding across every pool.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pools.iter().map(SamplePool::outstanding).sum()
    }

    /// Buffers allocated across every pool.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.pools.iter().map(|p| p.stats().allocated).sum()
    }

    /// Counters of the pools that have been used.
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(SamplePool::stats)
            .filter(|s| s.total_acquires > 0)
            .collect()
    }

    /// Free all cached buffers, warning about samples still held elsewhere.
    pub fn clear(&self) {
        for pool in &self.pools {
            pool.clear();
            let outstanding = pool.outstanding();
            if outstanding > 0 {
                warn!(
                    sample_type = %pool.sample_type(),
                    outstanding,
                    "samples still outstanding at pool teardown"
                );
            }
        }
    }
}

impl Default for SamplePools {
    fn default() -> Self {
        Self::new()
    }
}
