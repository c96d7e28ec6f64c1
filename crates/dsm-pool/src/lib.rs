//! Pool-backed, reference counted samples.
//!
//! Acquisition threads produce a steady stream of small, time-tagged records.
//! Allocating each one from the heap is wasteful, so this crate keeps a pool
//! of payload buffers per element type and hands out [`Sample`] handles that
//! return their buffer automatically when the last reference is dropped.
//!
//! - [`SamplePools`]: explicit pool context, one [`SamplePool`] per [`SampleType`]
//! - [`PooledSample`]: exclusive, mutable sample under construction
//! - [`Sample`]: immutable, cheaply cloneable, shareable across threads
//!
//! # Example
//!
//! ```
//! use dsm_pool::{SampleId, SamplePools, SampleType};
//!
//! let pools = SamplePools::new();
//! let mut raw = pools.get_sample(SampleType::Char, 5);
//! raw.set_id(SampleId::new(1, 100));
//! raw.set_timestamp(1_700_000_000_000_000);
//! raw.copy_from_slice(b"12.5\n");
//!
//! let sample = raw.freeze();
//! let held = sample.clone(); // a client keeps a reference
//! drop(sample);
//! assert_eq!(pools.outstanding(), 1);
//! drop(held);
//! assert_eq!(pools.outstanding(), 0);
//! ```

pub mod pool;
pub mod sample;

pub use pool::{PoolStats, SamplePool, SamplePools, MEDIUM_SAMPLE_MAX_ELEMENTS, SMALL_SAMPLE_MAX_ELEMENTS};
pub use sample::{DsmTime, PooledSample, Sample, SampleId, SampleType, USECS_PER_MSEC, USECS_PER_SEC};
