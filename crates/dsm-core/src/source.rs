//! Sample distribution: sources fan samples out to registered clients.
//!
//! A source owns a [`SampleDistributor`] and hands it every sample it
//! produces. Registered [`SampleClient`]s see each sample by reference during
//! [`SampleClient::receive`]; a client that needs the sample afterwards clones
//! it, which takes a reference. The source's own reference is released when
//! [`SampleDistributor::distribute`] returns.
//!
//! # Concurrency
//!
//! Registration may run concurrently with distribution. The client list is
//! copy-on-write: `distribute` takes a snapshot and iterates it without
//! holding any lock, so a client may even remove itself from inside
//! `receive`. A client removed while a distribution is in flight may still
//! see that one sample.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use dsm_pool::{DsmTime, Sample, SampleId};

// =============================================================================
// Client Trait
// =============================================================================

/// Receiver of samples from one or more sources.
///
/// # Contract
///
/// - `receive()` runs on the thread of the distributing source and should
///   return quickly; queue work elsewhere if it is heavy
/// - the sample reference is only valid for the call; clone to keep it
/// - the boolean result is informational (counted by the source) and never
///   stops delivery to other clients
pub trait SampleClient: Send + Sync {
    /// Handle one sample. Return false if it was rejected or dropped.
    fn receive(&self, sample: &Sample) -> bool;

    /// Orderly end of data: push out anything buffered.
    fn finish(&self) {}

    /// Descriptive name for logs.
    fn name(&self) -> &str {
        "unnamed_client"
    }
}

/// Opaque handle returned by client registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u64);

impl ClientHandle {
    /// Internal id, for logging.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Client built from a closure.
pub struct ClientFn<F> {
    name: String,
    f: F,
}

impl<F: Fn(&Sample) -> bool + Send + Sync> ClientFn<F> {
    /// Wrap `f` as a client named `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F: Fn(&Sample) -> bool + Send + Sync> SampleClient for ClientFn<F> {
    fn receive(&self, sample: &Sample) -> bool {
        (self.f)(sample)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Client that keeps every sample it receives.
#[derive(Default)]
pub struct SampleCollector {
    samples: Mutex<Vec<Sample>>,
    finished: AtomicU64,
}

impl SampleCollector {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples received so far.
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Take the samples received so far.
    pub fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.samples.lock())
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// True when nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Number of `finish()` calls seen.
    pub fn finish_count(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}

impl SampleClient for SampleCollector {
    fn receive(&self, sample: &Sample) -> bool {
        self.samples.lock().push(sample.clone());
        true
    }

    fn finish(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "sample_collector"
    }
}

// =============================================================================
// Distributor
// =============================================================================

#[derive(Clone)]
struct Registration {
    handle: ClientHandle,
    id: Option<SampleId>,
    client: Arc<dyn SampleClient>,
}

/// Counters kept by a [`SampleDistributor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributorStats {
    /// Samples distributed.
    pub samples: u64,
    /// Payload bytes distributed.
    pub bytes: u64,
    /// `receive()` calls that returned true.
    pub accepted: u64,
    /// `receive()` calls that returned false.
    pub rejected: u64,
    /// Timestamp of the last distributed sample.
    pub last_timestamp: Option<DsmTime>,
}

/// Client registry and fan-out used by every sample source.
pub struct SampleDistributor {
    name: String,
    clients: RwLock<Arc<Vec<Registration>>>,
    next_handle: AtomicU64,
    keep_stats: AtomicBool,
    samples: AtomicU64,
    bytes: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_timestamp: AtomicI64,
}

impl SampleDistributor {
    /// Distributor with no clients. Statistics are kept by default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: RwLock::new(Arc::new(Vec::new())),
            next_handle: AtomicU64::new(1),
            keep_stats: AtomicBool::new(true),
            samples: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_timestamp: AtomicI64::new(DsmTime::MIN),
        }
    }

    /// Name of the owning source.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, client: Arc<dyn SampleClient>, id: Option<SampleId>) -> ClientHandle {
        let handle = ClientHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            source = %self.name,
            client = client.name(),
            handle = handle.0,
            sample_id = ?id.map(|i| i.to_string()),
            "client registered"
        );
        let mut guard = self.clients.write();
        let mut list = Vec::clone(&guard);
        list.push(Registration { handle, id, client });
        *guard = Arc::new(list);
        handle
    }

    /// Register a client for every sample.
    pub fn add_client(&self, client: Arc<dyn SampleClient>) -> ClientHandle {
        self.register(client, None)
    }

    /// Register a client for samples with one id only.
    pub fn add_client_for_id(&self, client: Arc<dyn SampleClient>, id: SampleId) -> ClientHandle {
        self.register(client, Some(id))
    }

    /// Deregister a client. Returns false for unknown handles.
    pub fn remove_client(&self, handle: ClientHandle) -> bool {
        let mut guard = self.clients.write();
        let Some(pos) = guard.iter().position(|r| r.handle == handle) else {
            return false;
        };
        let mut list = Vec::clone(&guard);
        let removed = list.remove(pos);
        *guard = Arc::new(list);
        debug!(source = %self.name, client = removed.client.name(), "client removed");
        true
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Turn statistics on or off.
    pub fn set_keep_stats(&self, keep: bool) {
        self.keep_stats.store(keep, Ordering::Relaxed);
    }

    /// Deliver `sample` to every interested client, then drop the source's reference.
    ///
    /// Clients registered for the sample's id are called first, then the
    /// general clients, each group in registration order.
    pub fn distribute(&self, sample: Sample) {
        let clients = Arc::clone(&self.clients.read());
        let id = sample.id();
        let mut accepted = 0;
        let mut rejected = 0;
        let specific = clients.iter().filter(|r| r.id == Some(id));
        let general = clients.iter().filter(|r| r.id.is_none());
        for reg in specific.chain(general) {
            if reg.client.receive(&sample) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        if self.keep_stats.load(Ordering::Relaxed) {
            self.samples.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(sample.len() as u64, Ordering::Relaxed);
            self.accepted.fetch_add(accepted, Ordering::Relaxed);
            self.rejected.fetch_add(rejected, Ordering::Relaxed);
            self.last_timestamp.store(sample.timestamp(), Ordering::Relaxed);
        }
    }

    /// Distribute a batch in order.
    pub fn distribute_all(&self, samples: impl IntoIterator<Item = Sample>) {
        for sample in samples {
            self.distribute(sample);
        }
    }

    /// Call `finish()` on every client.
    pub fn flush(&self) {
        let clients = Arc::clone(&self.clients.read());
        for reg in clients.iter() {
            reg.client.finish();
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DistributorStats {
        let last = self.last_timestamp.load(Ordering::Relaxed);
        DistributorStats {
            samples: self.samples.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_timestamp: (last != DsmTime::MIN).then_some(last),
        }
    }
}

// =============================================================================
// Source Trait
// =============================================================================

/// Producer of samples. Implementors only provide their distributor.
pub trait SampleSource {
    /// The distributor that fans out this source's samples.
    fn distributor(&self) -> &SampleDistributor;

    /// Register a client for every sample.
    fn add_sample_client(&self, client: Arc<dyn SampleClient>) -> ClientHandle {
        self.distributor().add_client(client)
    }

    /// Register a client for samples with one id.
    fn add_sample_client_for_id(&self, client: Arc<dyn SampleClient>, id: SampleId) -> ClientHandle {
        self.distributor().add_client_for_id(client, id)
    }

    /// Deregister a client.
    fn remove_sample_client(&self, handle: ClientHandle) -> bool {
        self.distributor().remove_client(handle)
    }

    /// Number of registered clients.
    fn sample_client_count(&self) -> usize {
        self.distributor().client_count()
    }

    /// Ask every client to push out buffered data.
    fn flush(&self) {
        self.distributor().flush();
    }
}
