//! Standard raw → processed sample chain.
//!
//! ```text
//!  sources ──▶ raw sorter ──▶ SensorDispatcher ──▶ processed sorter ──▶ clients
//!                  │
//!                  └──▶ raw clients (archivers)
//! ```
//!
//! Processors may emit samples with timestamps shifted from their raw input
//! (e.g. corrected for sensor lag), so processed samples are sorted again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use dsm_pool::SampleId;

use crate::dispatch::{DispatchStats, SampleProcessor, SensorDispatcher};
use crate::error::Result;
use crate::sorter::{SampleSorter, SorterConfig, SorterStats};
use crate::source::{ClientHandle, SampleClient, SampleSource};

/// Sorter settings of a [`SamplePipeline`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sorter in front of the dispatcher.
    pub raw_sorter: SorterConfig,
    /// Sorter after the dispatcher.
    pub processed_sorter: SorterConfig,
}

/// Counters of every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Raw sorter.
    pub raw: SorterStats,
    /// Dispatcher.
    pub dispatch: DispatchStats,
    /// Processed sorter.
    pub processed: SorterStats,
}

/// Two sorters around a sensor dispatcher.
pub struct SamplePipeline {
    name: String,
    raw_sorter: Arc<SampleSorter>,
    dispatcher: Arc<SensorDispatcher>,
    processed_sorter: Arc<SampleSorter>,
}

impl SamplePipeline {
    /// Build and wire the stages.
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        let name = name.into();
        let raw_sorter = Arc::new(SampleSorter::new(format!("{name}-raw"), config.raw_sorter));
        let dispatcher = Arc::new(SensorDispatcher::new(format!("{name}-dispatch")));
        let processed_sorter = Arc::new(SampleSorter::new(
            format!("{name}-processed"),
            config.processed_sorter,
        ));
        raw_sorter.add_sample_client(dispatcher.clone());
        dispatcher.add_sample_client(processed_sorter.clone());
        Self {
            name,
            raw_sorter,
            dispatcher,
            processed_sorter,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feed samples of `source` into the raw sorter.
    pub fn connect(&self, source: &dyn SampleSource) -> ClientHandle {
        source.add_sample_client(self.raw_sorter.clone())
    }

    /// Undo [`connect`](Self::connect).
    pub fn disconnect(&self, source: &dyn SampleSource, handle: ClientHandle) -> bool {
        source.remove_sample_client(handle)
    }

    /// Register a client for sorted raw samples.
    pub fn add_raw_client(&self, client: Arc<dyn SampleClient>) -> ClientHandle {
        self.raw_sorter.add_sample_client(client)
    }

    /// Register a client for sorted processed samples.
    pub fn add_processed_client(&self, client: Arc<dyn SampleClient>) -> ClientHandle {
        self.processed_sorter.add_sample_client(client)
    }

    /// Route raw samples with `id` to `processor`.
    pub fn add_sensor(&self, id: SampleId, processor: Arc<dyn SampleProcessor>) {
        self.dispatcher.add_sensor(id, processor);
    }

    /// The raw sorter.
    pub fn raw_sorter(&self) -> &Arc<SampleSorter> {
        &self.raw_sorter
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<SensorDispatcher> {
        &self.dispatcher
    }

    /// The processed sorter.
    pub fn processed_sorter(&self) -> &Arc<SampleSorter> {
        &self.processed_sorter
    }

    /// Drain both sorters in order and finish every client.
    pub fn finish(&self) -> Result<()> {
        // Finishing the raw sorter cascades through the dispatcher.
        let raw = self.raw_sorter.finish();
        let processed = self.processed_sorter.finish();
        let stats = self.stats();
        info!(
            pipeline = %self.name,
            raw = stats.raw.output_samples,
            processed = stats.processed.output_samples,
            unmatched = stats.dispatch.unmatched,
            "pipeline finished"
        );
        raw.and(processed)
    }

    /// Counters of every stage.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            raw: self.raw_sorter.stats(),
            dispatch: self.dispatcher.stats(),
            processed: self.processed_sorter.stats(),
        }
    }
}
