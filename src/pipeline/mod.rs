pub mod coordinator;
pub mod worker;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::compute::{Compute, CpuCorrelator};
use crate::config::{Config, Params};
use crate::emit::section::{EmissionSection, OutputStream};
use crate::ingest::section::{IngestionSection, InputStream};
use crate::ingest::stats::IngestSnapshot;

pub use coordinator::{PipelineCoordinator, ReadTransactions};
pub use worker::Worker;

/// A compute worker to start: its locality and its compute stage.
pub struct WorkerSpec {
    pub locality: u32,
    pub compute: Box<dyn Compute>,
}

/// Every worker may hold a result buffer while waiting for its turn to
/// emit; the writer needs one more to make progress.
fn reserve_result_buffers(params: &mut Params, nr_workers: usize) {
    params.emission_pool_size = params.emission_pool_size.max(nr_workers + 1);
}

/// Pipeline wires ingestion, coordination, compute workers and emission.
pub struct Pipeline {
    params: Arc<Params>,
    section: Arc<IngestionSection>,
    emission: Arc<EmissionSection>,
    coordinator: Arc<PipelineCoordinator>,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Pipeline {
    /// Open every configured stream and start the pipeline with CPU workers.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut params = cfg.params().context("resolving run parameters")?;
        reserve_result_buffers(&mut params, cfg.workers.len());
        let params = Arc::new(params);

        info!(
            start = %params.start_time,
            stop = %params.stop_time,
            window = params.window_samples,
            history = params.history_samples,
            ring = params.ring_samples,
            real_time = params.real_time,
            "starting correlator",
        );

        // 0. Outputs first so nothing is ingested without a destination.
        let emission = EmissionSection::open(&params, &cfg.outputs).context("opening outputs")?;

        // 1. Inputs; their threads start receiving immediately.
        let section =
            IngestionSection::open(Arc::clone(&params), &cfg.inputs).context("opening inputs")?;

        // 2. Workers.
        let workers = cfg
            .workers
            .iter()
            .map(|w| WorkerSpec {
                locality: w.locality,
                compute: Box::new(CpuCorrelator::new()),
            })
            .collect();

        Self::assemble(params, section, emission, workers)
    }

    /// Start a pipeline from already-opened streams.
    pub fn start(
        mut params: Params,
        inputs: Vec<InputStream>,
        outputs: Vec<OutputStream>,
        workers: Vec<WorkerSpec>,
    ) -> Result<Self> {
        reserve_result_buffers(&mut params, workers.len());
        let params = Arc::new(params);

        let emission = EmissionSection::with_streams(&params, outputs)?;
        let section = IngestionSection::with_streams(Arc::clone(&params), inputs)?;

        Self::assemble(params, section, emission, workers)
    }

    fn assemble(
        params: Arc<Params>,
        section: IngestionSection,
        emission: EmissionSection,
        workers: Vec<WorkerSpec>,
    ) -> Result<Self> {
        let section = Arc::new(section);
        let emission = Arc::new(emission);

        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::clone(&section) as Arc<dyn ReadTransactions>,
            params.start_time,
            params.stop_time,
            params.window_samples,
            emission.localities().to_vec(),
        ));

        let pipeline = Self {
            params,
            section,
            emission,
            coordinator,
            workers: Mutex::new(Vec::with_capacity(workers.len())),
        };

        for (index, spec) in workers.into_iter().enumerate() {
            pipeline.spawn_worker(index, spec)?;
        }

        info!(workers = pipeline.workers.lock().len(), "pipeline started");

        Ok(pipeline)
    }

    fn spawn_worker(&self, index: usize, spec: WorkerSpec) -> Result<()> {
        let mut worker = Worker::new(
            index,
            spec.locality,
            Arc::clone(&self.params),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.section),
            Arc::clone(&self.emission),
            spec.compute,
        );

        let coordinator = Arc::clone(&self.coordinator);
        let section = Arc::clone(&self.section);
        let emission = Arc::clone(&self.emission);

        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                let result = worker.run();

                if let Err(e) = &result {
                    error!(worker = index, error = %e, "worker failed, stopping pipeline");
                    coordinator.request_stop();
                    section.release();
                    emission.release();
                }

                result
            })
            .with_context(|| format!("spawning worker {index}"))?;

        self.workers.lock().push(handle);
        Ok(())
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn ingest_stats(&self) -> IngestSnapshot {
        self.section.stats()
    }

    /// Result blocks dropped under overload.
    pub fn dropped_results(&self) -> u64 {
        self.emission.dropped()
    }

    /// Ask the pipeline to stop; [`Pipeline::wait`] returns once it has.
    pub fn stop(&self) {
        info!("stopping pipeline");
        self.coordinator.request_stop();
        self.section.release();
    }

    /// Wait for the workers to finish, then tear everything down.
    ///
    /// Returns the first error of any worker, ingestion or output thread.
    pub fn wait(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut first_error = None;

        for handle in workers {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("worker thread panicked")),
            };

            if let Err(e) = outcome {
                self.coordinator.request_stop();
                self.section.release();
                self.emission.release();
                first_error.get_or_insert(e);
            }
        }

        // Ingestion first: its threads may still be blocked on readers.
        if let Err(e) = self.section.shutdown() {
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.emission.finish() {
            first_error.get_or_insert(e);
        }

        let stats = self.section.stats();
        info!(
            packets = stats.packets,
            dropped_packets = stats.dropped_packets(),
            stale_samples = stats.stale_samples,
            forced_advances = stats.forced_advances,
            emitted = self.emission.emitted(),
            dropped_results = self.emission.dropped(),
            "pipeline stopped",
        );

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.workers.lock().is_empty() {
            return;
        }

        self.stop();
        if let Err(e) = self.wait() {
            error!(error = %e, "pipeline dropped with error");
        }
    }
}
