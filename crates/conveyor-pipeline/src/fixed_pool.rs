//! Fixed worker pool: a static number of FIFO workers sharing one stage.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conveyor_types::{Payload, PipelineError, Result};

use crate::fifo::Fifo;
use crate::params::StageParams;
use crate::processor::{Processor, SharedProcessor};
use crate::runner::{report_join, StageRunner};

/// Upper bound on the number of workers a [`FixedWorkerPool`] may be built with.
pub const MAX_FIXED_WORKERS: usize = 4096;

/// Runs `num_workers` independent [`Fifo`] workers against the same inbound
/// and outbound streams.
///
/// Work goes to whichever worker receives first. Outputs keep their relative
/// order only among payloads handled by the same worker. A failing worker
/// stops on its own; the others keep going.
pub struct FixedWorkerPool<P> {
    workers: Vec<Fifo<P>>,
}

impl<P: Payload> FixedWorkerPool<P> {
    pub fn new(processor: impl Processor<P> + 'static, num_workers: usize) -> Result<Self> {
        Self::from_shared(Arc::new(processor), num_workers)
    }

    /// Build a pool around a processor that is also used elsewhere.
    ///
    /// Returns [`PipelineError::InvalidWorkerCount`] when `num_workers` is 0
    /// and [`PipelineError::Config`] above [`MAX_FIXED_WORKERS`].
    pub fn from_shared(processor: SharedProcessor<P>, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(PipelineError::InvalidWorkerCount {
                runner: "fixed_pool",
                requested: num_workers,
            });
        }
        if num_workers > MAX_FIXED_WORKERS {
            return Err(PipelineError::Config(format!(
                "workers {num_workers} exceeds the limit of {MAX_FIXED_WORKERS}"
            )));
        }

        let workers = (0..num_workers)
            .map(|_| Fifo::from_shared(Arc::clone(&processor)))
            .collect();
        Ok(Self { workers })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

#[async_trait]
impl<P: Payload> StageRunner<P> for FixedWorkerPool<P> {
    fn name(&self) -> &str {
        "fixed_pool"
    }

    async fn run(&self, cancel: CancellationToken, params: StageParams<P>) {
        let stage = params.stage_index();
        let mut tasks = JoinSet::new();

        for (worker, fifo) in self.workers.iter().enumerate() {
            let fifo = fifo.clone();
            let cancel = cancel.clone();
            let params = params.clone();
            tasks.spawn(async move { fifo.drive(worker, &cancel, &params).await });
        }

        while let Some(joined) = tasks.join_next().await {
            report_join(&params, joined);
        }
        tracing::debug!(stage, workers = self.workers.len(), "All workers stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
