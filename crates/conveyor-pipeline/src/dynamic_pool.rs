//! Dynamic worker pool: one task per payload, bounded by a token pool.
//!
//! The admission loop takes a payload from the inbound stream, waits for a
//! free token, and spawns a task for that payload. It never waits on the
//! processing itself, only on token availability, so a payload starts as soon
//! as there is both data and capacity.
//!
//! Tokens are owned semaphore permits. A task holds its permit until it
//! finishes, so the permit goes back exactly once whether the payload was
//! forwarded, filtered, failed, cancelled, or the task panicked.
//!
//! # Shutdown
//!
//! Admission ends on cancellation, inbound closure, or the first task that
//! fails (or finds the outbound stream closed). In-flight tasks are not
//! cancelled by a failure; `run` waits until every token is back in the pool
//! before returning.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conveyor_types::{Payload, PipelineError, Result};

use crate::events::{StageEvent, StopReason};
use crate::params::StageParams;
use crate::processor::{Processor, SharedProcessor};
use crate::runner::{process_payload, report_join, StageRunner, Step};

/// Elastic per-payload parallelism capped at `max_workers`.
///
/// No ordering guarantee holds between outputs once more than one payload is
/// in flight.
pub struct DynamicWorkerPool<P> {
    processor: SharedProcessor<P>,
    tokens: Arc<Semaphore>,
    max_workers: u32,
}

impl<P: Payload> DynamicWorkerPool<P> {
    pub fn new(processor: impl Processor<P> + 'static, max_workers: usize) -> Result<Self> {
        Self::from_shared(Arc::new(processor), max_workers)
    }

    /// Build a pool around a processor that is also used elsewhere.
    ///
    /// Returns [`PipelineError::InvalidWorkerCount`] when `max_workers` is 0.
    pub fn from_shared(processor: SharedProcessor<P>, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(PipelineError::InvalidWorkerCount {
                runner: "dynamic_pool",
                requested: max_workers,
            });
        }
        let max_workers = u32::try_from(max_workers)
            .ok()
            .filter(|n| (*n as usize) <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| {
                PipelineError::Config(format!("max_workers {max_workers} exceeds the token limit"))
            })?;

        Ok(Self {
            processor,
            tokens: Arc::new(Semaphore::new(max_workers as usize)),
            max_workers,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers as usize
    }

    /// Tokens currently in the pool, i.e. not held by an in-flight payload.
    pub fn available_tokens(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Accept payloads until cancellation, closure, or a halted task.
    async fn admit(
        &self,
        cancel: &CancellationToken,
        params: &StageParams<P>,
        tasks: &mut JoinSet<()>,
    ) -> StopReason {
        let stage = params.stage_index();
        let halt = CancellationToken::new();
        let halted: Arc<OnceLock<StopReason>> = Arc::new(OnceLock::new());

        loop {
            while let Some(joined) = tasks.try_join_next() {
                report_join(params, joined);
            }

            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                _ = halt.cancelled() => return halt_reason(&halted),
                next = params.recv() => match next {
                    Some(payload) => payload,
                    None => return StopReason::InputClosed,
                },
            };

            // The payload is dropped unprocessed if admission ends here.
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                _ = halt.cancelled() => return halt_reason(&halted),
                permit = Arc::clone(&self.tokens).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // closed
                    Err(_) => return StopReason::Cancelled,
                },
            };

            let processor = Arc::clone(&self.processor);
            let cancel = cancel.clone();
            let params = params.clone();
            let halt = halt.clone();
            let halted = Arc::clone(&halted);
            tasks.spawn(async move {
                let _token = token;
                match process_payload(processor.as_ref(), &cancel, &params, payload).await {
                    Step::Continue | Step::Stop(StopReason::Cancelled) => {}
                    Step::Stop(reason) => {
                        let _ = halted.set(reason);
                        halt.cancel();
                    }
                }
            });
            tracing::trace!(stage, in_flight = tasks.len(), "Payload admitted");
        }
    }
}

fn halt_reason(halted: &OnceLock<StopReason>) -> StopReason {
    halted.get().copied().unwrap_or(StopReason::Failed)
}

#[async_trait]
impl<P: Payload> StageRunner<P> for DynamicWorkerPool<P> {
    fn name(&self) -> &str {
        "dynamic_pool"
    }

    async fn run(&self, cancel: CancellationToken, params: StageParams<P>) {
        let stage = params.stage_index();
        let mut tasks = JoinSet::new();

        let reason = self.admit(&cancel, &params, &mut tasks).await;
        tracing::debug!(stage, %reason, in_flight = tasks.len(), "Admission loop ended");
        params.observe(StageEvent::AdmissionHalted { stage, reason });

        // Every token back in the pool means no payload task is still running.
        let started = Instant::now();
        if let Ok(all) = self.tokens.acquire_many(self.max_workers).await {
            drop(all);
        }
        while let Some(joined) = tasks.join_next().await {
            report_join(&params, joined);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(stage, duration_ms, "Dynamic pool drained");
        params.observe(StageEvent::Drained { stage, duration_ms });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
