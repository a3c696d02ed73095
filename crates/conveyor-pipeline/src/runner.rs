//! Stage runner trait and the per-payload step shared by every strategy.

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use conveyor_types::{Outcome, Payload, PipelineError};

use crate::events::{StageEvent, StopReason};
use crate::params::StageParams;
use crate::processor::Processor;

// ---------------------------------------------------------------------------
// StageRunner trait
// ---------------------------------------------------------------------------

/// Runs one stage of a pipeline.
///
/// `run` returns once the stage has fully stopped: its input was exhausted,
/// `cancel` fired, or a processor failure ended it. Failures are only ever
/// reported on the error sink of `params`, so a caller cannot tell a
/// cancelled stage from a completed one by the return alone.
#[async_trait]
pub trait StageRunner<P: Payload>: Send + Sync {
    /// The runner strategy identifier (e.g. "fifo", "fixed_pool").
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken, params: StageParams<P>);
}

// ---------------------------------------------------------------------------
// Per-payload step
// ---------------------------------------------------------------------------

/// What a worker should do after handling one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop(StopReason),
}

/// Process one payload and route the result: forward it, mark it processed,
/// or report the failure.
pub(crate) async fn process_payload<P: Payload>(
    processor: &dyn Processor<P>,
    cancel: &CancellationToken,
    params: &StageParams<P>,
    payload: P,
) -> Step {
    let stage = params.stage_index();

    match processor.process(cancel, payload).await {
        Err(source) => {
            tracing::debug!(stage, error = %source, "Processor failed");
            params.observe(StageEvent::ProcessorFailed {
                stage,
                error: source.to_string(),
            });
            params.emit_error(PipelineError::stage(stage, source));
            Step::Stop(StopReason::Failed)
        }
        Ok(Outcome::Filtered(payload)) => {
            payload.mark_as_processed();
            params.observe(StageEvent::PayloadFiltered { stage });
            Step::Continue
        }
        Ok(Outcome::Forward(payload)) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Stop(StopReason::Cancelled),
                sent = params.send(payload) => match sent {
                    Ok(()) => {
                        params.observe(StageEvent::PayloadForwarded { stage });
                        Step::Continue
                    }
                    Err(_lost) => {
                        tracing::debug!(stage, "Outbound stream closed, dropping payload");
                        Step::Stop(StopReason::OutputClosed)
                    }
                },
            }
        }
    }
}

/// Report a worker task that ended in a panic. Clean exits are ignored.
pub(crate) fn report_join<P: Payload, T>(
    params: &StageParams<P>,
    joined: std::result::Result<T, JoinError>,
) {
    if let Err(err) = joined {
        let stage = params.stage_index();
        let message = panic_message(err);
        tracing::error!(stage, error = %message, "Worker panicked");
        params.emit_error(PipelineError::WorkerPanicked { stage, message });
    }
}

/// Render a task panic payload for error reporting.
pub(crate) fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let panic = err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
