//! Shared types and errors for the Conveyor stage engine.
//!
//! This crate provides the foundational types used across the other Conveyor crates:
//! - `PipelineError`: unified error taxonomy
//! - `Payload`: the contract every unit of work flowing between stages fulfils
//! - `Outcome`: what a processor decided to do with a payload

/// Opaque failure returned by a processor. The engine only wraps it with the
/// stage index; it never inspects the content.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all Conveyor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // === Construction Errors ===
    #[error("{runner}: worker count must be > 0 (got {requested})")]
    InvalidWorkerCount {
        runner: &'static str,
        requested: usize,
    },

    #[error("Invalid runner configuration: {0}")]
    Config(String),

    // === Stage Errors ===
    #[error("pipeline stage {stage}: {source}")]
    Stage {
        stage: usize,
        #[source]
        source: ProcessorError,
    },

    #[error("pipeline stage {stage}: worker panicked: {message}")]
    WorkerPanicked { stage: usize, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Wrap a processor failure with the index of the stage it happened in.
    pub fn stage(stage: usize, source: impl Into<ProcessorError>) -> Self {
        PipelineError::Stage {
            stage,
            source: source.into(),
        }
    }

    /// The stage an error is attributed to, if any.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::WorkerPanicked { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }

    /// Returns `true` for errors that prevent a runner from being built at all.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidWorkerCount { .. } | PipelineError::Config(_)
        )
    }
}

/// A convenience alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Payload: unit of work flowing between stages
// ---------------------------------------------------------------------------

/// A unit of work that moves through the stages of a pipeline.
///
/// Payloads are owned by exactly one stage at a time. Ownership moves to the
/// next stage when the payload is sent on the outbound stream. A payload that
/// is dropped from the pipeline instead (because a processor filtered it out)
/// is handed to [`mark_as_processed`](Payload::mark_as_processed), which
/// consumes it so it cannot be forwarded afterwards.
pub trait Payload: Send + Sized + 'static {
    fn mark_as_processed(self);
}

// ---------------------------------------------------------------------------
// Outcome: result of processing one payload
// ---------------------------------------------------------------------------

/// What a processor decided to do with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<P> {
    /// Send the (possibly transformed) payload to the next stage.
    Forward(P),
    /// Drop the payload. The runner marks it processed.
    Filtered(P),
}

impl<P> Outcome<P> {
    pub fn is_forward(&self) -> bool {
        matches!(self, Outcome::Forward(_))
    }

    pub fn is_filtered(&self) -> bool {
        matches!(self, Outcome::Filtered(_))
    }

    /// Unwrap the payload regardless of the decision.
    pub fn into_inner(self) -> P {
        match self {
            Outcome::Forward(p) | Outcome::Filtered(p) => p,
        }
    }
}
