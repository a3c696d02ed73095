//! Stage event system for observability.
//!
//! Emits [`StageEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, metrics collectors, dashboards) can follow
//! stage execution without coupling to the runner internals.

use serde::{Deserialize, Serialize};

/// Why a worker, or a dynamic pool's admission loop, stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The inbound stream was closed and fully consumed.
    InputClosed,
    /// The cancellation signal fired.
    Cancelled,
    /// The processor failed and the error was reported.
    Failed,
    /// Nobody is receiving on the outbound stream any more.
    OutputClosed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::InputClosed => "input_closed",
            StopReason::Cancelled => "cancelled",
            StopReason::Failed => "failed",
            StopReason::OutputClosed => "output_closed",
        };
        f.write_str(s)
    }
}

/// Events emitted while a stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageEvent {
    WorkerStarted {
        stage: usize,
        worker: usize,
    },
    WorkerStopped {
        stage: usize,
        worker: usize,
        reason: StopReason,
    },
    PayloadForwarded {
        stage: usize,
    },
    PayloadFiltered {
        stage: usize,
    },
    ProcessorFailed {
        stage: usize,
        error: String,
    },
    /// The error sink was full or closed and an error was discarded.
    ErrorDropped {
        stage: usize,
    },
    AdmissionHalted {
        stage: usize,
        reason: StopReason,
    },
    Drained {
        stage: usize,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<StageEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
