//! Per-stage execution context handed to a runner by the pipeline driver.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use conveyor_types::{Payload, PipelineError};

use crate::events::{EventEmitter, StageEvent};

/// The streams and identity a stage runs with.
///
/// Cloning a `StageParams` yields another handle to the **same** streams, so
/// every worker of a pool competes for the same inbound payloads and feeds the
/// same outbound stream.
pub struct StageParams<P> {
    stage: usize,
    input: Arc<Mutex<mpsc::Receiver<P>>>,
    output: mpsc::Sender<P>,
    errors: mpsc::Sender<PipelineError>,
    events: Option<EventEmitter>,
}

impl<P: Payload> StageParams<P> {
    pub fn new(
        stage: usize,
        input: mpsc::Receiver<P>,
        output: mpsc::Sender<P>,
        errors: mpsc::Sender<PipelineError>,
    ) -> Self {
        Self {
            stage,
            input: Arc::new(Mutex::new(input)),
            output,
            errors,
            events: None,
        }
    }

    /// Attach an event emitter that observes this stage.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Index of the stage, used for error attribution.
    pub fn stage_index(&self) -> usize {
        self.stage
    }

    /// Receive the next inbound payload. `None` once the stream is closed and
    /// drained.
    ///
    /// Concurrent callers are serialised on the stream; dropping the future
    /// releases the stream for the next caller.
    pub async fn recv(&self) -> Option<P> {
        self.input.lock().await.recv().await
    }

    /// Send a payload downstream. Waits for capacity; hands the payload back
    /// if the downstream receiver is gone.
    pub async fn send(&self, payload: P) -> std::result::Result<(), P> {
        self.output.send(payload).await.map_err(|e| e.0)
    }

    /// Report an error without ever waiting on the sink.
    ///
    /// A full or closed sink discards the error. Returns whether it was
    /// delivered.
    pub fn emit_error(&self, err: PipelineError) -> bool {
        match self.errors.try_send(err) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(err)) => {
                tracing::warn!(stage = self.stage, error = %err, "Error sink full, dropping error");
                self.observe(StageEvent::ErrorDropped { stage: self.stage });
                false
            }
            Err(mpsc::error::TrySendError::Closed(err)) => {
                tracing::warn!(stage = self.stage, error = %err, "Error sink closed, dropping error");
                self.observe(StageEvent::ErrorDropped { stage: self.stage });
                false
            }
        }
    }

    pub(crate) fn observe(&self, event: StageEvent) {
        if let Some(ref events) = self.events {
            events.emit(event);
        }
    }
}

impl<P> Clone for StageParams<P> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            input: Arc::clone(&self.input),
            output: self.output.clone(),
            errors: self.errors.clone(),
            events: self.events.clone(),
        }
    }
}

impl<P> std::fmt::Debug for StageParams<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageParams")
            .field("stage", &self.stage)
            .field("observed", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Num(u32);

    impl Payload for Num {
        fn mark_as_processed(self) {}
    }

    #[tokio::test]
    async fn clones_share_the_inbound_stream() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);
        let other = params.clone();

        in_tx.send(Num(1)).await.unwrap();
        in_tx.send(Num(2)).await.unwrap();
        drop(in_tx);

        assert_eq!(params.recv().await, Some(Num(1)));
        assert_eq!(other.recv().await, Some(Num(2)));
        assert_eq!(params.recv().await, None);
    }

    #[tokio::test]
    async fn emit_error_drops_when_sink_full() {
        let (_in_tx, in_rx) = mpsc::channel::<Num>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let events = EventEmitter::new(8);
        let mut observed = events.subscribe();
        let params = StageParams::new(5, in_rx, out_tx, err_tx).with_events(events);

        assert!(params.emit_error(PipelineError::stage(5, "first")));
        assert!(!params.emit_error(PipelineError::stage(5, "second")));

        let delivered = err_rx.recv().await.unwrap();
        assert_eq!(delivered.to_string(), "pipeline stage 5: first");
        assert!(err_rx.try_recv().is_err());
        assert_eq!(
            observed.recv().await.unwrap(),
            StageEvent::ErrorDropped { stage: 5 }
        );
    }

    #[tokio::test]
    async fn emit_error_on_closed_sink_does_not_block() {
        let (_in_tx, in_rx) = mpsc::channel::<Num>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        drop(err_rx);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);

        assert!(!params.emit_error(PipelineError::Other("lost".into())));
    }

    #[tokio::test]
    async fn send_hands_payload_back_when_downstream_gone() {
        let (_in_tx, in_rx) = mpsc::channel::<Num>(1);
        let (out_tx, out_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);
        drop(out_rx);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);

        assert_eq!(params.send(Num(9)).await, Err(Num(9)));
    }

    #[test]
    fn stage_index_is_stable() {
        let (_in_tx, in_rx) = mpsc::channel::<Num>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let params = StageParams::new(11, in_rx, out_tx, err_tx);
        assert_eq!(params.stage_index(), 11);
        assert_eq!(params.clone().stage_index(), 11);
    }
}
