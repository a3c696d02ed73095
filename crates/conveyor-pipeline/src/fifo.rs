//! Sequential (FIFO) runner: one payload at a time, in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conveyor_types::Payload;

use crate::events::{StageEvent, StopReason};
use crate::params::StageParams;
use crate::processor::{Processor, SharedProcessor};
use crate::runner::{process_payload, report_join, StageRunner, Step};

/// Drives a single processor over the inbound stream, strictly in order.
///
/// Outputs leave the stage in the order their inputs arrived. The first
/// processor failure ends the stage.
pub struct Fifo<P> {
    processor: SharedProcessor<P>,
}

impl<P: Payload> Fifo<P> {
    pub fn new(processor: impl Processor<P> + 'static) -> Self {
        Self::from_shared(Arc::new(processor))
    }

    /// Build a runner around a processor that is also used elsewhere.
    pub fn from_shared(processor: SharedProcessor<P>) -> Self {
        Self { processor }
    }

    /// The worker loop. `worker` only labels logs and events.
    pub(crate) async fn drive(
        &self,
        worker: usize,
        cancel: &CancellationToken,
        params: &StageParams<P>,
    ) -> StopReason {
        let stage = params.stage_index();
        params.observe(StageEvent::WorkerStarted { stage, worker });
        tracing::debug!(stage, worker, "Worker started");

        let reason = loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                next = params.recv() => match next {
                    Some(payload) => payload,
                    None => break StopReason::InputClosed,
                },
            };

            if let Step::Stop(reason) =
                process_payload(self.processor.as_ref(), cancel, params, payload).await
            {
                break reason;
            }
        };

        tracing::debug!(stage, worker, %reason, "Worker stopped");
        params.observe(StageEvent::WorkerStopped {
            stage,
            worker,
            reason,
        });
        reason
    }
}

impl<P> Clone for Fifo<P> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
        }
    }
}

#[async_trait]
impl<P: Payload> StageRunner<P> for Fifo<P> {
    fn name(&self) -> &str {
        "fifo"
    }

    async fn run(&self, cancel: CancellationToken, params: StageParams<P>) {
        // A processor panic surfaces on the error sink, never in the caller.
        let mut worker = JoinSet::new();
        let fifo = self.clone();
        let worker_params = params.clone();
        worker.spawn(async move { fifo.drive(0, &cancel, &worker_params).await });

        while let Some(joined) = worker.join_next().await {
            report_join(&params, joined);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::processor::processor_fn;
    use conveyor_types::{Outcome, PipelineError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Num(u64);

    impl Payload for Num {
        fn mark_as_processed(self) {}
    }

    fn double() -> impl Processor<Num> {
        processor_fn(|_c, p: Num| async move { Ok(Outcome::Forward(Num(p.0 * 2))) })
    }

    #[tokio::test]
    async fn doubles_five_payloads_in_order() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);

        for v in 1..=5 {
            in_tx.send(Num(v)).await.unwrap();
        }
        drop(in_tx);

        Fifo::new(double())
            .run(CancellationToken::new(), params)
            .await;

        let mut got = Vec::new();
        while let Some(n) = out_rx.recv().await {
            got.push(n.0);
        }
        assert_eq!(got, vec![2, 4, 6, 8, 10]);
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let params = StageParams::new(2, in_rx, out_tx, err_tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let fail_on_two = processor_fn(move |_c, p: Num| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if p.0 == 2 {
                    return Err("bad value 2".into());
                }
                Ok(Outcome::Forward(p))
            }
        });

        for v in 1..=4 {
            in_tx.send(Num(v)).await.unwrap();
        }
        drop(in_tx);

        Fifo::new(fail_on_two)
            .run(CancellationToken::new(), params)
            .await;

        assert_eq!(out_rx.recv().await.unwrap().0, 1);
        assert!(out_rx.recv().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err: PipelineError = err_rx.recv().await.unwrap();
        assert_eq!(err.to_string(), "pipeline stage 2: bad value 2");
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returns_promptly_when_cancelled_while_idle() {
        let (_in_tx, in_rx) = mpsc::channel::<Num>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), Fifo::new(double()).run(cancel, params))
            .await
            .expect("fifo should stop on cancellation");
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emits_lifecycle_events() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let events = EventEmitter::new(16);
        let mut rx = events.subscribe();
        let params = StageParams::new(1, in_rx, out_tx, err_tx).with_events(events);

        in_tx.send(Num(1)).await.unwrap();
        drop(in_tx);
        Fifo::new(double())
            .run(CancellationToken::new(), params)
            .await;

        assert_eq!(
            rx.recv().await.unwrap(),
            StageEvent::WorkerStarted { stage: 1, worker: 0 }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StageEvent::PayloadForwarded { stage: 1 }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StageEvent::WorkerStopped {
                stage: 1,
                worker: 0,
                reason: StopReason::InputClosed,
            }
        );
    }

    #[tokio::test]
    async fn processor_panic_is_reported_not_raised() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let params = StageParams::new(8, in_rx, out_tx, err_tx);
        let explode = processor_fn(|_c, p: Num| async move {
            if p.0 == 2 {
                panic!("fifo processor exploded");
            }
            Ok(Outcome::Forward(p))
        });

        for v in 1..=3 {
            in_tx.send(Num(v)).await.unwrap();
        }
        drop(in_tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            Fifo::new(explode).run(CancellationToken::new(), params),
        )
        .await
        .expect("run should return after the worker panics");

        assert_eq!(out_rx.recv().await.unwrap().0, 1);
        assert!(out_rx.recv().await.is_none());
        match err_rx.recv().await.unwrap() {
            PipelineError::WorkerPanicked { stage, message } => {
                assert_eq!(stage, 8);
                assert_eq!(message, "fifo processor exploded");
            }
            other => panic!("Expected WorkerPanicked, got: {other:?}"),
        }
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_after_cancellation_is_reported_once() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let params = StageParams::new(0, in_rx, out_tx, err_tx);
        let cancel_then_fail = processor_fn(|c: CancellationToken, _p: Num| async move {
            c.cancel();
            Err::<Outcome<Num>, _>("disk corrupted".into())
        });

        in_tx.send(Num(1)).await.unwrap();
        in_tx.send(Num(2)).await.unwrap();

        Fifo::new(cancel_then_fail)
            .run(CancellationToken::new(), params)
            .await;

        let err = err_rx.recv().await.unwrap();
        assert_eq!(err.to_string(), "pipeline stage 0: disk corrupted");
        assert!(err_rx.try_recv().is_err());
    }

    #[test]
    fn runner_name() {
        assert_eq!(Fifo::new(double()).name(), "fifo");
    }
}
