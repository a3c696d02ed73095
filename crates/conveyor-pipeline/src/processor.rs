//! Processor trait and the closure adapter.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conveyor_types::{Outcome, Payload, ProcessorError};

// ---------------------------------------------------------------------------
// Processor trait
// ---------------------------------------------------------------------------

/// Transforms a single payload.
///
/// The same processor instance is shared by every worker of a pool, so it
/// must tolerate concurrent calls. Long-running work should watch `cancel`
/// and bail out once it fires.
#[async_trait]
pub trait Processor<P: Payload>: Send + Sync {
    async fn process(
        &self,
        cancel: &CancellationToken,
        payload: P,
    ) -> std::result::Result<Outcome<P>, ProcessorError>;
}

/// A processor shared between runners and workers.
pub type SharedProcessor<P> = Arc<dyn Processor<P>>;

// ---------------------------------------------------------------------------
// ProcessorFn: closure adapter
// ---------------------------------------------------------------------------

/// Adapts an async closure into a [`Processor`].
///
/// The closure receives its own handle to the cancellation token.
pub struct ProcessorFn<F, P> {
    f: F,
    _payload: PhantomData<fn(P)>,
}

/// Build a processor from an async closure.
pub fn processor_fn<P, F, Fut>(f: F) -> ProcessorFn<F, P>
where
    P: Payload,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Outcome<P>, ProcessorError>> + Send,
{
    ProcessorFn {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> Processor<P> for ProcessorFn<F, P>
where
    P: Payload,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Outcome<P>, ProcessorError>> + Send,
{
    async fn process(
        &self,
        cancel: &CancellationToken,
        payload: P,
    ) -> std::result::Result<Outcome<P>, ProcessorError> {
        (self.f)(cancel.clone(), payload).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
