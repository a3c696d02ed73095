//! Stage runners for multi-stage data pipelines.
//!
//! This crate implements the strategies a pipeline driver can pick from to
//! execute one stage: a sequential FIFO runner, a fixed pool of FIFO workers,
//! and a dynamic pool that spawns a task per payload under a token budget.
//! All of them race every blocking step against a shared cancellation token
//! and report failures only through the stage's error sink.

pub mod config;
pub mod dynamic_pool;
pub mod events;
pub mod fifo;
pub mod fixed_pool;
pub mod params;
pub mod processor;
pub mod runner;

pub use config::{build_runner, RunnerConfig};
pub use dynamic_pool::DynamicWorkerPool;
pub use events::{EventEmitter, StageEvent, StopReason};
pub use fifo::Fifo;
pub use fixed_pool::{FixedWorkerPool, MAX_FIXED_WORKERS};
pub use params::StageParams;
pub use processor::{processor_fn, Processor, ProcessorFn, SharedProcessor};
pub use runner::StageRunner;

pub use tokio_util::sync::CancellationToken;
