//! Runner configuration: pick a strategy by name and build it.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use conveyor_types::{Payload, PipelineError, Result};

use crate::dynamic_pool::DynamicWorkerPool;
use crate::fifo::Fifo;
use crate::fixed_pool::{FixedWorkerPool, MAX_FIXED_WORKERS};
use crate::processor::SharedProcessor;
use crate::runner::StageRunner;

/// Which runner strategy a stage uses.
///
/// Serialized with a `strategy` tag:
///
/// ```json
/// { "strategy": "dynamic_pool", "max_workers": 8 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RunnerConfig {
    #[default]
    Fifo,
    FixedPool {
        workers: usize,
    },
    DynamicPool {
        max_workers: usize,
    },
}

impl RunnerConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Read a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Check worker counts without building a runner.
    pub fn validate(&self) -> Result<()> {
        match *self {
            RunnerConfig::Fifo => Ok(()),
            RunnerConfig::FixedPool { workers: 0 } => Err(PipelineError::InvalidWorkerCount {
                runner: "fixed_pool",
                requested: 0,
            }),
            RunnerConfig::DynamicPool { max_workers: 0 } => {
                Err(PipelineError::InvalidWorkerCount {
                    runner: "dynamic_pool",
                    requested: 0,
                })
            }
            RunnerConfig::FixedPool { workers } if workers > MAX_FIXED_WORKERS => {
                Err(PipelineError::Config(format!(
                    "workers {workers} exceeds the limit of {MAX_FIXED_WORKERS}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Upper bound on payloads processed concurrently by the built runner.
    pub fn concurrency(&self) -> usize {
        match *self {
            RunnerConfig::Fifo => 1,
            RunnerConfig::FixedPool { workers } => workers,
            RunnerConfig::DynamicPool { max_workers } => max_workers,
        }
    }

    /// Build the configured runner around `processor`.
    pub fn build<P: Payload>(
        &self,
        processor: SharedProcessor<P>,
    ) -> Result<Box<dyn StageRunner<P>>> {
        let runner: Box<dyn StageRunner<P>> = match *self {
            RunnerConfig::Fifo => Box::new(Fifo::from_shared(processor)),
            RunnerConfig::FixedPool { workers } => {
                Box::new(FixedWorkerPool::from_shared(processor, workers)?)
            }
            RunnerConfig::DynamicPool { max_workers } => {
                Box::new(DynamicWorkerPool::from_shared(processor, max_workers)?)
            }
        };
        tracing::debug!(runner = runner.name(), concurrency = self.concurrency(), "Built stage runner");
        Ok(runner)
    }
}

/// Convenience for building from an owned processor.
pub fn build_runner<P: Payload>(
    config: &RunnerConfig,
    processor: impl crate::processor::Processor<P> + 'static,
) -> Result<Box<dyn StageRunner<P>>> {
    config.build(Arc::new(processor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
