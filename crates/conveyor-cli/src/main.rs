//! CLI binary for driving a single pipeline stage with integer payloads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use conveyor_pipeline::{processor_fn, EventEmitter, RunnerConfig, StageEvent, StageParams};
use conveyor_types::{Outcome, Payload, PipelineError};

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Run a pipeline stage under a chosen runner strategy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed integers through a doubling stage
    Run {
        /// Runner configuration file (JSON)
        #[arg(short, long, conflicts_with_all = ["strategy", "workers"])]
        config: Option<PathBuf>,

        /// Runner strategy when no config file is given
        #[arg(short, long, value_enum, default_value = "fifo")]
        strategy: Strategy,

        /// Worker count for the pool strategies
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Number of payloads to feed (values 1..=count)
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,

        /// Simulated work per payload
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Make the processor fail on this input value
        #[arg(long)]
        fail_at: Option<u64>,

        /// Filter out inputs that are multiples of K
        #[arg(long)]
        skip_multiples_of: Option<u64>,

        /// Cancel the stage after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print output and summary as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Validate a runner configuration file
    Validate {
        /// Path to the configuration file
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Fifo,
    Fixed,
    Dynamic,
}

impl Strategy {
    fn config(self, workers: usize) -> RunnerConfig {
        match self {
            Strategy::Fifo => RunnerConfig::Fifo,
            Strategy::Fixed => RunnerConfig::FixedPool { workers },
            Strategy::Dynamic => RunnerConfig::DynamicPool {
                max_workers: workers,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            strategy,
            workers,
            count,
            delay_ms,
            fail_at,
            skip_multiples_of,
            timeout_ms,
            json,
        } => {
            let runner_config = match config {
                Some(path) => RunnerConfig::load(&path)?,
                None => strategy.config(workers),
            };
            let options = RunOptions {
                count,
                delay: Duration::from_millis(delay_ms),
                fail_at,
                skip_multiples_of,
                timeout: timeout_ms.map(Duration::from_millis),
                json,
            };
            cmd_run(&runner_config, &options).await?;
        }
        Commands::Validate { config } => {
            cmd_validate(&config)?;
        }
    }

    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = RunnerConfig::load(path)?;
    config.validate()?;
    println!(
        "Runner configuration is valid: {} (concurrency {})",
        serde_json::to_string(&config)?,
        config.concurrency()
    );
    Ok(())
}

struct RunOptions {
    count: u64,
    delay: Duration,
    fail_at: Option<u64>,
    skip_multiples_of: Option<u64>,
    timeout: Option<Duration>,
    json: bool,
}

/// Counts payloads that left the stage without being forwarded.
#[derive(Default)]
struct Tally {
    filtered: AtomicUsize,
}

struct Number {
    value: u64,
    tally: Arc<Tally>,
}

impl Payload for Number {
    fn mark_as_processed(self) {
        tracing::debug!(value = self.value, "Payload filtered");
        self.tally.filtered.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    runner: String,
    fed: u64,
    forwarded: usize,
    filtered: usize,
    errors: Vec<String>,
    cancelled: bool,
}

/// Largest buffer put between the driver and the stage.
const MAX_CHANNEL_CAPACITY: usize = 1024;

/// Two slots per concurrent payload, within `1..=MAX_CHANNEL_CAPACITY`.
fn channel_capacity(concurrency: usize) -> usize {
    concurrency.saturating_mul(2).clamp(1, MAX_CHANNEL_CAPACITY)
}

/// Log stage events until the stage drops its emitter. Returns how many were seen.
async fn log_events(mut observed: broadcast::Receiver<StageEvent>) -> usize {
    let mut seen = 0;
    loop {
        match observed.recv().await {
            Ok(event) => {
                seen += 1;
                tracing::debug!(?event, "Stage event");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    seen
}

async fn cmd_run(config: &RunnerConfig, options: &RunOptions) -> anyhow::Result<()> {
    let fail_at = options.fail_at;
    let skip = options.skip_multiples_of.filter(|k| *k > 0);
    let delay = options.delay;

    let doubler = processor_fn(move |cancel: CancellationToken, payload: Number| async move {
        // Cancellation cuts the simulated work short; the runner drops the result.
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if Some(payload.value) == fail_at {
            return Err(format!("refusing value {}", payload.value).into());
        }
        if skip.is_some_and(|k| payload.value % k == 0) {
            return Ok(Outcome::Filtered(payload));
        }
        Ok(Outcome::Forward(Number {
            value: payload.value * 2,
            tally: payload.tally,
        }))
    });
    let runner = config.build(Arc::new(doubler))?;

    let capacity = channel_capacity(config.concurrency());
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, mut out_rx) = mpsc::channel(capacity);
    let (err_tx, mut err_rx) = mpsc::channel::<PipelineError>(16);

    let events = EventEmitter::default();
    tokio::spawn(log_events(events.subscribe()));
    let params = StageParams::new(0, in_rx, out_tx, err_tx).with_events(events);

    let cancel = CancellationToken::new();
    let tally = Arc::new(Tally::default());

    // Cancel on Ctrl-C or when the time limit runs out.
    let watchdog = {
        let cancel = cancel.clone();
        let timeout = options.timeout;
        tokio::spawn(async move {
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, cancelling stage"),
                _ = deadline => tracing::info!("Time limit reached, cancelling stage"),
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        })
    };

    let feeder = {
        let cancel = cancel.clone();
        let tally = Arc::clone(&tally);
        let count = options.count;
        tokio::spawn(async move {
            for value in 1..=count {
                let payload = Number {
                    value,
                    tally: Arc::clone(&tally),
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = in_tx.send(payload) => if sent.is_err() { break },
                }
            }
        })
    };

    let errors = tokio::spawn(async move {
        let mut messages = Vec::new();
        while let Some(err) = err_rx.recv().await {
            tracing::warn!(error = %err, "Stage reported an error");
            messages.push(err.to_string());
        }
        messages
    });

    let stage = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            runner.run(cancel, params).await;
            runner
        })
    };

    let mut forwarded = 0;
    while let Some(number) = out_rx.recv().await {
        forwarded += 1;
        if options.json {
            println!("{}", serde_json::json!({ "value": number.value }));
        } else {
            println!("{}", number.value);
        }
    }

    let runner = stage.await?;
    feeder.abort();
    let errors = errors.await?;
    let cancelled = cancel.is_cancelled();
    cancel.cancel();
    watchdog.await?;

    let summary = Summary {
        runner: runner.name().to_string(),
        fed: options.count,
        forwarded,
        filtered: tally.filtered.load(Ordering::Relaxed),
        errors,
        cancelled,
    };
    tracing::debug!(?summary, "Stage finished");

    if options.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!();
        println!("Runner: {}", summary.runner);
        println!("Forwarded: {}", summary.forwarded);
        println!("Filtered: {}", summary.filtered);
        println!("Errors: {}", summary.errors.len());
        for err in &summary.errors {
            println!("  {err}");
        }
        if summary.cancelled {
            println!("(cancelled before the input was exhausted)");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
