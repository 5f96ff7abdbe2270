//! Stage: a pool of workers sharing one output channel
//!
//! Each worker runs `setup` once, `step` until stop is observed, then
//! `close` once. Stop is cooperative: a worker notices it only when a
//! bounded wait on a channel, socket or store times out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channel::Channel;
use super::shutdown::StopToken;
use crate::error::{HighwayError, Result};
use crate::metrics::standard;
use crate::tensor::Batch;

/// Configuration for one stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Number of parallel workers
    pub workers: usize,
    /// Capacity of the stage's output channel, in batches
    pub queue_capacity: usize,
    /// Bound on every blocking wait, in milliseconds
    pub timeout_ms: u64,
    /// Base seed; worker `i` seeds its generator with `seed + i`
    pub seed: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            timeout_ms: 1000,
            seed: 0,
        }
    }
}

impl StageConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject configurations no stage can run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HighwayError::config("stage needs at least one worker"));
        }
        if self.queue_capacity == 0 {
            return Err(HighwayError::config("queue capacity must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(HighwayError::config("timeout must be positive"));
        }
        Ok(())
    }
}

/// Everything one worker can see: its identity, its seeded generator and
/// the channels it reads and writes
pub struct WorkerContext {
    stage: Arc<str>,
    index: usize,
    workers: usize,
    seed: u64,
    rng: StdRng,
    input: Option<Channel>,
    output: Channel,
    stop: StopToken,
    timeout: Duration,
}

impl WorkerContext {
    /// Name of the owning stage
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Index of this worker within its stage
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of workers in the owning stage
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Seed this worker's generator was created from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn output(&self) -> &Channel {
        &self.output
    }

    /// Read one batch from upstream
    pub async fn dequeue(&self) -> Result<Batch> {
        let input = self.input.as_ref().ok_or_else(|| {
            HighwayError::config(format!("stage {} has no upstream to dequeue from", self.stage))
        })?;
        input.dequeue(self.timeout, &self.stop).await
    }

    /// Write one batch to this stage's output channel
    pub async fn enqueue(&self, batch: Batch) -> Result<()> {
        self.output.enqueue(batch, self.timeout, &self.stop).await
    }

    /// Run CPU-bound work on the blocking pool, lending it this worker's
    /// generator
    pub async fn run_blocking<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StdRng) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut rng = std::mem::replace(&mut self.rng, StdRng::seed_from_u64(self.seed));
        let (result, rng) = tokio::task::spawn_blocking(move || {
            let result = f(&mut rng);
            (result, rng)
        })
        .await
        .map_err(|e| HighwayError::TaskFailed {
            message: e.to_string(),
        })?;
        self.rng = rng;
        Ok(result)
    }
}

/// Per-worker behaviour of a stage
///
/// `setup` and `close` default to no-ops. Returning
/// [`HighwayError::Stopped`] from any hook ends the worker cleanly; any other
/// error ends it as a failure (and skips `close`).
#[async_trait]
pub trait StageWorker: Send + 'static {
    async fn setup(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()>;

    async fn close(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Observed stop and ran `close`
    Closed,
    /// `close` itself failed
    CloseFailed(String),
    /// `setup` failed; the worker never ran
    SetupFailed(String),
    /// `step` returned an unhandled error
    Crashed(String),
    /// The worker task panicked or was aborted
    Panicked(String),
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Closed)
    }
}

/// Observable stage lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Constructed,
    Running,
    StopRequested,
    Terminated,
}

type WorkerFactory = Box<dyn FnMut(usize) -> Box<dyn StageWorker> + Send>;

/// Keeps the alive count and worker gauge honest even if the task panics
struct AliveGuard {
    alive: Arc<AtomicUsize>,
}

impl AliveGuard {
    fn new(alive: Arc<AtomicUsize>) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        standard::ACTIVE_WORKERS.inc();
        Self { alive }
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
        standard::ACTIVE_WORKERS.dec();
    }
}

/// A group of identical workers writing into one bounded channel
pub struct Stage {
    name: Arc<str>,
    config: StageConfig,
    factory: Option<WorkerFactory>,
    input: Option<Channel>,
    output: Channel,
    stop: StopToken,
    started: bool,
    handles: Vec<JoinHandle<WorkerExit>>,
    alive: Arc<AtomicUsize>,
}

impl Stage {
    /// Build an unstarted stage; `factory(i)` creates worker `i` at start
    pub fn configure<W, F>(
        name: impl Into<String>,
        config: StageConfig,
        mut factory: F,
    ) -> Result<Self>
    where
        W: StageWorker,
        F: FnMut(usize) -> W + Send + 'static,
    {
        config.validate()?;
        let output = Channel::bounded(config.queue_capacity)?;
        Ok(Self {
            name: Arc::from(name.into()),
            factory: Some(Box::new(move |index| Box::new(factory(index)) as Box<dyn StageWorker>)),
            config,
            input: None,
            output,
            stop: StopToken::new(),
            started: false,
            handles: Vec::new(),
            alive: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Bind the read side to an upstream channel; only before `start`
    pub fn attach(&mut self, upstream: Channel) -> Result<()> {
        if self.started {
            return Err(HighwayError::config(format!(
                "cannot attach stage {} after it started",
                self.name
            )));
        }
        self.input = Some(upstream);
        Ok(())
    }

    /// Spawn every worker on the current tokio runtime
    pub fn start(&mut self) -> Result<()> {
        let mut factory = self.factory.take().ok_or_else(|| {
            HighwayError::config(format!("stage {} was already started", self.name))
        })?;
        self.started = true;

        for index in 0..self.config.workers {
            let seed = self.config.seed.wrapping_add(index as u64);
            let ctx = WorkerContext {
                stage: self.name.clone(),
                index,
                workers: self.config.workers,
                seed,
                rng: StdRng::seed_from_u64(seed),
                input: self.input.clone(),
                output: self.output.clone(),
                stop: self.stop.clone(),
                timeout: self.config.timeout(),
            };
            let worker = factory(index);
            let guard = AliveGuard::new(self.alive.clone());
            self.handles.push(tokio::spawn(run_worker(worker, ctx, guard)));
        }

        info!(
            stage = %self.name,
            workers = self.config.workers,
            capacity = self.config.queue_capacity,
            "Stage started"
        );
        Ok(())
    }

    /// Push into this stage's output channel (stop-aware)
    pub async fn enqueue(&self, batch: Batch, timeout: Duration) -> Result<()> {
        self.output.enqueue(batch, timeout, &self.stop).await
    }

    /// Pop from this stage's output channel (stop-aware)
    pub async fn dequeue(&self, timeout: Duration) -> Result<Batch> {
        self.output.dequeue(timeout, &self.stop).await
    }

    /// Request stop and return immediately
    pub fn stop(&self) {
        if !self.stop.is_stopped() {
            debug!(stage = %self.name, "Stop requested");
        }
        self.stop.stop();
    }

    /// Handle to the output channel, for a downstream stage
    pub fn output(&self) -> Channel {
        self.output.clone()
    }

    /// Workers that have not exited yet
    pub fn alive_workers(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StageState {
        if !self.started {
            StageState::Constructed
        } else if !self.stop.is_stopped() {
            StageState::Running
        } else if self.alive_workers() > 0 {
            StageState::StopRequested
        } else {
            StageState::Terminated
        }
    }

    /// Wait for every worker to exit and report how each ended
    ///
    /// Does not request stop by itself.
    pub async fn join(&mut self) -> Vec<WorkerExit> {
        let mut exits = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(stage = %self.name, error = %e, "Worker task panicked");
                    standard::WORKER_FAILURES.inc();
                    WorkerExit::Panicked(e.to_string())
                }
            };
            exits.push(exit);
        }
        exits
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

async fn run_worker(
    mut worker: Box<dyn StageWorker>,
    mut ctx: WorkerContext,
    _guard: AliveGuard,
) -> WorkerExit {
    debug!(stage = %ctx.stage, worker = ctx.index, seed = ctx.seed, "Worker starting");

    match worker.setup(&mut ctx).await {
        Ok(()) => {}
        Err(e) if e.is_stopped() => return close_worker(worker, ctx).await,
        Err(e) => {
            error!(stage = %ctx.stage, worker = ctx.index, error = %e, "Worker setup failed");
            standard::WORKER_FAILURES.inc();
            return WorkerExit::SetupFailed(e.to_string());
        }
    }

    loop {
        match worker.step(&mut ctx).await {
            Ok(()) if ctx.stop.is_stopped() => break,
            Ok(()) => {}
            Err(e) if e.is_stopped() => break,
            Err(e) => {
                error!(stage = %ctx.stage, worker = ctx.index, error = %e, "Worker crashed");
                standard::WORKER_FAILURES.inc();
                return WorkerExit::Crashed(e.to_string());
            }
        }
    }

    close_worker(worker, ctx).await
}

async fn close_worker(mut worker: Box<dyn StageWorker>, mut ctx: WorkerContext) -> WorkerExit {
    match worker.close(&mut ctx).await {
        Ok(()) => {
            debug!(stage = %ctx.stage, worker = ctx.index, "Worker closed");
            WorkerExit::Closed
        }
        Err(e) => {
            warn!(stage = %ctx.stage, worker = ctx.index, error = %e, "Worker close failed");
            WorkerExit::CloseFailed(e.to_string())
        }
    }
}
