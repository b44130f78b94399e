//! Pull-based worker pool for tile execution.
//!
//! Jobs enter a bounded queue in partition order and a fixed number of worker
//! tasks pull from it, so uneven per-tile cost load-balances itself.
//! Completion order is unconstrained; results are re-associated with their
//! tile, never with arrival order. All pool state (queue, counters, stop
//! channel) lives inside the `run` call, so independent runs can coexist.

use crate::error::TileError;
use crate::executor::{QueryEngine, TileResult};
use crate::metrics::Metrics;
use crate::partition::Tile;
use crate::recipe::Recipe;
use crate::scheduler::{Job, JobStatus, Manifest, TileFailure, TileOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub max_workers: usize,

    /// Times a failed tile is re-queued before it is marked failed
    pub max_retries: usize,

    /// Initial retry backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Un-merged results held in flight, as a multiple of `max_workers`
    pub result_buffer_factor: usize,

    /// Consecutive failures after which a worker is recycled
    pub recycle_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            result_buffer_factor: 2,
            recycle_threshold: 3,
        }
    }
}

/// How a run-level stop is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Halt new dispatch, let in-flight jobs drain to completion.
    Graceful,

    /// Abort in-flight jobs at their next suspension point.
    Hard,
}

/// Caller-side handle to stop a running scheduler.
pub struct StopHandle {
    tx: watch::Sender<Option<StopMode>>,
}

impl StopHandle {
    /// Create a handle and the signal the scheduler listens on.
    pub fn new() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, StopSignal { rx, _tx: None })
    }

    pub fn stop(&self, mode: StopMode) {
        let _ = self.tx.send(Some(mode));
    }
}

/// Receiver side of the stop channel.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopMode>>,
    // Keeps the channel open for signals that can never fire
    _tx: Option<Arc<watch::Sender<Option<StopMode>>>>,
}

impl StopSignal {
    /// A signal that never fires, for runs without stop control.
    pub fn inert() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            _tx: Some(Arc::new(tx)),
        }
    }
}

/// A tile's results on their way to the merge stage.
#[derive(Debug)]
pub struct CompletedTile {
    pub tile: Tile,
    pub result: TileResult,
}

/// Worker-to-supervisor events.
enum Event {
    Started {
        tile_id: String,
    },
    Retried {
        tile_id: String,
    },
    Succeeded {
        tile_id: String,
        attempts: usize,
    },
    Failed {
        tile_id: String,
        attempts: usize,
        error: TileError,
    },
    Recycled {
        worker_id: usize,
    },
}

/// Everything a worker task needs, cloneable so recycled workers can be
/// respawned with fresh state.
#[derive(Clone)]
struct WorkerCtx {
    engine: Arc<dyn QueryEngine>,
    recipe: Arc<Recipe>,
    job_rx: async_channel::Receiver<Job>,
    job_tx: async_channel::Sender<Job>,
    event_tx: mpsc::UnboundedSender<Event>,
    results_tx: mpsc::Sender<CompletedTile>,
    stop: watch::Receiver<Option<StopMode>>,
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
}

/// Supervisor-side accounting for one run.
struct RunState {
    statuses: HashMap<String, JobStatus>,
    outcomes: HashMap<String, Result<usize, (usize, TileError)>>,
    terminal: usize,
}

impl RunState {
    /// Apply one worker event. Returns true when the worker that sent it has
    /// exited and should be replaced.
    fn apply(&mut self, event: Event, metrics: &Metrics) -> bool {
        match event {
            Event::Started { tile_id } => {
                self.statuses.insert(tile_id, JobStatus::Running);
            }
            Event::Retried { tile_id } => {
                metrics.add_tile_retried();
                self.statuses.insert(tile_id, JobStatus::Pending);
            }
            Event::Succeeded { tile_id, attempts } => {
                self.statuses.insert(tile_id.clone(), JobStatus::Succeeded);
                self.outcomes.insert(tile_id, Ok(attempts));
                self.terminal += 1;
                metrics.add_tile_succeeded();
            }
            Event::Failed {
                tile_id,
                attempts,
                error,
            } => {
                self.statuses.insert(tile_id.clone(), JobStatus::Failed);
                self.outcomes.insert(tile_id, Err((attempts, error)));
                self.terminal += 1;
                metrics.add_tile_failed();
            }
            Event::Recycled { worker_id } => {
                metrics.add_worker_recycled();
                tracing::warn!("Recycling worker {} after repeated failures", worker_id);
                return true;
            }
        }
        false
    }

    /// Remove still-queued jobs after a stop and account for them as cancelled.
    fn drain_pending(&mut self, job_rx: &async_channel::Receiver<Job>) {
        while let Ok(job) = job_rx.try_recv() {
            self.statuses
                .insert(job.tile.tile_id.clone(), JobStatus::Failed);
            self.outcomes.insert(
                job.tile.tile_id.clone(),
                Err((job.attempt, TileError::Cancelled)),
            );
            self.terminal += 1;
        }
    }

    fn running(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == JobStatus::Running)
            .count()
    }
}

/// The tile handler's dispatch core.
pub struct TileScheduler {
    engine: Arc<dyn QueryEngine>,
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
}

impl TileScheduler {
    pub fn new(engine: Arc<dyn QueryEngine>, config: SchedulerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            engine,
            config,
            metrics,
        }
    }

    /// Bounded hand-off channel to the merge stage, sized so at most a small
    /// multiple of the worker count is held un-merged at once.
    pub fn result_channel(&self) -> (mpsc::Sender<CompletedTile>, mpsc::Receiver<CompletedTile>) {
        let capacity = (self.config.max_workers * self.config.result_buffer_factor).max(1);
        mpsc::channel(capacity)
    }

    /// Execute the recipe for every tile and account for each of them.
    ///
    /// Successful results stream through `results_tx` as they complete; the
    /// returned manifest lists every tile exactly once, in partition order.
    pub async fn run(
        &self,
        recipe: Arc<Recipe>,
        tiles: Vec<Tile>,
        results_tx: mpsc::Sender<CompletedTile>,
        stop: StopSignal,
    ) -> Manifest {
        let total = tiles.len();
        let order: Vec<String> = tiles.iter().map(|t| t.tile_id.clone()).collect();

        let mut state = RunState {
            statuses: order
                .iter()
                .map(|id| (id.clone(), JobStatus::Pending))
                .collect(),
            outcomes: HashMap::new(),
            terminal: 0,
        };

        let (job_tx, job_rx) = async_channel::bounded(total.max(1));
        for tile in tiles {
            job_tx
                .send(Job { tile, attempt: 0 })
                .await
                .expect("job queue is sized to hold every tile");
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let worker_count = self.config.max_workers.max(1).min(total.max(1));
        tracing::info!(
            "Dispatching {} tiles across {} workers (max {} retries per tile)",
            total,
            worker_count,
            self.config.max_retries
        );

        let ctx = WorkerCtx {
            engine: self.engine.clone(),
            recipe,
            job_rx: job_rx.clone(),
            job_tx: job_tx.clone(),
            event_tx,
            results_tx,
            stop: stop.rx.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        };

        let mut workers = JoinSet::new();
        let mut next_worker_id = 0;
        for _ in 0..worker_count {
            workers.spawn(worker_loop(ctx.clone(), next_worker_id));
            next_worker_id += 1;
        }

        let mut stop_rx = stop.rx.clone();
        let mut stop_watch_alive = true;
        let mut stopping: Option<StopMode> = *stop_rx.borrow();

        while state.terminal < total {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    // ctx is held by the supervisor, so the channel stays open
                    let Some(event) = maybe_event else { break };
                    let respawn = state.apply(event, &self.metrics);
                    if respawn && stopping.is_none() {
                        workers.spawn(worker_loop(ctx.clone(), next_worker_id));
                        next_worker_id += 1;
                    }
                    if stopping.is_some() {
                        state.drain_pending(&job_rx);
                    }
                }
                changed = stop_rx.changed(), if stop_watch_alive && stopping.is_none() => {
                    match changed {
                        Ok(()) => {
                            stopping = *stop_rx.borrow();
                            if let Some(mode) = stopping {
                                tracing::info!(
                                    "Stop requested ({:?}): {} jobs in flight, cancelling pending jobs",
                                    mode,
                                    state.running()
                                );
                                state.drain_pending(&job_rx);
                            }
                        }
                        Err(_) => stop_watch_alive = false,
                    }
                }
                joined = workers.join_next(), if !workers.is_empty() => {
                    let _ = joined;
                    // Events may still be queued from the exited worker;
                    // recycling respawns happen while draining them.
                    while let Ok(event) = event_rx.try_recv() {
                        let respawn = state.apply(event, &self.metrics);
                        if respawn && stopping.is_none() {
                            workers.spawn(worker_loop(ctx.clone(), next_worker_id));
                            next_worker_id += 1;
                        }
                    }
                    if workers.is_empty() && state.terminal < total {
                        tracing::warn!(
                            "All workers exited with {} tiles unaccounted",
                            total - state.terminal
                        );
                        state.drain_pending(&job_rx);
                        break;
                    }
                }
            }
        }

        // No further dispatch: closing the queue releases idle workers.
        job_tx.close();
        drop(ctx);
        while workers.join_next().await.is_some() {}

        let mut manifest = Manifest::default();
        for tile_id in order {
            match state.outcomes.remove(&tile_id) {
                Some(Ok(attempts)) => manifest.succeeded.push(TileOutcome { tile_id, attempts }),
                Some(Err((attempts, error))) => manifest.failed.push(TileFailure {
                    tile_id,
                    attempts,
                    error,
                }),
                // A worker exited without reporting (e.g. the result receiver
                // was dropped mid-teardown); account for the tile anyway.
                None => manifest.failed.push(TileFailure {
                    tile_id,
                    attempts: 0,
                    error: TileError::Cancelled,
                }),
            }
        }

        tracing::info!("Scheduler finished: {}", manifest);
        manifest
    }
}

async fn worker_loop(ctx: WorkerCtx, worker_id: usize) {
    let mut stop_rx = ctx.stop.clone();
    let mut consecutive_failures = 0usize;

    loop {
        if stop_rx.borrow().is_some() {
            return;
        }

        let job = tokio::select! {
            job = ctx.job_rx.recv() => match job {
                Ok(job) => job,
                Err(_) => return, // queue closed, run is over
            },
            _ = stop_broadcast(&mut stop_rx) => continue,
        };

        let tile_id = job.tile.tile_id.clone();
        let _ = ctx.event_tx.send(Event::Started {
            tile_id: tile_id.clone(),
        });

        let started = Instant::now();
        // One engine session per invocation (the trait contract); a hard stop
        // abandons the session at the next suspension point.
        let outcome = {
            let mut exec = ctx.engine.execute(&ctx.recipe, &job.tile);
            tokio::select! {
                res = &mut exec => Some(res),
                _ = hard_stop(&mut stop_rx) => None,
            }
        };
        ctx.metrics.add_execute_time(started.elapsed());

        let attempts = job.attempt + 1;
        let Some(result) = outcome else {
            let _ = ctx.event_tx.send(Event::Failed {
                tile_id,
                attempts,
                error: TileError::Cancelled,
            });
            return;
        };

        match result.and_then(|r| check_outputs(&ctx.recipe, r)) {
            Ok(result) => {
                consecutive_failures = 0;
                let completed = CompletedTile {
                    tile: job.tile,
                    result,
                };
                let receiver_alive = ctx.results_tx.send(completed).await.is_ok();
                let _ = ctx.event_tx.send(Event::Succeeded { tile_id, attempts });
                if !receiver_alive {
                    tracing::debug!("Result receiver dropped, worker {} exiting", worker_id);
                    return;
                }
            }
            Err(error) => {
                consecutive_failures += 1;

                if error.is_retriable() && attempts <= ctx.config.max_retries {
                    let backoff = backoff_ms(&ctx.config, attempts);
                    tracing::warn!(
                        "Tile {} attempt {} failed: {}, retrying in {}ms",
                        tile_id,
                        attempts,
                        error,
                        backoff
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;

                    if stop_rx.borrow().is_some() {
                        let _ = ctx.event_tx.send(Event::Failed {
                            tile_id,
                            attempts,
                            error: TileError::Cancelled,
                        });
                        return;
                    }

                    let _ = ctx.event_tx.send(Event::Retried {
                        tile_id: tile_id.clone(),
                    });
                    if ctx
                        .job_tx
                        .send(Job {
                            tile: job.tile,
                            attempt: attempts,
                        })
                        .await
                        .is_err()
                    {
                        let _ = ctx.event_tx.send(Event::Failed {
                            tile_id,
                            attempts,
                            error,
                        });
                    }
                } else {
                    tracing::error!(
                        "Tile {} failed after {} attempts: {}",
                        tile_id,
                        attempts,
                        error
                    );
                    let _ = ctx.event_tx.send(Event::Failed {
                        tile_id,
                        attempts,
                        error,
                    });
                }

                if consecutive_failures >= ctx.config.recycle_threshold {
                    let _ = ctx.event_tx.send(Event::Recycled { worker_id });
                    return;
                }
            }
        }
    }
}

/// Resolves when any stop mode is broadcast; pends forever once the handle is
/// gone (a dropped handle can no longer stop the run).
async fn stop_broadcast(rx: &mut watch::Receiver<Option<StopMode>>) {
    loop {
        if rx.borrow().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves only on a hard stop; graceful stops let in-flight work finish.
async fn hard_stop(rx: &mut watch::Receiver<Option<StopMode>>) {
    loop {
        if matches!(*rx.borrow(), Some(StopMode::Hard)) {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn backoff_ms(config: &SchedulerConfig, attempt: usize) -> u64 {
    let shift = (attempt.saturating_sub(1)).min(32) as u32;
    config
        .initial_backoff_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_backoff_ms)
}

/// A tile result must carry exactly the recipe's output set; anything else is
/// a defect reported as an execution failure.
fn check_outputs(recipe: &Recipe, result: TileResult) -> Result<TileResult, TileError> {
    let expected = recipe.output_names();
    let got: Vec<&str> = result.keys().map(String::as_str).collect();
    if expected != got {
        return Err(TileError::Execution(format!(
            "tile result outputs {:?} do not match recipe outputs {:?}",
            got, expected
        )));
    }
    for (name, array) in &result {
        array
            .validate()
            .map_err(|e| TileError::Execution(format!("output '{}': {}", name, e)))?;
    }
    Ok(result)
}
