//! Background Scheduler (spec §4.11): a priority task queue running on a
//! fixed worker pool, plus a single ticker thread that drives the periodic
//! maintenance work the Coordinator never blocks on — WAL interval
//! flushes, checkpoint-trigger evaluation, entanglement/wormhole decay,
//! wormhole snapshotting, and entropy sampling.
//!
//! The priority queue and worker-pool machinery is grounded on the
//! reference codebase's general-purpose `BackgroundScheduler`
//! (`crates/engine/src/background.rs`): a `BinaryHeap` ordered by
//! priority then FIFO sequence, `parking_lot` mutex/condvar pair for
//! `work_ready`/`drain_cond`, and an `ActiveTaskGuard` that keeps
//! `active_tasks` bookkeeping correct even when a task panics.

use parking_lot::Mutex as ParkingMutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;
use warp_core::config::EngineConfig;
use warp_core::types::{now_us, ShardId};
use warp_durability::checkpoint;
use warp_graph::{EntanglementIndex, WormholeGraph};
use warp_storage::ShardStore;

use crate::entropy::EntropyMonitor;
use crate::metrics::MetricsRegistry;

/// Priority levels for background work (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Entropy sampling, entanglement/wormhole decay.
    Low = 0,
    /// Checkpointing, wormhole snapshot writes.
    Normal = 1,
    /// User-initiated `force_flush`/`force_checkpoint`.
    High = 2,
}

#[derive(Debug)]
pub struct BackpressureError;

impl std::fmt::Display for BackpressureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "background scheduler queue is full")
    }
}

impl std::error::Error for BackpressureError {}

pub struct SchedulerStats {
    pub queue_depth: usize,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub worker_count: usize,
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Box<dyn FnOnce() + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    queue: ParkingMutex<BinaryHeap<TaskEnvelope>>,
    work_ready: parking_lot::Condvar,
    drain_cond: parking_lot::Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// Fixed-size worker pool draining a priority queue of maintenance tasks.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: ParkingMutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl BackgroundScheduler {
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: ParkingMutex::new(BinaryHeap::new()),
            work_ready: parking_lot::Condvar::new(),
            drain_cond: parking_lot::Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("warp-bg-{i}"))
                .spawn(move || worker_loop(&inner_clone))
                .expect("failed to spawn background worker thread");
            workers.push(handle);
        }

        Self {
            inner,
            workers: ParkingMutex::new(workers),
            num_threads,
        }
    }

    pub fn submit(&self, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> Result<(), BackpressureError> {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(BackpressureError);
        }
        if self.inner.queue_depth.load(AtomicOrdering::Acquire) >= self.inner.max_queue_depth {
            return Err(BackpressureError);
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let envelope = TaskEnvelope {
            priority,
            sequence,
            work: Box::new(work),
        };

        {
            let mut queue = self.inner.queue.lock();
            queue.push(envelope);
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0 || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner.tasks_completed.fetch_add(1, AtomicOrdering::Relaxed);
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            error!(
                "background task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

/// How often the ticker thread wakes up to re-evaluate periodic work.
/// Sub-tasks run on their own slower cadence tracked against wall time,
/// never every tick.
pub const TICK_INTERVAL_MS: u64 = 50;
pub const WORMHOLE_SNAPSHOT_INTERVAL_S: u64 = 60;
/// Decay runs once per second regardless of entropy sampling cadence, so
/// link/edge strengths erode smoothly even if `ENTROPY_INTERVAL_MS` changes.
const DECAY_INTERVAL_MS: u64 = 1000;

struct CheckpointBaseline {
    ops: u64,
    bytes: u64,
    last_checkpoint_us: u64,
}

/// Everything the ticker needs a handle to. Constructed once by the
/// Coordinator at `open()` and shared with the ticker thread via `Arc`.
pub struct TickerContext {
    pub store: Arc<ShardStore>,
    pub entanglement: Arc<EntanglementIndex>,
    pub wormhole: Arc<WormholeGraph>,
    pub entropy: Arc<EntropyMonitor>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: EngineConfig,
    /// `<root>/shards/`; each shard's checkpoints live under
    /// `shards_root.join(shard_id).join("checkpoints")`.
    pub shards_root: PathBuf,
    pub wormhole_snapshot_path: PathBuf,
}

/// Owns the ticker thread and the worker pool it submits maintenance
/// tasks to.
pub struct Ticker {
    scheduler: Arc<BackgroundScheduler>,
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Ticker {
    pub fn start(ctx: Arc<TickerContext>, num_workers: usize, max_queue_depth: usize) -> Self {
        let scheduler = Arc::new(BackgroundScheduler::new(num_workers, max_queue_depth));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_scheduler = Arc::clone(&scheduler);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("warp-ticker".to_string())
            .spawn(move || ticker_loop(ctx, thread_scheduler, thread_shutdown))
            .expect("failed to spawn ticker thread");

        Self {
            scheduler,
            thread: Some(thread),
            shutdown,
        }
    }

    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.scheduler.drain();
        self.scheduler.shutdown();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn ticker_loop(ctx: Arc<TickerContext>, scheduler: Arc<BackgroundScheduler>, shutdown: Arc<AtomicBool>) {
    let num_shards = ctx.store.shard_count();
    let mut baselines: Vec<CheckpointBaseline> = (0..num_shards)
        .map(|_| CheckpointBaseline {
            ops: 0,
            bytes: 0,
            last_checkpoint_us: now_us(),
        })
        .collect();
    let mut last_decay_us = now_us();
    let mut last_entropy_us = now_us();
    let mut last_wormhole_snapshot_us = now_us();

    while !shutdown.load(AtomicOrdering::Acquire) {
        std::thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));

        for shard_id in 0..num_shards {
            let _ = ctx.store.maybe_interval_flush(shard_id);
            maybe_checkpoint(&ctx, &scheduler, shard_id, &mut baselines[shard_id as usize]);
        }

        let now = now_us();
        if now.saturating_sub(last_decay_us) >= DECAY_INTERVAL_MS * 1000 {
            last_decay_us = now;
            let entanglement = Arc::clone(&ctx.entanglement);
            let wormhole = Arc::clone(&ctx.wormhole);
            let _ = scheduler.submit(TaskPriority::Low, move || {
                entanglement.decay_tick();
                wormhole.decay_tick();
            });
        }

        if now.saturating_sub(last_entropy_us) >= crate::entropy::ENTROPY_INTERVAL_MS * 1000 {
            last_entropy_us = now;
            let sample = ctx.entropy.tick();
            ctx.metrics
                .record_entropy_sample(sample.entropy, sample.skew, sample.low_entropy, sample.high_skew);
        }

        if now.saturating_sub(last_wormhole_snapshot_us) >= WORMHOLE_SNAPSHOT_INTERVAL_S * 1_000_000 {
            last_wormhole_snapshot_us = now;
            let wormhole = Arc::clone(&ctx.wormhole);
            let path = ctx.wormhole_snapshot_path.clone();
            let _ = scheduler.submit(TaskPriority::Normal, move || {
                if let Err(e) = wormhole.save(&path) {
                    tracing::warn!(target: "warp::scheduler", error = %e, "wormhole snapshot write failed");
                }
            });
        }
    }
}

fn maybe_checkpoint(ctx: &Arc<TickerContext>, scheduler: &Arc<BackgroundScheduler>, shard_id: ShardId, baseline: &mut CheckpointBaseline) {
    let ops = ctx.store.ops_total(shard_id);
    let bytes = ctx.store.wal_bytes_written(shard_id);
    let now = now_us();

    let ops_triggered = ops.saturating_sub(baseline.ops) >= ctx.config.checkpoint_ops;
    let bytes_triggered = bytes.saturating_sub(baseline.bytes) >= ctx.config.checkpoint_wal_bytes;
    let time_triggered = now.saturating_sub(baseline.last_checkpoint_us) >= ctx.config.checkpoint_interval_s * 1_000_000;

    if !(ops_triggered || bytes_triggered || time_triggered) {
        return;
    }

    baseline.ops = ops;
    baseline.bytes = bytes;
    baseline.last_checkpoint_us = now;

    let store = Arc::clone(&ctx.store);
    let metrics = Arc::clone(&ctx.metrics);
    let dir = ctx.shards_root.join(shard_id.to_string()).join("checkpoints");
    let compress_threshold = ctx.config.compress_threshold;
    let _ = scheduler.submit(TaskPriority::Normal, move || {
        let last_included_sequence = store.last_sequence(shard_id);
        let entries = store.snapshot_entries(shard_id);
        match checkpoint::create_checkpoint(&dir, shard_id, last_included_sequence, now_us(), entries.into_iter(), compress_threshold) {
            Ok(_) => {
                metrics.record_checkpoint_written();
                let _ = store.truncate_through(shard_id, last_included_sequence);
            }
            Err(e) => {
                metrics.record_checkpoint_failed();
                tracing::warn!(target: "warp::scheduler", shard_id, error = %e, "checkpoint write failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submit_and_drain_runs_all_tasks() {
        let scheduler = BackgroundScheduler::new(2, 64);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler.submit(TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            }).unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        scheduler.shutdown();
    }

    #[test]
    fn backpressure_rejects_when_queue_full() {
        let scheduler = BackgroundScheduler::new(0, 1);
        scheduler.submit(TaskPriority::Normal, || {}).unwrap();
        assert!(scheduler.submit(TaskPriority::Normal, || {}).is_err());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let scheduler = BackgroundScheduler::new(1, 16);
        scheduler.shutdown();
        assert!(scheduler.submit(TaskPriority::Normal, || {}).is_err());
    }

    #[test]
    fn task_panic_does_not_hang_drain() {
        let scheduler = BackgroundScheduler::new(2, 16);
        scheduler.submit(TaskPriority::Normal, || panic!("boom")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        scheduler.submit(TaskPriority::Normal, move || {
            c.fetch_add(1, AtomicOrdering::Relaxed);
        }).unwrap();
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
        scheduler.shutdown();
    }
}
