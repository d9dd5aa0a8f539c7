//! Engine Coordinator: the only API external callers depend on. Owns the
//! full lifecycle (`Closed -> Opening -> Recovering -> Ready -> Draining ->
//! Closed`) and wires together the router, shard store, entanglement
//! index, wormhole graph, cache, entropy monitor, metrics registry, and
//! background ticker built by the sibling modules in this crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use warp_cache::Cache;
use warp_core::config::EngineConfig;
use warp_core::key::validate_key_with_limits;
use warp_core::types::{now_us, ConsistencyMode, EngineState, ShardId};
use warp_core::{Error, Key, Limits, Value};
use warp_durability::checkpoint;
use warp_durability::wal::{FlushPolicy, WalConfig};
use warp_graph::{EntanglementIndex, WormholeGraph};
use warp_storage::{Router, ShardDescriptor, ShardStore};

use crate::entropy::EntropyMonitor;
use crate::manifest;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::recovery;
use crate::scheduler::{TaskPriority, Ticker, TickerContext};

/// Default worker count for the background ticker's task pool, used when
/// the platform does not report a core count.
const DEFAULT_WORKER_COUNT: usize = 4;
const SCHEDULER_QUEUE_DEPTH: usize = 4096;
/// Fallback link strength applied to `put`'s `entangle_hint` targets; the
/// pattern engine's `default_strength` is per-pattern, but a hint given at
/// call time carries no strength of its own.
const HINT_STRENGTH: f32 = 0.5;

fn state_to_u8(state: EngineState) -> u8 {
    match state {
        EngineState::Closed => 0,
        EngineState::Opening => 1,
        EngineState::Recovering => 2,
        EngineState::Ready => 3,
        EngineState::Draining => 4,
    }
}

fn u8_to_state(v: u8) -> EngineState {
    match v {
        0 => EngineState::Closed,
        1 => EngineState::Opening,
        2 => EngineState::Recovering,
        3 => EngineState::Ready,
        _ => EngineState::Draining,
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state_to_u8(state)))
    }

    fn load(&self) -> EngineState {
        u8_to_state(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: EngineState) {
        self.0.store(state_to_u8(state), Ordering::Release);
    }
}

/// A target shard, or every shard, for `force_flush`/`force_checkpoint`.
#[derive(Debug, Clone, Copy)]
pub enum ShardTarget {
    Shard(ShardId),
    All,
}

/// Per-`put` overrides (spec-style `opts` argument on the public API).
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Only `Strong` is currently honored as a per-call upgrade: it forces
    /// a flush of the write's shard before returning, regardless of the
    /// shard's default consistency mode. A downgrade request on a shard
    /// whose default is `Strong` is not possible — the shard store bakes
    /// one consistency mode in at `open()` for every shard, not per call.
    pub consistency: Option<ConsistencyMode>,
    pub tags: Vec<String>,
    pub entangle_hint: Vec<Key>,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub shard_id: ShardId,
    pub op_us: u64,
}

#[derive(Debug, Clone)]
pub struct GetOutcome {
    pub value: Value,
    pub shard_id: ShardId,
    pub op_us: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteOutcome {
    pub deleted: bool,
    pub shard_id: ShardId,
}

#[derive(Debug, Clone)]
pub struct QuantumGetOptions {
    pub max_entangled: usize,
    pub min_strength: f32,
    pub budget_us: u64,
}

impl Default for QuantumGetOptions {
    fn default() -> Self {
        Self {
            max_entangled: 8,
            min_strength: 0.3,
            budget_us: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuantumGetOutcome {
    pub primary: Value,
    pub shard_id: ShardId,
    pub entangled: HashMap<Key, Value>,
    /// Entangled fetches that were dropped: either the neighbor no longer
    /// existed, or its fetch did not return before `budget_us` elapsed.
    /// `quantum_get` never errors on these; they only show up here.
    pub misses: u64,
}

/// An open WarpEngine data root. `Engine::open` does all the recovery
/// work synchronously; by the time it returns, the engine is `Ready`.
pub struct Engine {
    state: StateCell,
    config: EngineConfig,
    limits: Limits,
    root: PathBuf,
    shards_root: PathBuf,
    wormhole_snapshot_path: PathBuf,
    router: Router,
    store: Arc<ShardStore>,
    cache: Cache,
    entanglement: Arc<EntanglementIndex>,
    wormhole: Arc<WormholeGraph>,
    entropy: Arc<EntropyMonitor>,
    metrics: Arc<MetricsRegistry>,
    ticker: Ticker,
}

impl Engine {
    /// Open (creating if necessary) the data root named by
    /// `config.data_root`, recovering every shard from its latest
    /// checkpoint plus WAL tail before accepting any calls.
    pub fn open(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;

        let root = PathBuf::from(&config.data_root);
        std::fs::create_dir_all(&root)?;

        if manifest::load_and_validate(&root, config.num_shards)?.is_none() {
            manifest::create(&root, config.num_shards, now_us())?;
        }
        write_config_snapshot(&root, &config)?;

        let shards_root = root.join("shards");
        std::fs::create_dir_all(&shards_root)?;
        std::fs::create_dir_all(root.join("entanglement"))?;
        let wormholes_dir = root.join("wormholes");
        std::fs::create_dir_all(&wormholes_dir)?;
        let wormhole_snapshot_path = wormholes_dir.join("graph.bin");

        let wal_config = WalConfig {
            segment_max_bytes: config.segment_max_bytes,
            flush_policy: FlushPolicy::Interval {
                interval_ms: config.flush_interval_ms,
            },
            ..WalConfig::default()
        };

        let store = Arc::new(ShardStore::open(
            &shards_root,
            config.num_shards,
            config.shard_max_capacity,
            config.consistency_default,
            wal_config.clone(),
        )?);
        let entanglement = Arc::new(EntanglementIndex::new());

        let state = StateCell::new(EngineState::Recovering);
        for shard_id in 0..config.num_shards {
            recovery::recover_shard(&shards_root, shard_id, &store, &entanglement, wal_config.max_recovery_scan_window)?;
        }

        let descriptors = (0..config.num_shards)
            .map(|shard_id| ShardDescriptor {
                shard_id,
                max_capacity: config.shard_max_capacity,
                consistency_mode: config.consistency_default,
                routing_weight: 1.0,
            })
            .collect();
        let router = Router::new(descriptors);

        let wormhole = Arc::new(WormholeGraph::load(&wormhole_snapshot_path));
        let entropy = Arc::new(EntropyMonitor::new(config.num_shards));
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = Cache::new(config.cache_tier_bytes, config.compress_threshold);

        let ticker_ctx = Arc::new(TickerContext {
            store: Arc::clone(&store),
            entanglement: Arc::clone(&entanglement),
            wormhole: Arc::clone(&wormhole),
            entropy: Arc::clone(&entropy),
            metrics: Arc::clone(&metrics),
            config: config.clone(),
            shards_root: shards_root.clone(),
            wormhole_snapshot_path: wormhole_snapshot_path.clone(),
        });
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_WORKER_COUNT);
        let ticker = Ticker::start(ticker_ctx, num_workers, SCHEDULER_QUEUE_DEPTH);

        state.store(EngineState::Ready);

        let limits = Limits {
            max_key_bytes: config.max_key_bytes,
            max_value_bytes: config.max_value_bytes,
        };

        Ok(Self {
            state,
            config,
            limits,
            root,
            shards_root,
            wormhole_snapshot_path,
            router,
            store,
            cache,
            entanglement,
            wormhole,
            entropy,
            metrics,
            ticker,
        })
    }

    pub fn data_root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> EngineState {
        self.state.load()
    }

    pub fn put(&self, key: Key, value: Value, opts: PutOptions) -> Result<PutOutcome, Error> {
        self.require_writable()?;
        self.validate_key(&key)?;
        if value.len() > self.limits.max_value_bytes {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes exceeds max_value_bytes {}",
                value.len(),
                self.limits.max_value_bytes
            )));
        }

        let started = Instant::now();
        let shard_id = self.router.shard_of(&key);
        self.entropy.record_op(shard_id);

        self.store.put(shard_id, key.clone(), value.clone(), opts.tags)?;
        if matches!(opts.consistency, Some(ConsistencyMode::Strong)) {
            self.store.flush(shard_id)?;
        }
        self.cache.put(key.clone(), value);

        for (from, to, strength) in self.entanglement.apply_patterns(&key) {
            let from_shard = self.router.shard_of(&from);
            self.store.append_link(from_shard, &from, &to, strength)?;
        }
        for hint in &opts.entangle_hint {
            self.link(&key, hint, HINT_STRENGTH)?;
        }

        self.metrics.record_put();
        Ok(PutOutcome {
            shard_id,
            op_us: started.elapsed().as_micros() as u64,
        })
    }

    pub fn get(&self, key: &Key) -> Result<GetOutcome, Error> {
        self.require_readable()?;
        self.validate_key(key)?;

        let started = Instant::now();
        let shard_id = self.router.shard_of(key);
        self.entropy.record_op(shard_id);

        if let Some(value) = self.cache.get(key) {
            self.metrics.record_cache_hit();
            self.metrics.record_get(true);
            return Ok(GetOutcome {
                value,
                shard_id,
                op_us: started.elapsed().as_micros() as u64,
            });
        }
        self.metrics.record_cache_miss();

        match self.store.get(shard_id, key) {
            Some((value, _meta)) => {
                self.cache.put(key.clone(), value.clone());
                self.metrics.record_get(true);
                Ok(GetOutcome {
                    value,
                    shard_id,
                    op_us: started.elapsed().as_micros() as u64,
                })
            }
            None => {
                self.metrics.record_get(false);
                Err(Error::NotFound)
            }
        }
    }

    pub fn delete(&self, key: &Key) -> Result<DeleteOutcome, Error> {
        self.require_writable()?;
        self.validate_key(key)?;

        let shard_id = self.router.shard_of(key);
        self.entropy.record_op(shard_id);
        let deleted = self.store.delete(shard_id, key)?;
        self.cache.invalidate(key);
        self.metrics.record_delete();
        Ok(DeleteOutcome { deleted, shard_id })
    }

    pub fn entangle(&self, from: &Key, targets: Vec<(Key, f32)>) -> Result<(), Error> {
        self.require_writable()?;
        self.validate_key(from)?;
        for (to, strength) in targets {
            self.validate_key(&to)?;
            self.link(from, &to, strength)?;
        }
        Ok(())
    }

    fn link(&self, from: &Key, to: &Key, strength: f32) -> Result<(), Error> {
        let applied = self.entanglement.link(from, to, strength);
        let from_shard = self.router.shard_of(from);
        self.store.append_link(from_shard, from, to, applied)
    }

    /// Primary lookup via the normal path, plus a bounded parallel fetch
    /// of entangled neighbors grouped by shard. Neighbor fetches beyond
    /// `budget_us` are abandoned, not retried or errored; their keys are
    /// simply absent from `entangled` and counted in `misses`.
    pub fn quantum_get(&self, key: &Key, opts: QuantumGetOptions) -> Result<QuantumGetOutcome, Error> {
        let primary = self.get(key)?;

        let store_for_exists = Arc::clone(&self.store);
        let router = &self.router;
        let mut neighbors = self.entanglement.neighbors(key, |to| store_for_exists.contains(router.shard_of(to), to));
        neighbors.retain(|(_, strength)| *strength >= opts.min_strength);
        neighbors.truncate(opts.max_entangled);

        let mut by_shard: FxHashMap<ShardId, Vec<Key>> = FxHashMap::default();
        for (to_key, _) in &neighbors {
            by_shard.entry(self.router.shard_of(to_key)).or_default().push(to_key.clone());
        }

        let deadline = Instant::now() + Duration::from_micros(opts.budget_us);
        let (tx, rx) = mpsc::channel::<(Key, Option<Value>)>();
        let mut expected = 0usize;
        for (&shard_id, keys) in by_shard.iter() {
            let store = Arc::clone(&self.store);
            let keys = keys.clone();
            let tx = tx.clone();
            expected += keys.len();
            std::thread::spawn(move || {
                for key in keys {
                    let value = store.get(shard_id, &key).map(|(v, _)| v);
                    if tx.send((key, value)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut entangled = HashMap::with_capacity(expected);
        let mut misses = 0u64;
        let mut received = 0usize;
        while received < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                misses += (expected - received) as u64;
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((key, Some(value))) => {
                    self.cache.put(key.clone(), value.clone());
                    entangled.insert(key, value);
                    received += 1;
                }
                Ok((_key, None)) => {
                    misses += 1;
                    received += 1;
                }
                Err(_) => {
                    misses += (expected - received) as u64;
                    break;
                }
            }
        }

        let hit_shards: Vec<ShardId> = by_shard.keys().copied().collect();
        self.wormhole.record_cooccurrence(primary.shard_id, &hit_shards);
        self.metrics.record_quantum_get(misses);

        Ok(QuantumGetOutcome {
            primary: primary.value,
            shard_id: primary.shard_id,
            entangled,
            misses,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let per_shard_table_len = (0..self.router.num_shards()).map(|s| self.store.len(s)).collect();
        self.metrics.snapshot(
            self.state.load(),
            per_shard_table_len,
            self.entanglement.link_count(),
            self.wormhole.edge_count(),
        )
    }

    /// Flush the given shard(s), submitted through the background
    /// scheduler at `High` priority so it runs ahead of routine
    /// maintenance work. `deadline` bounds how long the caller waits for
    /// acknowledgement; past it, `Backpressure` is returned but the flush
    /// already queued keeps running.
    pub fn force_flush(&self, target: ShardTarget, deadline: Option<Duration>) -> Result<(), Error> {
        let store = Arc::clone(&self.store);
        self.run_with_deadline(deadline, move || match target {
            ShardTarget::Shard(id) => store.flush(id),
            ShardTarget::All => store.flush_all(),
        })
    }

    pub fn force_checkpoint(&self, target: ShardTarget, deadline: Option<Duration>) -> Result<(), Error> {
        let shard_ids: Vec<ShardId> = match target {
            ShardTarget::Shard(id) => vec![id],
            ShardTarget::All => (0..self.router.num_shards()).collect(),
        };
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let shards_root = self.shards_root.clone();
        let compress_threshold = self.config.compress_threshold;
        self.run_with_deadline(deadline, move || {
            for shard_id in shard_ids {
                let last_included_sequence = store.last_sequence(shard_id);
                let entries = store.snapshot_entries(shard_id);
                let dir = shards_root.join(shard_id.to_string()).join("checkpoints");
                match checkpoint::create_checkpoint(&dir, shard_id, last_included_sequence, now_us(), entries.into_iter(), compress_threshold) {
                    Ok(_) => {
                        metrics.record_checkpoint_written();
                        store.truncate_through(shard_id, last_included_sequence)?;
                    }
                    Err(e) => {
                        metrics.record_checkpoint_failed();
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    }

    fn run_with_deadline<F>(&self, deadline: Option<Duration>, work: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.ticker
            .scheduler()
            .submit(TaskPriority::High, move || {
                let _ = tx.send(work());
            })
            .map_err(|_| Error::Backpressure {
                shard_id: None,
                message: "background scheduler queue is full".into(),
            })?;

        match deadline {
            Some(d) => rx.recv_timeout(d).map_err(|_| Error::Backpressure {
                shard_id: None,
                message: "operation exceeded its deadline; work continues in the background".into(),
            })?,
            None => rx.recv().map_err(|_| Error::Backpressure {
                shard_id: None,
                message: "background worker dropped before completing".into(),
            })?,
        }
    }

    /// Drain outstanding background work (best-effort, bounded by
    /// `close_timeout_s`), flush every shard, snapshot the wormhole graph,
    /// and shut the ticker down.
    pub fn close(self) -> Result<(), Error> {
        self.state.store(EngineState::Draining);

        let scheduler = Arc::clone(self.ticker.scheduler());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            scheduler.drain();
            let _ = tx.send(());
        });
        if rx.recv_timeout(Duration::from_secs(self.config.close_timeout_s)).is_err() {
            tracing::warn!(target: "warp::coordinator", "close timed out waiting for background work to drain; closing best-effort");
        }

        let mut engine = self;
        engine.ticker.shutdown();
        engine.store.flush_all()?;
        if let Err(e) = engine.wormhole.save(&engine.wormhole_snapshot_path) {
            tracing::warn!(target: "warp::coordinator", error = %e, "wormhole snapshot write failed during close");
        }
        engine.state.store(EngineState::Closed);
        Ok(())
    }

    fn validate_key(&self, key: &Key) -> Result<(), Error> {
        validate_key_with_limits(key, &self.limits).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    fn require_writable(&self) -> Result<(), Error> {
        let state = self.state.load();
        if state.accepts_writes() {
            return Ok(());
        }
        if state == EngineState::Recovering {
            return Err(Error::RecoveryInProgress);
        }
        Err(Error::ShardClosed { shard_id: None })
    }

    fn require_readable(&self) -> Result<(), Error> {
        let state = self.state.load();
        if state.accepts_reads() {
            return Ok(());
        }
        if state == EngineState::Recovering {
            return Err(Error::RecoveryInProgress);
        }
        Err(Error::ShardClosed { shard_id: None })
    }
}

fn write_config_snapshot(root: &Path, config: &EngineConfig) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(config).map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(root.join("config.json"), bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            num_shards: 4,
            data_root: dir.to_string_lossy().to_string(),
            shard_max_capacity: 1000,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn open_put_get_round_trips() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let outcome = engine.put(Key::from("alpha"), Value::from("one"), PutOptions::default()).unwrap();
        let got = engine.get(&Key::from("alpha")).unwrap();
        assert_eq!(got.value, Value::from("one"));
        assert_eq!(got.shard_id, outcome.shard_id);
        engine.close().unwrap();
    }

    #[test]
    fn reopen_after_close_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            engine.put(Key::from("alpha"), Value::from("one"), PutOptions::default()).unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let got = engine.get(&Key::from("alpha")).unwrap();
        assert_eq!(got.value, Value::from("one"));
        engine.close().unwrap();
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(Key::from("alpha"), Value::from("one"), PutOptions::default()).unwrap();
        let outcome = engine.delete(&Key::from("alpha")).unwrap();
        assert!(outcome.deleted);
        assert!(matches!(engine.get(&Key::from("alpha")), Err(Error::NotFound)));
        engine.close().unwrap();
    }

    #[test]
    fn quantum_get_returns_entangled_neighbors_above_threshold() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(Key::from("u:1"), Value::from("A"), PutOptions::default()).unwrap();
        engine.put(Key::from("u:2"), Value::from("B"), PutOptions::default()).unwrap();
        engine.entangle(&Key::from("u:1"), vec![(Key::from("u:2"), 0.8)]).unwrap();

        let result = engine
            .quantum_get(
                &Key::from("u:1"),
                QuantumGetOptions {
                    min_strength: 0.5,
                    ..QuantumGetOptions::default()
                },
            )
            .unwrap();
        assert_eq!(result.primary, Value::from("A"));
        assert_eq!(result.entangled.get(&Key::from("u:2")), Some(&Value::from("B")));
    }

    #[test]
    fn quantum_get_drops_dangling_link_after_delete() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(Key::from("u:1"), Value::from("A"), PutOptions::default()).unwrap();
        engine.put(Key::from("u:2"), Value::from("B"), PutOptions::default()).unwrap();
        engine.entangle(&Key::from("u:1"), vec![(Key::from("u:2"), 0.8)]).unwrap();
        engine.delete(&Key::from("u:2")).unwrap();

        let result = engine.quantum_get(&Key::from("u:1"), QuantumGetOptions::default()).unwrap();
        assert_eq!(result.primary, Value::from("A"));
        assert!(result.entangled.is_empty());
    }

    #[test]
    fn capacity_eviction_yields_not_found_after_overflow() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.num_shards = 2;
        config.shard_max_capacity = 3;
        let engine = Engine::open(config).unwrap();
        for i in 0..4u32 {
            engine
                .put(Key::from(format!("s0:{i}").as_str()), Value::from("v"), PutOptions::default())
                .unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(matches!(engine.get(&Key::from("s0:0")), Err(Error::NotFound)));
        engine.close().unwrap();
    }

    #[test]
    fn force_checkpoint_then_reopen_recovers_from_snapshot() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(Key::from("alpha"), Value::from("one"), PutOptions::default()).unwrap();
        engine.force_checkpoint(ShardTarget::All, Some(Duration::from_secs(5))).unwrap();
        engine.close().unwrap();

        let engine = Engine::open(test_config(dir.path())).unwrap();
        let got = engine.get(&Key::from("alpha")).unwrap();
        assert_eq!(got.value, Value::from("one"));
        engine.close().unwrap();
    }

    #[test]
    fn oversized_value_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_value_bytes = 4;
        let engine = Engine::open(config).unwrap();
        let err = engine.put(Key::from("k"), Value::from("too long"), PutOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        engine.close().unwrap();
    }
}
