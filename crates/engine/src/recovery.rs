//! Per-shard crash recovery (spec §4.3, §4.13): load the current
//! checkpoint (falling back through older ones on corruption), then
//! replay the WAL tail from `last_included_sequence + 1`, rebuilding both
//! the shard table and the Entanglement Index from the same durable log
//! (spec §4.6 "Durability": entanglement mutations ride the `from` key's
//! shard WAL, so there is no separate index log to rebuild from).

use std::path::Path;
use warp_core::types::{ShardId, WalOp};
use warp_core::value::RecordMeta;
use warp_core::{Error, Value};
use warp_durability::{checkpoint, wal};
use warp_graph::EntanglementIndex;
use warp_storage::ShardStore;

/// Recover one shard's table and the slice of the Entanglement Index
/// grounded in its WAL. Must run before the shard accepts new writes —
/// the Coordinator calls this for every shard while the engine is in
/// `Recovering` state, then calls `ShardStore::resume_wal_sequence` via
/// this function's own final step before returning.
pub fn recover_shard(
    shards_root: &Path,
    shard_id: ShardId,
    store: &ShardStore,
    entanglement: &EntanglementIndex,
    max_recovery_scan_window: usize,
) -> Result<(), Error> {
    let shard_dir = shards_root.join(shard_id.to_string());
    let checkpoints_dir = shard_dir.join("checkpoints");
    let wal_dir = shard_dir.join("wal");

    let from_sequence = match checkpoint::load_current(&checkpoints_dir)? {
        Some((meta, records)) => {
            tracing::info!(
                target: "warp::recovery",
                shard_id,
                checkpoint_id = %meta.checkpoint_id,
                records = records.len(),
                "loaded checkpoint"
            );
            for record in records {
                store.restore(shard_id, record.key, record.value, record.meta);
            }
            meta.last_included_sequence + 1
        }
        None => 0,
    };

    let mut replayed = 0u64;
    let replay_last = wal::replay(&wal_dir, from_sequence, max_recovery_scan_window, |entry| {
        replayed += 1;
        match entry.op {
            WalOp::Put => {
                if let Some(value_bytes) = &entry.value {
                    let meta = RecordMeta::new(shard_id, entry.timestamp_us);
                    store.restore(shard_id, entry.key(), Value::new(value_bytes.clone()), meta);
                }
            }
            WalOp::Delete => {
                store.remove_silently(shard_id, &entry.key());
            }
            WalOp::Link | WalOp::Unlink => {
                entanglement.apply_wal_entry(entry);
            }
        }
    })?;

    tracing::info!(target: "warp::recovery", shard_id, replayed, from_sequence, "wal replay complete");

    let resolved_last_sequence = replay_last.or_else(|| from_sequence.checked_sub(1));
    store.resume_wal_sequence(shard_id, resolved_last_sequence);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_core::{Key, Value as V};
    use warp_durability::wal::{WalConfig, WalWriter};
    use warp_storage::ShardStore;

    fn fresh_store(dir: &Path, n: u32) -> ShardStore {
        let shards_root = dir.join("shards");
        ShardStore::open(&shards_root, n, 1000, warp_core::ConsistencyMode::Eventual, WalConfig::for_testing()).unwrap()
    }

    #[test]
    fn recovery_from_empty_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path(), 1);
        let entanglement = EntanglementIndex::new();
        recover_shard(&dir.path().join("shards"), 0, &store, &entanglement, 1024).unwrap();
        assert_eq!(store.len(0), 0);
    }

    #[test]
    fn recovery_replays_wal_writes() {
        let dir = tempfile::tempdir().unwrap();
        let shards_root = dir.path().join("shards");
        let wal_dir = shards_root.join("0").join("wal");
        {
            let mut writer = WalWriter::open(&wal_dir, 0, WalConfig::for_testing()).unwrap();
            writer.append_put(1, &Key::from("a"), &V::from("1")).unwrap();
            writer.append_put(2, &Key::from("b"), &V::from("2")).unwrap();
            writer.append_delete(3, &Key::from("a")).unwrap();
            writer.close().unwrap();
        }

        let store = fresh_store(dir.path(), 1);
        let entanglement = EntanglementIndex::new();
        recover_shard(&shards_root, 0, &store, &entanglement, 1024).unwrap();

        assert!(store.get(0, &Key::from("a")).is_none());
        assert_eq!(store.get(0, &Key::from("b")).unwrap().0, V::from("2"));

        // Resumed sequence must continue past the replayed entries, not collide.
        let seq = store.put(0, Key::from("c"), V::from("3"), vec![]).unwrap();
        assert!(seq.insert_us > 0);
    }

    #[test]
    fn recovery_rebuilds_entanglement_index_from_wal() {
        let dir = tempfile::tempdir().unwrap();
        let shards_root = dir.path().join("shards");
        let wal_dir = shards_root.join("0").join("wal");
        {
            let mut writer = WalWriter::open(&wal_dir, 0, WalConfig::for_testing()).unwrap();
            writer.append_put(1, &Key::from("a"), &V::from("1")).unwrap();
            writer.append_link(2, &Key::from("a"), &Key::from("b"), 0.7).unwrap();
            writer.close().unwrap();
        }

        let store = fresh_store(dir.path(), 1);
        let entanglement = EntanglementIndex::new();
        recover_shard(&shards_root, 0, &store, &entanglement, 1024).unwrap();

        let neighbors = entanglement.neighbors(&Key::from("a"), |_| true);
        assert_eq!(neighbors, vec![(Key::from("b"), 0.7)]);
    }
}
