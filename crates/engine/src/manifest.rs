//! Engine-level manifest (spec §6: `<root>/manifest.json` — "shard count,
//! format version, last-known-good checkpoints"). Written once at first
//! `open()` of a fresh data root and re-validated on every subsequent
//! `open()`; `num_shards` and `format_version` are frozen for the life of
//! the data root (re-sharding is an explicit offline procedure, not a
//! runtime reconfiguration — spec §9).
//!
//! Uses the same crash-safe temp-file → fsync → rename pattern as
//! `warp_durability::checkpoint::write_atomic`, reimplemented here since
//! this lives one layer up and writes a single small JSON document rather
//! than a per-shard table snapshot.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use warp_core::types::Timestamp;
use warp_core::Error;

pub const ENGINE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineManifest {
    pub format_version: u32,
    pub num_shards: u32,
    pub created_us: Timestamp,
}

/// Load `<root>/manifest.json` if it exists and validate it against the
/// engine configuration about to open it. Returns `Ok(None)` for a fresh
/// data root (caller should write one). Rejects outright on a
/// `format_version` or `num_shards` mismatch — both are frozen at the
/// data root's first `open()` (spec §9 Open Question: "Checkpoint format
/// compatibility across engine versions" resolved here by refusing to
/// open rather than attempting migration — see DESIGN.md).
pub fn load_and_validate(root: &Path, expected_num_shards: u32) -> Result<Option<EngineManifest>, Error> {
    let path = manifest_path(root);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    let manifest: EngineManifest = serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;

    if manifest.format_version != ENGINE_FORMAT_VERSION {
        return Err(Error::CorruptRecord {
            message: format!(
                "engine manifest format version mismatch: on-disk {}, this build expects {}",
                manifest.format_version, ENGINE_FORMAT_VERSION
            ),
        });
    }
    if manifest.num_shards != expected_num_shards {
        return Err(Error::InvalidArgument(format!(
            "data root was opened with {} shards, cannot reopen with {}; resharding is an offline procedure",
            manifest.num_shards, expected_num_shards
        )));
    }
    Ok(Some(manifest))
}

/// Write a fresh manifest for a data root being opened for the first
/// time.
pub fn create(root: &Path, num_shards: u32, created_us: Timestamp) -> Result<EngineManifest, Error> {
    let manifest = EngineManifest {
        format_version: ENGINE_FORMAT_VERSION,
        num_shards,
        created_us,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| Error::Serialization(e.to_string()))?;
    fs::create_dir_all(root)?;
    write_atomic(&root.join("manifest.json.tmp"), &manifest_path(root), &bytes)?;
    Ok(manifest)
}

fn manifest_path(root: &Path) -> std::path::PathBuf {
    root.join("manifest.json")
}

fn write_atomic(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), Error> {
    {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, final_path)?;
    if let Some(parent) = final_path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_root_has_no_manifest() {
        let dir = tempdir().unwrap();
        assert!(load_and_validate(dir.path(), 8).unwrap().is_none());
    }

    #[test]
    fn create_then_load_round_trips() {
        let dir = tempdir().unwrap();
        create(dir.path(), 8, 1000).unwrap();
        let loaded = load_and_validate(dir.path(), 8).unwrap().unwrap();
        assert_eq!(loaded.num_shards, 8);
        assert_eq!(loaded.format_version, ENGINE_FORMAT_VERSION);
    }

    #[test]
    fn shard_count_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        create(dir.path(), 8, 1000).unwrap();
        let err = load_and_validate(dir.path(), 16).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn format_version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let bad = EngineManifest {
            format_version: ENGINE_FORMAT_VERSION + 1,
            num_shards: 8,
            created_us: 1000,
        };
        let bytes = serde_json::to_vec(&bad).unwrap();
        fs::write(dir.path().join("manifest.json"), bytes).unwrap();
        let err = load_and_validate(dir.path(), 8).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }
}
