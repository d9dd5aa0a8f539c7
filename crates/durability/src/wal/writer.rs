//! Per-shard WAL writer (spec §4.2).
//!
//! Append is single-producer: the shard's coordinator is the only caller.
//! Sequence allocation uses `AcqRel` ordering per the spec's design notes
//! ("sequence allocation MUST be AcqRel against the WAL writer") since the
//! flush thread and recovery path both need to observe a freshly-allocated
//! sequence as soon as the append that produced it is visible.

use super::config::WalConfig;
use super::mode::FlushPolicy;
use crate::format::{encode_record, SegmentHeader, WalEntry};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use warp_core::types::{ShardId, Timestamp};
use warp_core::{Error, Key, Value};

fn segment_file_name(base_seq: u64) -> String {
    format!("{base_seq:020}.wal")
}

fn parse_segment_base_seq(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".wal")?.parse().ok()
}

struct OpenSegment {
    file: File,
    base_seq: u64,
    offset: u64,
    last_record_offset: u64,
}

/// Append-only, per-shard write-ahead log.
pub struct WalWriter {
    wal_dir: PathBuf,
    shard_id: ShardId,
    config: WalConfig,
    segment: OpenSegment,
    next_sequence: AtomicU64,
    bytes_since_sync: u64,
    writes_since_sync: u64,
    total_bytes_written: u64,
    last_sync: Instant,
    read_only: bool,
}

impl WalWriter {
    /// Open (or create) the WAL directory for `shard_id`, resuming from
    /// the latest segment if one exists.
    pub fn open(wal_dir: impl Into<PathBuf>, shard_id: ShardId, config: WalConfig) -> Result<Self, Error> {
        config.validate().map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let wal_dir = wal_dir.into();
        fs::create_dir_all(&wal_dir)?;

        let segment = match find_latest_segment(&wal_dir)? {
            Some(base_seq) => open_existing_segment(&wal_dir, base_seq)?,
            None => create_segment(&wal_dir, shard_id, 0)?,
        };
        let next_sequence = segment.base_seq + sequences_written_hint(&segment);

        Ok(Self {
            wal_dir,
            shard_id,
            config,
            segment,
            next_sequence: AtomicU64::new(next_sequence),
            bytes_since_sync: 0,
            writes_since_sync: 0,
            total_bytes_written: 0,
            last_sync: Instant::now(),
            read_only: false,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Cumulative bytes appended since this `WalWriter` was constructed.
    /// Used by the Checkpoint Manager's "WAL bytes since last checkpoint"
    /// trigger condition (spec §4.3); not reset by `flush` or `rotate`.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The sequence that will be assigned to the next append, without
    /// consuming it. Used by the Checkpoint Manager to record
    /// `last_included_sequence` for a snapshot taken at this instant.
    pub fn peek_next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Acquire)
    }

    fn next_seq(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    fn append_entry(&mut self, entry: WalEntry) -> Result<u64, Error> {
        if self.read_only {
            return Err(Error::ShardReadOnly {
                shard_id: self.shard_id,
                message: "wal is read-only after a prior io error".into(),
            });
        }
        if self.bytes_since_sync >= self.config.max_unflushed_bytes {
            return Err(Error::Backpressure {
                shard_id: Some(self.shard_id),
                message: "wal unflushed buffer full".into(),
            });
        }

        let sequence = entry.sequence;
        let encoded = match encode_record(&entry, self.segment.last_record_offset) {
            Ok(bytes) => bytes,
            Err(e) => return Err(e),
        };

        if self.segment.offset + encoded.len() as u64 > self.config.segment_max_bytes {
            // `sequence` was already allocated (and `next_sequence` advanced
            // past it) before this append started, so the new segment must
            // be named after it directly rather than re-read the counter.
            self.rotate_with_base(sequence)?;
        }

        let write_result = self.segment.file.write_all(&encoded);
        if let Err(e) = write_result {
            self.read_only = true;
            tracing::error!(target: "warp::wal", shard_id = self.shard_id, error = %e, "wal write failed; shard marked read-only");
            return Err(Error::IoError(e));
        }

        self.segment.last_record_offset = self.segment.offset;
        self.segment.offset += encoded.len() as u64;
        self.bytes_since_sync += encoded.len() as u64;
        self.writes_since_sync += 1;
        self.total_bytes_written += encoded.len() as u64;

        if matches!(self.config.flush_policy, FlushPolicy::EveryWrite) {
            self.flush()?;
        } else if let FlushPolicy::OnBufferFull { max_unflushed_bytes } = self.config.flush_policy {
            if self.bytes_since_sync >= max_unflushed_bytes {
                self.flush()?;
            }
        }

        Ok(sequence)
    }

    pub fn append_put(&mut self, timestamp_us: Timestamp, key: &Key, value: &Value) -> Result<u64, Error> {
        let seq = self.next_seq();
        self.append_entry(WalEntry::put(seq, timestamp_us, self.shard_id, key, value))
    }

    pub fn append_delete(&mut self, timestamp_us: Timestamp, key: &Key) -> Result<u64, Error> {
        let seq = self.next_seq();
        self.append_entry(WalEntry::delete(seq, timestamp_us, self.shard_id, key))
    }

    pub fn append_link(&mut self, timestamp_us: Timestamp, from: &Key, to: &Key, strength: f32) -> Result<u64, Error> {
        let seq = self.next_seq();
        self.append_entry(WalEntry::link(seq, timestamp_us, self.shard_id, from, to, strength))
    }

    pub fn append_unlink(&mut self, timestamp_us: Timestamp, from: &Key, to: &Key) -> Result<u64, Error> {
        let seq = self.next_seq();
        self.append_entry(WalEntry::unlink(seq, timestamp_us, self.shard_id, from, to))
    }

    /// Batch all writes since the last sync into a single fsync syscall.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.segment.file.sync_data()?;
        self.bytes_since_sync = 0;
        self.writes_since_sync = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Flush if the configured interval has elapsed since the last sync.
    /// Called by the background WAL flusher, not the append path.
    pub fn maybe_interval_flush(&mut self) -> Result<bool, Error> {
        if let FlushPolicy::Interval { interval_ms } = self.config.flush_policy {
            if self.writes_since_sync > 0 && self.last_sync.elapsed().as_millis() as u64 >= interval_ms {
                self.flush()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Close the current segment and open the next one, named after
    /// `self.next_sequence` — the sequence that will be assigned to the
    /// next append. Idempotent: if the current segment has no records
    /// yet, rotation still opens a new file (the empty one is left in
    /// place for the reader's resync logic).
    pub fn rotate(&mut self) -> Result<(), Error> {
        let new_base = self.next_sequence.load(Ordering::Acquire);
        self.rotate_with_base(new_base)
    }

    /// Rotate to a new segment named after `new_base`. Used both by the
    /// public `rotate()` (no write in flight: `new_base` is simply
    /// `next_sequence`) and by a mid-append overflow, where `new_base`
    /// must be the sequence already allocated to the pending entry, not
    /// `next_sequence` (which has already been advanced past it).
    fn rotate_with_base(&mut self, new_base: u64) -> Result<(), Error> {
        self.flush()?;
        let new_segment = create_segment(&self.wal_dir, self.shard_id, new_base)?;
        tracing::debug!(target: "warp::wal", shard_id = self.shard_id, base_seq = new_base, "wal segment rotated");
        self.segment = new_segment;
        Ok(())
    }

    /// Delete closed segments whose last sequence is `<= sequence`. The
    /// active (last) segment is never removed. Caller (Checkpoint Manager)
    /// guarantees a covering checkpoint exists.
    pub fn truncate_through(&mut self, sequence: u64) -> Result<(), Error> {
        let mut bases = list_segment_bases(&self.wal_dir)?;
        bases.sort_unstable();
        if bases.len() <= 1 {
            return Ok(());
        }
        for window in bases.windows(2) {
            let (base, next_base) = (window[0], window[1]);
            let last_seq_in_segment = next_base.saturating_sub(1);
            if last_seq_in_segment <= sequence {
                let path = self.wal_dir.join(segment_file_name(base));
                fs::remove_file(&path)?;
                tracing::debug!(target: "warp::wal", shard_id = self.shard_id, base_seq = base, "wal segment truncated");
            }
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.flush()
    }

    /// Fix up the next-sequence counter after a recovery pass has
    /// established the true last-written sequence by replay, since
    /// `open()` only knows a conservative placeholder for an existing
    /// segment (see `sequences_written_hint`). Never moves the counter
    /// backward.
    pub fn resume_from(&mut self, last_written_sequence: Option<u64>) {
        let candidate = match last_written_sequence {
            Some(seq) => seq + 1,
            None => self.segment.base_seq,
        };
        let current = self.next_sequence.load(Ordering::Acquire);
        if candidate > current {
            self.next_sequence.store(candidate, Ordering::Release);
        }
    }
}

fn sequences_written_hint(segment: &OpenSegment) -> u64 {
    // Conservative: when resuming an existing segment we do not know how
    // many records it holds without a full scan, so the reader's recovery
    // pass is responsible for establishing the true next sequence. This
    // value is only used as a pre-recovery placeholder.
    let _ = segment;
    0
}

fn find_latest_segment(wal_dir: &Path) -> Result<Option<u64>, Error> {
    let mut bases = list_segment_bases(wal_dir)?;
    bases.sort_unstable();
    Ok(bases.last().copied())
}

fn list_segment_bases(wal_dir: &Path) -> Result<Vec<u64>, Error> {
    let mut out = Vec::new();
    for entry in fs::read_dir(wal_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(base) = parse_segment_base_seq(name) {
                out.push(base);
            }
        }
    }
    Ok(out)
}

fn create_segment(wal_dir: &Path, shard_id: ShardId, base_seq: u64) -> Result<OpenSegment, Error> {
    let path = wal_dir.join(segment_file_name(base_seq));
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    let header = SegmentHeader::new(shard_id, base_seq).to_bytes();
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(OpenSegment {
        file,
        base_seq,
        offset: header.len() as u64,
        last_record_offset: 0,
    })
}

fn open_existing_segment(wal_dir: &Path, base_seq: u64) -> Result<OpenSegment, Error> {
    let path = wal_dir.join(segment_file_name(base_seq));
    let file = OpenOptions::new().append(true).read(true).open(&path)?;
    let len = file.metadata()?.len();
    Ok(OpenSegment {
        file,
        base_seq,
        offset: len,
        last_record_offset: len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_rotate_creates_new_segment() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), 0, WalConfig::for_testing()).unwrap();
        writer.append_put(1, &Key::from("a"), &Value::from("1")).unwrap();
        writer.rotate().unwrap();
        writer.append_put(2, &Key::from("b"), &Value::from("2")).unwrap();
        let bases = list_segment_bases(dir.path()).unwrap();
        assert_eq!(bases.len(), 2);
    }

    #[test]
    fn mid_append_overflow_rotation_names_segment_after_its_first_record() {
        use super::super::reader::read_segment;

        let dir = tempdir().unwrap();
        let mut config = WalConfig::for_testing();
        // Small enough that later appends overflow the active segment
        // mid-call, forcing `append_entry` itself to rotate rather than a
        // caller-driven `rotate()`.
        config.segment_max_bytes = 96;
        let mut writer = WalWriter::open(dir.path(), 0, config.clone()).unwrap();
        for i in 0..20u64 {
            writer.append_put(i, &Key::from(format!("k{i}").as_str()), &Value::from("v")).unwrap();
        }

        let mut bases = list_segment_bases(dir.path()).unwrap();
        bases.sort_unstable();
        assert!(bases.len() > 1, "test setup must force at least one mid-append rotation");

        for base in bases {
            let path = dir.path().join(segment_file_name(base));
            let result = read_segment(&path, config.max_recovery_scan_window).unwrap();
            let first_entry_seq = result.entries.first().expect("segment must contain the record it was rotated for").sequence;
            assert_eq!(base, first_entry_seq, "segment filename must equal the sequence of the first record written into it");
        }
    }

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), 0, WalConfig::for_testing()).unwrap();
        let s1 = writer.append_put(1, &Key::from("a"), &Value::from("1")).unwrap();
        let s2 = writer.append_put(2, &Key::from("b"), &Value::from("2")).unwrap();
        assert_eq!(s2, s1 + 1);
    }

    #[test]
    fn resume_from_picks_up_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut writer = WalWriter::open(dir.path(), 0, WalConfig::for_testing()).unwrap();
            writer.append_put(0, &Key::from("a"), &Value::from("1")).unwrap();
            writer.append_put(1, &Key::from("b"), &Value::from("2")).unwrap();
            writer.close().unwrap();
        }
        // Without resume_from, reopening would allocate 0 again and collide.
        let mut writer = WalWriter::open(dir.path(), 0, WalConfig::for_testing()).unwrap();
        writer.resume_from(Some(1));
        let seq = writer.append_put(0, &Key::from("c"), &Value::from("3")).unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn truncate_through_removes_fully_covered_segments() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), 0, WalConfig::for_testing()).unwrap();
        writer.append_put(1, &Key::from("a"), &Value::from("1")).unwrap();
        writer.rotate().unwrap();
        writer.append_put(2, &Key::from("b"), &Value::from("2")).unwrap();
        writer.truncate_through(0).unwrap();
        let bases = list_segment_bases(dir.path()).unwrap();
        assert_eq!(bases.len(), 1);
    }
}
