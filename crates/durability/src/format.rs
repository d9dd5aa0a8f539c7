//! On-disk WAL segment and record framing (spec §4.2, §6).
//!
//! Segment header: `"WRP1" [u32 version=1] [u32 shard_id] [u64 base_seq]`.
//! Record framing: `[u64 sequence][u64 prev_offset][u32 body_len][body]
//! [u32 crc32c(body)]`. All integers little-endian. `body` is the
//! msgpack encoding of a [`WalEntry`] (spec §6 ties the body format to the
//! general length-prefixed, checksummed convention of §4.1; entries carry
//! structured fields rather than a raw key/value pair, so msgpack over the
//! entry struct is the literal realization of that convention — see
//! DESIGN.md for this open-question resolution).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use warp_core::types::{Sequence, ShardId, Timestamp, WalOp};
use warp_core::{Error, Key, Value};

pub const SEGMENT_MAGIC: &[u8; 4] = b"WRP1";
pub const SEGMENT_FORMAT_VERSION: u32 = 1;
/// magic(4) + version(4) + shard_id(4) + base_seq(8)
pub const SEGMENT_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u32,
    pub shard_id: ShardId,
    pub base_seq: Sequence,
}

impl SegmentHeader {
    pub fn new(shard_id: ShardId, base_seq: Sequence) -> Self {
        Self {
            version: SEGMENT_FORMAT_VERSION,
            shard_id,
            base_seq,
        }
    }

    pub fn to_bytes(self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.shard_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.base_seq.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(corrupt("segment header truncated"));
        }
        if &buf[0..4] != SEGMENT_MAGIC {
            return Err(corrupt("bad segment magic"));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != SEGMENT_FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported segment format version {version}")));
        }
        let shard_id = ShardId::from_le_bytes(buf[8..12].try_into().unwrap());
        let base_seq = Sequence::from_le_bytes(buf[12..20].try_into().unwrap());
        Ok(Self {
            version,
            shard_id,
            base_seq,
        })
    }
}

/// A single mutation recorded in a shard's WAL (spec §3 WAL Entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: Sequence,
    pub timestamp_us: Timestamp,
    pub op: WalOp,
    pub shard_id: ShardId,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub link_target: Option<Vec<u8>>,
    pub link_strength: Option<f32>,
}

impl WalEntry {
    pub fn put(sequence: Sequence, timestamp_us: Timestamp, shard_id: ShardId, key: &Key, value: &Value) -> Self {
        Self {
            sequence,
            timestamp_us,
            op: WalOp::Put,
            shard_id,
            key: key.as_bytes().to_vec(),
            value: Some(value.as_bytes().to_vec()),
            link_target: None,
            link_strength: None,
        }
    }

    pub fn delete(sequence: Sequence, timestamp_us: Timestamp, shard_id: ShardId, key: &Key) -> Self {
        Self {
            sequence,
            timestamp_us,
            op: WalOp::Delete,
            shard_id,
            key: key.as_bytes().to_vec(),
            value: None,
            link_target: None,
            link_strength: None,
        }
    }

    pub fn link(
        sequence: Sequence,
        timestamp_us: Timestamp,
        shard_id: ShardId,
        from: &Key,
        to: &Key,
        strength: f32,
    ) -> Self {
        Self {
            sequence,
            timestamp_us,
            op: WalOp::Link,
            shard_id,
            key: from.as_bytes().to_vec(),
            value: None,
            link_target: Some(to.as_bytes().to_vec()),
            link_strength: Some(strength),
        }
    }

    pub fn unlink(sequence: Sequence, timestamp_us: Timestamp, shard_id: ShardId, from: &Key, to: &Key) -> Self {
        Self {
            sequence,
            timestamp_us,
            op: WalOp::Unlink,
            shard_id,
            key: from.as_bytes().to_vec(),
            value: None,
            link_target: Some(to.as_bytes().to_vec()),
            link_strength: None,
        }
    }

    pub fn key(&self) -> Key {
        Key::new(self.key.clone())
    }
}

/// Encode `[sequence][prev_offset][body_len][body][crc32c(body)]`.
pub fn encode_record(entry: &WalEntry, prev_offset: u64) -> Result<Vec<u8>, Error> {
    let body = rmp_serde::to_vec(entry)?;
    let mut out = Vec::with_capacity(8 + 8 + 4 + body.len() + 4);
    out.write_u64::<LittleEndian>(entry.sequence)?;
    out.write_u64::<LittleEndian>(prev_offset)?;
    out.write_u32::<LittleEndian>(body.len() as u32)?;
    out.write_all(&body)?;
    let crc = crc32fast::hash(&body);
    out.write_u32::<LittleEndian>(crc)?;
    Ok(out)
}

/// Result of successfully parsing one record from a byte cursor.
pub struct ParsedRecord {
    pub entry: WalEntry,
    pub prev_offset: u64,
    /// Total bytes consumed, including the trailing crc32.
    pub consumed: usize,
}

/// Parse one record starting at the cursor's current position.
///
/// Returns `Ok(None)` when there are not enough bytes left for even the
/// fixed-size header — this is the expected shape of a crash-truncated
/// tail, not corruption. Returns `Err(CorruptRecord)` when a full header
/// parses but the checksum fails or the declared body length overruns the
/// buffer — that is corruption and the caller should resync forward.
pub fn parse_record(buf: &[u8]) -> Result<Option<ParsedRecord>, Error> {
    const FIXED_HEADER: usize = 8 + 8 + 4;
    if buf.len() < FIXED_HEADER {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    let sequence = cursor.read_u64::<LittleEndian>().unwrap();
    let prev_offset = cursor.read_u64::<LittleEndian>().unwrap();
    let body_len = cursor.read_u32::<LittleEndian>().unwrap() as usize;

    let body_start = FIXED_HEADER;
    let body_end = body_start.checked_add(body_len).ok_or_else(|| corrupt("body length overflow"))?;
    let crc_end = body_end.checked_add(4).ok_or_else(|| corrupt("body length overflow"))?;
    if crc_end > buf.len() {
        // Not enough bytes yet for the declared body length: could be a
        // torn write (treat as "need more data") or bogus header
        // (corruption). Callers distinguish by whether more segment bytes
        // exist; here we report it as a short read via Ok(None) and let
        // the reader's resync window catch genuine corruption via the crc
        // check on a shorter reinterpretation.
        return Ok(None);
    }

    let body = &buf[body_start..body_end];
    let expected_crc = (&buf[body_end..crc_end]).read_u32::<LittleEndian>().unwrap();
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        return Err(corrupt("wal record crc32 mismatch"));
    }

    let mut entry: WalEntry = rmp_serde::from_slice(body)?;
    entry.sequence = sequence;

    Ok(Some(ParsedRecord {
        entry,
        prev_offset,
        consumed: crc_end,
    }))
}

fn corrupt(message: &str) -> Error {
    Error::CorruptRecord {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_header_round_trips() {
        let header = SegmentHeader::new(7, 42);
        let bytes = header.to_bytes();
        let parsed = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = SegmentHeader::new(0, 0).to_bytes();
        bytes[0] = b'X';
        assert!(SegmentHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn record_round_trips() {
        let entry = WalEntry::put(1, 1000, 0, &Key::from("a"), &Value::from("b"));
        let encoded = encode_record(&entry, 0).unwrap();
        let parsed = parse_record(&encoded).unwrap().unwrap();
        assert_eq!(parsed.entry.sequence, 1);
        assert_eq!(parsed.entry.key(), Key::from("a"));
        assert_eq!(parsed.consumed, encoded.len());
    }

    #[test]
    fn short_buffer_is_none_not_error() {
        let entry = WalEntry::put(1, 1000, 0, &Key::from("a"), &Value::from("b"));
        let encoded = encode_record(&entry, 0).unwrap();
        let truncated = &encoded[..encoded.len() - 1];
        assert!(parse_record(truncated).unwrap().is_none());
    }

    #[test]
    fn corrupted_body_is_detected() {
        let entry = WalEntry::put(1, 1000, 0, &Key::from("a"), &Value::from("b"));
        let mut encoded = encode_record(&entry, 0).unwrap();
        let mid = encoded.len() - 6;
        encoded[mid] ^= 0xff;
        assert!(parse_record(&encoded).is_err());
    }
}
