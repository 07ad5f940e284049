//! The consumer checkpoint (cursor) and its codec.
//!
//! A checkpoint is opaque to consumers: they echo back whatever the
//! previous response returned. Internally it encodes the suspension point
//! of the producer state machine: the log position reached, the
//! intra-transaction write id and reverse-index key of a mid-transaction
//! resume, or the pinned read time and next scan key of a snapshot.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tide_row::{HybridTime, OpId};

/// Checkpoint codec format version.
const CHECKPOINT_FORMAT_VERSION: u8 = 1;

/// `write_id` sentinel selecting snapshot mode.
pub const SNAPSHOT_WRITE_ID: i32 = -1;

/// Mode the producer selects from an incoming checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Consistent-read backfill pinned at `snapshot_time`.
    Snapshot,
    /// Resume emitting intents of a partially streamed transaction.
    TransactionResume,
    /// Walk newly replicated log entries.
    WalStreaming,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub term: i64,
    pub index: i64,
    /// Next intent write id to emit; `0` is a transaction boundary, `-1`
    /// selects snapshot mode.
    pub write_id: i32,
    /// Reverse-index key of the next intent (streaming) or next row key to
    /// scan (snapshot).
    #[serde(with = "serde_bytes_vec")]
    pub key: Vec<u8>,
    /// Read time a snapshot scan is pinned at; `0` outside snapshot mode.
    pub snapshot_time: u64,
}

impl Checkpoint {
    pub fn op_id(&self) -> OpId {
        OpId::new(self.term, self.index)
    }

    /// Streaming checkpoint at a clean transaction boundary.
    pub fn at_boundary(op_id: OpId) -> Self {
        Checkpoint {
            term: op_id.term,
            index: op_id.index,
            write_id: 0,
            key: Vec::new(),
            snapshot_time: 0,
        }
    }

    /// Mid-transaction resume checkpoint.
    pub fn mid_transaction(op_id: OpId, key: Vec<u8>, write_id: u32) -> Self {
        Checkpoint {
            term: op_id.term,
            index: op_id.index,
            write_id: write_id as i32,
            key,
            snapshot_time: 0,
        }
    }

    /// Snapshot-mode checkpoint.
    pub fn snapshot(op_id: OpId, key: Vec<u8>, snapshot_time: HybridTime) -> Self {
        Checkpoint {
            term: op_id.term,
            index: op_id.index,
            write_id: SNAPSHOT_WRITE_ID,
            key,
            snapshot_time: snapshot_time.as_u64(),
        }
    }

    /// Checkpoint a consumer sends to request a snapshot bootstrap.
    pub fn snapshot_bootstrap() -> Self {
        Checkpoint {
            term: 0,
            index: 0,
            write_id: SNAPSHOT_WRITE_ID,
            key: Vec::new(),
            snapshot_time: 0,
        }
    }

    pub fn mode(&self) -> StreamMode {
        if self.write_id == SNAPSHOT_WRITE_ID {
            StreamMode::Snapshot
        } else if !self.key.is_empty() && self.write_id != 0 {
            StreamMode::TransactionResume
        } else {
            StreamMode::WalStreaming
        }
    }

    pub fn snapshot_time(&self) -> HybridTime {
        HybridTime::from_u64(self.snapshot_time)
    }

    /// True for the very first snapshot call, before the read time is pinned.
    pub fn is_snapshot_handshake(&self) -> bool {
        self.mode() == StreamMode::Snapshot && self.key.is_empty() && self.snapshot_time == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + 8 + 4 + self.key.len());
        out.push(CHECKPOINT_FORMAT_VERSION);
        out.extend_from_slice(&self.term.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.write_id.to_be_bytes());
        out.extend_from_slice(&self.snapshot_time.to_be_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let version = *bytes
            .first()
            .ok_or_else(|| anyhow!("empty checkpoint buffer"))?;
        cursor += 1;
        if version != CHECKPOINT_FORMAT_VERSION {
            return Err(anyhow!("unsupported checkpoint format version {}", version));
        }
        let term = read_i64(bytes, &mut cursor)?;
        let index = read_i64(bytes, &mut cursor)?;
        let write_id = read_i32(bytes, &mut cursor)?;
        let snapshot_time = read_u64(bytes, &mut cursor)?;
        let key_len = read_u32(bytes, &mut cursor)? as usize;
        if bytes.len() != cursor + key_len {
            return Err(anyhow!(
                "checkpoint key length mismatch: declared={}, available={}",
                key_len,
                bytes.len() - cursor
            ));
        }
        Ok(Checkpoint {
            term,
            index,
            write_id,
            key: bytes[cursor..].to_vec(),
            snapshot_time,
        })
    }

    /// Total order over stream progress.
    ///
    /// Op id first. At equal op ids, phases rank snapshot < mid-transaction
    /// < clean boundary, so finishing a transaction or leaving snapshot mode
    /// counts as forward progress; within a phase the resume key and write
    /// id decide. A correctly operating producer never returns a checkpoint
    /// that ranks below the one it received.
    pub fn stream_order(&self, other: &Checkpoint) -> std::cmp::Ordering {
        self.op_id()
            .cmp(&other.op_id())
            .then_with(|| self.phase_rank().cmp(&other.phase_rank()))
            .then_with(|| match (self.mode(), other.mode()) {
                (StreamMode::Snapshot, StreamMode::Snapshot) => {
                    // Scan keys grow; the pinned read time never changes
                    // within one snapshot, but the handshake (time 0) sorts
                    // below every pinned continuation.
                    self.snapshot_time
                        .cmp(&other.snapshot_time)
                        .then_with(|| self.key.cmp(&other.key))
                }
                (StreamMode::TransactionResume, StreamMode::TransactionResume) => self
                    .key
                    .cmp(&other.key)
                    .then_with(|| self.write_id.cmp(&other.write_id)),
                _ => std::cmp::Ordering::Equal,
            })
    }

    fn phase_rank(&self) -> u8 {
        match self.mode() {
            StreamMode::Snapshot => 0,
            StreamMode::TransactionResume => 1,
            StreamMode::WalStreaming => 2,
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} write_id={} key={} snapshot_time={}",
            self.term,
            self.index,
            self.write_id,
            hex::encode(&self.key),
            self.snapshot_time
        )
    }
}

// Serde helper keeping the key readable in JSON-framed transports.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

fn read_i64(bytes: &[u8], cursor: &mut usize) -> Result<i64> {
    Ok(read_u64(bytes, cursor)? as i64)
}

fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32> {
    Ok(read_u32(bytes, cursor)? as i32)
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    if bytes.len() < *cursor + 8 {
        return Err(anyhow!("checkpoint buffer underflow while decoding u64"));
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[*cursor..*cursor + 8]);
    *cursor += 8;
    Ok(u64::from_be_bytes(out))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if bytes.len() < *cursor + 4 {
        return Err(anyhow!("checkpoint buffer underflow while decoding u32"));
    }
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(u32::from_be_bytes(out))
}
