//! Row, key and value primitives for the TideStore tablet keyspace.
//!
//! These types are kept in a small, dependency-light crate because they are
//! used by both the tablet server's storage layer and the CDC producer.

pub mod keys;
pub mod schema;
pub mod values;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable numeric identifier of a logical SQL table.
pub type TableId = u64;
/// Stable numeric identifier of one tablet (shard) of a table.
pub type TabletId = u64;
/// Schema version counter, bumped by every applied DDL.
pub type SchemaVersion = u32;

/// Number of low bits of a hybrid time reserved for the logical counter.
const HYBRID_TIME_LOGICAL_BITS: u32 = 12;

/// Logical+physical commit timestamp, totally ordered.
///
/// The upper 52 bits hold physical microseconds since the epoch, the lower
/// 12 bits a logical counter that breaks ties within one microsecond.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX);

    pub const fn from_micros(micros: u64) -> Self {
        HybridTime(micros << HYBRID_TIME_LOGICAL_BITS)
    }

    pub const fn from_micros_and_logical(micros: u64, logical: u16) -> Self {
        HybridTime((micros << HYBRID_TIME_LOGICAL_BITS) | (logical as u64))
    }

    pub const fn from_u64(raw: u64) -> Self {
        HybridTime(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical component in microseconds, with the logical counter dropped.
    pub const fn physical_micros(self) -> u64 {
        self.0 >> HYBRID_TIME_LOGICAL_BITS
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ physical: {} logical: {} }}", self.physical_micros(), self.0 & 0xfff)
    }
}

/// Consensus log position, ordered by `(term, index)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    pub const fn new(term: i64, index: i64) -> Self {
        OpId { term, index }
    }

    /// Sentinel for "no op id"; sorts below every valid position.
    pub const fn invalid() -> Self {
        OpId { term: -1, index: -1 }
    }

    pub const fn is_valid(self) -> bool {
        self.term >= 0 && self.index >= 0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Unique transaction identifier scoped by coordinating node and a
/// monotonically increasing counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId {
    pub node_id: u64,
    pub counter: u64,
}

impl TransactionId {
    pub const fn new(node_id: u64, counter: u64) -> Self {
        TransactionId { node_id, counter }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.node_id, self.counter)
    }
}
