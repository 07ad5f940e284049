//! Producer error taxonomy.
//!
//! Every variant is terminal for the request; only `IntentsGced` is
//! terminal for the stream itself. A verified tablet split travels on the
//! response (`TerminalStatus::TabletSplit`) rather than as an error, so the
//! checkpoint advanced past the split still reaches the consumer. Soft
//! conditions (catalog fallback) are handled inline by the schema resolver
//! and never surface here.

use serde::{Deserialize, Serialize};
use tide_row::{OpId, TabletId, TransactionId};

/// Wire-level status attached to a response or derived from an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus {
    #[default]
    Ok,
    TabletSplit,
    IntentsGced,
    SnapshotFailed,
    CorruptEncoding,
    UnsupportedType,
    InternalError,
}

#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// The apply record's op id is at or below the tablet's retention
    /// checkpoint and no intents remain. The consumer is too far behind and
    /// must re-bootstrap via snapshot.
    #[error(
        "intents for transaction {txn} already garbage-collected \
         (apply op {op_id} <= retention checkpoint {retention_checkpoint})"
    )]
    IntentsGced {
        txn: TransactionId,
        op_id: OpId,
        retention_checkpoint: OpId,
    },

    #[error("snapshot failed for tablet {tablet_id}: {reason}")]
    SnapshotFailed { tablet_id: TabletId, reason: String },

    #[error("corrupt key/value encoding: {0:#}")]
    CorruptEncoding(#[source] anyhow::Error),

    #[error("unsupported pg type oid {oid} for column '{column}'")]
    UnsupportedType { column: String, oid: u32 },

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl CdcError {
    pub fn terminal_status(&self) -> TerminalStatus {
        match self {
            CdcError::IntentsGced { .. } => TerminalStatus::IntentsGced,
            CdcError::SnapshotFailed { .. } => TerminalStatus::SnapshotFailed,
            CdcError::CorruptEncoding(_) => TerminalStatus::CorruptEncoding,
            CdcError::UnsupportedType { .. } => TerminalStatus::UnsupportedType,
            CdcError::Internal(_) => TerminalStatus::InternalError,
        }
    }

    /// Wraps a codec-layer failure as a corrupt-encoding error.
    pub fn corrupt(err: anyhow::Error) -> Self {
        CdcError::CorruptEncoding(err)
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
