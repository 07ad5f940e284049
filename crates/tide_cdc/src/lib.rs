//! Change-data-capture producer core for TideStore tablets.
//!
//! The producer answers one request: given a per-consumer checkpoint, return
//! the next ordered batch of committed row-change events on this tablet plus
//! the checkpoint to resume from. It reconstructs logical events from the
//! replicated log and the provisional-intent store across three modes
//! (snapshot backfill, log streaming, mid-transaction continuation), while
//! preserving commit order, exactly-once delivery relative to the returned
//! checkpoint, and schema-version correctness.
//!
//! The RPC transport, the storage engine, the consensus log reader and the
//! catalog are external collaborators reached through the traits in
//! [`tablet`].

pub mod checkpoint;
pub mod config;
pub mod consumption;
pub mod datum;
pub mod error;
pub mod events;
pub mod intents;
pub mod producer;
pub mod rows;
pub mod schema_cache;
pub mod snapshot;
pub mod tablet;
pub mod wal;

pub use checkpoint::{Checkpoint, StreamMode};
pub use config::{OptionsProvider, ProducerOptions};
pub use error::{CdcError, Result, TerminalStatus};
pub use events::{
    ChangeRecord, Datum, EnumLabelMap, EventKind, EventOpId, GetChangesRequest,
    GetChangesResponse, RowEvent,
};
pub use producer::CdcProducer;
