//! Runtime-mutable producer options.
//!
//! Options are read once per request so a mid-batch flip of an environment
//! variable cannot change modes inside one response. Tests hand the
//! producer a fixed snapshot through [`OptionsProvider::fixed`] instead of
//! mutating process environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Max `READ` events per snapshot response.
const DEFAULT_SNAPSHOT_BATCH_SIZE: usize = 250;
/// Whether `TRUNCATE` log entries become events.
const DEFAULT_STREAM_TRUNCATE_RECORD: bool = false;
/// Packed-update mode: fold successive column writes of one row into one event.
const DEFAULT_SINGLE_RECORD_UPDATE: bool = true;
/// Intent-GC horizon extension while a snapshot is in progress.
const DEFAULT_INTENT_RETENTION_MS: u64 = 240_000;

/// Per-request snapshot of all producer options.
#[derive(Clone, Debug)]
pub struct ProducerOptions {
    pub snapshot_batch_size: usize,
    pub stream_truncate_record: bool,
    pub single_record_update: bool,
    pub intent_retention: Duration,
    /// Forces snapshot continuations to fail. Test capability only; has no
    /// environment variable on purpose.
    pub test_snapshot_failure: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            snapshot_batch_size: DEFAULT_SNAPSHOT_BATCH_SIZE,
            stream_truncate_record: DEFAULT_STREAM_TRUNCATE_RECORD,
            single_record_update: DEFAULT_SINGLE_RECORD_UPDATE,
            intent_retention: Duration::from_millis(DEFAULT_INTENT_RETENTION_MS),
            test_snapshot_failure: false,
        }
    }
}

impl ProducerOptions {
    /// Reads the current option values from the environment.
    pub fn from_env() -> Self {
        ProducerOptions {
            snapshot_batch_size: read_env_usize(
                "TIDE_CDC_SNAPSHOT_BATCH_SIZE",
                DEFAULT_SNAPSHOT_BATCH_SIZE,
            ),
            stream_truncate_record: read_env_bool(
                "TIDE_CDC_STREAM_TRUNCATE_RECORD",
                DEFAULT_STREAM_TRUNCATE_RECORD,
            ),
            single_record_update: read_env_bool(
                "TIDE_CDC_SINGLE_RECORD_UPDATE",
                DEFAULT_SINGLE_RECORD_UPDATE,
            ),
            intent_retention: Duration::from_millis(read_env_u64(
                "TIDE_CDC_INTENT_RETENTION_MS",
                DEFAULT_INTENT_RETENTION_MS,
            )),
            test_snapshot_failure: false,
        }
    }
}

/// Source of per-request option snapshots.
#[derive(Clone, Debug, Default)]
pub struct OptionsProvider {
    fixed: Option<ProducerOptions>,
}

impl OptionsProvider {
    /// Reads from the environment on every request.
    pub fn from_env() -> Self {
        OptionsProvider { fixed: None }
    }

    /// Always returns the given snapshot; used by tests and embedders that
    /// manage configuration themselves.
    pub fn fixed(options: ProducerOptions) -> Self {
        OptionsProvider {
            fixed: Some(options),
        }
    }

    pub fn current(&self) -> ProducerOptions {
        match &self.fixed {
            Some(options) => options.clone(),
            None => ProducerOptions::from_env(),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}
