//! Memory-consumption accounting for one producer request.
//!
//! A request accrues bytes read from disk plus the approximate size of the
//! assembled response; the total is released on every exit path when the
//! scoped handle drops.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default, Debug, Clone, Copy)]
pub struct MemTrackerSnapshot {
    pub request_count: u64,
    pub total_bytes: u64,
    pub max_request_bytes: u64,
}

/// Shared tracker of in-flight producer memory, with cumulative stats.
#[derive(Default)]
pub struct MemTracker {
    consumed: AtomicI64,
    request_count: AtomicU64,
    total_bytes: AtomicU64,
    max_request_bytes: AtomicU64,
}

impl MemTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(MemTracker::default())
    }

    /// Bytes currently held by in-flight requests.
    pub fn consumed(&self) -> i64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Cumulative stats since the last snapshot call.
    pub fn snapshot_and_reset(&self) -> MemTrackerSnapshot {
        MemTrackerSnapshot {
            request_count: self.request_count.swap(0, Ordering::Relaxed),
            total_bytes: self.total_bytes.swap(0, Ordering::Relaxed),
            max_request_bytes: self.max_request_bytes.swap(0, Ordering::Relaxed),
        }
    }

    fn record_request(&self, bytes: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.max_request_bytes.fetch_max(bytes, Ordering::Relaxed);
    }
}

/// Accrues bytes against a tracker and releases them all on drop.
pub struct ScopedConsumption {
    tracker: Arc<MemTracker>,
    bytes: u64,
}

impl ScopedConsumption {
    pub fn new(tracker: Arc<MemTracker>) -> Self {
        ScopedConsumption { tracker, bytes: 0 }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.tracker
            .consumed
            .fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for ScopedConsumption {
    fn drop(&mut self) {
        self.tracker
            .consumed
            .fetch_sub(self.bytes as i64, Ordering::Relaxed);
        self.tracker.record_request(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_released_on_drop() {
        let tracker = MemTracker::new();
        {
            let mut scope = ScopedConsumption::new(tracker.clone());
            scope.add(100);
            scope.add(28);
            assert_eq!(tracker.consumed(), 128);
            assert_eq!(scope.bytes(), 128);
        }
        assert_eq!(tracker.consumed(), 0);

        let stats = tracker.snapshot_and_reset();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.total_bytes, 128);
        assert_eq!(stats.max_request_bytes, 128);
        assert_eq!(tracker.snapshot_and_reset().request_count, 0);
    }
}
