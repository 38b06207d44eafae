//! Per-bucket I/O and API call counters.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every call path of one bucket.
///
/// Incremented with relaxed atomics; exactness across racing snapshots is
/// not required.
#[derive(Debug, Default)]
pub struct BucketStats {
    pub ops: AtomicU64,
    pub get_ops: AtomicU64,
    pub put_ops: AtomicU64,
    pub head_ops: AtomicU64,
    pub del_ops: AtomicU64,
    pub list_ops: AtomicU64,
    pub copy_ops: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub errors: AtomicU64,
    error_kinds: Mutex<HashMap<String, u64>>,
}

impl BucketStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one API call of the given kind.
    pub fn tick(&self, kind: &AtomicU64) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        kind.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error, keyed by a short tag including provider status/code.
    pub fn tick_err(&self, tag: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut kinds = self.error_kinds.lock().expect("stats mutex poisoned");
        *kinds.entry(tag).or_insert(0) += 1;
    }

    pub fn tick_in_bytes(&self, n: u64) {
        self.in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tick_out_bytes(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            get_ops: self.get_ops.load(Ordering::Relaxed),
            put_ops: self.put_ops.load(Ordering::Relaxed),
            head_ops: self.head_ops.load(Ordering::Relaxed),
            del_ops: self.del_ops.load(Ordering::Relaxed),
            list_ops: self.list_ops.load(Ordering::Relaxed),
            copy_ops: self.copy_ops.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            error_kinds: self
                .error_kinds
                .lock()
                .expect("stats mutex poisoned")
                .clone(),
        }
    }
}

/// Point-in-time copy of [`BucketStats`] for status reports.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub ops: u64,
    pub get_ops: u64,
    pub put_ops: u64,
    pub head_ops: u64,
    pub del_ops: u64,
    pub list_ops: u64,
    pub copy_ops: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub errors: u64,
    pub error_kinds: HashMap<String, u64>,
}
