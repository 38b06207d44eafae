//! Per-key minimum retry spacing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Limits how often the dispatcher reconsiders the same container, so a
/// container that repeatedly fails to run cannot cause a relock storm.
pub struct Throttle {
    hold: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the caller may proceed with `key`. After a positive
    /// answer, subsequent checks for the same key return false until the
    /// hold period elapses.
    pub fn check(&self, key: &str) -> bool {
        if self.hold.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("throttle mutex poisoned");
        match seen.get(key) {
            Some(last) if now.duration_since(*last) < self.hold => false,
            _ => {
                seen.insert(key.to_string(), now);
                true
            }
        }
    }
}
