//! Volume fan-out: ordered readable and writable views.

use crate::volume::{Volume, VolumeStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Holds every configured volume, partitioned into readable (all of them)
/// and writable subsets, with a rotating cursor to spread first writes.
pub struct VolumeManager {
    volumes: Vec<Arc<dyn Volume>>,
    writable: Vec<Arc<dyn Volume>>,
    cursor: AtomicUsize,
}

impl VolumeManager {
    pub fn new(volumes: Vec<Arc<dyn Volume>>) -> Self {
        let writable = volumes.iter().filter(|v| v.writable()).cloned().collect();
        Self {
            volumes,
            writable,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Every volume, in configuration order.
    pub fn readable(&self) -> &[Arc<dyn Volume>] {
        &self.volumes
    }

    /// Writable volumes, in configuration order.
    pub fn writable(&self) -> &[Arc<dyn Volume>] {
        &self.writable
    }

    /// Writable volumes starting at a rotating position, so successive
    /// writes spread across devices.
    pub fn writable_rotated(&self) -> Vec<Arc<dyn Volume>> {
        if self.writable.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.writable.len();
        let mut rotated = Vec::with_capacity(self.writable.len());
        rotated.extend_from_slice(&self.writable[start..]);
        rotated.extend_from_slice(&self.writable[..start]);
        rotated
    }

    pub fn by_device(&self, device_id: &str) -> Option<&Arc<dyn Volume>> {
        self.volumes.iter().find(|v| v.device_id() == device_id)
    }

    pub fn status(&self) -> Vec<VolumeStatus> {
        self.volumes.iter().map(|v| v.status()).collect()
    }
}
