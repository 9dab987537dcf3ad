//! Exclusive claims on camera device indices
//!
//! A stream unit leases a device index before opening it, so no two units
//! ever drive the same physical camera. The lease is an RAII guard: dropping
//! it gives the index back.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::CameraBackend;

/// Registry of device indices currently in use
///
/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct DeviceLeaseRegistry {
    in_use: Arc<Mutex<BTreeSet<u32>>>,
}

impl DeviceLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lowest candidate index nobody holds
    ///
    /// The scan and the claim happen under one lock, so concurrent callers
    /// with overlapping candidates never receive the same index.
    pub fn acquire_first_available(&self, candidates: &[u32]) -> Option<DeviceLease> {
        let mut sorted = candidates.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let index = {
            let mut in_use = self.in_use.lock();
            let index = sorted.into_iter().find(|i| !in_use.contains(i))?;
            in_use.insert(index);
            index
        };

        info!(device = index, "Device leased");
        Some(DeviceLease {
            index,
            registry: self.clone(),
        })
    }

    /// Give an index back
    ///
    /// Returns whether the index was leased. Safe to call more than once.
    pub fn release(&self, index: u32) -> bool {
        let removed = self.in_use.lock().remove(&index);
        if removed {
            info!(device = index, "Device released");
        } else {
            debug!(device = index, "Release of device that was not leased");
        }
        removed
    }

    pub fn is_leased(&self, index: u32) -> bool {
        self.in_use.lock().contains(&index)
    }

    /// Snapshot of leased indices, ascending
    pub fn leased(&self) -> Vec<u32> {
        self.in_use.lock().iter().copied().collect()
    }

    /// Indices in `0..max_index` that are free and answer a liveness probe
    ///
    /// Probing opens the device, so it runs without holding the lock. The
    /// result is advisory: pass it to [`acquire_first_available`] to claim.
    ///
    /// [`acquire_first_available`]: Self::acquire_first_available
    pub fn available_devices(&self, backend: &dyn CameraBackend, max_index: u32) -> Vec<u32> {
        let free: Vec<u32> = {
            let in_use = self.in_use.lock();
            (0..max_index).filter(|i| !in_use.contains(i)).collect()
        };

        let available: Vec<u32> = free.into_iter().filter(|&i| backend.probe(i)).collect();
        if available.is_empty() {
            warn!(backend = backend.name(), "No available camera devices");
        } else {
            info!(backend = backend.name(), devices = ?available, "Available cameras");
        }
        available
    }
}

/// A held device index, released on drop
#[derive(Debug)]
pub struct DeviceLease {
    index: u32,
    registry: DeviceLeaseRegistry,
}

impl DeviceLease {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.registry.release(self.index);
    }
}

impl std::fmt::Debug for DeviceLeaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLeaseRegistry")
            .field("in_use", &self.leased())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test_pattern::TestPatternBackend;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_acquire_lowest_free() {
        let registry = DeviceLeaseRegistry::new();

        let a = registry.acquire_first_available(&[3, 1, 2]).unwrap();
        assert_eq!(a.index(), 1);
        let b = registry.acquire_first_available(&[1, 2, 3]).unwrap();
        assert_eq!(b.index(), 2);
        assert_eq!(registry.leased(), vec![1, 2]);
    }

    #[test]
    fn test_acquire_none_when_exhausted() {
        let registry = DeviceLeaseRegistry::new();
        let _a = registry.acquire_first_available(&[0]).unwrap();
        assert!(registry.acquire_first_available(&[0]).is_none());
        assert!(registry.acquire_first_available(&[]).is_none());
    }

    #[test]
    fn test_drop_releases_exactly_once() {
        let registry = DeviceLeaseRegistry::new();
        let lease = registry.acquire_first_available(&[4]).unwrap();
        assert!(registry.is_leased(4));

        drop(lease);
        assert!(!registry.is_leased(4));
        // Second release is a no-op.
        assert!(!registry.release(4));

        let again = registry.acquire_first_available(&[4]).unwrap();
        assert_eq!(again.index(), 4);
    }

    #[test]
    fn test_concurrent_acquire_never_duplicates() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        for _ in 0..ROUNDS {
            let registry = DeviceLeaseRegistry::new();
            let barrier = Arc::new(Barrier::new(THREADS));

            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let registry = registry.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        // Overlapping candidate windows.
                        let candidates: Vec<u32> = (t as u32 / 2..t as u32 / 2 + 4).collect();
                        barrier.wait();
                        registry.acquire_first_available(&candidates)
                    })
                })
                .collect();

            let leases: Vec<DeviceLease> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            let mut indices: Vec<u32> = leases.iter().map(|l| l.index()).collect();
            let total = indices.len();
            indices.sort_unstable();
            indices.dedup();
            assert_eq!(indices.len(), total, "duplicate lease handed out");
            assert_eq!(registry.leased(), indices);
        }
    }

    #[test]
    fn test_available_devices_probes_free_indices() {
        let registry = DeviceLeaseRegistry::new();
        let backend = TestPatternBackend::with_devices([0, 2, 5]);

        assert_eq!(registry.available_devices(&backend, 19), vec![0, 2, 5]);

        let _held = registry.acquire_first_available(&[2]).unwrap();
        assert_eq!(registry.available_devices(&backend, 19), vec![0, 5]);
        assert_eq!(registry.available_devices(&backend, 3), vec![0]);
    }
}
