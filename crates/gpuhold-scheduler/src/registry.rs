//! Registry of devices under occupation

use gpuhold_core::DeviceIndex;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

/// Devices this process already manages, claimed or in flight
///
/// Every read and write goes through one mutex, so two scan cycles can
/// never both claim the same index.
#[derive(Debug, Default)]
pub struct OccupancyRegistry {
    claimed: Mutex<HashSet<DeviceIndex>>,
}

impl OccupancyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a device
    ///
    /// Returns `true` and records the device if it was not yet claimed,
    /// `false` otherwise.
    pub async fn try_claim(&self, idx: DeviceIndex) -> bool {
        let claimed = self.claimed.lock().await.insert(idx);
        if claimed {
            debug!(device = idx, "Claimed device");
        }
        claimed
    }

    /// Whether the device is already claimed
    pub async fn contains(&self, idx: DeviceIndex) -> bool {
        self.claimed.lock().await.contains(&idx)
    }

    /// Number of claimed devices
    pub async fn len(&self) -> usize {
        self.claimed.lock().await.len()
    }

    /// Whether no device is claimed
    pub async fn is_empty(&self) -> bool {
        self.claimed.lock().await.is_empty()
    }

    /// Claimed devices, ascending
    pub async fn claimed(&self) -> Vec<DeviceIndex> {
        let mut indices: Vec<DeviceIndex> = self.claimed.lock().await.iter().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Drop a claim; only the release-on-failure policy calls this
    pub(crate) async fn release(&self, idx: DeviceIndex) -> bool {
        let released = self.claimed.lock().await.remove(&idx);
        if released {
            debug!(device = idx, "Released device");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_registry_empty() {
        let registry = OccupancyRegistry::new();
        assert!(registry.is_empty().await);
        assert!(!registry.contains(0).await);
    }

    #[tokio::test]
    async fn test_claim_once() {
        let registry = OccupancyRegistry::new();
        assert!(registry.try_claim(3).await);
        assert!(!registry.try_claim(3).await);
        assert!(registry.contains(3).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_claimed_sorted() {
        let registry = OccupancyRegistry::new();
        for idx in [3, 0, 1] {
            registry.try_claim(idx).await;
        }
        assert_eq!(registry.claimed().await, vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_release() {
        let registry = OccupancyRegistry::new();
        registry.try_claim(2).await;
        assert!(registry.release(2).await);
        assert!(!registry.release(2).await);
        assert!(registry.try_claim(2).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let registry = Arc::new(OccupancyRegistry::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.try_claim(7).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.claimed().await, vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_many_devices() {
        let registry = Arc::new(OccupancyRegistry::new());

        let handles: Vec<_> = (0..128u32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { (i % 8, registry.try_claim(i % 8).await) })
            })
            .collect();

        let mut wins = [0u32; 8];
        for handle in handles {
            let (idx, won) = handle.await.unwrap();
            if won {
                wins[idx as usize] += 1;
            }
        }

        assert!(wins.iter().all(|&w| w == 1));
        assert_eq!(registry.len().await, 8);
    }
}
