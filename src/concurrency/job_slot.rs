//! Job slot - a named, single-occupancy gate in front of a shared resource.
//!
//! Built on a one-permit `Semaphore`:
//! - `try_acquire` fails immediately when the slot is taken
//! - `acquire_timeout` waits at most a bounded time
//! - the permit is released when the returned guard drops

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct JobSlot {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    /// Attempts turned away because the slot was occupied
    rejected_count: AtomicU64,
    /// Successful acquisitions
    granted_count: AtomicU64,
}

impl JobSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(1)),
            rejected_count: AtomicU64::new(0),
            granted_count: AtomicU64::new(0),
        }
    }

    /// Take the slot if it is free right now.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.grant(permit)),
            Err(_) => {
                self.rejected_count.fetch_add(1, Ordering::SeqCst);
                debug!(slot = self.name, "slot occupied, rejecting");
                None
            }
        }
    }

    /// Wait up to `timeout` for the slot. A zero timeout behaves like `try_acquire`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<SlotGuard> {
        if timeout.is_zero() {
            return self.try_acquire();
        }

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Some(self.grant(permit)),
            // Closed semaphore or elapsed wait: both mean the caller gets no slot.
            _ => {
                self.rejected_count.fetch_add(1, Ordering::SeqCst);
                debug!(slot = self.name, ?timeout, "slot wait timed out");
                None
            }
        }
    }

    pub fn is_free(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::SeqCst)
    }

    pub fn granted_count(&self) -> u64 {
        self.granted_count.load(Ordering::SeqCst)
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> SlotGuard {
        self.granted_count.fetch_add(1, Ordering::SeqCst);
        SlotGuard { _permit: permit }
    }
}

/// Holding this means the slot is yours; dropping it releases the slot.
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_acquire_is_rejected() {
        let slot = JobSlot::new("test");
        let first = slot.try_acquire();
        assert!(first.is_some());
        assert!(!slot.is_free());
        assert!(slot.try_acquire().is_none());
        assert_eq!(slot.rejected_count(), 1);

        drop(first);
        assert!(slot.is_free());
        assert!(slot.try_acquire().is_some());
        assert_eq!(slot.granted_count(), 2);
    }

    #[tokio::test]
    async fn acquire_timeout_gives_up() {
        let slot = JobSlot::new("test");
        let _held = slot.try_acquire().unwrap();
        let waited = slot.acquire_timeout(Duration::from_millis(20)).await;
        assert!(waited.is_none());
        assert_eq!(slot.rejected_count(), 1);
    }

    #[tokio::test]
    async fn acquire_timeout_succeeds_after_release() {
        let slot = Arc::new(JobSlot::new("test"));
        let held = slot.try_acquire().unwrap();

        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.acquire_timeout(Duration::from_secs(5)).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn zero_timeout_is_fail_fast() {
        let slot = JobSlot::new("test");
        let _held = slot.try_acquire().unwrap();
        assert!(slot.acquire_timeout(Duration::ZERO).await.is_none());
    }
}
