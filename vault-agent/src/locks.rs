//! Per-account in-flight submission leases.
//!
//! At most one lease exists per account. A lease is released when its guard
//! drops, on every exit path. Leases older than the timeout are considered
//! leaked and reclaimed by the next acquirer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use vault_ledger::Address;

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    acquired_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<Address, Lease>>>;

fn lock_table(table: &LeaseTable) -> MutexGuard<'_, HashMap<Address, Lease>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct InFlightRegistry {
    leases: LeaseTable,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl InFlightRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Take the account's lease, or `None` if a live lease is held.
    pub fn try_acquire(&self, account: &Address) -> Option<LeaseGuard> {
        let mut leases = lock_table(&self.leases);
        let now = Instant::now();

        if let Some(existing) = leases.get(account) {
            let held_for = now.duration_since(existing.acquired_at);
            if held_for < self.timeout {
                debug!(account = %account, "Lease busy");
                return None;
            }
            warn!(
                account = %account,
                lease_id = existing.id,
                held_secs = held_for.as_secs(),
                "Reclaiming stale in-flight lease"
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            account.clone(),
            Lease {
                id,
                acquired_at: now,
            },
        );
        Some(LeaseGuard {
            leases: self.leases.clone(),
            account: account.clone(),
            id,
        })
    }

    pub fn is_held(&self, account: &Address) -> bool {
        lock_table(&self.leases)
            .get(account)
            .is_some_and(|lease| lease.acquired_at.elapsed() < self.timeout)
    }

    /// Number of live leases.
    pub fn in_flight(&self) -> usize {
        lock_table(&self.leases)
            .values()
            .filter(|lease| lease.acquired_at.elapsed() < self.timeout)
            .count()
    }
}

/// Releases the lease on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    leases: LeaseTable,
    account: Address,
    id: u64,
}

impl LeaseGuard {
    pub fn account(&self) -> &Address {
        &self.account
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut leases = lock_table(&self.leases);
        // A reclaimed lease belongs to someone else now
        if leases.get(&self.account).is_some_and(|lease| lease.id == self.id) {
            leases.remove(&self.account);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_lease_per_account() {
        let registry = InFlightRegistry::new(Duration::from_secs(60));
        let alice = Address::from("alice");
        let bob = Address::from("bob");

        let guard = registry.try_acquire(&alice).unwrap();
        assert!(registry.try_acquire(&alice).is_none());
        assert!(registry.try_acquire(&bob).is_some());
        assert_eq!(guard.account(), &alice);
        assert!(registry.is_held(&alice));

        drop(guard);
        assert!(!registry.is_held(&alice));
        assert!(registry.try_acquire(&alice).is_some());
    }

    #[test]
    fn test_released_on_early_return() {
        let registry = InFlightRegistry::new(Duration::from_secs(60));
        let alice = Address::from("alice");

        let attempt = |registry: &InFlightRegistry| -> Result<(), &'static str> {
            let _guard = registry.try_acquire(&alice).ok_or("busy")?;
            Err("submission failed")
        };
        assert_eq!(attempt(&registry), Err("submission failed"));
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_stale_lease_reclaimed() {
        let registry = InFlightRegistry::new(Duration::from_millis(10));
        let alice = Address::from("alice");

        let leaked = registry.try_acquire(&alice).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let fresh = registry.try_acquire(&alice).unwrap();

        // Dropping the leaked guard must not release the fresh lease
        drop(leaked);
        assert!(registry.is_held(&alice));
        drop(fresh);
        assert!(!registry.is_held(&alice));
    }
}
