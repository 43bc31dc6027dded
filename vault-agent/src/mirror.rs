//! Permission mirror and reconciler.
//!
//! A non-authoritative local copy of each account's ledger state, kept
//! current by the ledger's change stream. Sequence gaps and lagged
//! subscriptions fall back to re-reading the ledger, and a periodic
//! reconciler bounds staleness. Ledger rejections always win over the mirror.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use vault_ledger::{AccountSnapshot, Address, Ledger, LedgerError, LedgerEvent};

/// What `apply` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Already reflected; ignored
    Stale,
    /// Next in sequence; folded in
    Applied,
    /// Gap or unknown account; re-read from the ledger
    Refreshed,
}

pub struct PermissionMirror {
    ledger: Arc<Ledger>,
    snapshots: RwLock<HashMap<Address, AccountSnapshot>>,
}

impl PermissionMirror {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Last-known snapshot, if the account is mirrored.
    pub async fn snapshot(&self, account: &Address) -> Option<AccountSnapshot> {
        self.snapshots.read().await.get(account).cloned()
    }

    /// Mirrored snapshot, loading it from the ledger on a miss.
    pub async fn get_or_load(&self, account: &Address) -> Result<AccountSnapshot, LedgerError> {
        if let Some(snapshot) = self.snapshot(account).await {
            return Ok(snapshot);
        }
        self.refresh(account).await
    }

    pub async fn accounts(&self) -> Vec<Address> {
        self.snapshots.read().await.keys().cloned().collect()
    }

    /// Replace the account's snapshot with a fresh ledger read.
    pub async fn refresh(&self, account: &Address) -> Result<AccountSnapshot, LedgerError> {
        let fresh = self.ledger.snapshot(account).await?;
        let mut snapshots = self.snapshots.write().await;
        // Keep whichever is newer; a concurrent apply may have moved ahead
        let entry = snapshots.entry(account.clone()).or_insert_with(|| fresh.clone());
        if fresh.sequence >= entry.sequence {
            *entry = fresh;
        }
        debug!(account = %account, sequence = entry.sequence, "Mirror refreshed");
        Ok(entry.clone())
    }

    /// Re-read every ledger account. Returns how many were refreshed.
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for account in self.ledger.accounts().await {
            match self.refresh(&account).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(account = %account, error = %e, "Mirror refresh failed"),
            }
        }
        refreshed
    }

    /// Fold one ledger event into the mirror.
    pub async fn apply(&self, event: &LedgerEvent) -> Result<ApplyOutcome, LedgerError> {
        {
            let mut snapshots = self.snapshots.write().await;
            if let Some(snapshot) = snapshots.get_mut(&event.account) {
                if event.sequence <= snapshot.sequence {
                    return Ok(ApplyOutcome::Stale);
                }
                if event.sequence == snapshot.sequence + 1 {
                    event.apply_to(snapshot);
                    if event.change.is_permission_change() {
                        debug!(
                            account = %event.account,
                            sequence = event.sequence,
                            kind = event.change.kind(),
                            "Mirror applied permission change"
                        );
                    }
                    return Ok(ApplyOutcome::Applied);
                }
                warn!(
                    account = %event.account,
                    expected = snapshot.sequence + 1,
                    got = event.sequence,
                    "Sequence gap, re-reading account"
                );
            }
        }

        self.refresh(&event.account).await?;
        Ok(ApplyOutcome::Refreshed)
    }

    /// Catch every mirrored account up after the subscription lagged.
    pub async fn resume(&self) {
        let known: Vec<(Address, u64)> = self
            .snapshots
            .read()
            .await
            .iter()
            .map(|(account, snapshot)| (account.clone(), snapshot.sequence))
            .collect();

        for (account, after) in known {
            match self.ledger.events_since(&account, after).await {
                Ok(events) => {
                    for event in &events {
                        if let Err(e) = self.apply(event).await {
                            warn!(account = %account, error = %e, "Resume apply failed");
                        }
                    }
                }
                Err(LedgerError::EventsPruned { .. }) => {
                    debug!(account = %account, after, "Resume window pruned, re-reading");
                    if let Err(e) = self.refresh(&account).await {
                        warn!(account = %account, error = %e, "Mirror refresh failed");
                    }
                }
                Err(e) => warn!(account = %account, error = %e, "Resume failed"),
            }
        }

        // Accounts opened while we were lagging
        for account in self.ledger.accounts().await {
            if self.snapshot(&account).await.is_none() {
                if let Err(e) = self.refresh(&account).await {
                    warn!(account = %account, error = %e, "Mirror refresh failed");
                }
            }
        }
    }

    /// Subscribe, load every account, and keep applying the change stream.
    pub async fn start_listener(self: &Arc<Self>) -> JoinHandle<()> {
        // Subscribe first so nothing between the load and the loop is lost
        let rx = self.ledger.subscribe();
        let loaded = self.refresh_all().await;
        info!(accounts = loaded, "Mirror loaded");

        let mirror = self.clone();
        tokio::spawn(async move { mirror.listen(rx).await })
    }

    async fn listen(&self, mut rx: broadcast::Receiver<LedgerEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.apply(&event).await {
                        warn!(account = %event.account, error = %e, "Mirror apply failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Mirror subscription lagged, resuming from last sequences");
                    self.resume().await;
                }
                Err(RecvError::Closed) => {
                    info!("Ledger notification stream closed, mirror listener stopping");
                    break;
                }
            }
        }
    }

    /// Periodically re-read every account.
    pub fn start_reconciler(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let mirror = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let refreshed = mirror.refresh_all().await;
                debug!(accounts = refreshed, "Mirror reconciled");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_ledger::{LedgerOptions, SimulatedAdapter};

    async fn ledger() -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::with_options(
            "admin",
            LedgerOptions {
                event_retention: 4,
                notification_buffer: 2,
            },
        ));
        for id in ["lend-a", "lend-b"] {
            ledger
                .register_destination(
                    &Address::from("admin"),
                    Arc::new(SimulatedAdapter::with_rate(id, 5.0)),
                )
                .await
                .unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_apply_in_order_and_stale() {
        let ledger = ledger().await;
        let mirror = PermissionMirror::new(ledger.clone());
        let alice = Address::from("alice");
        ledger.deposit(&alice, 100).await.unwrap();
        mirror.refresh(&alice).await.unwrap();

        let event = ledger
            .set_agent(&alice, &alice, Some("bot".into()))
            .await
            .unwrap();
        assert_eq!(mirror.apply(&event).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(mirror.apply(&event).await.unwrap(), ApplyOutcome::Stale);
        let snapshot = mirror.snapshot(&alice).await.unwrap();
        assert!(snapshot.is_delegated_to(&"bot".into()));
    }

    #[tokio::test]
    async fn test_gap_triggers_full_read() {
        let ledger = ledger().await;
        let mirror = PermissionMirror::new(ledger.clone());
        let alice = Address::from("alice");
        ledger.deposit(&alice, 100).await.unwrap();
        mirror.refresh(&alice).await.unwrap();

        // Mirror misses the allowlist change and only sees the revocation
        ledger
            .set_allowlist(&alice, &alice, &"lend-a".into(), true)
            .await
            .unwrap();
        let revoke = ledger.set_agent(&alice, &alice, None).await.unwrap();

        assert_eq!(mirror.apply(&revoke).await.unwrap(), ApplyOutcome::Refreshed);
        let snapshot = mirror.snapshot(&alice).await.unwrap();
        assert_eq!(snapshot, ledger.snapshot(&alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_account_is_loaded() {
        let ledger = ledger().await;
        let mirror = PermissionMirror::new(ledger.clone());
        let event = ledger.deposit(&Address::from("bob"), 5).await.unwrap();
        assert_eq!(mirror.apply(&event).await.unwrap(), ApplyOutcome::Refreshed);
        assert_eq!(mirror.accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_falls_back_when_pruned() {
        let ledger = ledger().await;
        let mirror = PermissionMirror::new(ledger.clone());
        let alice = Address::from("alice");
        let bob = Address::from("bob");
        ledger.deposit(&alice, 100).await.unwrap();
        ledger.deposit(&bob, 100).await.unwrap();
        mirror.refresh_all().await;

        // Alice stays within retention, Bob falls out of it
        ledger.set_agent(&alice, &alice, Some("bot".into())).await.unwrap();
        for _ in 0..6 {
            ledger.deposit(&bob, 1).await.unwrap();
        }
        ledger.deposit(&Address::from("carol"), 1).await.unwrap();

        mirror.resume().await;
        for account in ledger.accounts().await {
            assert_eq!(
                mirror.snapshot(&account).await.unwrap(),
                ledger.snapshot(&account).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_listener_recovers_from_lag() {
        let ledger = ledger().await;
        let mirror = Arc::new(PermissionMirror::new(ledger.clone()));
        let alice = Address::from("alice");
        ledger.deposit(&alice, 100).await.unwrap();

        let handle = mirror.start_listener().await;
        // Overflow the two-slot notification buffer before the listener runs
        ledger.set_agent(&alice, &alice, Some("bot".into())).await.unwrap();
        ledger
            .set_allowlist_batch(
                &alice,
                &alice,
                &[("lend-a".into(), true), ("lend-b".into(), true)],
            )
            .await
            .unwrap();
        ledger.set_agent(&alice, &alice, None).await.unwrap();

        let expected = ledger.snapshot(&alice).await.unwrap();
        let mut synced = false;
        for _ in 0..50 {
            if mirror.snapshot(&alice).await.as_ref() == Some(&expected) {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(synced, "mirror never caught up with the ledger");
    }
}
