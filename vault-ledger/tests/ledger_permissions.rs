//! Permission and concurrency tests for the ledger surface.
//!
//! These exercise the guarantees a delegate relies on: moves are validated
//! against state at the moment of application, and concurrent callers
//! cannot double-apply a move or observe a partial one.

use std::sync::Arc;
use std::time::Duration;

use vault_ledger::{
    Address, DestinationAdapter, DestinationId, Ledger, LedgerError, MoveProof, SimulatedAdapter,
    Venue,
};

// ============================================================================
// Test Utilities
// ============================================================================

const ADMIN: &str = "admin";
const BOT: &str = "bot";

fn proof(id: &str, seq: u64) -> MoveProof {
    MoveProof {
        proposal_id: id.to_string(),
        observed_sequence: seq,
    }
}

fn dest(id: &str) -> Venue {
    Venue::Destination(DestinationId::from(id))
}

async fn ledger_with_destinations(latency: Duration) -> Arc<Ledger> {
    let ledger = Arc::new(Ledger::new(ADMIN));
    for (id, rate) in [("lend-a", 5.0), ("lend-b", 6.8)] {
        let adapter = SimulatedAdapter::with_rate(id, rate).with_latency(latency);
        ledger
            .register_destination(&Address::from(ADMIN), Arc::new(adapter))
            .await
            .unwrap();
    }
    ledger
}

async fn open_delegated(ledger: &Ledger, principal: &str, amount: i128) -> Address {
    let account = Address::from(principal);
    ledger.deposit(&account, amount).await.unwrap();
    ledger
        .set_agent(&account, &account, Some(Address::from(BOT)))
        .await
        .unwrap();
    ledger
        .set_allowlist_batch(
            &account,
            &account,
            &[("lend-a".into(), true), ("lend-b".into(), true)],
        )
        .await
        .unwrap();
    account
}

// ============================================================================
// Authorization At Application Time
// ============================================================================

#[tokio::test]
async fn test_allowlist_change_after_proposal_is_honored() {
    let ledger = ledger_with_destinations(Duration::ZERO).await;
    let alice = open_delegated(&ledger, "alice", 10_000).await;
    let observed = ledger.snapshot(&alice).await.unwrap();
    assert!(observed.is_allowlisted(&"lend-b".into()));

    // Principal narrows the allowlist after the delegate read it
    ledger
        .set_allowlist(&alice, &alice, &"lend-b".into(), false)
        .await
        .unwrap();

    let err = ledger
        .rebalance(
            &Address::from(BOT),
            &alice,
            &Venue::Pool,
            &dest("lend-b"),
            10_000,
            &proof("p1", observed.sequence),
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::DestinationNotApproved("lend-b".into()));
    assert!(err.is_permission());
    assert_eq!(ledger.get_balances(&alice).await.unwrap().pool, 10_000);
}

#[tokio::test]
async fn test_delegate_cannot_withdraw_or_administer() {
    let ledger = ledger_with_destinations(Duration::ZERO).await;
    let alice = open_delegated(&ledger, "alice", 10_000).await;
    let bot = Address::from(BOT);

    assert!(ledger.withdraw(&bot, &alice, 1).await.is_err());
    assert!(ledger.set_agent(&bot, &alice, Some(bot.clone())).await.is_err());
    assert!(ledger
        .set_allowlist(&bot, &alice, &"lend-a".into(), false)
        .await
        .is_err());
    assert!(ledger
        .register_destination(&bot, Arc::new(SimulatedAdapter::with_rate("evil", 99.0)))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revocation_races_in_flight_move() {
    let ledger = ledger_with_destinations(Duration::from_millis(30)).await;
    let alice = open_delegated(&ledger, "alice", 10_000).await;
    let seq = ledger.snapshot(&alice).await.unwrap().sequence;

    let mover = {
        let ledger = ledger.clone();
        let alice = alice.clone();
        tokio::spawn(async move {
            ledger
                .rebalance(
                    &Address::from(BOT),
                    &alice,
                    &Venue::Pool,
                    &dest("lend-a"),
                    10_000,
                    &proof("p1", seq),
                )
                .await
        })
    };
    let revoke = ledger.set_agent(&alice, &alice, None).await.unwrap();
    let moved = mover.await.unwrap();

    let snapshot = ledger.snapshot(&alice).await.unwrap();
    match moved {
        // Applied before the revocation took the lock
        Ok(receipt) => {
            assert!(receipt.event.sequence < revoke.sequence);
            assert_eq!(snapshot.balances.at(&dest("lend-a")), 10_000);
        }
        Err(e) => {
            assert!(e.is_permission());
            assert_eq!(snapshot.balances.pool, 10_000);
        }
    }

    // Anything after the revocation fails
    let err = ledger
        .rebalance(
            &Address::from(BOT),
            &alice,
            &Venue::Pool,
            &dest("lend-b"),
            1,
            &proof("p2", snapshot.sequence),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotAuthorized { .. }));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_apply_once() {
    let ledger = ledger_with_destinations(Duration::from_millis(5)).await;
    let alice = open_delegated(&ledger, "alice", 10_000).await;
    let seq = ledger.snapshot(&alice).await.unwrap().sequence;

    let attempts = (0..8).map(|_| {
        let ledger = ledger.clone();
        let alice = alice.clone();
        tokio::spawn(async move {
            ledger
                .rebalance(
                    &Address::from(BOT),
                    &alice,
                    &Venue::Pool,
                    &dest("lend-a"),
                    1_000,
                    &proof("same", seq),
                )
                .await
        })
    });
    let results = futures_util::future::join_all(attempts).await;

    let applied = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(LedgerError::DuplicateProof(_)))))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(ledger.get_balances(&alice).await.unwrap().pool, 9_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accounts_progress_independently() {
    let ledger = ledger_with_destinations(Duration::from_millis(10)).await;
    let mut accounts = Vec::new();
    for name in ["alice", "bob", "carol"] {
        accounts.push(open_delegated(&ledger, name, 5_000).await);
    }

    let moves = accounts.iter().map(|account| {
        let ledger = ledger.clone();
        let account = account.clone();
        tokio::spawn(async move {
            let seq = ledger.snapshot(&account).await.unwrap().sequence;
            ledger
                .rebalance(
                    &Address::from(BOT),
                    &account,
                    &Venue::Pool,
                    &dest("lend-b"),
                    5_000,
                    &proof("p", seq),
                )
                .await
        })
    });
    for result in futures_util::future::join_all(moves).await {
        assert!(result.unwrap().is_ok());
    }

    let adapter = ledger.adapter(&"lend-b".into()).await.unwrap();
    assert_eq!(adapter.id().as_str(), "lend-b");
    for account in &accounts {
        let balances = ledger.get_balances(account).await.unwrap();
        assert_eq!(balances.pool, 0);
        assert_eq!(balances.total(), 5_000);
    }
}

#[tokio::test]
async fn test_subscriber_sequences_are_gapless_per_account() {
    let ledger = ledger_with_destinations(Duration::ZERO).await;
    let mut rx = ledger.subscribe();
    let alice = open_delegated(&ledger, "alice", 100).await;
    let bob = open_delegated(&ledger, "bob", 100).await;

    let mut last = std::collections::HashMap::new();
    while let Ok(event) = rx.try_recv() {
        let prev = last.insert(event.account.clone(), event.sequence).unwrap_or(0);
        assert_eq!(event.sequence, prev + 1);
    }
    assert_eq!(last[&alice], 4);
    assert_eq!(last[&bob], 4);
}
