//! Execution orchestrator.
//!
//! One cycle walks every ledger account with a bounded worker pool. For each
//! account delegated to this agent it reads the mirror, fetches quotes, asks
//! the decision engine for a move, and submits it under the account's
//! in-flight lease. Every submission leaves an audit trail in the record
//! store, and every failure is classified:
//!
//! | Class      | Retry | Mirror refresh | Breaker | Alert            |
//! |------------|-------|----------------|---------|------------------|
//! | Permission | no    | yes            | -       | principal        |
//! | Resource   | no    | -              | -       | principal        |
//! | Transient  | yes   | on revocation  | failure | principal (+ops) |
//!
//! The orchestrator is built once per process and driven through
//! [`Orchestrator::init`], [`Orchestrator::run_cycle`], and
//! [`Orchestrator::shutdown`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn, Instrument};

use vault_common::logging::{generate_span_id, generate_trace_id};
use vault_common::{AgentConfig, Config, PreferencesConfig};
use vault_ledger::{Address, ErrorClass, Ledger, LedgerError, MoveProof};

use crate::alerts::{Alert, AlertKind, AlertSink, Severity};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitBreakerState};
use crate::engine::{DecisionEngine, RebalanceProposal};
use crate::locks::InFlightRegistry;
use crate::mirror::PermissionMirror;
use crate::quotes::QuoteFetcher;
use crate::records::{NewRecord, RebalanceRecord, RecordOutcome, RecordStore};
use crate::retry::{retry_transient, RetryError, RetryPolicy};

// ============================================================================
// Reports
// ============================================================================

/// What happened to one account in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountOutcome {
    /// Not delegated to this agent; nothing recorded
    NotDelegated,
    /// No worthwhile move
    Skipped,
    /// Another submission holds the account's lease
    Busy,
    /// Breaker tripped before submission
    Halted,
    Confirmed { move_id: String },
    Failed { class: Option<ErrorClass>, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub account: Address,
    #[serde(flatten)]
    pub outcome: AccountOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The whole cycle was skipped by the breaker
    pub halted: bool,
    pub accounts: Vec<AccountReport>,
}

impl CycleReport {
    pub fn count(&self, matches: impl Fn(&AccountOutcome) -> bool) -> usize {
        self.accounts.iter().filter(|r| matches(&r.outcome)).count()
    }

    pub fn confirmed(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::Confirmed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::Failed { .. }))
    }

    pub fn outcome_for(&self, account: &Address) -> Option<&AccountOutcome> {
        self.accounts
            .iter()
            .find(|r| &r.account == account)
            .map(|r| &r.outcome)
    }
}

/// Result of crash recovery at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub confirmed: usize,
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.confirmed + self.failed
    }
}

/// Why a pending retry was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CancelReason {
    BreakerTripped,
    GrantRevoked,
    AccountUnreadable(String),
}

impl CancelReason {
    fn alert_kind(&self) -> AlertKind {
        match self {
            Self::BreakerTripped => AlertKind::SubmissionHalted,
            Self::GrantRevoked => AlertKind::PermissionRejected,
            Self::AccountUnreadable(_) => AlertKind::ResourceRejected,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakerTripped => f.write_str("circuit breaker tripped"),
            Self::GrantRevoked => f.write_str("agent grant revoked"),
            Self::AccountUnreadable(e) => write!(f, "account unreadable: {e}"),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    agent: Address,
    settings: AgentConfig,
    ledger: Arc<Ledger>,
    mirror: Arc<PermissionMirror>,
    engine: DecisionEngine,
    quotes: QuoteFetcher,
    breaker: CircuitBreaker,
    leases: InFlightRegistry,
    records: Arc<RecordStore>,
    alerts: Arc<dyn AlertSink>,
    retry: RetryPolicy,
    last_report: RwLock<Option<CycleReport>>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        ledger: Arc<Ledger>,
        mirror: Arc<PermissionMirror>,
        records: Arc<RecordStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let settings = config.agent.clone();
        Self {
            agent: Address::new(settings.address.clone()),
            engine: DecisionEngine::new(config.engine.clone()),
            quotes: QuoteFetcher::new(
                ledger.clone(),
                Duration::from_millis(settings.quote_timeout_ms),
            ),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from(&settings.breaker)),
            leases: InFlightRegistry::new(Duration::from_secs(settings.lease_timeout_secs)),
            retry: RetryPolicy::from(&settings.retry),
            settings,
            ledger,
            mirror,
            records,
            alerts,
            last_report: RwLock::new(None),
        }
    }

    pub fn agent(&self) -> &Address {
        &self.agent
    }

    pub fn leases(&self) -> &InFlightRegistry {
        &self.leases
    }

    pub fn mirror(&self) -> &Arc<PermissionMirror> {
        &self.mirror
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    fn preferences_for(&self, account: &Address) -> &PreferencesConfig {
        self.settings
            .account_preferences
            .get(account.as_str())
            .unwrap_or(&self.settings.preferences)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Restore breaker state and resolve submissions left dangling by a crash.
    ///
    /// Runs before any cycle, so no lease of this process can cover an
    /// unresolved submission: every one of them is recovered regardless of age.
    pub async fn init(&self) -> Result<RecoveryReport> {
        if let Some(state) = self.records.load_breaker_state()? {
            self.breaker.restore(state);
        }

        let unresolved = self.records.unresolved_submissions()?;
        let report = self.recover(unresolved).await?;

        info!(
            agent = %self.agent,
            breaker_tripped = self.breaker.is_tripped(),
            recovered_confirmed = report.confirmed,
            recovered_failed = report.failed,
            "Orchestrator initialized"
        );
        Ok(report)
    }

    /// Resolve submissions older than the lease timeout whose account holds
    /// no lease. These were orphaned by an exit path that skipped the
    /// terminal record.
    pub async fn sweep_dangling(&self) -> Result<RecoveryReport> {
        let lease_timeout = self.settings.lease_timeout_secs.min(u64::from(u32::MAX)) as i64;
        let cutoff = Utc::now() - chrono::Duration::seconds(lease_timeout);
        let stale: Vec<_> = self
            .records
            .dangling_submissions(cutoff)?
            .into_iter()
            .filter(|r| !self.leases.is_held(&r.account))
            .collect();
        self.recover(stale).await
    }

    async fn recover(&self, submissions: Vec<RebalanceRecord>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in submissions {
            let Some(proof) = record.proof() else {
                continue;
            };
            let (outcome, detail) = match self.ledger.proof_applied(&record.account, &proof).await {
                Ok(true) => (RecordOutcome::Confirmed, "recovered: proof applied by ledger"),
                Ok(false) => (RecordOutcome::Failed, "recovered: proof never applied"),
                Err(e) => {
                    warn!(account = %record.account, error = %e, "Recovery lookup failed");
                    (RecordOutcome::Failed, "recovered: account unreadable")
                }
            };
            self.records.append(NewRecord::resolved(
                &record.account,
                &proof,
                outcome,
                None,
                Some(detail.to_string()),
            ))?;
            match outcome {
                RecordOutcome::Confirmed => report.confirmed += 1,
                _ => report.failed += 1,
            }
            if let Err(e) = self.mirror.refresh(&record.account).await {
                warn!(account = %record.account, error = %e, "Mirror refresh after recovery failed");
            }
            info!(
                account = %record.account,
                proposal_id = %proof.proposal_id,
                outcome = outcome.to_db_string(),
                "Dangling submission resolved"
            );
        }
        Ok(report)
    }

    /// Flush breaker state.
    pub async fn shutdown(&self) -> Result<()> {
        self.records.save_breaker_state(&self.breaker.state())?;
        info!("Orchestrator shut down");
        Ok(())
    }

    /// Manually clear the breaker and persist the cleared state.
    pub fn clear_breaker(&self) -> Result<()> {
        self.breaker.clear();
        self.records.save_breaker_state(&self.breaker.state())?;
        Ok(())
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one rebalancing cycle over every ledger account.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = generate_trace_id();
        let span = tracing::info_span!("rebalance_cycle", cycle_id = %cycle_id);
        let report = self.run_cycle_inner(cycle_id).instrument(span).await;
        *self.last_report.write().await = Some(report.clone());
        report
    }

    async fn run_cycle_inner(&self, cycle_id: String) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport {
            cycle_id,
            started_at: Some(started_at),
            ..Default::default()
        };

        if self.breaker.is_tripped() {
            if self.breaker.take_alert() {
                let reason = self.breaker.state().reason.unwrap_or_default();
                self.alerts
                    .raise(Alert::operator(
                        Severity::Critical,
                        AlertKind::CycleHalted,
                        format!("rebalancing halted until the circuit breaker is cleared: {reason}"),
                    ))
                    .await;
            }
            warn!("Circuit breaker tripped, skipping cycle");
            report.halted = true;
            report.finished_at = Some(Utc::now());
            return report;
        }

        match self.sweep_dangling().await {
            Ok(swept) if swept.total() > 0 => {
                warn!(
                    confirmed = swept.confirmed,
                    failed = swept.failed,
                    "Resolved submissions orphaned past the lease timeout"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Dangling submission sweep failed"),
        }

        let accounts = self.ledger.accounts().await;
        info!(accounts = accounts.len(), "Rebalance cycle started");

        report.accounts = stream::iter(accounts)
            .map(|account| async move {
                let outcome = self.process_account(&account).await;
                AccountReport { account, outcome }
            })
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;
        report.accounts.sort_by(|a, b| a.account.cmp(&b.account));
        report.finished_at = Some(Utc::now());

        info!(
            confirmed = report.confirmed(),
            failed = report.failed(),
            elapsed_ms = (Utc::now() - started_at).num_milliseconds(),
            "Rebalance cycle finished"
        );
        report
    }

    /// Evaluate and, if worthwhile, execute a move for one account.
    pub async fn process_account(&self, account: &Address) -> AccountOutcome {
        let span = tracing::debug_span!("account_step", account = %account, span_id = %generate_span_id());
        match self.try_process_account(account).instrument(span).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(account = %account, error = %e, "Account processing failed");
                AccountOutcome::Failed {
                    class: None,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_process_account(&self, account: &Address) -> Result<AccountOutcome> {
        if self.breaker.is_tripped() {
            return Ok(AccountOutcome::Halted);
        }

        let snapshot = self.mirror.get_or_load(account).await?;
        if !snapshot.is_delegated_to(&self.agent) {
            debug!(account = %account, "Not delegated to this agent");
            return Ok(AccountOutcome::NotDelegated);
        }

        let quotes = self.quotes.fetch(&snapshot.allowlist).await;
        let proposal = self.engine.propose(
            account,
            &snapshot.balances,
            &snapshot.allowlist,
            &quotes,
            self.preferences_for(account),
        );
        let Some(proposal) = proposal else {
            self.records.append(NewRecord::skipped(
                account,
                format!("no worthwhile move across {} quotes", quotes.len()),
            ))?;
            return Ok(AccountOutcome::Skipped);
        };

        let Some(_lease) = self.leases.try_acquire(account) else {
            info!(account = %account, "Submission already in flight");
            return Ok(AccountOutcome::Busy);
        };
        // A submission that held the lease before us may have moved the account
        let current = self.mirror.snapshot(account).await.map(|s| s.sequence);
        if current.is_some_and(|sequence| sequence > snapshot.sequence) {
            info!(
                account = %account,
                observed = snapshot.sequence,
                current = ?current,
                "Account changed while proposing, deferring to next cycle"
            );
            return Ok(AccountOutcome::Busy);
        }

        let proof = MoveProof {
            proposal_id: proposal.id.clone(),
            observed_sequence: snapshot.sequence,
        };
        self.records.append(NewRecord::submitted(&proposal, &proof))?;
        info!(
            account = %account,
            proposal_id = %proposal.id,
            from = %proposal.from,
            to = %proposal.to,
            amount = %proposal.amount,
            net_delta_pct = proposal.net_delta_pct,
            "Submitting rebalance"
        );

        let result = self.submit(&proposal, &proof).await;
        self.resolve(&proposal, &proof, result).await
    }

    async fn submit(
        &self,
        proposal: &RebalanceProposal,
        proof: &MoveProof,
    ) -> std::result::Result<vault_ledger::MoveReceipt, RetryError<LedgerError, CancelReason>> {
        let ledger = &self.ledger;
        let breaker = &self.breaker;
        let agent = &self.agent;
        let account = &proposal.account;

        retry_transient(
            &self.retry,
            move |attempt| async move {
                if attempt > 1 {
                    debug!(account = %account, attempt, "Retrying rebalance");
                }
                ledger
                    .rebalance(agent, account, &proposal.from, &proposal.to, proposal.amount, proof)
                    .await
            },
            LedgerError::is_transient,
            move || async move {
                if breaker.is_tripped() {
                    return Some(CancelReason::BreakerTripped);
                }
                match ledger.get_agent(account).await {
                    Ok(current) if current.as_ref() == Some(agent) => None,
                    Ok(_) => Some(CancelReason::GrantRevoked),
                    Err(e) => Some(CancelReason::AccountUnreadable(e.to_string())),
                }
            },
        )
        .await
    }

    async fn resolve(
        &self,
        proposal: &RebalanceProposal,
        proof: &MoveProof,
        result: std::result::Result<vault_ledger::MoveReceipt, RetryError<LedgerError, CancelReason>>,
    ) -> Result<AccountOutcome> {
        let account = &proposal.account;

        let err = match result {
            Ok(receipt) => {
                self.records.append(NewRecord::resolved(
                    account,
                    proof,
                    RecordOutcome::Confirmed,
                    Some(receipt.move_id.clone()),
                    None,
                ))?;
                if let Err(e) = self.mirror.apply(&receipt.event).await {
                    warn!(account = %account, error = %e, "Mirror apply of receipt failed");
                }
                self.breaker.record_success();
                info!(account = %account, move_id = %receipt.move_id, "Rebalance confirmed");
                return Ok(AccountOutcome::Confirmed {
                    move_id: receipt.move_id,
                });
            }
            Err(err) => err,
        };

        let class = err.last_error().class();
        let (kind, reason) = match &err {
            RetryError::Fatal(e) => {
                if class == ErrorClass::Permission {
                    if let Err(refresh) = self.mirror.refresh(account).await {
                        warn!(account = %account, error = %refresh, "Mirror refresh failed");
                    }
                    (AlertKind::PermissionRejected, format!("ledger rejected move: {e}"))
                } else {
                    (AlertKind::ResourceRejected, format!("ledger rejected move: {e}"))
                }
            }
            RetryError::Cancelled { last, reason } => {
                if *reason != CancelReason::BreakerTripped {
                    if let Err(refresh) = self.mirror.refresh(account).await {
                        warn!(account = %account, error = %refresh, "Mirror refresh failed");
                    }
                }
                (
                    reason.alert_kind(),
                    format!("retry cancelled ({reason}) after: {last}"),
                )
            }
            RetryError::Exhausted { last, attempts } => {
                let reason = format!("gave up after {attempts} attempts: {last}");
                if self.breaker.record_failure(reason.clone()) {
                    self.on_breaker_trip().await;
                }
                (AlertKind::RetriesExhausted, reason)
            }
        };

        warn!(account = %account, class = ?class, reason = %reason, "Rebalance failed");
        self.records.append(NewRecord::resolved(
            account,
            proof,
            RecordOutcome::Failed,
            None,
            Some(reason.clone()),
        ))?;
        self.alerts
            .raise(Alert::principal(
                account,
                kind,
                format!(
                    "move of {} from {} to {} failed: {}",
                    proposal.amount, proposal.from, proposal.to, reason
                ),
            ))
            .await;

        Ok(AccountOutcome::Failed {
            class: Some(class),
            reason,
        })
    }

    async fn on_breaker_trip(&self) {
        let state = self.breaker.state();
        if let Err(e) = self.records.save_breaker_state(&state) {
            error!(error = %e, "Failed to persist breaker state");
        }
        self.alerts
            .raise(Alert::operator(
                Severity::Critical,
                AlertKind::BreakerTripped,
                format!(
                    "circuit breaker tripped, all submissions halted: {}",
                    state.reason.unwrap_or_default()
                ),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use vault_ledger::{SimulatedAdapter, Venue};

    const ALICE: &str = "alice";

    struct Harness {
        ledger: Arc<Ledger>,
        orchestrator: Orchestrator,
        alerts: Arc<MemoryAlertSink>,
        lend_a: Arc<SimulatedAdapter>,
    }

    async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    async fn harness_with(tune: impl FnOnce(&mut Config)) -> Harness {
        let mut config = Config::default();
        config.agent.retry.base_delay_ms = 1;
        config.agent.retry.max_delay_ms = 2;
        tune(&mut config);

        let ledger = Arc::new(Ledger::new(config.ledger.admin.as_str()));
        let admin = Address::new(config.ledger.admin.clone());
        let lend_a = Arc::new(SimulatedAdapter::with_rate("lend-a", 5.0));
        ledger.register_destination(&admin, lend_a.clone()).await.unwrap();

        let alice = Address::from(ALICE);
        ledger.deposit(&alice, 10_000).await.unwrap();
        ledger
            .set_agent(&alice, &alice, Some(Address::new(config.agent.address.clone())))
            .await
            .unwrap();
        ledger
            .set_allowlist(&alice, &alice, &"lend-a".into(), true)
            .await
            .unwrap();

        let alerts = Arc::new(MemoryAlertSink::new());
        let orchestrator = Orchestrator::new(
            &config,
            ledger.clone(),
            Arc::new(PermissionMirror::new(ledger.clone())),
            Arc::new(RecordStore::in_memory().unwrap()),
            alerts.clone(),
        );
        Harness {
            ledger,
            orchestrator,
            alerts,
            lend_a,
        }
    }

    #[tokio::test]
    async fn test_idle_pool_moves_to_best_destination() {
        let h = harness().await;
        let alice = Address::from(ALICE);

        let report = h.orchestrator.run_cycle().await;
        assert!(matches!(
            report.outcome_for(&alice),
            Some(AccountOutcome::Confirmed { .. })
        ));
        assert_eq!(h.lend_a.held().await, 10_000);

        let records = h.orchestrator.records().records_for(&alice).unwrap();
        let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![RecordOutcome::Submitted, RecordOutcome::Confirmed]);
        assert!(records[1].external_reference.is_some());

        // Mirror reflects the receipt without waiting for a listener
        let mirrored = h.orchestrator.mirror().snapshot(&alice).await.unwrap();
        assert_eq!(mirrored.balances.at(&Venue::Destination("lend-a".into())), 10_000);
        assert_eq!(h.orchestrator.leases().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_second_cycle_skips() {
        let h = harness().await;
        let alice = Address::from(ALICE);
        h.orchestrator.run_cycle().await;

        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.outcome_for(&alice), Some(&AccountOutcome::Skipped));
        let last = h.orchestrator.records().records_for(&alice).unwrap();
        assert_eq!(last.last().unwrap().outcome, RecordOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_resource_failure_not_retried() {
        let h = harness().await;
        h.lend_a
            .inject_failures(
                vault_ledger::AdapterOp::Deposit,
                vault_ledger::AdapterError::Rejected("paused".into()),
                5,
            )
            .await;

        let report = h.orchestrator.run_cycle().await;
        match report.outcome_for(&Address::from(ALICE)) {
            Some(AccountOutcome::Failed { class, .. }) => {
                assert_eq!(*class, Some(ErrorClass::Resource))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(h.alerts.count(AlertKind::ResourceRejected).await, 1);
        assert_eq!(h.orchestrator.breaker_stats().samples, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_confirmed() {
        let h = harness().await;
        h.lend_a
            .inject_failures(
                vault_ledger::AdapterOp::Deposit,
                vault_ledger::AdapterError::Timeout,
                2,
            )
            .await;

        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.confirmed(), 1);
        assert_eq!(h.ledger.get_balances(&Address::from(ALICE)).await.unwrap().pool, 0);
    }

    #[tokio::test]
    async fn test_breaker_trip_cancels_pending_retry() {
        let h = harness_with(|config| {
            config.agent.retry.base_delay_ms = 300;
            config.agent.retry.max_delay_ms = 300;
            config.agent.retry.jitter = 0.0;
            config.agent.breaker.min_samples = 1;
        })
        .await;
        h.lend_a
            .inject_failures(
                vault_ledger::AdapterOp::Deposit,
                vault_ledger::AdapterError::Timeout,
                1,
            )
            .await;

        let (report, tripped) = tokio::join!(h.orchestrator.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.orchestrator.breaker.record_failure("venue outage")
        });
        assert!(tripped);

        match report.outcome_for(&Address::from(ALICE)) {
            Some(AccountOutcome::Failed { class, reason }) => {
                assert_eq!(*class, Some(ErrorClass::Transient));
                assert!(reason.contains("circuit breaker tripped"), "{reason}");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(h.lend_a.deposit_count().await, 0);
        assert_eq!(h.alerts.count(AlertKind::SubmissionHalted).await, 1);
        assert_eq!(h.alerts.count(AlertKind::PermissionRejected).await, 0);
        // Only the sample that tripped it
        assert_eq!(h.orchestrator.breaker_stats().samples, 1);
    }

    #[tokio::test]
    async fn test_shutdown_persists_breaker() {
        let h = harness().await;
        h.orchestrator.breaker.record_failure("x");
        h.orchestrator.shutdown().await.unwrap();
        let saved = h.orchestrator.records().load_breaker_state().unwrap().unwrap();
        assert_eq!(saved, h.orchestrator.breaker_state());
    }
}
