//! Authoritative account ledger.
//!
//! The ledger owns balances, agent grants, allowlists, and the protocol
//! registry. Every operation either applies fully or leaves state unchanged.
//!
//! # Locking
//!
//! Mutations are serialized per account by an async mutex. Operations that
//! consult the registry take the registry lock before the account lock, so
//! admin changes and rebalances never deadlock. Events are sequenced and
//! published while the account lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::adapter::DestinationAdapter;
use crate::allowlist::IndexedSet;
use crate::error::LedgerError;
use crate::event::{EventLog, LedgerChange, LedgerEvent};
use crate::registry::ProtocolRegistry;
use crate::types::{AccountSnapshot, Address, Amount, Balances, DestinationId, MoveProof, Venue};

/// Ledger tuning knobs.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Events retained per account for resume
    pub event_retention: usize,
    /// Capacity of the broadcast channel
    pub notification_buffer: usize,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            event_retention: 1024,
            notification_buffer: 256,
        }
    }
}

/// Result of a successful `rebalance`.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveReceipt {
    pub move_id: String,
    pub account: Address,
    pub from: Venue,
    pub to: Venue,
    pub amount: Amount,
    pub event: LedgerEvent,
}

#[derive(Debug)]
struct AccountState {
    balances: Balances,
    agent: Option<Address>,
    allowlist: IndexedSet<DestinationId>,
    applied_proofs: HashSet<String>,
    log: EventLog,
}

impl AccountState {
    fn new(retention: usize) -> Self {
        Self {
            balances: Balances::default(),
            agent: None,
            allowlist: IndexedSet::new(),
            applied_proofs: HashSet::new(),
            log: EventLog::new(retention),
        }
    }

    fn snapshot(&self, account: &Address) -> AccountSnapshot {
        AccountSnapshot {
            account: account.clone(),
            agent: self.agent.clone(),
            allowlist: self.allowlist.to_vec(),
            balances: self.balances.clone(),
            sequence: self.log.last_sequence(),
        }
    }
}

pub struct Ledger {
    admin: Address,
    options: LedgerOptions,
    registry: RwLock<ProtocolRegistry>,
    accounts: RwLock<HashMap<Address, Arc<Mutex<AccountState>>>>,
    notifier: broadcast::Sender<LedgerEvent>,
}

impl Ledger {
    pub fn new(admin: impl Into<Address>) -> Self {
        Self::with_options(admin, LedgerOptions::default())
    }

    pub fn with_options(admin: impl Into<Address>, options: LedgerOptions) -> Self {
        let (notifier, _) = broadcast::channel(options.notification_buffer.max(1));
        Self {
            admin: admin.into(),
            options,
            registry: RwLock::new(ProtocolRegistry::new()),
            accounts: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub fn admin(&self) -> &Address {
        &self.admin
    }

    /// Subscribe to change notifications for every account.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.notifier.subscribe()
    }

    async fn account(&self, account: &Address) -> Result<Arc<Mutex<AccountState>>, LedgerError> {
        self.accounts
            .read()
            .await
            .get(account)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAccount(account.clone()))
    }

    fn emit(&self, account: &Address, state: &mut AccountState, change: LedgerChange) -> LedgerEvent {
        let event = state.log.record(account, change);
        debug!(
            account = %account,
            sequence = event.sequence,
            kind = event.change.kind(),
            "Ledger event"
        );
        // No subscribers is fine
        let _ = self.notifier.send(event.clone());
        event
    }

    fn require_principal(caller: &Address, account: &Address) -> Result<(), LedgerError> {
        if caller != account {
            return Err(LedgerError::NotAuthorized {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    fn require_positive(amount: Amount) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(())
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn register_destination(
        &self,
        caller: &Address,
        adapter: Arc<dyn DestinationAdapter>,
    ) -> Result<(), LedgerError> {
        if caller != &self.admin {
            return Err(LedgerError::NotAuthorized {
                caller: caller.clone(),
            });
        }
        let id = adapter.id().clone();
        if !self.registry.write().await.register(adapter) {
            return Err(LedgerError::AlreadyRegistered(id));
        }
        info!(destination = %id, "Destination registered");
        Ok(())
    }

    pub async fn deregister_destination(
        &self,
        caller: &Address,
        id: &DestinationId,
    ) -> Result<(), LedgerError> {
        if caller != &self.admin {
            return Err(LedgerError::NotAuthorized {
                caller: caller.clone(),
            });
        }

        let mut registry = self.registry.write().await;
        if !registry.contains(id) {
            return Err(LedgerError::DestinationNotRegistered(id.clone()));
        }

        let accounts: Vec<_> = self.accounts.read().await.values().cloned().collect();
        for state in accounts {
            if state.lock().await.balances.positions.get(id).copied().unwrap_or(0) > 0 {
                return Err(LedgerError::DestinationInUse(id.clone()));
            }
        }

        registry.deregister(id);
        info!(destination = %id, "Destination deregistered");
        Ok(())
    }

    pub async fn registered_destinations(&self) -> Vec<DestinationId> {
        self.registry.read().await.ids()
    }

    pub async fn adapter(&self, id: &DestinationId) -> Option<Arc<dyn DestinationAdapter>> {
        self.registry.read().await.get(id)
    }

    // ========================================================================
    // Principal Operations
    // ========================================================================

    /// Credit the pool balance, opening the account on first deposit.
    pub async fn deposit(&self, account: &Address, amount: Amount) -> Result<LedgerEvent, LedgerError> {
        Self::require_positive(amount)?;

        let state = {
            let mut accounts = self.accounts.write().await;
            accounts
                .entry(account.clone())
                .or_insert_with(|| {
                    info!(account = %account, "Account opened");
                    Arc::new(Mutex::new(AccountState::new(self.options.event_retention)))
                })
                .clone()
        };

        let mut state = state.lock().await;
        let balance = state
            .balances
            .credited(&Venue::Pool, amount)
            .ok_or(LedgerError::BalanceOverflow {
                venue: Venue::Pool,
                amount,
            })?;
        state.balances.pool = balance;
        Ok(self.emit(account, &mut state, LedgerChange::Deposited { amount, balance }))
    }

    /// Debit the pool balance. Only the principal may withdraw.
    pub async fn withdraw(
        &self,
        caller: &Address,
        account: &Address,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        Self::require_principal(caller, account)?;
        Self::require_positive(amount)?;

        let state = self.account(account).await?;
        let mut state = state.lock().await;
        if amount > state.balances.pool {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available: state.balances.pool,
            });
        }
        state.balances.pool -= amount;
        let balance = state.balances.pool;
        Ok(self.emit(account, &mut state, LedgerChange::Withdrawn { amount, balance }))
    }

    /// Replace the delegate grant. `None` revokes.
    pub async fn set_agent(
        &self,
        caller: &Address,
        account: &Address,
        agent: Option<Address>,
    ) -> Result<LedgerEvent, LedgerError> {
        Self::require_principal(caller, account)?;

        let state = self.account(account).await?;
        let mut state = state.lock().await;
        state.agent = agent.clone();
        match &agent {
            Some(agent) => info!(account = %account, agent = %agent, "Agent granted"),
            None => info!(account = %account, "Agent revoked"),
        }
        Ok(self.emit(account, &mut state, LedgerChange::AgentSet { agent }))
    }

    /// Enable or disable one destination. No-ops succeed without an event.
    pub async fn set_allowlist(
        &self,
        caller: &Address,
        account: &Address,
        destination: &DestinationId,
        enabled: bool,
    ) -> Result<Option<LedgerEvent>, LedgerError> {
        let mut events = self
            .set_allowlist_batch(caller, account, &[(destination.clone(), enabled)])
            .await?;
        Ok(events.pop())
    }

    /// Apply several allowlist changes atomically.
    ///
    /// Every entry is validated before any is applied; each effective change
    /// emits its own event.
    pub async fn set_allowlist_batch(
        &self,
        caller: &Address,
        account: &Address,
        entries: &[(DestinationId, bool)],
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        Self::require_principal(caller, account)?;

        let registry = self.registry.read().await;
        let state = self.account(account).await?;
        let mut state = state.lock().await;

        // Validate against a scratch copy so later entries see earlier ones
        let mut scratch = state.allowlist.clone();
        let mut changes = Vec::new();
        for (destination, enabled) in entries {
            if *enabled {
                if !registry.contains(destination) {
                    return Err(LedgerError::DestinationNotRegistered(destination.clone()));
                }
                if scratch.insert(destination.clone()) {
                    changes.push((destination.clone(), true));
                }
            } else {
                if scratch.contains(destination)
                    && state.balances.positions.get(destination).copied().unwrap_or(0) > 0
                {
                    return Err(LedgerError::DestinationInUse(destination.clone()));
                }
                if scratch.remove(destination) {
                    changes.push((destination.clone(), false));
                }
            }
        }

        let mut events = Vec::with_capacity(changes.len());
        for (destination, enabled) in changes {
            if enabled {
                state.allowlist.insert(destination.clone());
            } else {
                state.allowlist.remove(&destination);
            }
            info!(account = %account, destination = %destination, enabled, "Allowlist updated");
            events.push(self.emit(
                account,
                &mut state,
                LedgerChange::AllowlistSet {
                    destination,
                    enabled,
                },
            ));
        }
        Ok(events)
    }

    // ========================================================================
    // Delegate Operations
    // ========================================================================

    /// Move funds between venues on behalf of the principal.
    ///
    /// Authorization and allowlist membership are checked against state at
    /// the moment of application, under the account lock.
    pub async fn rebalance(
        &self,
        caller: &Address,
        account: &Address,
        from: &Venue,
        to: &Venue,
        amount: Amount,
        proof: &MoveProof,
    ) -> Result<MoveReceipt, LedgerError> {
        let registry = self.registry.read().await;
        let state = self.account(account).await?;
        let mut state = state.lock().await;

        if state.agent.as_ref() != Some(caller) {
            warn!(account = %account, caller = %caller, "Rebalance by non-agent rejected");
            return Err(LedgerError::NotAuthorized {
                caller: caller.clone(),
            });
        }

        let venues = [from, to];
        for id in venues.iter().filter_map(|v| v.destination()) {
            if !state.allowlist.contains(id) {
                return Err(LedgerError::DestinationNotApproved(id.clone()));
            }
        }
        let mut adapters = Vec::with_capacity(2);
        for venue in venues {
            let adapter = match venue.destination() {
                Some(id) => Some(
                    registry
                        .get(id)
                        .ok_or_else(|| LedgerError::DestinationNotRegistered(id.clone()))?,
                ),
                None => None,
            };
            adapters.push(adapter);
        }
        let (source, target) = (adapters[0].clone(), adapters[1].clone());

        Self::require_positive(amount)?;
        if from == to {
            return Err(LedgerError::SameVenue);
        }

        let proof_id = proof.key();
        if state.applied_proofs.contains(&proof_id) {
            return Err(LedgerError::DuplicateProof(proof_id));
        }

        let available = state.balances.at(from);
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        if state.balances.credited(to, amount).is_none() {
            return Err(LedgerError::BalanceOverflow {
                venue: to.clone(),
                amount,
            });
        }

        if let Some(source) = &source {
            source.withdraw(amount).await?;
        }
        if let Some(target) = &target {
            if let Err(e) = target.deposit(amount).await {
                warn!(account = %account, to = %to, error = %e, "Target deposit failed, restoring source");
                if let Some(source) = &source {
                    if let Err(restore) = source.deposit(amount).await {
                        error!(
                            account = %account,
                            from = %from,
                            amount = %amount,
                            error = %restore,
                            "Compensating deposit failed"
                        );
                    }
                }
                return Err(e.into());
            }
        }

        // Overflow was ruled out above under the same lock
        let _ = state.balances.transfer(from, to, amount);
        state.applied_proofs.insert(proof_id.clone());
        let move_id = uuid::Uuid::new_v4().to_string();
        info!(
            account = %account,
            move_id = %move_id,
            from = %from,
            to = %to,
            amount = %amount,
            "Rebalance applied"
        );
        let event = self.emit(
            account,
            &mut state,
            LedgerChange::Rebalanced {
                move_id: move_id.clone(),
                from: from.clone(),
                to: to.clone(),
                amount,
                proof_id,
            },
        );

        Ok(MoveReceipt {
            move_id,
            account: account.clone(),
            from: from.clone(),
            to: to.clone(),
            amount,
            event,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Known accounts in address order.
    pub async fn accounts(&self) -> Vec<Address> {
        let mut accounts: Vec<_> = self.accounts.read().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub async fn snapshot(&self, account: &Address) -> Result<AccountSnapshot, LedgerError> {
        let state = self.account(account).await?;
        let state = state.lock().await;
        Ok(state.snapshot(account))
    }

    pub async fn get_allowlist(&self, account: &Address) -> Result<Vec<DestinationId>, LedgerError> {
        let state = self.account(account).await?;
        let allowlist = state.lock().await.allowlist.to_vec();
        Ok(allowlist)
    }

    pub async fn get_agent(&self, account: &Address) -> Result<Option<Address>, LedgerError> {
        let state = self.account(account).await?;
        let agent = state.lock().await.agent.clone();
        Ok(agent)
    }

    pub async fn get_balances(&self, account: &Address) -> Result<Balances, LedgerError> {
        let state = self.account(account).await?;
        let balances = state.lock().await.balances.clone();
        Ok(balances)
    }

    /// Whether a proof has already been applied to the account.
    pub async fn proof_applied(&self, account: &Address, proof: &MoveProof) -> Result<bool, LedgerError> {
        let state = self.account(account).await?;
        let applied = state.lock().await.applied_proofs.contains(&proof.key());
        Ok(applied)
    }

    /// Retained events after `after`, for resuming a lagging subscriber.
    pub async fn events_since(&self, account: &Address, after: u64) -> Result<Vec<LedgerEvent>, LedgerError> {
        let state = self.account(account).await?;
        let state = state.lock().await;
        state.log.since(account, after)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("admin", &self.admin)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
