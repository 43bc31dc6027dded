//! Ledger change notifications.
//!
//! Every mutation produces one [`LedgerEvent`] with a per-account sequence
//! number starting at 1. Events serialize as
//! `{type, account, payload, sequence, timestamp}`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::error::LedgerError;
use crate::types::{AccountSnapshot, Address, Amount, DestinationId, Venue};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LedgerChange {
    Deposited {
        amount: Amount,
        balance: Amount,
    },
    Withdrawn {
        amount: Amount,
        balance: Amount,
    },
    AgentSet {
        agent: Option<Address>,
    },
    AllowlistSet {
        destination: DestinationId,
        enabled: bool,
    },
    Rebalanced {
        move_id: String,
        from: Venue,
        to: Venue,
        amount: Amount,
        proof_id: String,
    },
}

impl LedgerChange {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "deposited",
            Self::Withdrawn { .. } => "withdrawn",
            Self::AgentSet { .. } => "agent_set",
            Self::AllowlistSet { .. } => "allowlist_set",
            Self::Rebalanced { .. } => "rebalanced",
        }
    }

    /// Whether this change touches delegation or allowlist state.
    pub fn is_permission_change(&self) -> bool {
        matches!(self, Self::AgentSet { .. } | Self::AllowlistSet { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEvent {
    pub account: Address,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub change: LedgerChange,
}

impl LedgerEvent {
    /// Fold this event into a snapshot of the same account.
    ///
    /// The caller is responsible for sequence continuity.
    pub fn apply_to(&self, snapshot: &mut AccountSnapshot) {
        match &self.change {
            LedgerChange::Deposited { balance, .. } | LedgerChange::Withdrawn { balance, .. } => {
                snapshot.balances.pool = *balance;
            }
            LedgerChange::AgentSet { agent } => {
                snapshot.agent = agent.clone();
            }
            LedgerChange::AllowlistSet {
                destination,
                enabled,
            } => {
                let slot = snapshot.allowlist.iter().position(|d| d == destination);
                match (slot, enabled) {
                    (None, true) => snapshot.allowlist.push(destination.clone()),
                    (Some(slot), false) => {
                        snapshot.allowlist.swap_remove(slot);
                    }
                    _ => {}
                }
            }
            LedgerChange::Rebalanced {
                from, to, amount, ..
            } => {
                if snapshot.balances.transfer(from, to, *amount).is_none() {
                    tracing::warn!(
                        account = %snapshot.account,
                        sequence = self.sequence,
                        "Rebalance overflows snapshot balances, snapshot has diverged"
                    );
                }
            }
        }
        snapshot.sequence = self.sequence;
    }
}

// ============================================================================
// Event Log
// ============================================================================

/// Bounded per-account event history used to resume lagging subscribers.
#[derive(Debug, Clone)]
pub struct EventLog {
    retention: usize,
    last_sequence: u64,
    events: VecDeque<LedgerEvent>,
}

impl EventLog {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            last_sequence: 0,
            events: VecDeque::new(),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Stamp `change` with the next sequence and retain it.
    pub fn record(&mut self, account: &Address, change: LedgerChange) -> LedgerEvent {
        self.last_sequence += 1;
        let event = LedgerEvent {
            account: account.clone(),
            sequence: self.last_sequence,
            timestamp: Utc::now(),
            change,
        };
        if self.events.len() == self.retention {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    /// Events with a sequence greater than `after`, oldest first.
    pub fn since(&self, account: &Address, after: u64) -> Result<Vec<LedgerEvent>, LedgerError> {
        if after >= self.last_sequence {
            return Ok(Vec::new());
        }
        let oldest = self
            .events
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.last_sequence + 1);
        if after + 1 < oldest {
            return Err(LedgerError::EventsPruned {
                account: account.clone(),
                after,
            });
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Balances;

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            account: "alice".into(),
            agent: None,
            allowlist: vec![],
            balances: Balances::default(),
            sequence: 0,
        }
    }

    #[test]
    fn test_sequences_start_at_one() {
        let mut log = EventLog::new(8);
        let account = Address::from("alice");
        let first = log.record(
            &account,
            LedgerChange::Deposited {
                amount: 10,
                balance: 10,
            },
        );
        assert_eq!(first.sequence, 1);
        assert_eq!(log.last_sequence(), 1);
    }

    #[test]
    fn test_since_detects_pruned_history() {
        let mut log = EventLog::new(2);
        let account = Address::from("alice");
        for i in 1..=4 {
            log.record(
                &account,
                LedgerChange::Deposited {
                    amount: 1,
                    balance: i,
                },
            );
        }

        let tail = log.since(&account, 2).unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
        assert!(log.since(&account, 4).unwrap().is_empty());
        assert!(matches!(
            log.since(&account, 1),
            Err(LedgerError::EventsPruned { after: 1, .. })
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let mut log = EventLog::new(4);
        let event = log.record(
            &Address::from("alice"),
            LedgerChange::AllowlistSet {
                destination: "lend-a".into(),
                enabled: true,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "allowlist_set");
        assert_eq!(json["account"], "alice");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["payload"]["destination"], "lend-a");
        assert_eq!(json["payload"]["enabled"], true);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_apply_to_snapshot() {
        let mut snap = snapshot();
        let mut log = EventLog::new(8);
        let account = Address::from("alice");

        let events = vec![
            log.record(
                &account,
                LedgerChange::Deposited {
                    amount: 100,
                    balance: 100,
                },
            ),
            log.record(
                &account,
                LedgerChange::AgentSet {
                    agent: Some("bot".into()),
                },
            ),
            log.record(
                &account,
                LedgerChange::AllowlistSet {
                    destination: "lend-a".into(),
                    enabled: true,
                },
            ),
            log.record(
                &account,
                LedgerChange::Rebalanced {
                    move_id: "m1".into(),
                    from: Venue::Pool,
                    to: Venue::Destination("lend-a".into()),
                    amount: 60,
                    proof_id: "p@3".into(),
                },
            ),
        ];
        for event in &events {
            event.apply_to(&mut snap);
        }

        assert_eq!(snap.sequence, 4);
        assert_eq!(snap.agent, Some(Address::from("bot")));
        assert!(snap.is_allowlisted(&"lend-a".into()));
        assert_eq!(snap.balances.pool, 40);
        assert_eq!(snap.balances.at(&Venue::Destination("lend-a".into())), 60);
    }
}
