//! Identifiers and value types shared by the ledger surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Amount of the base asset in minor units.
pub type Amount = i128;

/// A principal, delegate, or administrator address.
///
/// Accounts are keyed by their principal's address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a yield-bearing destination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Where funds sit: the ledger's own pool or an external destination.
///
/// Ordered with `Pool` first, then destinations by identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Pool,
    Destination(DestinationId),
}

impl Venue {
    pub fn destination(&self) -> Option<&DestinationId> {
        match self {
            Self::Pool => None,
            Self::Destination(id) => Some(id),
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => f.write_str("pool"),
            Self::Destination(id) => write!(f, "{id}"),
        }
    }
}

impl From<DestinationId> for Venue {
    fn from(id: DestinationId) -> Self {
        Self::Destination(id)
    }
}

/// Pool balance and per-destination positions of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Idle funds held by the ledger itself
    pub pool: Amount,
    /// Nonzero positions keyed by destination
    pub positions: BTreeMap<DestinationId, Amount>,
}

impl Balances {
    /// Amount held at a venue.
    pub fn at(&self, venue: &Venue) -> Amount {
        match venue {
            Venue::Pool => self.pool,
            Venue::Destination(id) => self.positions.get(id).copied().unwrap_or(0),
        }
    }

    /// Every nonzero holding in `Venue` order.
    pub fn holdings(&self) -> Vec<(Venue, Amount)> {
        let mut holdings = Vec::with_capacity(self.positions.len() + 1);
        if self.pool > 0 {
            holdings.push((Venue::Pool, self.pool));
        }
        holdings.extend(
            self.positions
                .iter()
                .filter(|(_, amount)| **amount > 0)
                .map(|(id, amount)| (Venue::Destination(id.clone()), *amount)),
        );
        holdings
    }

    /// Total funds across the pool and all destinations, saturating at
    /// `Amount::MAX`.
    pub fn total(&self) -> Amount {
        self.positions
            .values()
            .fold(self.pool, |total, amount| total.saturating_add(*amount))
    }

    /// Move `amount` between venues, dropping emptied positions.
    ///
    /// Callers validate sufficiency first. Returns `None` and leaves the
    /// balances untouched if the target would overflow.
    pub fn transfer(&mut self, from: &Venue, to: &Venue, amount: Amount) -> Option<()> {
        let credited = self.at(to).checked_add(amount)?;
        let debited = self.at(from) - amount;
        self.set(from, debited);
        self.set(to, credited);
        Some(())
    }

    /// The balance at `venue` after crediting `amount`, if it fits.
    pub fn credited(&self, venue: &Venue, amount: Amount) -> Option<Amount> {
        self.at(venue).checked_add(amount)
    }

    fn set(&mut self, venue: &Venue, value: Amount) {
        match venue {
            Venue::Pool => self.pool = value,
            Venue::Destination(id) if value == 0 => {
                self.positions.remove(id);
            }
            Venue::Destination(id) => {
                self.positions.insert(id.clone(), value);
            }
        }
    }
}

/// Full read of one account at a given event sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account: Address,
    pub agent: Option<Address>,
    /// Allowlisted destinations in enumeration order
    pub allowlist: Vec<DestinationId>,
    pub balances: Balances,
    /// Sequence of the last event applied to this account
    pub sequence: u64,
}

impl AccountSnapshot {
    pub fn is_allowlisted(&self, id: &DestinationId) -> bool {
        self.allowlist.contains(id)
    }

    pub fn is_delegated_to(&self, agent: &Address) -> bool {
        self.agent.as_ref() == Some(agent)
    }
}

/// Proof attached to a rebalance submission.
///
/// The ledger applies each proof key at most once per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveProof {
    /// Digest of the proposal being executed
    pub proposal_id: String,
    /// Account sequence the proposer observed when building the move
    pub observed_sequence: u64,
}

impl MoveProof {
    pub fn key(&self) -> String {
        format!("{}@{}", self.proposal_id, self.observed_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_ordering_puts_pool_first() {
        let mut venues = vec![
            Venue::Destination("zeta".into()),
            Venue::Destination("alpha".into()),
            Venue::Pool,
        ];
        venues.sort();
        assert_eq!(venues[0], Venue::Pool);
        assert_eq!(venues[1], Venue::Destination("alpha".into()));
    }

    #[test]
    fn test_transfer_drops_empty_positions() {
        let mut balances = Balances {
            pool: 500,
            ..Default::default()
        };
        let dest = Venue::Destination("lend-a".into());

        balances.transfer(&Venue::Pool, &dest, 500).unwrap();
        assert_eq!(balances.pool, 0);
        assert_eq!(balances.at(&dest), 500);

        balances.transfer(&dest, &Venue::Pool, 500).unwrap();
        assert!(balances.positions.is_empty());
        assert_eq!(balances.total(), 500);
    }

    #[test]
    fn test_transfer_refuses_overflowing_target() {
        let dest = Venue::Destination("lend-a".into());
        let mut balances = Balances {
            pool: 10,
            ..Default::default()
        };
        balances.positions.insert("lend-a".into(), Amount::MAX);
        let before = balances.clone();

        assert_eq!(balances.transfer(&Venue::Pool, &dest, 10), None);
        assert_eq!(balances, before);
        assert_eq!(balances.credited(&Venue::Pool, Amount::MAX - 10), Some(Amount::MAX));
        assert_eq!(balances.credited(&Venue::Pool, Amount::MAX), None);
    }

    #[test]
    fn test_holdings_skip_zero_pool() {
        let mut balances = Balances::default();
        balances.positions.insert("b".into(), 10);
        balances.positions.insert("a".into(), 20);
        let holdings = balances.holdings();
        assert_eq!(holdings.len(), 2);
        assert_eq!(holdings[0].0, Venue::Destination("a".into()));
    }

    #[test]
    fn test_venue_serializes_snake_case() {
        let json = serde_json::to_string(&Venue::Destination("lend-a".into())).unwrap();
        assert_eq!(json, r#"{"destination":"lend-a"}"#);
        assert_eq!(serde_json::to_string(&Venue::Pool).unwrap(), r#""pool""#);
    }

    #[test]
    fn test_proof_key_includes_sequence() {
        let proof = MoveProof {
            proposal_id: "abc".into(),
            observed_sequence: 7,
        };
        assert_eq!(proof.key(), "abc@7");
    }
}
