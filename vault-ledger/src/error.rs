//! Ledger rejection reasons.

use serde::Serialize;
use thiserror::Error;

use crate::adapter::AdapterError;
use crate::types::{Address, DestinationId, Venue};

/// How a caller should react to a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Authorization or allowlist problem; never retried, mirror is stale
    Permission,
    /// Bad request or insufficient state; never retried
    Resource,
    /// Destination hiccup; retried with backoff
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("{caller} is not authorized for this operation")]
    NotAuthorized { caller: Address },

    #[error("destination {0} is not on the account allowlist")]
    DestinationNotApproved(DestinationId),

    #[error("destination {0} is not registered")]
    DestinationNotRegistered(DestinationId),

    #[error("destination {0} still holds funds")]
    DestinationInUse(DestinationId),

    #[error("destination {0} is already registered")]
    AlreadyRegistered(DestinationId),

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: i128, available: i128 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i128),

    #[error("crediting {amount} to {venue} would overflow its balance")]
    BalanceOverflow { venue: Venue, amount: i128 },

    #[error("source and target venue are the same")]
    SameVenue,

    #[error("move proof {0} was already applied")]
    DuplicateProof(String),

    #[error("unknown account {0}")]
    UnknownAccount(Address),

    #[error("events after sequence {after} for {account} are no longer retained")]
    EventsPruned { account: Address, after: u64 },

    #[error("adapter failure: {0}")]
    Adapter(#[from] AdapterError),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotAuthorized { .. }
            | Self::DestinationNotApproved(_)
            | Self::DestinationNotRegistered(_)
            | Self::DestinationInUse(_) => ErrorClass::Permission,
            Self::Adapter(e) if e.is_transient() => ErrorClass::Transient,
            _ => ErrorClass::Resource,
        }
    }

    pub fn is_permission(&self) -> bool {
        self.class() == ErrorClass::Permission
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            LedgerError::NotAuthorized {
                caller: "mallory".into()
            }
            .class(),
            ErrorClass::Permission
        );
        assert_eq!(
            LedgerError::DestinationInUse("lend-a".into()).class(),
            ErrorClass::Permission
        );
        assert_eq!(
            LedgerError::InsufficientFunds {
                requested: 10,
                available: 5
            }
            .class(),
            ErrorClass::Resource
        );
        assert_eq!(
            LedgerError::DuplicateProof("p@1".into()).class(),
            ErrorClass::Resource
        );
        assert_eq!(
            LedgerError::BalanceOverflow {
                venue: Venue::Pool,
                amount: 1
            }
            .class(),
            ErrorClass::Resource
        );
        assert_eq!(
            LedgerError::Adapter(AdapterError::Timeout).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            LedgerError::Adapter(AdapterError::Rejected("paused".into())).class(),
            ErrorClass::Resource
        );
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::InsufficientFunds {
            requested: 10,
            available: 5,
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds: requested 10, available 5"
        );
    }
}
