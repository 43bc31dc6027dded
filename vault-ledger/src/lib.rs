//! Vault Ledger Library
//!
//! The authoritative record of delegated funds. Principals deposit into a
//! pool, grant a single delegate, and allowlist destinations; the delegate
//! may only move funds between the pool and allowlisted, registered
//! destinations.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       vault-ledger                        │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐   │
//! │  │   Accounts   │  │   Protocol   │  │  Event Log +   │   │
//! │  │ (per-account │  │   Registry   │  │   Broadcast    │   │
//! │  │    mutex)    │  │  (adapters)  │  │                │   │
//! │  └──────────────┘  └──────────────┘  └────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Only the current delegate may `rebalance`, and only between venues
//!   allowlisted at the moment of application.
//! - A destination holding funds cannot be removed from the allowlist.
//! - Each move proof is applied at most once per account.
//! - A move whose target deposit fails is compensated at the source and
//!   leaves ledger state unchanged.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod adapter;
pub mod allowlist;
pub mod error;
pub mod event;
pub mod ledger;
pub mod registry;
pub mod types;

pub use adapter::{AdapterError, AdapterOp, DestinationAdapter, RateReading, SimulatedAdapter};
pub use allowlist::IndexedSet;
pub use error::{ErrorClass, LedgerError};
pub use event::{EventLog, LedgerChange, LedgerEvent};
pub use ledger::{Ledger, LedgerOptions, MoveReceipt};
pub use registry::ProtocolRegistry;
pub use types::{AccountSnapshot, Address, Amount, Balances, DestinationId, MoveProof, Venue};
