//! Vault Common - Shared types, utilities, and configuration for the delegated yield vault.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Control surface error type
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    AgentConfig, BreakerConfig, Config, CostConfig, DestinationConfig, EngineConfig, LedgerConfig,
    ObservabilityConfig, PreferencesConfig, RetryConfig, RiskTier,
};
pub use error::Error;
pub use validation::{Validate, ValidationError, ValidationResult};
