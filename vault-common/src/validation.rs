//! Configuration validation.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use std::str::FromStr;
use thiserror::Error;

use crate::config::{AgentConfig, Config, EngineConfig, LedgerConfig, ObservabilityConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn require_fraction(field: &str, value: f64) -> ValidationResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("{value} is not within [0, 1]")));
    }
    Ok(())
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.ledger.validate() {
            errors.push(e);
        }
        if let Err(e) = self.agent.validate() {
            errors.push(e);
        }
        if let Err(e) = self.engine.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.check_agent_is_not_admin() {
            errors.push(e);
        }
        if let Err(e) = self.check_destinations() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// The delegate must never double as the registry administrator.
    fn check_agent_is_not_admin(&self) -> ValidationResult<()> {
        if self.agent.address == self.ledger.admin {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "agent.address and ledger.admin are both '{}'",
                    self.agent.address
                ),
            });
        }
        Ok(())
    }

    fn check_destinations(&self) -> ValidationResult<()> {
        let mut seen = std::collections::HashSet::new();
        for destination in &self.destinations {
            if destination.id.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "destinations[].id".into(),
                });
            }
            if !seen.insert(destination.id.as_str()) {
                return Err(ValidationError::Conflict {
                    reason: format!("destination '{}' is declared twice", destination.id),
                });
            }
            require_fraction("destinations[].utilization", destination.utilization)?;
        }
        Ok(())
    }

    /// Load and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for LedgerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.admin.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "ledger.admin".into(),
            });
        }
        if self.event_retention == 0 {
            return Err(invalid("ledger.event_retention", "must be at least 1"));
        }
        if self.notification_buffer == 0 {
            return Err(invalid("ledger.notification_buffer", "must be at least 1"));
        }
        Ok(())
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.address.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "agent.address".into(),
            });
        }

        cron::Schedule::from_str(&self.schedule)
            .map_err(|e| invalid("agent.schedule", e.to_string()))?;

        if self.max_concurrency == 0 {
            return Err(invalid("agent.max_concurrency", "must be at least 1"));
        }
        if self.quote_timeout_ms == 0 {
            return Err(invalid("agent.quote_timeout_ms", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("agent.retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "agent.retry.base_delay_ms",
                "must not exceed agent.retry.max_delay_ms",
            ));
        }
        require_fraction("agent.retry.jitter", self.retry.jitter)?;
        require_fraction("agent.breaker.failure_fraction", self.breaker.failure_fraction)?;
        if self.breaker.min_samples == 0 {
            return Err(invalid("agent.breaker.min_samples", "must be at least 1"));
        }
        if self.preferences.min_position < 0 {
            return Err(invalid("agent.preferences.min_position", "must not be negative"));
        }
        Ok(())
    }
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult<()> {
        require_fraction("engine.utilization_ceiling", self.utilization_ceiling)?;
        if self.liquidity_floor < 0.0 {
            return Err(invalid("engine.liquidity_floor", "must not be negative"));
        }
        if !(self.conservative_rate_ceiling <= self.balanced_rate_ceiling
            && self.balanced_rate_ceiling <= self.growth_rate_ceiling)
        {
            return Err(invalid(
                "engine.*_rate_ceiling",
                "ceilings must be ordered conservative <= balanced <= growth",
            ));
        }
        if self.cost.amortization_days <= 0.0 {
            return Err(invalid("engine.cost.amortization_days", "must be positive"));
        }
        if self.cost.fixed_cost < 0.0 || self.cost.variable_bps < 0.0 {
            return Err(invalid("engine.cost", "costs must not be negative"));
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "observability.log_level",
                format!("'{}' is not one of {:?}", self.log_level, LEVELS),
            ));
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            return Err(invalid(
                "observability.log_format",
                format!("'{}' must be 'json' or 'pretty'", self.log_format),
            ));
        }
        Ok(())
    }
}
