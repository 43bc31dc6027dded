//! Configuration management for the vault services.
//!
//! The agent reads a single configuration file at `~/.yieldvault/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (VAULT_* prefix), when applied via `load_with_env`
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `VAULT_PORT` → service.port
//! - `VAULT_BIND_ADDRESS` → network.bind
//! - `VAULT_LOG_LEVEL` → observability.log_level
//! - `VAULT_AGENT_ADDRESS` → agent.address
//! - `VAULT_DB_PATH` → agent.db_path
//! - `VAULT_SCHEDULE` → agent.schedule

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".yieldvault"),
        |dirs| dirs.home_dir().join(".yieldvault"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network / Service
// ============================================================================

/// Global network configuration.
///
/// Default bind address is `127.0.0.1` (local only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address for the control surface
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

/// HTTP control surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Port number for the agent service
    #[serde(default)]
    pub port: Option<u16>,
}

// ============================================================================
// Ledger
// ============================================================================

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Administrator address allowed to vet destinations
    #[serde(default = "default_admin")]
    pub admin: String,

    /// Number of events retained per account for notification resume
    #[serde(default = "default_event_retention")]
    pub event_retention: usize,

    /// Capacity of the change-notification broadcast channel
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            admin: default_admin(),
            event_retention: default_event_retention(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

fn default_admin() -> String {
    "admin".into()
}
fn default_event_retention() -> usize {
    1024
}
fn default_notification_buffer() -> usize {
    256
}

/// A destination registered with the ledger at boot.
///
/// The service binary backs each of these with a simulated adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination identifier
    pub id: String,
    /// Quoted annual rate in percent
    pub rate_pct: f64,
    /// Available liquidity in base units
    #[serde(default = "default_destination_liquidity")]
    pub liquidity: f64,
    /// Utilization ratio in `[0, 1]`
    #[serde(default = "default_destination_utilization")]
    pub utilization: f64,
}

fn default_destination_liquidity() -> f64 {
    10_000_000.0
}
fn default_destination_utilization() -> f64 {
    0.5
}

// ============================================================================
// Agent
// ============================================================================

/// Risk appetite of an account, selects the quoted-rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Conservative,
    #[default]
    Balanced,
    Growth,
}

/// Per-account decision preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// Risk tier
    #[serde(default)]
    pub risk_tier: RiskTier,

    /// Minimum net improvement (annualized percentage points) required to move
    #[serde(default = "default_min_improvement_pct")]
    pub min_improvement_pct: f64,

    /// Positions at or below this amount (base units) are left alone
    #[serde(default = "default_min_position")]
    pub min_position: i128,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            risk_tier: RiskTier::default(),
            min_improvement_pct: default_min_improvement_pct(),
            min_position: default_min_position(),
        }
    }
}

fn default_min_improvement_pct() -> f64 {
    0.5
}
fn default_min_position() -> i128 {
    100
}

/// Retry policy for transient submission failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first submission
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Trip when failures / outcomes exceeds this fraction
    #[serde(default = "default_failure_fraction")]
    pub failure_fraction: f64,

    /// Rolling window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Minimum outcomes in the window before the fraction is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_fraction: default_failure_fraction(),
            window_secs: default_window_secs(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_failure_fraction() -> f64 {
    0.5
}
fn default_window_secs() -> u64 {
    6 * 3600
}
fn default_min_samples() -> usize {
    4
}

/// Execution orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Delegate address this agent signs moves with
    #[serde(default = "default_agent_address")]
    pub address: String,

    /// Cron expression for scheduled cycles (sec min hour dom mon dow)
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Interval between full mirror reconciliations in seconds
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Per-destination quote timeout in milliseconds
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,

    /// Accounts processed concurrently within one cycle
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Age after which an in-flight lease or dangling submission is considered stale
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    /// SQLite path for rebalance records (defaults to the config dir)
    #[serde(default)]
    pub db_path: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Preferences applied to accounts without an explicit entry
    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Per-account preference overrides keyed by account address
    #[serde(default)]
    pub account_preferences: HashMap<String, PreferencesConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            schedule: default_schedule(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            quote_timeout_ms: default_quote_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            lease_timeout_secs: default_lease_timeout_secs(),
            db_path: None,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            preferences: PreferencesConfig::default(),
            account_preferences: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Resolve the record database path.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir().join("records.db"))
    }
}

fn default_agent_address() -> String {
    "agent".into()
}
fn default_schedule() -> String {
    "0 0 */4 * * *".into()
}
fn default_reconcile_interval_secs() -> u64 {
    300
}
fn default_quote_timeout_ms() -> u64 {
    2_000
}
fn default_max_concurrency() -> usize {
    8
}
fn default_lease_timeout_secs() -> u64 {
    600
}

// ============================================================================
// Decision Engine
// ============================================================================

/// Move cost model, normalized by the engine to an annualized percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Fixed cost per move in base units
    #[serde(default = "default_fixed_cost")]
    pub fixed_cost: f64,

    /// Variable cost in basis points of the moved amount
    #[serde(default)]
    pub variable_bps: f64,

    /// Horizon over which the one-off cost is amortized
    #[serde(default = "default_amortization_days")]
    pub amortization_days: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            fixed_cost: default_fixed_cost(),
            variable_bps: 0.0,
            amortization_days: default_amortization_days(),
        }
    }
}

fn default_fixed_cost() -> f64 {
    30.0
}
fn default_amortization_days() -> f64 {
    365.0
}

/// Safety filters and cost model for the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quotes with less liquidity (base units) are discarded
    #[serde(default = "default_liquidity_floor")]
    pub liquidity_floor: f64,

    /// Quotes with higher utilization are discarded
    #[serde(default = "default_utilization_ceiling")]
    pub utilization_ceiling: f64,

    /// Rate ceiling (percent) for conservative accounts
    #[serde(default = "default_conservative_ceiling")]
    pub conservative_rate_ceiling: f64,

    /// Rate ceiling (percent) for balanced accounts
    #[serde(default = "default_balanced_ceiling")]
    pub balanced_rate_ceiling: f64,

    /// Rate ceiling (percent) for growth accounts
    #[serde(default = "default_growth_ceiling")]
    pub growth_rate_ceiling: f64,

    #[serde(default)]
    pub cost: CostConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            liquidity_floor: default_liquidity_floor(),
            utilization_ceiling: default_utilization_ceiling(),
            conservative_rate_ceiling: default_conservative_ceiling(),
            balanced_rate_ceiling: default_balanced_ceiling(),
            growth_rate_ceiling: default_growth_ceiling(),
            cost: CostConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Rate ceiling for a risk tier.
    pub fn rate_ceiling(&self, tier: RiskTier) -> f64 {
        match tier {
            RiskTier::Conservative => self.conservative_rate_ceiling,
            RiskTier::Balanced => self.balanced_rate_ceiling,
            RiskTier::Growth => self.growth_rate_ceiling,
        }
    }
}

fn default_liquidity_floor() -> f64 {
    100_000.0
}
fn default_utilization_ceiling() -> f64 {
    0.95
}
fn default_conservative_ceiling() -> f64 {
    8.0
}
fn default_balanced_ceiling() -> f64 {
    15.0
}
fn default_growth_ceiling() -> f64 {
    40.0
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to pin at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Destinations registered at boot
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("VAULT_PORT") {
            if let Ok(p) = port.parse() {
                self.service.port = Some(p);
            }
        }

        if let Ok(bind) = std::env::var("VAULT_BIND_ADDRESS") {
            self.network.bind = bind;
        }

        if let Ok(level) = std::env::var("VAULT_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(address) = std::env::var("VAULT_AGENT_ADDRESS") {
            self.agent.address = address;
        }

        if let Ok(path) = std::env::var("VAULT_DB_PATH") {
            self.agent.db_path = Some(path);
        }

        if let Ok(schedule) = std::env::var("VAULT_SCHEDULE") {
            self.agent.schedule = schedule;
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create config directory {}", dir.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Get the effective bind address.
    pub fn bind_address(&self) -> &str {
        &self.network.bind
    }

    /// Get the effective control surface port.
    pub fn service_port(&self) -> u16 {
        self.service.port.unwrap_or(4480)
    }

    /// Get the control surface endpoint URL.
    pub fn service_endpoint(&self) -> String {
        format!("http://{}:{}", self.bind_address(), self.service_port())
    }

    /// Preferences for an account, falling back to the agent default.
    pub fn preferences_for(&self, account: &str) -> &PreferencesConfig {
        self.agent
            .account_preferences
            .get(account)
            .unwrap_or(&self.agent.preferences)
    }
}
