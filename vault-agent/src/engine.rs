//! Decision engine.
//!
//! A pure function from (balances, allowlist, quotes, preferences) to at most
//! one rebalance proposal. It never errors and has no side effects, so the
//! same inputs always produce a byte-identical proposal or none.
//!
//! # Pipeline
//!
//! ```text
//! quotes ──► allowlist filter ──► safety filters ──► best destination
//!                  │
//!                  └──► position rates ──► net improvement per position
//!                                                 │
//!                                                 ▼
//!                                first position above threshold
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use vault_common::{CostConfig, EngineConfig, PreferencesConfig};
use vault_ledger::{Address, Amount, Balances, DestinationId, Venue};

// ============================================================================
// Inputs
// ============================================================================

/// Observed yield of one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldQuote {
    pub destination: DestinationId,
    /// Annualized rate, in percent
    pub rate_pct: f64,
    pub liquidity: f64,
    pub utilization: f64,
    pub observed_at: DateTime<Utc>,
}

impl YieldQuote {
    pub fn new(destination: impl Into<DestinationId>, rate_pct: f64, liquidity: f64, utilization: f64) -> Self {
        Self {
            destination: destination.into(),
            rate_pct,
            liquidity,
            utilization,
            observed_at: Utc::now(),
        }
    }
}

/// Execution cost estimate, annualized against the moved amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Flat cost per move, in base units
    pub fixed_cost: f64,
    /// Proportional cost, in basis points of the moved amount
    pub variable_bps: f64,
    /// Horizon over which the cost is spread
    pub amortization_days: f64,
}

impl CostModel {
    /// Annualized cost of moving `amount`, in percentage points.
    pub fn annualized_pct(&self, amount: Amount) -> f64 {
        if amount <= 0 || self.amortization_days <= 0.0 {
            return f64::INFINITY;
        }
        let amount = amount as f64;
        let cost = self.fixed_cost + amount * self.variable_bps / 10_000.0;
        cost / amount * 100.0 * 365.0 / self.amortization_days
    }
}

impl From<&CostConfig> for CostModel {
    fn from(config: &CostConfig) -> Self {
        Self {
            fixed_cost: config.fixed_cost,
            variable_bps: config.variable_bps,
            amortization_days: config.amortization_days,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// A single candidate fund move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceProposal {
    /// SHA-256 of the proposal content
    pub id: String,
    pub account: Address,
    pub from: Venue,
    pub to: Venue,
    pub amount: Amount,
    pub gross_delta_pct: f64,
    pub estimated_cost_pct: f64,
    pub net_delta_pct: f64,
    pub justification: String,
}

impl RebalanceProposal {
    fn digest(
        account: &Address,
        from: &Venue,
        to: &Venue,
        amount: Amount,
        gross: f64,
        cost: f64,
        net: f64,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(account.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(from.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(to.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(amount.to_be_bytes());
        hasher.update(gross.to_bits().to_be_bytes());
        hasher.update(cost.to_bits().to_be_bytes());
        hasher.update(net.to_bits().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: EngineConfig,
    cost: CostModel,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cost = CostModel::from(&config.cost);
        Self { config, cost }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    fn passes_safety(&self, quote: &YieldQuote, rate_ceiling: f64) -> bool {
        quote.rate_pct.is_finite()
            && quote.rate_pct > 0.0
            && quote.rate_pct <= rate_ceiling
            && quote.liquidity >= self.config.liquidity_floor
            && quote.utilization <= self.config.utilization_ceiling
    }

    /// Propose at most one move for an account.
    pub fn propose(
        &self,
        account: &Address,
        balances: &Balances,
        allowlist: &[DestinationId],
        quotes: &[YieldQuote],
        preferences: &PreferencesConfig,
    ) -> Option<RebalanceProposal> {
        // Allowlisted quotes; the first quote per destination wins
        let mut allowed: Vec<&YieldQuote> = Vec::new();
        let mut position_rates: HashMap<&DestinationId, f64> = HashMap::new();
        for quote in quotes {
            if !allowlist.contains(&quote.destination) || position_rates.contains_key(&quote.destination) {
                continue;
            }
            position_rates.insert(&quote.destination, quote.rate_pct);
            allowed.push(quote);
        }

        let ceiling = self.config.rate_ceiling(preferences.risk_tier);
        let best = allowed
            .iter()
            .copied()
            .filter(|q| self.passes_safety(q, ceiling))
            .fold(None::<&YieldQuote>, |best, q| match best {
                Some(b) if b.rate_pct > q.rate_pct => Some(b),
                Some(b) if b.rate_pct == q.rate_pct && b.destination <= q.destination => Some(b),
                _ => Some(q),
            })?;
        let target = Venue::Destination(best.destination.clone());

        for (venue, amount) in balances.holdings() {
            if amount <= preferences.min_position || venue == target {
                continue;
            }
            let current_rate = match &venue {
                Venue::Pool => 0.0,
                Venue::Destination(id) => match position_rates.get(id) {
                    Some(rate) => *rate,
                    None => continue,
                },
            };

            let gross = best.rate_pct - current_rate;
            let cost = self.cost.annualized_pct(amount);
            let net = gross - cost;
            if net <= preferences.min_improvement_pct {
                continue;
            }

            let justification = format!(
                "move {} from {} ({:.2}%) to {} ({:.2}%): gross {:.2}%, cost {:.2}%, net {:.2}% exceeds threshold {:.2}%",
                amount,
                venue,
                current_rate,
                target,
                best.rate_pct,
                gross,
                cost,
                net,
                preferences.min_improvement_pct,
            );
            return Some(RebalanceProposal {
                id: RebalanceProposal::digest(account, &venue, &target, amount, gross, cost, net),
                account: account.clone(),
                from: venue,
                to: target,
                amount,
                gross_delta_pct: gross,
                estimated_cost_pct: cost,
                net_delta_pct: net,
                justification,
            });
        }

        None
    }
}
