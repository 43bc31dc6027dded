//! Destination adapter contract.
//!
//! Every yield-bearing destination is reached only through a
//! [`DestinationAdapter`] looked up in the protocol registry.
//!
//! # Architecture
//!
//! ```text
//! DestinationAdapter (trait)
//!        |
//!        v
//! SimulatedAdapter
//! (in-memory)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{Amount, DestinationId};

/// Failure reported by a destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The destination did not answer in time
    #[error("destination timed out")]
    Timeout,
    /// The destination is temporarily unavailable
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    /// The destination refused the request
    #[error("destination rejected request: {0}")]
    Rejected(String),
}

impl AdapterError {
    /// Check if the error is transient (worth retrying).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// Point-in-time reading of a destination's yield and depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateReading {
    /// Annualized rate, in percent
    pub rate_pct: f64,
    /// Available liquidity in base units
    pub liquidity: f64,
    /// Utilization in [0, 1]
    pub utilization: f64,
}

/// Typed capability interface for one destination.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Destination this adapter serves
    fn id(&self) -> &DestinationId;

    /// Move `amount` into the destination
    async fn deposit(&self, amount: Amount) -> Result<(), AdapterError>;

    /// Move `amount` out of the destination
    async fn withdraw(&self, amount: Amount) -> Result<(), AdapterError>;

    /// Current yield reading
    async fn current_rate(&self) -> Result<RateReading, AdapterError>;
}

// ============================================================================
// Simulated Adapter
// ============================================================================

/// Adapter operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOp {
    Deposit,
    Withdraw,
    Rate,
}

#[derive(Debug, Default)]
struct SimulatedState {
    reading: Option<RateReading>,
    held: Amount,
    deposits: u32,
    withdrawals: u32,
    deposit_faults: VecDeque<AdapterError>,
    withdraw_faults: VecDeque<AdapterError>,
    rate_faults: VecDeque<AdapterError>,
}

impl SimulatedState {
    fn faults(&mut self, op: AdapterOp) -> &mut VecDeque<AdapterError> {
        match op {
            AdapterOp::Deposit => &mut self.deposit_faults,
            AdapterOp::Withdraw => &mut self.withdraw_faults,
            AdapterOp::Rate => &mut self.rate_faults,
        }
    }
}

/// In-memory destination with configurable quotes, injected failures, and
/// artificial latency.
#[derive(Debug)]
pub struct SimulatedAdapter {
    id: DestinationId,
    latency: Duration,
    state: Mutex<SimulatedState>,
}

impl SimulatedAdapter {
    pub fn new(id: impl Into<DestinationId>, reading: RateReading) -> Self {
        Self {
            id: id.into(),
            latency: Duration::ZERO,
            state: Mutex::new(SimulatedState {
                reading: Some(reading),
                ..Default::default()
            }),
        }
    }

    /// Simulated destination quoting `rate_pct` with deep, lightly used liquidity.
    pub fn with_rate(id: impl Into<DestinationId>, rate_pct: f64) -> Self {
        Self::new(
            id,
            RateReading {
                rate_pct,
                liquidity: 10_000_000.0,
                utilization: 0.5,
            },
        )
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_reading(&self, reading: RateReading) {
        self.state.lock().await.reading = Some(reading);
    }

    pub async fn set_rate(&self, rate_pct: f64) {
        let mut state = self.state.lock().await;
        if let Some(reading) = state.reading.as_mut() {
            reading.rate_pct = rate_pct;
        }
    }

    /// Stop quoting; rate calls report the destination as unavailable.
    pub async fn clear_reading(&self) {
        self.state.lock().await.reading = None;
    }

    /// Fail the next `count` calls of `op` with `error`.
    pub async fn inject_failures(&self, op: AdapterOp, error: AdapterError, count: usize) {
        let mut state = self.state.lock().await;
        let faults = state.faults(op);
        for _ in 0..count {
            faults.push_back(error.clone());
        }
    }

    /// Funds currently held at this destination.
    pub async fn held(&self) -> Amount {
        self.state.lock().await.held
    }

    /// Number of successful deposits.
    pub async fn deposit_count(&self) -> u32 {
        self.state.lock().await.deposits
    }

    /// Number of successful withdrawals.
    pub async fn withdraw_count(&self) -> u32 {
        self.state.lock().await.withdrawals
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl DestinationAdapter for SimulatedAdapter {
    fn id(&self) -> &DestinationId {
        &self.id
    }

    async fn deposit(&self, amount: Amount) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        if let Some(fault) = state.deposit_faults.pop_front() {
            return Err(fault);
        }
        state.held = state
            .held
            .checked_add(amount)
            .ok_or_else(|| AdapterError::Rejected(format!("deposit of {amount} overflows holdings")))?;
        state.deposits += 1;
        debug!(destination = %self.id, amount = %amount, held = %state.held, "Simulated deposit");
        Ok(())
    }

    async fn withdraw(&self, amount: Amount) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        if let Some(fault) = state.withdraw_faults.pop_front() {
            return Err(fault);
        }
        if amount > state.held {
            return Err(AdapterError::Rejected(format!(
                "withdraw of {} exceeds held {}",
                amount, state.held
            )));
        }
        state.held -= amount;
        state.withdrawals += 1;
        debug!(destination = %self.id, amount = %amount, held = %state.held, "Simulated withdraw");
        Ok(())
    }

    async fn current_rate(&self) -> Result<RateReading, AdapterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        if let Some(fault) = state.rate_faults.pop_front() {
            return Err(fault);
        }
        state
            .reading
            .ok_or_else(|| AdapterError::Unavailable(format!("{} is not quoting", self.id)))
    }
}
