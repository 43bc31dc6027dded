//! Parallel yield quote fetching.
//!
//! A destination that times out, errors, or has no registered adapter simply
//! yields no quote; the engine then treats it as unpriced.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use vault_ledger::{DestinationId, Ledger};

use crate::engine::YieldQuote;

#[derive(Clone)]
pub struct QuoteFetcher {
    ledger: Arc<Ledger>,
    timeout: Duration,
}

impl QuoteFetcher {
    pub fn new(ledger: Arc<Ledger>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    /// Fetch quotes for `destinations`, preserving their order.
    pub async fn fetch(&self, destinations: &[DestinationId]) -> Vec<YieldQuote> {
        let calls = destinations.iter().map(|id| self.fetch_one(id));
        join_all(calls).await.into_iter().flatten().collect()
    }

    async fn fetch_one(&self, id: &DestinationId) -> Option<YieldQuote> {
        let Some(adapter) = self.ledger.adapter(id).await else {
            warn!(destination = %id, "No adapter registered, skipping quote");
            return None;
        };

        match timeout(self.timeout, adapter.current_rate()).await {
            Ok(Ok(reading)) => Some(YieldQuote {
                destination: id.clone(),
                rate_pct: reading.rate_pct,
                liquidity: reading.liquidity,
                utilization: reading.utilization,
                observed_at: Utc::now(),
            }),
            Ok(Err(e)) => {
                warn!(destination = %id, error = %e, "Quote failed");
                None
            }
            Err(_) => {
                warn!(
                    destination = %id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Quote timed out"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_ledger::{AdapterError, AdapterOp, Address, SimulatedAdapter};

    #[tokio::test]
    async fn test_failures_yield_no_quote() {
        let ledger = Arc::new(Ledger::new("admin"));
        let admin = Address::from("admin");
        let healthy = Arc::new(SimulatedAdapter::with_rate("healthy", 5.0));
        let flaky = Arc::new(SimulatedAdapter::with_rate("flaky", 6.0));
        let slow = Arc::new(
            SimulatedAdapter::with_rate("slow", 7.0).with_latency(Duration::from_millis(200)),
        );
        flaky
            .inject_failures(AdapterOp::Rate, AdapterError::Unavailable("down".into()), 1)
            .await;
        ledger.register_destination(&admin, healthy).await.unwrap();
        ledger.register_destination(&admin, flaky).await.unwrap();
        ledger.register_destination(&admin, slow).await.unwrap();

        let fetcher = QuoteFetcher::new(ledger, Duration::from_millis(50));
        let quotes = fetcher
            .fetch(&[
                "slow".into(),
                "healthy".into(),
                "flaky".into(),
                "unregistered".into(),
            ])
            .await;

        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].destination, DestinationId::from("healthy"));
        assert!((quotes[0].rate_pct - 5.0).abs() < f64::EPSILON);
    }
}
