//! Vault Agent Library
//!
//! The delegated rebalancing agent. Watches ledger accounts through a
//! permission mirror, decides when moving funds is worth it, and submits
//! moves the ledger re-validates on application.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         vault-agent                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Scheduler ──► Orchestrator ──► Decision Engine              │
//! │                    │   │                                     │
//! │                    │   └──► Quote Fetcher ──► Adapters       │
//! │                    ▼                                         │
//! │  Permission Mirror ◄── ledger events      Record Store       │
//! │                    │                      (SQLite)           │
//! │                    └──► Ledger.rebalance                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod alerts;
pub mod breaker;
pub mod engine;
pub mod locks;
pub mod mirror;
pub mod orchestrator;
pub mod quotes;
pub mod records;
pub mod retry;
pub mod routes;
pub mod scheduler;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use vault_common::config::Config;
use vault_ledger::{Address, Ledger, LedgerOptions, RateReading, SimulatedAdapter};

use crate::alerts::{AlertSink, TracingAlertSink};
use crate::mirror::PermissionMirror;
use crate::orchestrator::Orchestrator;
use crate::records::RecordStore;
use crate::scheduler::RebalanceScheduler;

pub use crate::engine::{CostModel, DecisionEngine, RebalanceProposal, YieldQuote};
pub use crate::orchestrator::{AccountOutcome, CycleReport, RecoveryReport};

/// Shared state behind the control surface.
pub struct AgentState {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<RebalanceScheduler>,
}

impl AgentState {
    /// Build the ledger and agent components from configuration.
    ///
    /// Destinations from `config.destinations` are registered as simulated
    /// adapters under the configured admin.
    pub async fn new(
        config: Config,
        records: RecordStore,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let ledger = Arc::new(Ledger::with_options(
            config.ledger.admin.as_str(),
            LedgerOptions {
                event_retention: config.ledger.event_retention,
                notification_buffer: config.ledger.notification_buffer,
            },
        ));

        let admin = Address::new(config.ledger.admin.clone());
        for destination in &config.destinations {
            let adapter = SimulatedAdapter::new(
                destination.id.as_str(),
                RateReading {
                    rate_pct: destination.rate_pct,
                    liquidity: destination.liquidity,
                    utilization: destination.utilization,
                },
            );
            ledger
                .register_destination(&admin, Arc::new(adapter))
                .await
                .with_context(|| format!("Failed to register destination {}", destination.id))?;
        }

        let mirror = Arc::new(PermissionMirror::new(ledger.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            ledger.clone(),
            mirror,
            Arc::new(records),
            alerts,
        ));
        let scheduler = Arc::new(RebalanceScheduler::new(
            &config.agent.schedule,
            orchestrator.clone(),
        )?);

        Ok(Self {
            config,
            ledger,
            orchestrator,
            scheduler,
        })
    }
}

pub struct AgentService {
    state: Arc<AgentState>,
}

impl AgentService {
    /// Create the service with the file-backed record store and log alerts.
    pub async fn new(config: Config) -> Result<Self> {
        let db_path = config.agent.db_path();
        let records = RecordStore::open(&db_path)
            .with_context(|| format!("Failed to open record store at {}", db_path.display()))?;
        let state = AgentState::new(config, records, Arc::new(TracingAlertSink)).await?;
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    /// Start background tasks and serve the control surface until a
    /// shutdown signal arrives.
    pub async fn start(self) -> Result<()> {
        let state = self.state;
        let mirror = state.orchestrator.mirror().clone();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(mirror.start_listener().await);
        handles.push(mirror.start_reconciler(Duration::from_secs(
            state.config.agent.reconcile_interval_secs.max(1),
        )));

        let recovery = state.orchestrator.init().await?;
        if recovery.total() > 0 {
            tracing::warn!(
                confirmed = recovery.confirmed,
                failed = recovery.failed,
                "Resolved submissions left dangling by a previous run"
            );
        }

        let scheduler = state.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                tracing::error!(error = %e, "Rebalance scheduler failed");
            }
        });

        let addr: SocketAddr = format!(
            "{}:{}",
            state.config.bind_address(),
            state.config.service_port()
        )
        .parse()
        .context("Invalid bind address")?;
        tracing::info!(address = %addr, agent = %state.orchestrator.agent(), "Starting HTTP server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let app = routes::build_router(state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        state.scheduler.stop().await;
        let _ = scheduler_handle.await;
        for handle in handles {
            handle.abort();
        }
        state.orchestrator.shutdown().await?;
        tracing::info!("Vault agent stopped");
        Ok(())
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                }
            }
            _ => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");
    }
}
