//! Cron-driven rebalance scheduler.
//!
//! Fires [`Orchestrator::run_cycle`] on the configured cron expression
//! (`sec min hour dom mon dow`). Manual triggers go through the same gate,
//! so two cycles never overlap.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::orchestrator::{CycleReport, Orchestrator};

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Scheduler not started
    Stopped,
    /// Waiting for the next tick
    Running,
}

pub struct RebalanceScheduler {
    expression: String,
    schedule: Schedule,
    orchestrator: Arc<Orchestrator>,
    state: RwLock<SchedulerState>,
    /// Held for the duration of a cycle
    cycle_gate: Mutex<()>,
    trigger: Notify,
    stop: Notify,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl RebalanceScheduler {
    pub fn new(expression: &str, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("Invalid rebalance schedule cron: {expression}"))?;
        info!(schedule = %expression, "Scheduler configured");

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            orchestrator,
            state: RwLock::new(SchedulerState::Stopped),
            cycle_gate: Mutex::new(()),
            trigger: Notify::new(),
            stop: Notify::new(),
            last_run: RwLock::new(None),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub async fn get_state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read().await
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    pub fn is_cycle_running(&self) -> bool {
        self.cycle_gate.try_lock().is_err()
    }

    /// Run a cycle now unless one is already in progress.
    pub async fn run_now(&self) -> Option<CycleReport> {
        let Ok(_gate) = self.cycle_gate.try_lock() else {
            debug!("Cycle already in progress, trigger ignored");
            return None;
        };
        *self.last_run.write().await = Some(Utc::now());
        Some(self.orchestrator.run_cycle().await)
    }

    /// Wake the loop for an immediate cycle.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the scheduler loop.
    pub async fn stop(&self) {
        *self.state.write().await = SchedulerState::Stopped;
        self.stop.notify_one();
        info!("Scheduler stopped");
    }

    /// Run the scheduler loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<()> {
        *self.state.write().await = SchedulerState::Running;
        info!(schedule = %self.expression, "Scheduler started");

        loop {
            let Some(next) = self.next_run() else {
                warn!(schedule = %self.expression, "Schedule has no upcoming runs");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, wait_ms = wait.as_millis() as u64, "Waiting for next cycle");

            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.trigger.notified() => {
                    info!("Cycle triggered on demand");
                }
                _ = self.stop.notified() => {}
            }

            if *self.state.read().await == SchedulerState::Stopped {
                break;
            }
            if self.run_now().await.is_none() {
                info!("Previous cycle still running, skipping scheduled tick");
            }
        }

        *self.state.write().await = SchedulerState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::TracingAlertSink;
    use crate::mirror::PermissionMirror;
    use crate::records::RecordStore;
    use vault_common::Config;
    use vault_ledger::Ledger;

    fn orchestrator() -> Arc<Orchestrator> {
        let config = Config::default();
        let ledger = Arc::new(Ledger::new("admin"));
        Arc::new(Orchestrator::new(
            &config,
            ledger.clone(),
            Arc::new(PermissionMirror::new(ledger)),
            Arc::new(RecordStore::in_memory().unwrap()),
            Arc::new(TracingAlertSink),
        ))
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(RebalanceScheduler::new("not a cron", orchestrator()).is_err());
    }

    #[tokio::test]
    async fn test_run_now_records_last_run() {
        let scheduler = RebalanceScheduler::new("0 0 * * * *", orchestrator()).unwrap();
        assert!(scheduler.last_run().await.is_none());
        let report = scheduler.run_now().await.unwrap();
        assert!(!report.halted);
        assert!(scheduler.last_run().await.is_some());
        assert!(!scheduler.is_cycle_running());
    }

    #[tokio::test]
    async fn test_run_now_refuses_overlap() {
        let scheduler = RebalanceScheduler::new("0 0 * * * *", orchestrator()).unwrap();
        let _held = scheduler.cycle_gate.lock().await;
        assert!(scheduler.is_cycle_running());
        assert!(scheduler.run_now().await.is_none());
    }

    #[tokio::test]
    async fn test_trigger_runs_cycle_before_schedule() {
        let scheduler = Arc::new(RebalanceScheduler::new("0 0 0 1 1 *", orchestrator()).unwrap());
        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        scheduler.trigger();
        let mut ran = false;
        for _ in 0..100 {
            if scheduler.last_run().await.is_some() {
                ran = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(ran, "triggered cycle never ran");
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let scheduler = Arc::new(RebalanceScheduler::new("0 0 0 1 1 *", orchestrator()).unwrap());
        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        for _ in 0..50 {
            if scheduler.get_state().await == SchedulerState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.get_state().await, SchedulerState::Stopped);
        assert!(scheduler.last_run().await.is_none());
    }
}
