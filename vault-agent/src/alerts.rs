//! Alerts for principals and operators.
//!
//! The agent only decides *that* someone must be told; delivery belongs to
//! whatever [`AlertSink`] is plugged in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use vault_ledger::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Who the alert is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Principal(Address),
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Ledger refused the move on authorization or allowlist grounds
    PermissionRejected,
    /// Ledger refused the move for lack of funds or a bad request
    ResourceRejected,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    BreakerTripped,
    /// A cycle was skipped because the breaker is tripped
    CycleHalted,
    /// A pending retry was abandoned because the breaker tripped
    SubmissionHalted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub audience: Audience,
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, audience: Audience, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            audience,
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn principal(account: &Address, kind: AlertKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, Audience::Principal(account.clone()), kind, message)
    }

    pub fn operator(severity: Severity, kind: AlertKind, message: impl Into<String>) -> Self {
        Self::new(severity, Audience::Operator, kind, message)
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Emits alerts as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        let audience = match &alert.audience {
            Audience::Principal(account) => account.to_string(),
            Audience::Operator => "operator".to_string(),
        };
        match alert.severity {
            Severity::Info => {
                tracing::info!(target: "vault_alerts", audience = %audience, kind = ?alert.kind, "{}", alert.message)
            }
            Severity::Warning => {
                tracing::warn!(target: "vault_alerts", audience = %audience, kind = ?alert.kind, "{}", alert.message)
            }
            Severity::Critical => {
                tracing::error!(target: "vault_alerts", audience = %audience, kind = ?alert.kind, "{}", alert.message)
            }
        }
    }
}

/// Keeps alerts in memory; useful for tests and the status surface.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    pub async fn count(&self, kind: AlertKind) -> usize {
        self.alerts.lock().await.iter().filter(|a| a.kind == kind).count()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn raise(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
