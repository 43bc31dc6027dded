//! SQLite persistence for the rebalance audit log and breaker state.
//!
//! The record log is append-only and keyed by `(account, sequence)`. A
//! submission is written before the move is sent and resolved by a later
//! `confirmed` or `failed` record carrying the same proposal id, so a crash
//! between the two leaves a dangling `submitted` row for recovery.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use vault_ledger::{Address, MoveProof};

use crate::breaker::CircuitBreakerState;
use crate::engine::RebalanceProposal;

/// Outcome of one orchestrator step for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Move handed to the ledger, result not yet known
    Submitted,
    Confirmed,
    Failed,
    /// No worthwhile move
    Skipped,
}

impl RecordOutcome {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Check if the outcome closes a submission
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Stored audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub account: Address,
    /// Per-account sequence, assigned on append
    pub sequence: u64,
    /// Proposal digest; empty for skipped cycles
    pub proposal_id: String,
    pub proposal: Option<RebalanceProposal>,
    pub outcome: RecordOutcome,
    /// Ledger move id for confirmed moves
    pub external_reference: Option<String>,
    /// Account sequence the move proof was built against
    pub observed_sequence: Option<u64>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RebalanceRecord {
    /// The proof this submission was sent with, if any.
    pub fn proof(&self) -> Option<MoveProof> {
        self.observed_sequence.map(|observed_sequence| MoveProof {
            proposal_id: self.proposal_id.clone(),
            observed_sequence,
        })
    }
}

/// Record to append; the store assigns sequence and timestamp.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub account: Address,
    pub proposal_id: String,
    pub proposal: Option<RebalanceProposal>,
    pub outcome: RecordOutcome,
    pub external_reference: Option<String>,
    pub observed_sequence: Option<u64>,
    pub detail: Option<String>,
}

impl NewRecord {
    pub fn skipped(account: &Address, detail: impl Into<String>) -> Self {
        Self {
            account: account.clone(),
            proposal_id: String::new(),
            proposal: None,
            outcome: RecordOutcome::Skipped,
            external_reference: None,
            observed_sequence: None,
            detail: Some(detail.into()),
        }
    }

    pub fn submitted(proposal: &RebalanceProposal, proof: &MoveProof) -> Self {
        Self {
            account: proposal.account.clone(),
            proposal_id: proposal.id.clone(),
            proposal: Some(proposal.clone()),
            outcome: RecordOutcome::Submitted,
            external_reference: None,
            observed_sequence: Some(proof.observed_sequence),
            detail: Some(proposal.justification.clone()),
        }
    }

    /// Terminal record closing a submission.
    pub fn resolved(
        account: &Address,
        proof: &MoveProof,
        outcome: RecordOutcome,
        external_reference: Option<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            account: account.clone(),
            proposal_id: proof.proposal_id.clone(),
            proposal: None,
            outcome,
            external_reference,
            observed_sequence: Some(proof.observed_sequence),
            detail,
        }
    }
}

/// SQLite store for rebalance records
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    /// Open or create a record store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;

        info!(path = ?path.as_ref(), "Record store opened");
        Ok(store)
    }

    /// Create an in-memory record store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;

        debug!("In-memory record store created");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("record store connection lock poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rebalance_records (
                account TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                proposal_id TEXT NOT NULL,
                proposal TEXT,
                outcome TEXT NOT NULL,
                external_reference TEXT,
                observed_sequence INTEGER,
                detail TEXT,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (account, sequence)
            );

            CREATE TABLE IF NOT EXISTS breaker_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                tripped INTEGER NOT NULL,
                reason TEXT,
                tripped_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_outcome ON rebalance_records(outcome);
            CREATE INDEX IF NOT EXISTS idx_records_proposal ON rebalance_records(account, proposal_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Record Operations
    // ========================================================================

    /// Append a record, assigning the next sequence for its account
    pub fn append(&self, record: NewRecord) -> Result<RebalanceRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM rebalance_records WHERE account = ?1",
            params![record.account.as_str()],
            |row| row.get(0),
        )?;
        let recorded_at = Utc::now();
        let proposal_json = record
            .proposal
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize proposal")?;

        tx.execute(
            r#"
            INSERT INTO rebalance_records (
                account, sequence, proposal_id, proposal, outcome,
                external_reference, observed_sequence, detail, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.account.as_str(),
                sequence,
                record.proposal_id,
                proposal_json,
                record.outcome.to_db_string(),
                record.external_reference,
                record.observed_sequence.map(|s| s as i64),
                record.detail,
                recorded_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        debug!(
            account = %record.account,
            sequence,
            outcome = record.outcome.to_db_string(),
            "Record appended"
        );

        Ok(RebalanceRecord {
            account: record.account,
            sequence: sequence as u64,
            proposal_id: record.proposal_id,
            proposal: record.proposal,
            outcome: record.outcome,
            external_reference: record.external_reference,
            observed_sequence: record.observed_sequence,
            detail: record.detail,
            recorded_at,
        })
    }

    /// All records for an account, oldest first
    pub fn records_for(&self, account: &Address) -> Result<Vec<RebalanceRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT account, sequence, proposal_id, proposal, outcome,
                   external_reference, observed_sequence, detail, recorded_at
            FROM rebalance_records
            WHERE account = ?1
            ORDER BY sequence ASC
            "#,
        )?;

        let records = stmt
            .query_map(params![account.as_str()], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Submissions with no terminal record, recorded before `older_than`
    pub fn dangling_submissions(&self, older_than: DateTime<Utc>) -> Result<Vec<RebalanceRecord>> {
        Ok(self
            .unresolved_submissions()?
            .into_iter()
            .filter(|r| r.recorded_at < older_than)
            .collect())
    }

    /// Every submission with no terminal record, oldest first per account.
    pub fn unresolved_submissions(&self) -> Result<Vec<RebalanceRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT account, sequence, proposal_id, proposal, outcome,
                   external_reference, observed_sequence, detail, recorded_at
            FROM rebalance_records
            WHERE outcome IN ('submitted', 'confirmed', 'failed')
            ORDER BY account ASC, sequence ASC
            "#,
        )?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        let resolved: HashSet<(Address, String, Option<u64>)> = records
            .iter()
            .filter(|r| r.outcome.is_terminal())
            .map(|r| (r.account.clone(), r.proposal_id.clone(), r.observed_sequence))
            .collect();

        Ok(records
            .into_iter()
            .filter(|r| r.outcome == RecordOutcome::Submitted)
            .filter(|r| {
                !resolved.contains(&(r.account.clone(), r.proposal_id.clone(), r.observed_sequence))
            })
            .collect())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RebalanceRecord> {
        let account: String = row.get(0)?;
        let sequence: i64 = row.get(1)?;
        let proposal_json: Option<String> = row.get(3)?;
        let outcome_str: String = row.get(4)?;
        let observed_sequence: Option<i64> = row.get(6)?;
        let recorded_str: String = row.get(8)?;

        Ok(RebalanceRecord {
            account: Address::new(account),
            sequence: sequence as u64,
            proposal_id: row.get(2)?,
            proposal: proposal_json.and_then(|json| serde_json::from_str(&json).ok()),
            outcome: RecordOutcome::from_db_string(&outcome_str).unwrap_or(RecordOutcome::Failed),
            external_reference: row.get(5)?,
            observed_sequence: observed_sequence.map(|s| s as u64),
            detail: row.get(7)?,
            recorded_at: DateTime::parse_from_rfc3339(&recorded_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ========================================================================
    // Breaker State
    // ========================================================================

    pub fn save_breaker_state(&self, state: &CircuitBreakerState) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO breaker_state (id, tripped, reason, tripped_at, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                tripped = excluded.tripped,
                reason = excluded.reason,
                tripped_at = excluded.tripped_at,
                updated_at = excluded.updated_at
            "#,
            params![
                state.tripped,
                state.reason,
                state.tripped_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!(tripped = state.tripped, "Breaker state saved");
        Ok(())
    }

    pub fn load_breaker_state(&self) -> Result<Option<CircuitBreakerState>> {
        let conn = self.conn()?;

        let state = conn
            .query_row(
                "SELECT tripped, reason, tripped_at FROM breaker_state WHERE id = 1",
                [],
                |row| {
                    let tripped_at: Option<String> = row.get(2)?;
                    Ok(CircuitBreakerState {
                        tripped: row.get(0)?,
                        reason: row.get(1)?,
                        tripped_at: tripped_at.and_then(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .map(|dt| dt.with_timezone(&Utc))
                                .ok()
                        }),
                    })
                },
            )
            .optional()?;

        Ok(state)
    }
}
