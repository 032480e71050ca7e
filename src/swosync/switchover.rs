// ABOUTME: Switchover state guard - the single-row state machine on the source database
// ABOUTME: Provides the in-progress check and the compare-and-swap cutover write

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use super::pipeline::{Batch, BatchResults};
use crate::utils::quote_qualified;

/// Value of `switchover_state.current_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchoverPhase {
    Idle,
    InProgress,
    UseNextDb,
}

impl SwitchoverPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchoverPhase::Idle => "idle",
            SwitchoverPhase::InProgress => "in_progress",
            SwitchoverPhase::UseNextDb => "use_next_db",
        }
    }
}

impl fmt::Display for SwitchoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchoverPhase {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "idle" => Ok(SwitchoverPhase::Idle),
            "in_progress" => Ok(SwitchoverPhase::InProgress),
            "use_next_db" => Ok(SwitchoverPhase::UseNextDb),
            other => Err(anyhow!("unknown switchover state: {other}")),
        }
    }
}

/// Contents of the switchover row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchoverState {
    pub ok: bool,
    pub current_state: SwitchoverPhase,
    pub db_id: Uuid,
}

impl SwitchoverState {
    fn from_row(row: &Row) -> Result<Self> {
        let state: String = row.try_get(1).context("Failed to read current_state")?;
        Ok(Self {
            ok: row.try_get(0).context("Failed to read ok")?,
            current_state: state.parse()?,
            db_id: row.try_get(2).context("Failed to read db_id")?,
        })
    }
}

/// Reads and transitions the switchover row.
#[derive(Debug, Clone)]
pub struct SwitchoverGuard {
    table: String,
}

impl SwitchoverGuard {
    pub fn new(table: &str) -> Self {
        Self {
            table: quote_qualified(table),
        }
    }

    /// Quoted table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT ok, current_state::text, db_id FROM {}",
            self.table
        )
    }

    /// Conditional write: only an `in_progress` row moves to `use_next_db`.
    pub fn transition_sql(&self) -> String {
        format!(
            "UPDATE {} SET current_state = 'use_next_db' WHERE current_state = 'in_progress'",
            self.table
        )
    }

    /// Read the current state outside any sync pass (status, external readers).
    pub async fn load(&self, client: &Client) -> Result<SwitchoverState> {
        let row = client
            .query_one(&self.select_sql(), &[])
            .await
            .with_context(|| format!("Failed to read {}", self.table))?;
        SwitchoverState::from_row(&row)
    }

    /// Queue the in-progress check read.
    pub fn add_batch_check(&self, batch: &mut Batch) {
        batch.query("read switchover state", self.select_sql(), vec![]);
    }

    /// Scan the in-progress check read, returning the observed state.
    pub fn scan_batch_check(&self, res: &mut BatchResults) -> Result<SwitchoverState> {
        let rows = res.next_rows()?;
        match rows.as_slice() {
            [row] => SwitchoverState::from_row(row),
            [] => Err(anyhow!("{} has no rows", self.table)),
            _ => Err(anyhow!("{} has {} rows, expected exactly one", self.table, rows.len())),
        }
    }

    /// Queue the compare-and-swap cutover write.
    pub fn add_batch_transition(&self, batch: &mut Batch) {
        batch.execute("switchover to use_next_db", self.transition_sql(), vec![]);
    }
}

/// Interpret the affected row count of the cutover write.
///
/// Zero rows means the state was not `in_progress`; the cutover must abort.
pub fn check_transition(rows_affected: u64) -> std::result::Result<(), super::SyncError> {
    match rows_affected {
        0 => Err(super::SyncError::StateConflict),
        _ => Ok(()),
    }
}
