// ABOUTME: Logical replicator - composes sequence, table and switchover sync into passes
// ABOUTME: Incremental passes are repeatable; the final pass stops writers and commits the cutover

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_postgres::{Client, IsolationLevel};

use super::error::{SyncError, SyncPhase};
use super::pipeline::{Batch, BatchError};
use super::sequence::SequenceSync;
use super::switchover::{check_transition, SwitchoverGuard, SwitchoverPhase, SwitchoverState};
use super::table::{exec_delete_changes, rank_by_dependencies, PruneRange, TableDescriptor, TableSync};
use crate::config::{SwitchoverConfig, TableConfig};
use crate::postgres;
use crate::utils::quote_qualified;

/// Which kind of pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Final,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Incremental => f.write_str("incremental"),
            SyncMode::Final => f.write_str("final"),
        }
    }
}

/// Statistics from one successful pass.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub mode: SyncMode,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub change_entries: usize,
    pub tables_changed: usize,
    pub rows_upserted: usize,
    pub rows_deleted: usize,
    pub sequences_advanced: usize,
    /// Change-log entries removed after the pass; `None` when pruning failed
    pub pruned: Option<u64>,
    pub duration_ms: u64,
}

impl SyncStats {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            started_at: chrono::Utc::now(),
            change_entries: 0,
            tables_changed: 0,
            rows_upserted: 0,
            rows_deleted: 0,
            sequences_advanced: 0,
            pruned: None,
            duration_ms: 0,
        }
    }
}

/// Where a pass is, so a timeout can be reported against the right phase.
#[derive(Debug, Clone, Copy)]
struct Progress {
    phase: SyncPhase,
    fatal: bool,
}

impl Progress {
    fn at(&mut self, phase: SyncPhase) {
        self.phase = phase;
    }

    fn fail(&self, err: impl Into<anyhow::Error>) -> SyncError {
        SyncError::phase(self.phase, self.fatal, err.into())
    }
}

/// Statement positions inside the first source batch, used to tag a batch
/// failure with the phase its statement belongs to.
struct ReadLayout {
    locks_end: usize,
    sequences_end: usize,
}

impl ReadLayout {
    fn phase_of(&self, err: &BatchError) -> SyncPhase {
        self.phase_at(err.index)
    }

    fn phase_at(&self, index: usize) -> SyncPhase {
        if index < self.locks_end {
            SyncPhase::Begin
        } else if index < self.sequences_end {
            SyncPhase::ScanSequences
        } else {
            SyncPhase::ScanChanges
        }
    }
}

/// Replays source changes onto the destination and performs the cutover.
///
/// Owns both connections; every pass takes `&mut self`, so passes on one
/// replicator can never overlap. Across processes the advisory sync lock
/// rejects a second concurrent pass.
pub struct LogicalReplicator {
    source: Client,
    target: Client,
    tables: Vec<TableDescriptor>,
    sequences: Vec<String>,
    change_log: String,
    guard: SwitchoverGuard,
    sync_lock_key: i64,
    stop_the_world_lock_key: i64,
    lock_timeout: Duration,
    pass_timeout: Option<Duration>,
    /// Set while the session-level stop-the-world lock may be held on source
    stop_the_world_held: bool,
}

impl LogicalReplicator {
    /// Build a replicator from open connections and described tables.
    ///
    /// Tables are ordered by rank (parents first), keeping the given order
    /// between tables of equal rank.
    pub fn new(
        source: Client,
        target: Client,
        mut tables: Vec<TableDescriptor>,
        config: &SwitchoverConfig,
    ) -> Self {
        tables.sort_by_key(|t| t.rank);
        Self {
            source,
            target,
            tables,
            sequences: config.sequences.clone(),
            change_log: config.change_log_table.clone(),
            guard: SwitchoverGuard::new(&config.switchover_table),
            sync_lock_key: config.sync_lock_key,
            stop_the_world_lock_key: config.stop_the_world_lock_key,
            lock_timeout: config.lock_timeout(),
            pass_timeout: config.pass_timeout(),
            stop_the_world_held: false,
        }
    }

    /// Connect to both databases and describe the tracked tables from the
    /// destination catalog (schemas are identical on both sides).
    pub async fn connect(config: &SwitchoverConfig) -> Result<Self> {
        let (source_url, target_url) = config.urls()?;

        let source = postgres::connect_with_retry(source_url)
            .await
            .context("Failed to connect to source database")?;
        let target = postgres::connect_with_retry(target_url)
            .await
            .context("Failed to connect to target database")?;

        let tables = describe_tables(&target, &config.tables).await?;
        for table in &tables {
            tracing::debug!(
                "Tracking {} (rank {}, key {:?})",
                table.name,
                table.rank,
                table.primary_key
            );
        }

        Ok(Self::new(source, target, tables, config))
    }

    /// True once either connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.source.is_closed() || self.target.is_closed()
    }

    /// Tables in apply order.
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    /// Replay pending changes without blocking application writers.
    ///
    /// Safe to call repeatedly; a failed pass leaves nothing committed on the
    /// source and can be retried on the next tick.
    pub async fn incremental_sync(&mut self) -> Result<SyncStats, SyncError> {
        self.sync(SyncMode::Incremental).await
    }

    /// Stop the world, replay the final delta, and flip the switchover state
    /// to `use_next_db`. Must be called exactly once; never retried.
    pub async fn final_sync(&mut self) -> Result<SyncStats, SyncError> {
        let result = self.sync(SyncMode::Final).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                tracing::error!(
                    "Final sync failed ({}). Inspect {} before taking any further action.",
                    err,
                    self.guard.table()
                );
            }
        }
        result
    }

    async fn sync(&mut self, mode: SyncMode) -> Result<SyncStats, SyncError> {
        let started = Instant::now();
        let mut progress = Progress {
            phase: SyncPhase::Begin,
            fatal: false,
        };

        if self.stop_the_world_held {
            // Left over from a pass whose future was dropped.
            self.release_stop_the_world().await;
        }

        let outcome = match self.pass_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_pass(mode, &mut progress)).await,
            None => Ok(self.run_pass(mode, &mut progress).await),
        };
        // The pass future is dropped by now, so ROLLBACK of any open
        // transaction is queued. A statement still running on the server
        // would hold it back; cancel it.
        if outcome.is_err() {
            self.cancel_running().await;
        }
        if self.stop_the_world_held {
            self.release_stop_the_world().await;
        }

        let (mut stats, prune) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Timeout {
                    phase: progress.phase,
                    fatal: progress.fatal,
                })
            }
        };

        stats.pruned = self.prune(mode, &prune).await;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        if mode == SyncMode::Incremental && stats.change_entries == 0 && stats.sequences_advanced == 0 {
            tracing::debug!("{} sync found nothing to apply", mode);
            return Ok(stats);
        }
        tracing::info!(
            "{} sync complete: {} change entries, {} tables, {} upserts, {} deletes, {} sequences advanced in {}ms",
            mode,
            stats.change_entries,
            stats.tables_changed,
            stats.rows_upserted,
            stats.rows_deleted,
            stats.sequences_advanced,
            stats.duration_ms
        );
        Ok(stats)
    }

    async fn run_pass(
        &mut self,
        mode: SyncMode,
        progress: &mut Progress,
    ) -> Result<(SyncStats, Vec<PruneRange>), SyncError> {
        let final_pass = mode == SyncMode::Final;
        let mut stats = SyncStats::new(mode);

        // Read-only deferrable snapshots never block writers and cannot be
        // cancelled by serialization failures; the final pass must write.
        progress.at(SyncPhase::Begin);
        if final_pass {
            // Must be granted before the snapshot exists, so every writer
            // that committed ahead of us is visible to it.
            self.acquire_stop_the_world()
                .await
                .map_err(|e| progress.fail(e))?;
            // Writers are blocked behind us from here on: nothing is retried.
            progress.fatal = true;
        }

        let src_tx = self
            .source
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .read_only(!final_pass)
            .deferrable(!final_pass)
            .start()
            .await
            .map_err(|e| progress.fail(anyhow!(e).context("begin source transaction")))?;

        let mut seq_sync = SequenceSync::new(&self.sequences);
        let mut tbl_sync = TableSync::new(&self.tables, &self.change_log);

        let mut read_changes = Batch::new();
        read_changes.query(
            "set lock timeout",
            "SELECT pg_catalog.set_config('lock_timeout', $1, true)",
            vec![Box::new(self.lock_timeout.as_millis().to_string())],
        );
        read_changes.query(
            "in-progress lock",
            "SELECT pg_try_advisory_xact_lock($1)",
            vec![Box::new(self.sync_lock_key)],
        );
        self.guard.add_batch_check(&mut read_changes);
        let locks_end = read_changes.len();
        seq_sync.add_batch_reads(&mut read_changes);
        let layout = ReadLayout {
            locks_end,
            sequences_end: read_changes.len(),
        };
        tbl_sync.add_batch_change_read(&mut read_changes);

        let mut res = read_changes.send(&src_tx).await.map_err(|e| {
            progress.at(layout.phase_of(&e));
            progress.fail(e)
        })?;

        res.skip().map_err(|e| progress.fail(e))?;
        let locked = res
            .next_rows()
            .and_then(|rows| {
                rows.first()
                    .map(|row| row.get::<_, bool>(0))
                    .ok_or_else(|| anyhow!("advisory lock returned no rows"))
            })
            .map_err(|e| progress.fail(e))?;
        if !locked {
            return Err(progress.fail(anyhow!(
                "another sync pass holds advisory lock {}",
                self.sync_lock_key
            )));
        }

        let state = self
            .guard
            .scan_batch_check(&mut res)
            .map_err(|e| progress.fail(e))?;
        ensure_in_progress(&state, final_pass)?;

        progress.at(SyncPhase::ScanSequences);
        seq_sync
            .scan_batch_reads(&mut res)
            .map_err(|e| progress.fail(e))?;

        progress.at(SyncPhase::ScanChanges);
        tbl_sync
            .scan_batch_change_read(&mut res)
            .map_err(|e| progress.fail(e))?;
        stats.change_entries = tbl_sync.change_entry_count();
        stats.tables_changed = tbl_sync.pending_tables().count();

        for (table, rows) in tbl_sync.pending_counts() {
            tracing::debug!("{}: {} pending rows", table, rows);
        }

        progress.at(SyncPhase::ReadRows);
        let mut read_rows = Batch::new();
        tbl_sync.add_batch_row_reads(&mut read_rows);
        if !read_rows.is_empty() {
            let mut res = read_rows
                .send(&src_tx)
                .await
                .map_err(|e| progress.fail(e))?;
            tbl_sync
                .scan_batch_row_reads(&mut res)
                .map_err(|e| progress.fail(e))?;
        }

        progress.at(SyncPhase::ApplyChanges);
        let mut apply = Batch::new();
        apply.execute("defer constraints", "SET CONSTRAINTS ALL DEFERRED", vec![]);
        seq_sync.add_batch_writes(&mut apply);
        let summary = tbl_sync.add_batch_writes(&mut apply);
        stats.rows_upserted = summary.upserts;
        stats.rows_deleted = summary.deletes;

        if apply.len() > 1 {
            let dst_tx = self
                .target
                .transaction()
                .await
                .map_err(|e| progress.fail(anyhow!(e).context("begin destination transaction")))?;
            let mut res = apply.send(&dst_tx).await.map_err(|e| progress.fail(e))?;
            res.skip().map_err(|e| progress.fail(e))?;
            stats.sequences_advanced = seq_sync
                .scan_batch_writes(&mut res)
                .map_err(|e| progress.fail(e))?;
            dst_tx
                .commit()
                .await
                .map_err(|e| progress.fail(anyhow!(e).context("commit destination transaction")))?;
        }

        if final_pass {
            let mut triggers = Batch::new();
            tbl_sync.add_batch_enable_triggers(&mut triggers);
            triggers
                .send(&self.target)
                .await
                .map_err(|e| progress.fail(e))?;
        }

        if final_pass {
            // Writers are stopped, the destination holds the final snapshot
            // and its triggers are live: only now may readers be told.
            progress.at(SyncPhase::StateTransition);
            let mut finish = Batch::new();
            self.guard.add_batch_transition(&mut finish);
            let mut res = finish.send(&src_tx).await.map_err(|e| progress.fail(e))?;
            let affected = res.next_affected().map_err(|e| progress.fail(e))?;
            check_transition(affected)?;
        }

        progress.at(SyncPhase::CommitRead);
        src_tx
            .commit()
            .await
            .map_err(|e| progress.fail(anyhow!(e).context("commit source transaction")))?;

        Ok((stats, tbl_sync.prune_ranges()))
    }

    /// Take the session-level stop-the-world lock on source, waiting at most
    /// `lock_timeout`. Application writers take the same key shared.
    async fn acquire_stop_the_world(&mut self) -> Result<()> {
        let mut batch = Batch::new();
        batch.query(
            "set lock timeout",
            "SELECT pg_catalog.set_config('lock_timeout', $1, false)",
            vec![Box::new(self.lock_timeout.as_millis().to_string())],
        );
        batch.execute(
            "stop-the-world lock",
            "SELECT pg_advisory_lock($1)",
            vec![Box::new(self.stop_the_world_lock_key)],
        );
        batch.execute("reset lock timeout", "RESET lock_timeout", vec![]);

        // Flag first: if this future is dropped the grant may still arrive.
        self.stop_the_world_held = true;
        match batch.send(&self.source).await {
            Ok(_) => {
                tracing::info!(
                    "Stop-the-world lock {} acquired, writers are blocked",
                    self.stop_the_world_lock_key
                );
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context("Failed to acquire stop-the-world lock")),
        }
    }

    /// Release the stop-the-world lock. Failures are logged; the flag stays
    /// set so the next pass retries, and a closed connection frees it anyway.
    async fn release_stop_the_world(&mut self) {
        match self
            .source
            .query_one(
                "SELECT pg_advisory_unlock($1)",
                &[&self.stop_the_world_lock_key],
            )
            .await
        {
            Ok(row) => {
                self.stop_the_world_held = false;
                if row.get::<_, bool>(0) {
                    tracing::info!("Stop-the-world lock released");
                }
            }
            Err(e) => tracing::warn!("Failed to release stop-the-world lock: {}", e),
        }
    }

    async fn cancel_running(&self) {
        for (side, client) in [("source", &self.source), ("target", &self.target)] {
            if let Err(e) = postgres::cancel_query(client).await {
                tracing::warn!("Failed to cancel running query on {}: {:#}", side, e);
            }
        }
    }

    /// Best-effort removal of consumed change-log entries. Failures are
    /// logged only: replaying an entry again is a no-op.
    async fn prune(&self, mode: SyncMode, ranges: &[PruneRange]) -> Option<u64> {
        let delete = exec_delete_changes(&self.source, &self.change_log, ranges);
        let result = match self.pass_timeout {
            Some(limit) => tokio::time::timeout(limit, delete)
                .await
                .unwrap_or_else(|_| Err(anyhow!("timed out"))),
            None => delete.await,
        };

        match result {
            Ok(deleted) => {
                tracing::debug!("Pruned {} change-log entries", deleted);
                Some(deleted)
            }
            Err(e) => {
                let err = SyncError::phase(SyncPhase::DeleteChanges, false, e);
                match mode {
                    SyncMode::Incremental => {
                        tracing::warn!("Change-log cleanup failed, will retry next pass: {}", err)
                    }
                    SyncMode::Final => {
                        tracing::warn!("Change-log cleanup failed after cutover: {}", err)
                    }
                }
                None
            }
        }
    }

    /// Current switchover row on the source.
    pub async fn switchover_state(&self) -> Result<SwitchoverState> {
        self.guard.load(&self.source).await
    }

    /// Change-log entries waiting per tracked table, in apply order.
    pub async fn pending_changes(&self) -> Result<Vec<(String, i64)>> {
        let rows = self
            .source
            .query(
                &format!(
                    "SELECT table_name, count(*) FROM {} GROUP BY table_name",
                    quote_qualified(&self.change_log)
                ),
                &[],
            )
            .await
            .context("Failed to count pending changes")?;

        let counts: HashMap<String, i64> = rows
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();

        Ok(self
            .tables
            .iter()
            .map(|t| (t.name.clone(), counts.get(&t.name).copied().unwrap_or(0)))
            .collect())
    }
}

/// The in-progress check. In a final pass a wrong state is always fatal.
fn ensure_in_progress(state: &SwitchoverState, final_pass: bool) -> Result<(), SyncError> {
    if state.current_state == SwitchoverPhase::InProgress {
        return Ok(());
    }
    Err(SyncError::NotInProgress {
        state: state.current_state,
        fatal: final_pass,
    })
}

/// Describe configured tables from the catalog, deriving ranks from foreign
/// keys for any table without a configured rank.
pub async fn describe_tables(client: &Client, configs: &[TableConfig]) -> Result<Vec<TableDescriptor>> {
    let mut metadata = Vec::with_capacity(configs.len());
    for config in configs {
        metadata.push(postgres::load_table_metadata(client, &config.name).await?);
    }

    let derived = if configs.iter().all(|c| c.rank.is_some()) {
        vec![0; configs.len()]
    } else {
        let oids: Vec<u32> = metadata.iter().map(|m| m.oid).collect();
        let index_of: HashMap<u32, usize> = oids.iter().enumerate().map(|(i, oid)| (*oid, i)).collect();
        let edges: Vec<(usize, usize)> = postgres::load_foreign_keys(client, &oids)
            .await?
            .into_iter()
            .filter_map(|(child, parent)| Some((*index_of.get(&child)?, *index_of.get(&parent)?)))
            .collect();
        let names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        rank_by_dependencies(&names, &edges)?
    };

    configs
        .iter()
        .zip(metadata)
        .zip(derived)
        .map(|((config, meta), derived_rank)| {
            let (primary_key, key_type) = match &config.primary_key {
                Some(pk) if *pk == meta.primary_key => (pk.clone(), meta.primary_key_types.first().cloned()),
                Some(pk) => (pk.clone(), None),
                None => (meta.primary_key.clone(), meta.primary_key_types.first().cloned()),
            };
            TableDescriptor::new(
                &config.name,
                meta.columns,
                primary_key,
                key_type,
                config.rank.unwrap_or(derived_rank),
            )
        })
        .collect()
}
