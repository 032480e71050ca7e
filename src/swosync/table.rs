// ABOUTME: Table synchronizer - replays change-log entries as row upserts and deletes
// ABOUTME: Coalesces entries per row, fetches current contents, writes in dependency order

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_postgres::Client;

use super::pipeline::{Batch, BatchResults};
use crate::utils::{quote_ident, quote_qualified};

/// A tracked table and everything needed to build its statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Name as written to `change_log.table_name` (optionally `schema.table`)
    pub name: String,
    /// All columns in ordinal order
    pub columns: Vec<String>,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
    /// SQL type of the key column, used for index-friendly lookups on
    /// single-column keys
    pub key_type: Option<String>,
    /// Parents have lower ranks than their children
    pub rank: i32,
}

impl TableDescriptor {
    pub fn new(
        name: &str,
        columns: Vec<String>,
        primary_key: Vec<String>,
        key_type: Option<String>,
        rank: i32,
    ) -> Result<Self> {
        if primary_key.is_empty() {
            bail!("Table {} has no primary key", name);
        }
        if let Some(missing) = primary_key.iter().find(|c| !columns.contains(c)) {
            bail!("Primary key column {} is not a column of {}", missing, name);
        }
        let key_type = if primary_key.len() == 1 { key_type } else { None };

        Ok(Self {
            name: name.to_string(),
            columns,
            primary_key,
            key_type,
            rank,
        })
    }

    fn quoted(&self) -> String {
        quote_qualified(&self.name)
    }

    /// Text form of the row key, matching what capture triggers write to `row_id`.
    pub fn row_key_expr(&self) -> String {
        match self.primary_key.as_slice() {
            [single] => format!("{}::text", quote_ident(single)),
            cols => format!(
                "ROW({})::text",
                cols.iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn key_match(&self, param: &str) -> String {
        match (self.primary_key.as_slice(), &self.key_type) {
            ([single], Some(ty)) => format!("{} = {}::text::{}", quote_ident(single), param, ty),
            _ => format!("{} = {}::text", self.row_key_expr(), param),
        }
    }

    pub fn changes_sql(&self, change_log: &str) -> String {
        format!(
            "SELECT id, row_id FROM {} WHERE table_name = $1 ORDER BY id",
            quote_qualified(change_log)
        )
    }

    /// Fetch current contents of the requested rows as JSON documents.
    ///
    /// Each row comes back under the requested `row_id` text itself, never a
    /// re-rendered key, so `05` requested for key `5` is still found.
    pub fn fetch_sql(&self) -> String {
        let join = match (self.primary_key.as_slice(), &self.key_type) {
            ([single], Some(ty)) => format!(
                "swo_row.{} = swo_req.row_id::{}",
                quote_ident(single),
                ty
            ),
            ([single], None) => format!("swo_row.{}::text = swo_req.row_id", quote_ident(single)),
            (cols, _) => format!(
                "ROW({})::text = swo_req.row_id",
                cols.iter()
                    .map(|c| format!("swo_row.{}", quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        format!(
            "SELECT swo_req.row_id, to_jsonb(swo_row) AS data \
             FROM unnest($1::text[]) AS swo_req(row_id) JOIN {} swo_row ON {}",
            self.quoted(),
            join
        )
    }

    /// Upsert a JSON row; on key conflict every non-key column is overwritten.
    pub fn upsert_sql(&self) -> String {
        let quoted_columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let quoted_pk: Vec<String> = self
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect();

        let update_columns: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.primary_key.contains(c))
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect();

        let update_clause = if update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", update_columns.join(", "))
        };

        format!(
            "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
             ON CONFLICT ({pk}) {update}",
            table = self.quoted(),
            cols = quoted_columns.join(", "),
            pk = quoted_pk.join(", "),
            update = update_clause
        )
    }

    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", self.quoted(), self.key_match("$1"))
    }

    pub fn enable_triggers_sql(&self) -> String {
        format!("ALTER TABLE {} ENABLE TRIGGER USER", self.quoted())
    }

    pub fn prune_sql(change_log: &str) -> String {
        format!(
            "DELETE FROM {} WHERE table_name = $1 AND id <= $2 AND id = ANY($3)",
            quote_qualified(change_log)
        )
    }
}

/// Assign dependency ranks from foreign-key edges `(child, parent)`, given
/// as indexes into `names`. A table's rank is one more than its highest
/// ranked parent; roots get 0. Self-references are ignored.
pub fn rank_by_dependencies(names: &[String], edges: &[(usize, usize)]) -> Result<Vec<i32>> {
    let mut parents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    for &(child, parent) in edges {
        if child != parent {
            parents[child].push(parent);
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done(i32),
    }

    fn visit(idx: usize, parents: &[Vec<usize>], marks: &mut [Mark], names: &[String]) -> Result<i32> {
        match marks[idx] {
            Mark::Done(rank) => return Ok(rank),
            Mark::Visiting => bail!("Foreign key cycle involving table {}", names[idx]),
            Mark::New => {}
        }
        marks[idx] = Mark::Visiting;
        let mut rank = 0;
        for &parent in &parents[idx] {
            rank = rank.max(visit(parent, parents, marks, names)? + 1);
        }
        marks[idx] = Mark::Done(rank);
        Ok(rank)
    }

    let mut marks = vec![Mark::New; names.len()];
    (0..names.len())
        .map(|idx| visit(idx, &parents, &mut marks, names))
        .collect()
}

/// One destination write produced by a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Upsert {
        table: usize,
        row_id: String,
        data: Value,
    },
    Delete {
        table: usize,
        row_id: String,
    },
}

/// Per-table summary of the planned destination writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub upserts: usize,
    pub deletes: usize,
}

/// Change-log entries bounded for pruning on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRange {
    pub table: String,
    pub max_id: i64,
    pub ids: Vec<i64>,
}

#[derive(Debug, Default)]
struct TableChanges {
    entry_ids: Vec<i64>,
    max_id: i64,
    row_ids: BTreeSet<String>,
    fetched: BTreeMap<String, Value>,
}

/// Per-pass table sync state: pending row ids, fetched rows, prune bounds.
///
/// `tables` must already be sorted parents-first.
#[derive(Debug)]
pub struct TableSync<'a> {
    tables: &'a [TableDescriptor],
    change_log: &'a str,
    changes: Vec<TableChanges>,
}

impl<'a> TableSync<'a> {
    pub fn new(tables: &'a [TableDescriptor], change_log: &'a str) -> Self {
        Self {
            tables,
            change_log,
            changes: tables.iter().map(|_| TableChanges::default()).collect(),
        }
    }

    /// Queue one pending-changes read per table.
    pub fn add_batch_change_read(&self, batch: &mut Batch) {
        for table in self.tables {
            batch.query(
                format!("read changes for {}", table.name),
                table.changes_sql(self.change_log),
                vec![Box::new(table.name.clone())],
            );
        }
    }

    pub fn scan_batch_change_read(&mut self, res: &mut BatchResults) -> Result<()> {
        for idx in 0..self.tables.len() {
            let rows = res.next_rows()?;
            let entries = rows
                .iter()
                .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
                .collect::<Result<Vec<(i64, String)>, tokio_postgres::Error>>()
                .with_context(|| format!("Failed to scan changes for {}", self.tables[idx].name))?;
            self.record_changes(idx, entries);
        }
        Ok(())
    }

    /// Record change-log entries `(id, row_id)` for the table at `idx`.
    /// Repeated row ids collapse into a single pending row.
    pub fn record_changes(&mut self, idx: usize, entries: impl IntoIterator<Item = (i64, String)>) {
        let changes = &mut self.changes[idx];
        for (id, row_id) in entries {
            changes.max_id = changes.max_id.max(id);
            changes.entry_ids.push(id);
            changes.row_ids.insert(row_id);
        }
    }

    /// Indexes of tables with at least one pending row.
    pub fn pending_tables(&self) -> impl Iterator<Item = usize> + '_ {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.row_ids.is_empty())
            .map(|(idx, _)| idx)
    }

    pub fn change_entry_count(&self) -> usize {
        self.changes.iter().map(|c| c.entry_ids.len()).sum()
    }

    /// Queue one row fetch per table with pending rows.
    pub fn add_batch_row_reads(&self, batch: &mut Batch) {
        for idx in self.pending_tables() {
            let table = &self.tables[idx];
            let ids: Vec<String> = self.changes[idx].row_ids.iter().cloned().collect();
            batch.query(
                format!("read rows from {}", table.name),
                table.fetch_sql(),
                vec![Box::new(ids)],
            );
        }
    }

    pub fn scan_batch_row_reads(&mut self, res: &mut BatchResults) -> Result<()> {
        let pending: Vec<usize> = self.pending_tables().collect();
        for idx in pending {
            let rows = res.next_rows()?;
            let fetched = rows
                .iter()
                .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
                .collect::<Result<Vec<(String, Value)>, tokio_postgres::Error>>()
                .with_context(|| format!("Failed to scan rows of {}", self.tables[idx].name))?;
            self.record_rows(idx, fetched);
        }
        Ok(())
    }

    /// Record fetched `(row_id, row)` pairs for the table at `idx`.
    pub fn record_rows(&mut self, idx: usize, rows: impl IntoIterator<Item = (String, Value)>) {
        let changes = &mut self.changes[idx];
        for (row_id, data) in rows {
            changes.fetched.insert(row_id, data);
        }
    }

    /// Destination writes in apply order: upserts parents-first, then
    /// deletes children-first. A requested row missing from the fetch was
    /// deleted on the source.
    pub fn plan_writes(&self) -> Vec<RowWrite> {
        let mut writes = Vec::new();

        for (idx, changes) in self.changes.iter().enumerate() {
            for (row_id, data) in &changes.fetched {
                writes.push(RowWrite::Upsert {
                    table: idx,
                    row_id: row_id.clone(),
                    data: data.clone(),
                });
            }
        }

        for (idx, changes) in self.changes.iter().enumerate().rev() {
            for row_id in changes
                .row_ids
                .iter()
                .filter(|id| !changes.fetched.contains_key(*id))
            {
                writes.push(RowWrite::Delete {
                    table: idx,
                    row_id: row_id.clone(),
                });
            }
        }

        writes
    }

    /// Queue the planned writes, one statement per row.
    pub fn add_batch_writes(&self, batch: &mut Batch) -> WriteSummary {
        let mut summary = WriteSummary::default();
        for write in self.plan_writes() {
            match write {
                RowWrite::Upsert { table, row_id, data } => {
                    let table = &self.tables[table];
                    batch.execute(
                        format!("upsert {}/{}", table.name, row_id),
                        table.upsert_sql(),
                        vec![Box::new(data)],
                    );
                    summary.upserts += 1;
                }
                RowWrite::Delete { table, row_id } => {
                    let table = &self.tables[table];
                    batch.execute(
                        format!("delete {}/{}", table.name, row_id),
                        table.delete_sql(),
                        vec![Box::new(row_id)],
                    );
                    summary.deletes += 1;
                }
            }
        }
        summary
    }

    /// Queue `ENABLE TRIGGER USER` for every tracked table.
    pub fn add_batch_enable_triggers(&self, batch: &mut Batch) {
        for table in self.tables {
            batch.execute(
                format!("enable triggers on {}", table.name),
                table.enable_triggers_sql(),
                vec![],
            );
        }
    }

    /// Consumed change-log entries per table, bounded by the maximum id seen.
    pub fn prune_ranges(&self) -> Vec<PruneRange> {
        self.pending_tables()
            .map(|idx| PruneRange {
                table: self.tables[idx].name.clone(),
                max_id: self.changes[idx].max_id,
                ids: self.changes[idx].entry_ids.clone(),
            })
            .collect()
    }

    /// Number of pending rows per table name, for reporting.
    pub fn pending_counts(&self) -> HashMap<&str, usize> {
        self.pending_tables()
            .map(|idx| (self.tables[idx].name.as_str(), self.changes[idx].row_ids.len()))
            .collect()
    }
}

/// Delete consumed change-log entries. Runs outside any transaction after
/// the apply has committed; only entries a pass actually read are removed,
/// so entries committed behind its snapshot survive.
pub async fn exec_delete_changes(
    client: &Client,
    change_log: &str,
    ranges: &[PruneRange],
) -> Result<u64> {
    if ranges.is_empty() {
        return Ok(0);
    }

    let mut batch = Batch::new();
    for range in ranges {
        batch.execute(
            format!("delete changes for {}", range.table),
            TableDescriptor::prune_sql(change_log),
            vec![
                Box::new(range.table.clone()),
                Box::new(range.max_id),
                Box::new(range.ids.clone()),
            ],
        );
    }

    let mut res = batch.send(client).await?;
    let mut deleted = 0;
    for _ in 0..batch.len() {
        deleted += res.next_affected()?;
    }
    Ok(deleted)
}
