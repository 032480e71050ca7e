// ABOUTME: Catalog introspection for tracked tables
// ABOUTME: Reads column lists, primary keys and foreign-key edges from pg_catalog

use anyhow::{bail, Context, Result};
use tokio_postgres::Client;

use crate::utils::quote_qualified;

/// Column and key layout of a single table as seen by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub oid: u32,
    /// Writable columns in ordinal order (dropped and generated columns excluded)
    pub columns: Vec<String>,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
    /// SQL type of each primary key column, parallel to `primary_key`
    pub primary_key_types: Vec<String>,
}

/// Load column and primary key metadata for `table` (optionally `schema.table`).
pub async fn load_table_metadata(client: &Client, table: &str) -> Result<TableMetadata> {
    let regclass = quote_qualified(table);

    let row = client
        .query_opt("SELECT to_regclass($1::text)::oid", &[&regclass])
        .await
        .with_context(|| format!("Failed to resolve table {}", table))?;
    let oid: Option<u32> = row.and_then(|r| r.get(0));
    let Some(oid) = oid else {
        bail!("Table {} does not exist", table);
    };

    let column_rows = client
        .query(
            "SELECT a.attname::text
             FROM pg_attribute a
             WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped
               AND a.attgenerated = ''
             ORDER BY a.attnum",
            &[&oid],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}", table))?;

    let key_rows = client
        .query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = $1 AND i.indisprimary
             ORDER BY array_position(i.indkey::int2[], a.attnum)",
            &[&oid],
        )
        .await
        .with_context(|| format!("Failed to get primary key for {}", table))?;

    Ok(TableMetadata {
        oid,
        columns: column_rows.iter().map(|row| row.get(0)).collect(),
        primary_key: key_rows.iter().map(|row| row.get(0)).collect(),
        primary_key_types: key_rows.iter().map(|row| row.get(1)).collect(),
    })
}

/// Foreign-key edges `(child_oid, parent_oid)` among the given tables.
///
/// Edges pointing outside the set are dropped; self-references are kept and
/// left for the caller to ignore.
pub async fn load_foreign_keys(client: &Client, oids: &[u32]) -> Result<Vec<(u32, u32)>> {
    let oids = oids.to_vec();
    let rows = client
        .query(
            "SELECT c.conrelid, c.confrelid
             FROM pg_constraint c
             WHERE c.contype = 'f'
               AND c.conrelid = ANY($1)
               AND c.confrelid = ANY($1)",
            &[&oids],
        )
        .await
        .context("Failed to read foreign key constraints")?;

    Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
}
