// ABOUTME: Sequence synchronizer - copies sequence positions from source to destination
// ABOUTME: Destination sequences only ever move forward

use anyhow::{anyhow, Context, Result};

use super::pipeline::{Batch, BatchResults};
use crate::utils::{quote_literal, quote_qualified};

/// Position of a sequence observed on the source during one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    pub name: String,
    pub last_value: i64,
    pub is_called: bool,
}

/// Reads source sequence values and advances destination sequences to match.
#[derive(Debug)]
pub struct SequenceSync {
    names: Vec<String>,
    observed: Vec<SequenceState>,
}

impl SequenceSync {
    pub fn new(names: &[String]) -> Self {
        Self {
            names: names.to_vec(),
            observed: Vec::with_capacity(names.len()),
        }
    }

    /// Queue one current-value read per sequence.
    pub fn add_batch_reads(&self, batch: &mut Batch) {
        for name in &self.names {
            batch.query(
                format!("read sequence {}", name),
                format!(
                    "SELECT last_value, is_called FROM {}",
                    quote_qualified(name)
                ),
                vec![],
            );
        }
    }

    /// Scan the reads queued by [`add_batch_reads`](Self::add_batch_reads).
    pub fn scan_batch_reads(&mut self, res: &mut BatchResults) -> Result<()> {
        self.observed.clear();
        for name in &self.names {
            let rows = res.next_rows()?;
            let row = rows
                .first()
                .ok_or_else(|| anyhow!("sequence {} returned no rows", name))?;
            let last_value: i64 = row
                .try_get(0)
                .with_context(|| format!("Failed to read last_value of {}", name))?;
            let is_called: bool = row
                .try_get(1)
                .with_context(|| format!("Failed to read is_called of {}", name))?;
            self.observed.push(SequenceState {
                name: name.clone(),
                last_value,
                is_called,
            });
        }
        Ok(())
    }

    /// Queue one forward-only advance per observed sequence.
    ///
    /// `setval` only runs when the destination sits behind the observed
    /// position, so a destination that is already ahead is left untouched.
    pub fn add_batch_writes(&self, batch: &mut Batch) {
        for state in &self.observed {
            batch.query(
                format!("advance sequence {}", state.name),
                advance_sql(&state.name),
                vec![Box::new(state.last_value), Box::new(state.is_called)],
            );
        }
    }

    /// Count how many destination sequences actually moved.
    pub fn scan_batch_writes(&self, res: &mut BatchResults) -> Result<usize> {
        let mut advanced = 0;
        for _ in &self.observed {
            if !res.next_rows()?.is_empty() {
                advanced += 1;
            }
        }
        Ok(advanced)
    }
}

fn advance_sql(name: &str) -> String {
    let quoted = quote_qualified(name);
    format!(
        "SELECT pg_catalog.setval({}, $1, $2) FROM {} \
         WHERE last_value < $1 OR (last_value = $1 AND NOT is_called AND $2)",
        quote_literal(&quoted),
        quoted
    )
}
