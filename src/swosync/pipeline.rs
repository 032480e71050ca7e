// ABOUTME: Ordered statement batches executed in a single pipelined round trip
// ABOUTME: Responses are consumed in queue order, mirroring the request order

use anyhow::{anyhow, Result};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Row, Statement};

/// Owned statement parameter.
pub type Param = Box<dyn ToSql + Sync + Send>;

/// Failure of one statement in a sent batch.
#[derive(Debug, thiserror::Error)]
#[error("{label} failed: {source}")]
pub struct BatchError {
    /// Queue position of the failing statement
    pub index: usize,
    pub label: String,
    #[source]
    pub source: tokio_postgres::Error,
}

/// What the caller expects back from a queued statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The statement returns rows that will be scanned.
    Rows,
    /// Only the affected row count is of interest.
    Affected,
}

/// A single queued statement.
pub struct QueuedStatement {
    pub label: String,
    pub sql: String,
    pub params: Vec<Param>,
    pub expect: Expect,
}

impl std::fmt::Debug for QueuedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedStatement")
            .field("label", &self.label)
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .field("expect", &self.expect)
            .finish()
    }
}

/// An ordered queue of statements bound for one connection or transaction.
///
/// Statements are sent together: every distinct SQL text is prepared in one
/// pipelined round trip, then all statements are executed in a second one.
/// The server still runs them one after another, in queue order.
#[derive(Debug, Default)]
pub struct Batch {
    statements: Vec<QueuedStatement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a statement whose rows will be scanned.
    pub fn query(&mut self, label: impl Into<String>, sql: impl Into<String>, params: Vec<Param>) {
        self.push(label.into(), sql.into(), params, Expect::Rows);
    }

    /// Queue a statement whose affected row count will be scanned.
    pub fn execute(
        &mut self,
        label: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Param>,
    ) {
        self.push(label.into(), sql.into(), params, Expect::Affected);
    }

    fn push(&mut self, label: String, sql: String, params: Vec<Param>, expect: Expect) {
        self.statements.push(QueuedStatement {
            label,
            sql,
            params,
            expect,
        });
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[QueuedStatement] {
        &self.statements
    }

    /// Send the batch and wait for every response.
    ///
    /// Futures are first polled in queue order, which is the order the
    /// requests are written to the connection. The first failing statement
    /// (in queue order) determines the error.
    pub async fn send<C>(&self, client: &C) -> Result<BatchResults, BatchError>
    where
        C: GenericClient + Sync,
    {
        if self.statements.is_empty() {
            return Ok(BatchResults::default());
        }

        let prepared = self.prepare_all(client).await?;

        let param_refs: Vec<Vec<&(dyn ToSql + Sync)>> = self
            .statements
            .iter()
            .map(|stmt| {
                stmt.params
                    .iter()
                    .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                    .collect()
            })
            .collect();

        let futures: Vec<BoxFuture<'_, Result<Response, BatchError>>> = self
            .statements
            .iter()
            .zip(param_refs.iter())
            .enumerate()
            .map(|(index, (stmt, params))| {
                let statement = &prepared[stmt.sql.as_str()];
                let label = stmt.label.as_str();
                let tag = move |source| BatchError {
                    index,
                    label: label.to_string(),
                    source,
                };
                match stmt.expect {
                    Expect::Rows => client
                        .query(statement, params)
                        .map(move |res| res.map(Response::Rows).map_err(tag))
                        .boxed(),
                    Expect::Affected => client
                        .execute(statement, params)
                        .map(move |res| res.map(Response::Affected).map_err(tag))
                        .boxed(),
                }
            })
            .collect();

        let responses = try_join_all(futures).await?;
        Ok(BatchResults {
            responses: self
                .statements
                .iter()
                .map(|s| s.label.clone())
                .zip(responses)
                .collect(),
        })
    }

    async fn prepare_all<C>(&self, client: &C) -> Result<HashMap<&str, Statement>, BatchError>
    where
        C: GenericClient + Sync,
    {
        let mut distinct: Vec<(usize, &QueuedStatement)> = Vec::new();
        for (index, stmt) in self.statements.iter().enumerate() {
            if !distinct.iter().any(|(_, seen)| seen.sql == stmt.sql) {
                distinct.push((index, stmt));
            }
        }

        let prepared = try_join_all(distinct.iter().map(|&(index, stmt)| {
            client.prepare(&stmt.sql).map(move |res| {
                res.map_err(|source| BatchError {
                    index,
                    label: format!("prepare {}", stmt.label),
                    source,
                })
            })
        }))
        .await?;

        Ok(distinct
            .into_iter()
            .map(|(_, stmt)| stmt.sql.as_str())
            .zip(prepared)
            .collect())
    }
}

#[derive(Debug)]
enum Response {
    Rows(Vec<Row>),
    Affected(u64),
}

/// Responses of a sent [`Batch`], consumed front to back.
#[derive(Debug, Default)]
pub struct BatchResults {
    responses: VecDeque<(String, Response)>,
}

impl BatchResults {
    /// Rows of the next queued statement.
    pub fn next_rows(&mut self) -> Result<Vec<Row>> {
        match self.responses.pop_front() {
            Some((_, Response::Rows(rows))) => Ok(rows),
            Some((label, Response::Affected(_))) => {
                Err(anyhow!("{} was queued without rows", label))
            }
            None => Err(anyhow!("batch results exhausted")),
        }
    }

    /// Affected row count of the next queued statement.
    pub fn next_affected(&mut self) -> Result<u64> {
        match self.responses.pop_front() {
            Some((_, Response::Affected(n))) => Ok(n),
            Some((_, Response::Rows(rows))) => Ok(rows.len() as u64),
            None => Err(anyhow!("batch results exhausted")),
        }
    }

    /// Skip the next response, returning its label.
    pub fn skip(&mut self) -> Result<String> {
        self.responses
            .pop_front()
            .map(|(label, _)| label)
            .ok_or_else(|| anyhow!("batch results exhausted"))
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.responses.len()
    }
}
