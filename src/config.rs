// ABOUTME: Switchover configuration loaded from TOML
// ABOUTME: Describes both databases, tracked tables and sequences, lock keys and timeouts

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils;

/// A tracked table as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Table name as recorded in the change log (optionally `schema.table`)
    pub name: String,
    /// Primary key columns; read from the catalog when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    /// Dependency rank (parents lower); derived from foreign keys when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i32>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchoverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default = "default_change_log_table")]
    pub change_log_table: String,
    #[serde(default = "default_switchover_table")]
    pub switchover_table: String,
    /// Advisory lock key held by a running sync pass
    #[serde(default = "default_sync_lock_key")]
    pub sync_lock_key: i64,
    /// Advisory lock key application writers share-lock before committing
    #[serde(default = "default_stop_the_world_lock_key")]
    pub stop_the_world_lock_key: i64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Whole-pass deadline; 0 disables it
    #[serde(default = "default_pass_timeout_secs")]
    pub pass_timeout_secs: u64,
    #[serde(default)]
    pub sequences: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

fn default_change_log_table() -> String {
    "change_log".to_string()
}

fn default_switchover_table() -> String {
    "switchover_state".to_string()
}

fn default_sync_lock_key() -> i64 {
    4369
}

fn default_stop_the_world_lock_key() -> i64 {
    4370
}

fn default_lock_timeout_ms() -> u64 {
    15_000
}

fn default_pass_timeout_secs() -> u64 {
    300
}

impl Default for SwitchoverConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            target_url: None,
            change_log_table: default_change_log_table(),
            switchover_table: default_switchover_table(),
            sync_lock_key: default_sync_lock_key(),
            stop_the_world_lock_key: default_stop_the_world_lock_key(),
            lock_timeout_ms: default_lock_timeout_ms(),
            pass_timeout_secs: default_pass_timeout_secs(),
            sequences: Vec::new(),
            tables: Vec::new(),
        }
    }
}

impl SwitchoverConfig {
    /// Parse a config from TOML text without validating it.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse switchover config")
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config location in the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from("switchover.toml")
    }

    /// Apply command-line overrides for the connection URLs.
    pub fn with_urls(mut self, source: Option<String>, target: Option<String>) -> Self {
        if source.is_some() {
            self.source_url = source;
        }
        if target.is_some() {
            self.target_url = target;
        }
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pass_timeout(&self) -> Option<Duration> {
        match self.pass_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Both URLs, or an error naming the missing one.
    pub fn urls(&self) -> Result<(&str, &str)> {
        let source = self
            .source_url
            .as_deref()
            .context("Source database URL not set (use --source or source_url)")?;
        let target = self
            .target_url
            .as_deref()
            .context("Target database URL not set (use --target or target_url)")?;
        Ok((source, target))
    }

    /// Check identifiers, uniqueness and lock keys.
    ///
    /// URLs are checked only when present, since they may still come from
    /// the command line.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("Config must list at least one table under [[tables]]");
        }

        utils::validate_postgres_identifier(&self.change_log_table)
            .context("Invalid change_log_table")?;
        utils::validate_postgres_identifier(&self.switchover_table)
            .context("Invalid switchover_table")?;

        let mut seen = HashSet::new();
        for table in &self.tables {
            utils::validate_postgres_identifier(&table.name)
                .with_context(|| format!("Invalid table name {:?}", table.name))?;
            if !seen.insert(table.name.as_str()) {
                bail!("Table {} is listed more than once", table.name);
            }
            if let Some(pk) = &table.primary_key {
                if pk.is_empty() {
                    bail!("Table {} has an empty primary_key list", table.name);
                }
                for column in pk {
                    utils::validate_postgres_identifier(column).with_context(|| {
                        format!("Invalid primary key column for {}", table.name)
                    })?;
                }
            }
        }

        let mut seen = HashSet::new();
        for sequence in &self.sequences {
            utils::validate_postgres_identifier(sequence)
                .with_context(|| format!("Invalid sequence name {:?}", sequence))?;
            if !seen.insert(sequence.as_str()) {
                bail!("Sequence {} is listed more than once", sequence);
            }
        }

        if self.sync_lock_key == self.stop_the_world_lock_key {
            bail!("sync_lock_key and stop_the_world_lock_key must differ");
        }

        for url in [&self.source_url, &self.target_url].into_iter().flatten() {
            utils::validate_connection_string(url)?;
        }
        if let (Some(source), Some(target)) = (&self.source_url, &self.target_url) {
            utils::validate_source_target_different(source, target)?;
        }

        Ok(())
    }
}
