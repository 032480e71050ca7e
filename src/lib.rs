// ABOUTME: Library crate for pg-switchover
// ABOUTME: Exposes config, connection helpers and the switchover sync engine

pub mod commands;
pub mod config;
pub mod postgres;
pub mod swosync;
pub mod utils;

pub use config::{SwitchoverConfig, TableConfig};
pub use swosync::{LogicalReplicator, SyncError, SyncPhase, SyncStats};
