// ABOUTME: Incremental sync command - runs passes once or on an interval
// ABOUTME: Reconnects after lost connections and stops once the cutover is observed

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::config::SwitchoverConfig;
use crate::swosync::{LogicalReplicator, SwitchoverPhase, SyncError, SyncStats};

/// Run incremental sync passes against the configured databases.
///
/// With `once`, a single pass runs and its error is returned. Otherwise
/// passes repeat every `every` until shutdown is signalled; failed passes
/// are logged and retried on the next tick.
pub async fn sync(
    config: &SwitchoverConfig,
    once: bool,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut replicator = LogicalReplicator::connect(config).await?;
    tracing::info!(
        "Connected; tracking {} tables and {} sequences",
        replicator.tables().len(),
        config.sequences.len()
    );

    if once {
        let stats = replicator.incremental_sync().await?;
        print_stats(&stats);
        return Ok(());
    }

    println!();
    println!("========================================");
    println!("Starting incremental switchover sync");
    println!("========================================");
    println!("  Sync interval: {}s", every.as_secs());
    println!("  Press Ctrl+C to stop");
    println!();

    let mut ticker = interval(every);
    let mut passes = 0u64;
    let mut failures = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received, stopping sync");
                break;
            }
            _ = ticker.tick() => {
                if replicator.is_closed() {
                    tracing::warn!("Database connection lost, reconnecting");
                    match LogicalReplicator::connect(config).await {
                        Ok(fresh) => replicator = fresh,
                        Err(e) => {
                            tracing::error!("Reconnect failed: {:#}", e);
                            continue;
                        }
                    }
                }

                passes += 1;
                tracing::debug!("Starting sync pass {}", passes);

                // Dropping the pass on shutdown rolls back its transactions.
                let result = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        tracing::info!("Shutdown signal received during sync pass, aborting");
                        break;
                    }
                    result = replicator.incremental_sync() => result,
                };

                match result {
                    Ok(stats) => {
                        if stats.change_entries > 0 {
                            tracing::info!(
                                "Pass {}: {} upserts, {} deletes across {} tables",
                                passes,
                                stats.rows_upserted,
                                stats.rows_deleted,
                                stats.tables_changed
                            );
                        }
                    }
                    Err(SyncError::NotInProgress { state: SwitchoverPhase::UseNextDb, .. }) => {
                        tracing::info!("Switchover already completed, nothing left to sync");
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        bail!("Sync pass {} failed fatally: {}", passes, e);
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::error!("Sync pass {} failed: {}", passes, e);
                    }
                }
            }
        }
    }

    tracing::info!("Sync stopped after {} passes ({} failed)", passes, failures);
    Ok(())
}

/// Print a pass summary to stdout.
pub fn print_stats(stats: &SyncStats) {
    println!();
    println!("========================================");
    println!("{} sync complete", capitalize(&stats.mode.to_string()));
    println!("========================================");
    println!("  Change entries:      {}", stats.change_entries);
    println!("  Tables changed:      {}", stats.tables_changed);
    println!("  Rows upserted:       {}", stats.rows_upserted);
    println!("  Rows deleted:        {}", stats.rows_deleted);
    println!("  Sequences advanced:  {}", stats.sequences_advanced);
    match stats.pruned {
        Some(n) => println!("  Change-log pruned:   {}", n),
        None => println!("  Change-log pruned:   failed (see log)"),
    }
    println!("  Duration:            {}ms", stats.duration_ms);
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
