// ABOUTME: Status command - shows the switchover state and pending change-log entries
// ABOUTME: Read-only; safe to run while a sync loop is active

use anyhow::Result;

use crate::config::SwitchoverConfig;
use crate::swosync::LogicalReplicator;

pub async fn status(config: &SwitchoverConfig) -> Result<()> {
    let replicator = LogicalReplicator::connect(config).await?;
    let state = replicator.switchover_state().await?;
    let pending = replicator.pending_changes().await?;

    println!();
    println!("========================================");
    println!("Switchover status");
    println!("========================================");
    println!("  State:        {}", state.current_state);
    println!("  Healthy:      {}", if state.ok { "yes" } else { "no" });
    println!("  Database id:  {}", state.db_id);
    println!();
    println!("Pending change-log entries:");
    let width = pending.iter().map(|(t, _)| t.len()).max().unwrap_or(0);
    for (table, count) in &pending {
        println!("  {:<width$}  {}", table, count, width = width);
    }
    println!(
        "  {:<width$}  {}",
        "total",
        pending.iter().map(|(_, n)| n).sum::<i64>(),
        width = width
    );

    Ok(())
}
