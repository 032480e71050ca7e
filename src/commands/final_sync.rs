// ABOUTME: Final sync command - stops writers, replays the last delta and cuts over
// ABOUTME: Asks for confirmation first and never retries a failed cutover

use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};

use crate::config::SwitchoverConfig;
use crate::swosync::{LogicalReplicator, SwitchoverPhase};

use super::sync::print_stats;

/// Run the one-time final sync.
///
/// `yes` skips the interactive confirmation.
pub async fn final_sync(config: &SwitchoverConfig, yes: bool) -> Result<()> {
    let mut replicator = LogicalReplicator::connect(config).await?;

    let state = replicator.switchover_state().await?;
    if state.current_state != SwitchoverPhase::InProgress {
        bail!(
            "Switchover is {}, expected in_progress. Final sync is only valid during a switchover.",
            state.current_state
        );
    }

    let pending: i64 = replicator
        .pending_changes()
        .await?
        .iter()
        .map(|(_, n)| *n)
        .sum();

    println!();
    println!("========================================");
    println!("Final switchover sync");
    println!("========================================");
    println!("  Database id:      {}", state.db_id);
    println!("  Pending changes:  {}", pending);
    println!();
    println!("Application writers will block on the stop-the-world lock until the");
    println!("cutover commits. Once it does, readers of the switchover state move");
    println!("to the new database. This cannot be undone by this tool.");
    println!();

    if !yes {
        let confirm = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Stop writers and cut over now?")
            .default(false)
            .interact()?;
        if !confirm {
            bail!("Final sync cancelled by user");
        }
    }

    tracing::info!("Starting final sync");
    match replicator.final_sync().await {
        Ok(stats) => {
            print_stats(&stats);
            println!();
            println!("Switchover state is now {}.", SwitchoverPhase::UseNextDb);
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            println!();
            println!("Final sync failed in phase '{}'.", e.sync_phase());
            println!("Do not retry automatically: inspect {} first.", config.switchover_table);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
