// ABOUTME: CLI entry point for pg-switchover
// ABOUTME: Parses commands, loads the switchover config and routes to handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_switchover::commands;
use pg_switchover::config::SwitchoverConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pg-switchover")]
#[command(about = "Keep a replacement PostgreSQL database in sync and cut over to it", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to switchover.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Source database URL (overrides source_url in the config)
    #[arg(long, env = "SWITCHOVER_SOURCE_URL", global = true)]
    source: Option<String>,
    /// Target database URL (overrides target_url in the config)
    #[arg(long, env = "SWITCHOVER_TARGET_URL", global = true)]
    target: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay pending changes from source to target (repeats until Ctrl+C)
    Sync {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Stop writers, replay the final delta and switch readers to the target
    FinalSync {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show the switchover state and pending change-log entries
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    pg_switchover::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config_path = cli.config.unwrap_or_else(SwitchoverConfig::default_path);
    let config = SwitchoverConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?
        .with_urls(cli.source, cli.target);
    config.validate()?;

    if let Ok((source, target)) = config.urls() {
        tracing::info!(
            "Source: {}",
            pg_switchover::utils::strip_password_from_url(source)?
        );
        tracing::info!(
            "Target: {}",
            pg_switchover::utils::strip_password_from_url(target)?
        );
    }

    match cli.command {
        Commands::Sync { once, interval } => {
            if interval == 0 {
                anyhow::bail!("--interval must be at least 1 second");
            }

            // Create shutdown channel
            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

            // Set up Ctrl+C handler
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Received shutdown signal");
                        let _ = shutdown_tx.send(());
                    }
                    Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
                }
            });

            commands::sync(&config, once, Duration::from_secs(interval), shutdown_rx).await
        }
        Commands::FinalSync { yes } => commands::final_sync(&config, yes).await,
        Commands::Status => commands::status(&config).await,
    }
}
