// ABOUTME: PostgreSQL connection setup with TLS and retry support
// ABOUTME: Spawns the connection task and tags sessions with an application name

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils;

/// Application name reported in `pg_stat_activity` for replicator sessions.
pub const APPLICATION_NAME: &str = "pg-switchover";

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS certificate policy.
///
/// Only the first call has an effect; later calls are ignored.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized, ignoring");
    }
    if allow_self_signed_certs {
        tracing::warn!("TLS certificate verification is disabled (--allow-self-signed-certs)");
    }
}

fn make_tls() -> Result<MakeTlsConnector> {
    let allow_self_signed = ALLOW_SELF_SIGNED.get().copied().unwrap_or(false);
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL and spawn the connection driver task.
///
/// `sslmode` in the URL decides whether TLS is negotiated.
pub async fn connect(url: &str) -> Result<Client> {
    let mut config: tokio_postgres::Config = url
        .parse()
        .context("Failed to parse PostgreSQL connection string")?;
    config.application_name(APPLICATION_NAME);

    let display_url = utils::strip_password_from_url(url).unwrap_or_else(|_| "<url>".to_string());
    let (client, connection) = config
        .connect(make_tls()?)
        .await
        .with_context(|| format!("Failed to connect to {}", display_url))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection to {} closed: {}", display_url, e);
        }
    });

    Ok(client)
}

/// Ask the server to cancel whatever `client` is currently running.
///
/// Sent over a separate connection; a no-op when the session is idle.
pub async fn cancel_query(client: &Client) -> Result<()> {
    client
        .cancel_token()
        .cancel_query(make_tls()?)
        .await
        .context("Failed to send cancel request")
}

/// Connect with exponential backoff (3 retries starting at 1s).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    utils::retry_with_backoff("Connect", 3, Duration::from_secs(1), || connect(url)).await
}
