//! netlag
//!
//! Standalone latency-injecting TCP proxy.
//!
//! This binary:
//! - Listens for clients and pairs each one with a connection to the target
//! - Delays traffic per direction as configured
//! - Closes every session on Ctrl-C before exiting

use anyhow::Result;
use netlag::TcpProxy;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to NETLAG_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting netlag");
    info!(
        target_host = %config.target_host,
        target_port = config.target_port,
        read_delay_ms = config.read_delay.as_millis() as u64,
        write_delay_ms = config.write_delay.as_millis() as u64,
        buffered = config.buffered,
        "Configuration loaded"
    );

    let proxy = TcpProxy::new(config.proxy_config());
    let listen_addr = proxy.start(Some(netlag::DEFAULT_TIMEOUT)).await?;
    info!(listen_addr = %listen_addr, proxy = %proxy, "Accepting clients");

    tokio::signal::ctrl_c().await?;
    info!(sessions = proxy.session_count(), "Shutdown signal received");

    if let Err(e) = proxy.close(Some(config.shutdown_timeout)).await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }

    let stats = proxy.stats();
    info!(
        sessions_accepted = stats.sessions_accepted.load(std::sync::atomic::Ordering::Relaxed),
        upstream_failures = stats.upstream_failures.load(std::sync::atomic::Ordering::Relaxed),
        "netlag stopped"
    );
    Ok(())
}
