//! Proxy daemon configuration (env-driven).

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use netlag::{ProxyConfig, DEFAULT_CHUNK_SIZE, DEFAULT_LISTEN_HOST};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream host every client is paired with.
    pub target_host: String,

    /// Upstream port.
    pub target_port: u16,

    /// Listen host.
    pub listen_host: IpAddr,

    /// Listen port. Ephemeral when unset.
    pub listen_port: Option<u16>,

    /// Initial client to target delay.
    pub read_delay: Duration,

    /// Initial target to client delay.
    pub write_delay: Duration,

    /// Queue writes instead of waiting for each to drain.
    pub buffered: bool,

    /// Maximum bytes read per chunk.
    pub chunk_size: usize,

    /// Bound on the shutdown sequence.
    pub shutdown_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let target = var("NETLAG_TARGET").context("Missing target. Set NETLAG_TARGET=host:port.")?;
        let (target_host, target_port) = parse_target(&target)?;

        let listen_host: IpAddr = var("NETLAG_LISTEN_HOST")
            .map(|v| v.parse())
            .transpose()
            .context("NETLAG_LISTEN_HOST must be an IP address.")?
            .unwrap_or(DEFAULT_LISTEN_HOST);

        let listen_port: Option<u16> = var("NETLAG_LISTEN_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("NETLAG_LISTEN_PORT must be a port number.")?;

        let read_delay = millis(&var, "NETLAG_READ_DELAY_MS")?.unwrap_or_default();
        let write_delay = millis(&var, "NETLAG_WRITE_DELAY_MS")?.unwrap_or_default();

        let buffered = var("NETLAG_BUFFERED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let chunk_size: usize = var("NETLAG_CHUNK_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("NETLAG_CHUNK_SIZE must be an integer (bytes).")?
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .max(1);

        let shutdown_timeout =
            millis(&var, "NETLAG_SHUTDOWN_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(10));

        let log_level = var("NETLAG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            target_host,
            target_port,
            listen_host,
            listen_port,
            read_delay,
            write_delay,
            buffered,
            chunk_size,
            shutdown_timeout,
            log_level,
        })
    }

    /// Proxy settings derived from this configuration.
    pub fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.target_host.clone(), self.target_port)
            .with_listen_host(self.listen_host)
            .with_buffered(self.buffered)
            .with_chunk_size(self.chunk_size)
            .with_delay(self.read_delay, self.write_delay);
        if let Some(port) = self.listen_port {
            config = config.with_listen_port(port);
        }
        config
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let value: Option<u64> = var(key)
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;
    Ok(value.map(Duration::from_millis))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("NETLAG_TARGET must be host:port, got {target:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("NETLAG_TARGET has an empty host: {target:?}"));
    }
    let port = port
        .parse()
        .with_context(|| format!("NETLAG_TARGET has an invalid port: {target:?}"))?;
    Ok((host.to_string(), port))
}
