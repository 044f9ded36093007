use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::daemon::DaemonClientConfig;
use crate::db::DbConfig;
use crate::telemetry::{BackoffPolicy, RelayConfig};

/// Which registry backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub registry: RegistryBackend,
    pub database: DbConfig,
    pub daemon: DaemonClientConfig,
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("BERTH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = env_flag("BERTH_DEV");

        let registry = match std::env::var("BERTH_REGISTRY")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => RegistryBackend::Postgres,
            "memory" => RegistryBackend::Memory,
            other => bail!("BERTH_REGISTRY must be 'postgres' or 'memory', got '{other}'"),
        };

        let database = database_from_env()?;

        let daemon = DaemonClientConfig {
            timeout: Duration::from_secs(env_u64("BERTH_DAEMON_TIMEOUT_SECS", 10)?),
            tls: env_flag("BERTH_DAEMON_TLS"),
        };

        let reconnect = env_u64("BERTH_RELAY_RECONNECT_SECS", 5)?;
        let max_reconnect = env_u64("BERTH_RELAY_MAX_RECONNECT_SECS", reconnect)?.max(reconnect);
        let relay = RelayConfig {
            reconnect: BackoffPolicy {
                base: Duration::from_secs(reconnect),
                max: Duration::from_secs(max_reconnect),
                jitter: if max_reconnect > reconnect { 0.25 } else { 0.0 },
            },
            backlog_lines: env_u64("BERTH_RELAY_BACKLOG_LINES", 100)? as usize,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            registry,
            database,
            daemon,
            relay,
        })
    }
}

fn database_from_env() -> Result<DbConfig> {
    database_from(|name| std::env::var(name).ok())
}

fn database_from(var: impl Fn(&str) -> Option<String>) -> Result<DbConfig> {
    let defaults = DbConfig::default();
    let number = |name: &str, default: u64| parse_u64(name, var(name), default);

    let max_connections = number("BERTH_DB_MAX_CONNECTIONS", defaults.max_connections.into())?;
    let min_connections = number("BERTH_DB_MIN_CONNECTIONS", defaults.min_connections.into())?;
    if max_connections == 0 || min_connections > max_connections {
        bail!(
            "BERTH_DB_MIN_CONNECTIONS ({min_connections}) must not exceed a non-zero BERTH_DB_MAX_CONNECTIONS ({max_connections})"
        );
    }

    Ok(DbConfig {
        database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
        max_connections: u32::try_from(max_connections)?,
        min_connections: u32::try_from(min_connections)?,
        acquire_timeout: Duration::from_secs(number(
            "BERTH_DB_ACQUIRE_TIMEOUT_SECS",
            defaults.acquire_timeout.as_secs(),
        )?),
        statement_timeout: Duration::from_secs(number(
            "BERTH_DB_STATEMENT_TIMEOUT_SECS",
            defaults.statement_timeout.as_secs(),
        )?),
        migrations_dir: var("BERTH_MIGRATIONS_DIR")
            .map(Into::into)
            .unwrap_or(defaults.migrations_dir),
    })
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    parse_u64(name, std::env::var(name).ok(), default)
}

fn parse_u64(name: &str, value: Option<String>, default: u64) -> Result<u64> {
    match value {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => bail!("{name} must be an unsigned integer: {e}"),
        },
        None => Ok(default),
    }
}
