// Environment-driven configuration
//
// Binaries call `dotenvy::dotenv().ok()` first, then `CoreConfig::from_env()`.
// Everything has a default except the database URL.

use std::str::FromStr;
use std::time::Duration;

use crate::capabilities::Tier;
use crate::error::{Result, SpineError};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(SpineError::Config(format!("unknown log format: {other}"))),
        }
    }
}

/// Core configuration shared by the API server, worker and CLI
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub tier: Tier,
    /// Pooled-mode worker concurrency
    pub worker_concurrency: usize,
    /// Hard per-execution timeout
    pub execution_timeout: Duration,
    /// Scheduler tick interval
    pub scheduler_interval: Duration,
    /// A schedule firing missed by more than this is skipped
    pub misfire_grace: Duration,
    /// A running execution without a heartbeat for this long is stale
    pub heartbeat_timeout: Duration,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("SPINE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| SpineError::Config("SPINE_DATABASE_URL is not set".to_string()))?;

        let log_level = std::env::var("SPINE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = std::env::var("SPINE_LOG_FORMAT")
            .ok()
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();
        let tier = std::env::var("SPINE_TIER")
            .ok()
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            database_url,
            log_level,
            log_format,
            tier,
            worker_concurrency: env_usize("SPINE_WORKER_CONCURRENCY")?
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
            execution_timeout: env_secs("SPINE_EXECUTION_TIMEOUT_SECS")?
                .unwrap_or(Duration::from_secs(3600)),
            scheduler_interval: env_secs("SPINE_SCHEDULER_INTERVAL_SECS")?
                .unwrap_or(Duration::from_secs(15)),
            misfire_grace: env_secs("SPINE_MISFIRE_GRACE_SECS")?
                .unwrap_or(Duration::from_secs(300)),
            heartbeat_timeout: env_secs("SPINE_HEARTBEAT_TIMEOUT_SECS")?
                .unwrap_or(Duration::from_secs(120)),
        })
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| SpineError::Config(format!("{name} must be an integer, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    Ok(env_usize(name)?.map(|n| Duration::from_secs(n as u64)))
}

/// Initialize the tracing subscriber from config.
///
/// Console format for interactive use, JSON for log shippers.
pub fn init_tracing(log_level: &str, format: LogFormat) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_level.into());

    match format {
        LogFormat::Console => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("console".parse::<LogFormat>().unwrap(), LogFormat::Console);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
