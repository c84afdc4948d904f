//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use idempotency::IdempotencyConfig;
use saga::SagaConfig;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL stores when set, in-memory stores otherwise
/// - `SAGA_WORKERS`: reply consumers (default 4)
/// - `RELAY_INTERVAL_MS`, `SWEEP_INTERVAL_MS`: background tick intervals
/// - `MAX_STEP_ATTEMPTS`: attempts per forward step before it times out
/// - `RESERVATION_DEADLINE_SECS`, `PAYMENT_DEADLINE_SECS`: step deadlines
/// - `COMPENSATION_CEILING_SECS`: escalation threshold for compensations
/// - `IDEMPOTENCY_TTL_SECS`: how long command keys are remembered
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub saga_workers: usize,
    pub relay_interval: Duration,
    pub sweep_interval: Duration,
    pub idempotency_purge_interval: Duration,
    pub max_step_attempts: u32,
    pub reservation_deadline: Duration,
    pub payment_deadline: Duration,
    pub compensation_ceiling: Duration,
    pub idempotency_ttl: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_secs).unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| f.parse().ok())
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            saga_workers: parsed("SAGA_WORKERS")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.saga_workers),
            relay_interval: millis("RELAY_INTERVAL_MS", defaults.relay_interval),
            sweep_interval: millis("SWEEP_INTERVAL_MS", defaults.sweep_interval),
            idempotency_purge_interval: defaults.idempotency_purge_interval,
            max_step_attempts: parsed("MAX_STEP_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_step_attempts),
            reservation_deadline: secs("RESERVATION_DEADLINE_SECS", defaults.reservation_deadline),
            payment_deadline: secs("PAYMENT_DEADLINE_SECS", defaults.payment_deadline),
            compensation_ceiling: secs("COMPENSATION_CEILING_SECS", defaults.compensation_ceiling),
            idempotency_ttl: secs("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Saga timing derived from this configuration.
    pub fn saga_config(&self) -> SagaConfig {
        let mut config = SagaConfig {
            reservation_deadline: self.reservation_deadline,
            payment_deadline: self.payment_deadline,
            compensation_ceiling: self.compensation_ceiling,
            ..SagaConfig::default()
        };
        config.step_retry.max_attempts = self.max_step_attempts;
        config
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            ttl: self.idempotency_ttl,
            ..IdempotencyConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let saga = SagaConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            saga_workers: 4,
            relay_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(1),
            idempotency_purge_interval: Duration::from_secs(60),
            max_step_attempts: saga.step_retry.max_attempts,
            reservation_deadline: saga.reservation_deadline,
            payment_deadline: saga.payment_deadline,
            compensation_ceiling: saga.compensation_ceiling,
            idempotency_ttl: IdempotencyConfig::default().ttl,
        }
    }
}
