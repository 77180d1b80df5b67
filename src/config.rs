//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between free-running ticks.
    pub tick_interval: Duration,
    /// How long pending steps may stay unrunnable before the task fails.
    pub deadlock_timeout: Duration,
    /// Start in deterministic (manually ticked, single-step) mode.
    pub deterministic: bool,
    /// Override for the number of step transitions applied per task per tick.
    /// Values below 1 fall back to the mode default.
    pub max_transitions_per_tick: Option<i64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            deadlock_timeout: Duration::from_secs(30 * 60),
            deterministic: false,
            max_transitions_per_tick: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: Duration::from_millis(env_or(
                "SCANORCH_TICK_INTERVAL_MS",
                defaults.tick_interval.as_millis() as u64,
            )?),
            deadlock_timeout: Duration::from_secs(env_or(
                "SCANORCH_DEADLOCK_TIMEOUT_SECS",
                defaults.deadlock_timeout.as_secs(),
            )?),
            deterministic: env_or("SCANORCH_DETERMINISTIC", defaults.deterministic)?,
            max_transitions_per_tick: env_opt("SCANORCH_MAX_TRANSITIONS")?,
        })
    }
}

/// Per-target sliding-window rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Width of the sliding window.
    pub window: Duration,
    /// Global ceiling of scans per target within the window. `<= 0` disables.
    pub default_limit: i64,
    /// Per-target ceilings; take precedence over `default_limit`.
    pub overrides: HashMap<String, i64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            default_limit: 10,
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let overrides = match std::env::var("SCANORCH_RATE_OVERRIDES") {
            Ok(raw) => parse_overrides(&raw)?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            window: Duration::from_secs(env_or(
                "SCANORCH_RATE_WINDOW_SECS",
                defaults.window.as_secs(),
            )?),
            default_limit: env_or("SCANORCH_RATE_LIMIT", defaults.default_limit)?,
            overrides,
        })
    }

    /// Set a per-target ceiling.
    pub fn with_override(mut self, target: impl Into<String>, limit: i64) -> Self {
        self.overrides.insert(target.into(), limit);
        self
    }
}

/// Scan queue and default executor configuration.
#[derive(Debug, Clone)]
pub struct ScanQueueConfig {
    /// Wall-clock limit for a single external scan process.
    pub scan_timeout: Duration,
    /// Maximum captured bytes per output stream.
    pub max_output_bytes: usize,
    /// Whether completed discovery scans may enqueue a follow-up probe.
    pub follow_up_enabled: bool,
    /// A follow-up is skipped if an equivalent one ran within this window.
    pub follow_up_window: Duration,
}

impl Default for ScanQueueConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(300),
            max_output_bytes: 64 * 1024,
            follow_up_enabled: true,
            follow_up_window: Duration::from_secs(3600),
        }
    }
}

impl ScanQueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            scan_timeout: Duration::from_secs(env_or(
                "SCANORCH_SCAN_TIMEOUT_SECS",
                defaults.scan_timeout.as_secs(),
            )?),
            max_output_bytes: env_or("SCANORCH_MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            follow_up_enabled: env_or("SCANORCH_FOLLOW_UP", defaults.follow_up_enabled)?,
            follow_up_window: Duration::from_secs(env_or(
                "SCANORCH_FOLLOW_UP_WINDOW_SECS",
                defaults.follow_up_window.as_secs(),
            )?),
        })
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// When set, logs are also written to a daily-rotated file here.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: std::env::var("SCANORCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/scan-orchestrator.db")),
            port: env_or("SCANORCH_PORT", 8080)?,
            log_dir: std::env::var("SCANORCH_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub scan_queue: ScanQueueConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            scheduler: SchedulerConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
            scan_queue: ScanQueueConfig::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

/// Parse `host=limit` pairs separated by commas.
fn parse_overrides(raw: &str) -> Result<HashMap<String, i64>, ConfigError> {
    let mut overrides = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (target, limit) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "SCANORCH_RATE_OVERRIDES".to_string(),
                message: format!("expected target=limit, got '{pair}'"),
            })?;
        let limit: i64 = limit
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SCANORCH_RATE_OVERRIDES".to_string(),
                message: format!("{pair}: {e}"),
            })?;
        overrides.insert(target.trim().to_string(), limit);
    }
    Ok(overrides)
}
