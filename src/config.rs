//! Configuration types.
//!
//! Everything is read from environment variables with defaults. A value that
//! is present but unparsable is an error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite file holding the message store and execution ledger.
    pub db_path: PathBuf,
    /// JSON rule definitions, re-read every cycle.
    pub rules_file: PathBuf,
    /// Upper bound on messages fetched per cycle.
    pub max_results: usize,
    /// Pause between scheduled cycles.
    pub interval: Duration,
    /// Give up on a (message, rule) pair after this many unsuccessful dispatches.
    pub max_attempts: Option<u32>,
    /// Run a single cycle and exit.
    pub run_once: bool,
    /// Log actions instead of applying them.
    pub dry_run: bool,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mail-rules.db"),
            rules_file: PathBuf::from("./rules.json"),
            max_results: 100,
            interval: Duration::from_secs(300), // 5 minutes
            max_attempts: None,
            run_once: false,
            dry_run: false,
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Build config from `MAIL_RULES_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_results = env_parse::<usize>("MAIL_RULES_MAX_RESULTS")?
            .map(|n| ensure_nonzero("MAIL_RULES_MAX_RESULTS", n))
            .transpose()?
            .unwrap_or(defaults.max_results);

        let interval = env_parse::<u64>("MAIL_RULES_INTERVAL_SECS")?
            .map(|secs| ensure_nonzero("MAIL_RULES_INTERVAL_SECS", secs))
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        Ok(Self {
            db_path: env_string("MAIL_RULES_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            rules_file: env_string("MAIL_RULES_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_file),
            max_results,
            interval,
            max_attempts: env_parse::<u32>("MAIL_RULES_MAX_ATTEMPTS")?,
            run_once: env_flag("MAIL_RULES_RUN_ONCE")?,
            dry_run: env_flag("MAIL_RULES_DRY_RUN")?,
            log_dir: env_string("MAIL_RULES_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// A non-empty environment variable.
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an optional environment variable.
pub(crate) fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| parse_value(key, &raw))
        .transpose()
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn ensure_nonzero<T: Default + PartialEq>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn env_flag(key: &str) -> Result<bool, ConfigError> {
    match env_string(key) {
        None => Ok(false),
        Some(raw) => parse_flag(key, &raw),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}
