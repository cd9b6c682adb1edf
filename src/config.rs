//! Configuration management for the dispatch engine.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DISPATCH_DB_PATH` - Optional. SQLite database file. When unset, an in-memory
//!   store is used and nothing survives a restart.
//! - `DISPATCH_DEFAULT_MAX_RETRIES` - Optional. Retries granted to tasks that do not
//!   name their own. Defaults to `3`, must be at least `1`.
//! - `DISPATCH_BACKOFF_BASE_MS` - Optional. Base re-queue notification delay. Defaults to `1000`.
//! - `DISPATCH_BACKOFF_MAX_MS` - Optional. Delay cap. Defaults to `60000`, must be >= base.
//! - `DISPATCH_MAX_FALLBACK_HOPS` - Optional. Hops followed by chained charges, at most the
//!   longest chain registration accepts. Defaults to that maximum (`16`).
//! - `DISPATCH_QUEUE` - Optional. `memory` or `none`. Defaults to `none`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::budget::{BackoffPolicy, MAX_FALLBACK_DEPTH};
use crate::task::DEFAULT_MAX_RETRIES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which queue collaborator to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Workers discover tasks by polling only.
    None,
    /// In-process channel, drained by a logging consumer.
    Memory,
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(QueueMode::None),
            "memory" => Ok(QueueMode::Memory),
            other => Err(format!("expected 'memory' or 'none', got '{}'", other)),
        }
    }
}

/// Tunables used by the dispatcher itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub default_max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on hops followed by `charge_following_fallbacks`.
    pub max_fallback_hops: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            max_fallback_hops: MAX_FALLBACK_DEPTH,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// SQLite database file; `None` selects the in-memory store
    pub db_path: Option<PathBuf>,

    pub queue: QueueMode,

    pub dispatch: DispatchSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&lookup, "PORT", 3000u16)?;

        let db_path = lookup("DISPATCH_DB_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let queue = match lookup("DISPATCH_QUEUE") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue("DISPATCH_QUEUE".to_string(), e))?,
            None => QueueMode::None,
        };

        let default_max_retries = parse_or(&lookup, "DISPATCH_DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        if default_max_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "DISPATCH_DEFAULT_MAX_RETRIES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let base_ms = parse_or(&lookup, "DISPATCH_BACKOFF_BASE_MS", 1_000u64)?;
        let max_ms = parse_or(&lookup, "DISPATCH_BACKOFF_MAX_MS", 60_000u64)?;
        if max_ms < base_ms {
            return Err(ConfigError::InvalidValue(
                "DISPATCH_BACKOFF_MAX_MS".to_string(),
                format!("{} is below DISPATCH_BACKOFF_BASE_MS ({})", max_ms, base_ms),
            ));
        }

        let max_fallback_hops = parse_or(&lookup, "DISPATCH_MAX_FALLBACK_HOPS", MAX_FALLBACK_DEPTH)?;
        if !(1..=MAX_FALLBACK_DEPTH).contains(&max_fallback_hops) {
            return Err(ConfigError::InvalidValue(
                "DISPATCH_MAX_FALLBACK_HOPS".to_string(),
                format!("must be between 1 and {}", MAX_FALLBACK_DEPTH),
            ));
        }

        Ok(Self {
            host,
            port,
            db_path,
            queue,
            dispatch: DispatchSettings {
                default_max_retries,
                backoff: BackoffPolicy {
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                },
                max_fallback_hops,
            },
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            db_path: None,
            queue: QueueMode::None,
            dispatch: DispatchSettings::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}
