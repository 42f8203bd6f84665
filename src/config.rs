//! Configuration types.

use crate::agent::executor::DEFAULT_HISTORY_LIMIT;

/// Runtime configuration, read from `WATCHD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdConfig {
    /// Path of the database file.
    pub db: String,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Earlier runs exposed to agents through `ctx.history()`.
    pub history_limit: usize,
    /// Informational; schedules are evaluated in UTC.
    pub timezone: String,
}

impl Default for WatchdConfig {
    fn default() -> Self {
        Self {
            db: "./watchd.db".to_string(),
            log_level: "info".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            timezone: "UTC".to_string(),
        }
    }
}

impl WatchdConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let history_limit = match lookup("WATCHD_HISTORY_LIMIT") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Invalid WATCHD_HISTORY_LIMIT, using default");
                defaults.history_limit
            }),
            None => defaults.history_limit,
        };

        Self {
            db: lookup("WATCHD_DB").unwrap_or(defaults.db),
            log_level: lookup("WATCHD_LOG_LEVEL").unwrap_or(defaults.log_level),
            history_limit,
            timezone: lookup("WATCHD_TIMEZONE").unwrap_or(defaults.timezone),
        }
    }
}
