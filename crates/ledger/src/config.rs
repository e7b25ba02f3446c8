//! Ledger configuration
//!
//! Every field has a default so a partial JSON file (or none at all) is a
//! valid configuration. Selected fields can be overridden from the environment.

use apgms_bus::EventsConfig;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration shared by the ledger, reconciliation and CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// sqlx connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Pool size; SQLite admits one writer so the default is 1
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite waits on a locked database file
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Actor recorded in the audit chain when the caller names none
    #[serde(default = "default_actor")]
    pub default_actor: String,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

/// Reconciliation job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Timeout for one banking partner balance read
    #[serde(default = "default_balance_timeout_ms")]
    pub balance_timeout_ms: u64,

    /// Tenants reconciled in parallel
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Period of the scheduled run
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Ask the banking partner to block outbound transfers on a shortfall
    #[serde(default = "default_block_on_shortfall")]
    pub block_on_shortfall: bool,
}

fn default_database_url() -> String {
    "sqlite:apgms-ledger.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    1
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_actor() -> String {
    "system".to_string()
}

fn default_balance_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    3_600 // hourly
}

fn default_block_on_shortfall() -> bool {
    true
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            default_actor: default_actor(),
            events: EventsConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            balance_timeout_ms: default_balance_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            interval_secs: default_interval_secs(),
            block_on_shortfall: default_block_on_shortfall(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: &Path) -> Result<Self, io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Configuration for a SQLite file at `path`, everything else default
    pub fn for_sqlite_file(path: impl AsRef<Path>) -> Self {
        Self {
            database_url: format!("sqlite:{}?mode=rwc", path.as_ref().display()),
            ..Self::default()
        }
    }

    /// Apply `APGMS_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), io::Error> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), io::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("APGMS_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(value) = lookup("APGMS_MAX_CONNECTIONS") {
            self.max_connections = parse_var("APGMS_MAX_CONNECTIONS", &value)?;
        }
        if let Some(prefix) = lookup("APGMS_EVENT_PREFIX") {
            self.events.subject_prefix = prefix;
        }
        if let Some(dir) = lookup("APGMS_EVENT_LOG_DIR") {
            self.events.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("APGMS_RECON_TIMEOUT_MS") {
            self.reconciliation.balance_timeout_ms = parse_var("APGMS_RECON_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("APGMS_RECON_CONCURRENCY") {
            self.reconciliation.max_concurrency = parse_var("APGMS_RECON_CONCURRENCY", &value)?;
        }
        Ok(())
    }

    /// Get busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl ReconciliationConfig {
    /// Get balance read timeout as Duration
    pub fn balance_timeout(&self) -> Duration {
        Duration::from_millis(self.balance_timeout_ms)
    }

    /// Get run interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, io::Error> {
    value.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has an invalid value: {}", name, value),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();

        assert_eq!(config.database_url, "sqlite:apgms-ledger.db?mode=rwc");
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.default_actor, "system");
        assert_eq!(config.events.subject_prefix, "apgms.dev");
        assert_eq!(config.reconciliation.max_concurrency, 4);
        assert!(config.reconciliation.block_on_shortfall);
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{ "default_actor": "ops", "reconciliation": { "max_concurrency": 8 } }"#;
        let config: LedgerConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.default_actor, "ops");
        assert_eq!(config.reconciliation.max_concurrency, 8);
        assert_eq!(config.reconciliation.balance_timeout_ms, 5_000); // default
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("APGMS_DATABASE_URL", "sqlite::memory:"),
            ("APGMS_RECON_TIMEOUT_MS", "250"),
            ("APGMS_EVENT_LOG_DIR", "/var/log/apgms"),
        ]
        .into_iter()
        .collect();

        let mut config = LedgerConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.reconciliation.balance_timeout(), Duration::from_millis(250));
        assert_eq!(config.events.log_dir, Some(PathBuf::from("/var/log/apgms")));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = LedgerConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "APGMS_MAX_CONNECTIONS").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_for_sqlite_file() {
        let config = LedgerConfig::for_sqlite_file("/tmp/ledger.db");
        assert_eq!(config.database_url, "sqlite:/tmp/ledger.db?mode=rwc");
    }
}
