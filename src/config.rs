//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILINDEX_CONFIG` (environment variable)
//! 2. `~/.config/mailindex/config.toml` (Linux),
//!    `~/Library/Application Support/mailindex/config.toml` (macOS)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "MAILINDEX_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    /// Where the mail lives and what to skip.
    pub store: StoreConfig,
    /// Index file and indexing limits.
    pub index: IndexConfig,
    pub watcher: WatcherConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for the index and logs.
    pub cache_dir: Option<PathBuf>,
}

/// Mail store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Versioned mail data directory. Found automatically when unset.
    pub mail_root: Option<PathBuf>,
    /// Mailboxes never indexed and left out of search results.
    pub exclude_mailboxes: Vec<String>,
}

/// Index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index file. Defaults to `index.db` in the cache directory.
    pub db_path: Option<PathBuf>,
    /// Newest messages kept per mailbox.
    pub max_per_mailbox: usize,
    /// Hours after the last sync before the index counts as stale.
    pub staleness_hours: f64,
}

/// File watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Quiet period in milliseconds before pending changes are applied.
    pub debounce_ms: u64,
    /// Longest a pending change waits under a steady stream of events.
    pub max_delay_ms: u64,
    /// Pending changes above this trigger a full sync instead.
    pub max_pending: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            cache_dir: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mail_root: None,
            exclude_mailboxes: vec!["Drafts".to_string()],
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_per_mailbox: 5000,
            staleness_hours: 24.0,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_delay_ms: 2000,
            max_pending: 10_000,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<PathBuf> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(path)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailindex").join("config.toml"))
}

/// Return the cache directory for the index, logs, etc.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailindex")
}

/// Return the index file path.
pub fn db_path(config: &Config) -> PathBuf {
    config
        .index
        .db_path
        .clone()
        .unwrap_or_else(|| cache_dir(config).join("index.db"))
}
