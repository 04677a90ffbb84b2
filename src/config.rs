use crate::core::db::driver::Dialect;
use crate::core::db::statement::DEFAULT_STATEMENT_CAPACITY;
use crate::core::{Result, SchemaDbError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 5;
const DEFAULT_MAX_NESTING: usize = 10;

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_max_nesting() -> usize {
    DEFAULT_MAX_NESTING
}

fn default_statement_cache_size() -> usize {
    DEFAULT_STATEMENT_CAPACITY
}

/// Connection parameters for one logical database.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite:` URL, plain file path, `:memory:`, or `mysql://` URL
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Driver options: PRAGMAs for SQLite, connect options for MySQL
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// How long lock contention is retried before giving up
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Sleep between lock retries
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,
    /// Distinct SQL texts kept compiled
    #[serde(default = "default_statement_cache_size")]
    pub statement_cache_size: usize,
}

impl DatabaseConfig {
    /// Configuration from a bare DSN, with default timeouts.
    pub fn from_dsn(dsn: &str) -> Self {
        DatabaseConfig {
            url: dsn.trim().to_string(),
            user: None,
            password: None,
            options: BTreeMap::new(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_nesting: DEFAULT_MAX_NESTING,
            statement_cache_size: DEFAULT_STATEMENT_CAPACITY,
        }
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::from_url(&self.url)
    }

    /// Filesystem path for the embedded dialect, with any `sqlite:` scheme
    /// stripped.
    pub fn sqlite_path(&self) -> &str {
        let url = self.url.as_str();
        url.strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(SchemaDbError::Config("database url is empty".to_string()));
        }
        if self.retry_interval_ms == 0 && self.lock_timeout_ms > 0 {
            return Err(SchemaDbError::Config(
                "retry_interval_ms must be positive when lock retries are enabled".to_string(),
            ));
        }
        if self.statement_cache_size == 0 {
            return Err(SchemaDbError::Config(
                "statement_cache_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
}

impl Config {
    /// Looks up a named database.
    pub fn database(&self, name: &str) -> Result<&DatabaseConfig> {
        self.databases
            .get(name)
            .ok_or_else(|| SchemaDbError::Config(format!("no database named '{}'", name)))
    }
}

/// Parses and validates a TOML configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    for database in config.databases.values() {
        database.validate()?;
    }
    Ok(config)
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = schemadb::config::load_config("schemadb.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// `<config dir>/schemadb/config.toml`, when the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("schemadb").join("config.toml"))
}
