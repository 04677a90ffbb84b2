/// Connection Management Module
///
/// This module provides the database handle: one logical connection with
/// its schema catalog, statement cache stack and transaction depth. A
/// process that talks to several databases holds several handles.
use crate::config::DatabaseConfig;
use crate::core::db::driver::{Dialect, Driver, DriverError};
use crate::core::db::schema::{Catalog, TableSchema};
use crate::core::db::sqlite::SqliteDriver;
use crate::core::db::statement::{lock_cache, StatementCache, StatementStats};
use crate::core::error::{QueryContext, Result, SchemaDbError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Handle to one logical database.
///
/// The native connection is opened lazily on first use. Operations take
/// `&mut self`; sharing a handle between threads requires external
/// synchronization.
pub struct Database {
    pub(crate) config: DatabaseConfig,
    pub(crate) driver: Option<Box<dyn Driver>>,
    pub(crate) catalog: Catalog,
    pub(crate) statements: Arc<Mutex<StatementCache>>,
    pub(crate) depth: usize,
    pub(crate) last_query: Option<QueryContext>,
}

/// Opens the native driver for `config`.
///
/// # Returns
///
/// The connected driver, or `SchemaDbError::Driver` when the backend refuses
/// the connection.
pub fn open_driver(config: &DatabaseConfig) -> Result<Box<dyn Driver>> {
    config.validate()?;
    let options: Vec<(String, String)> = config
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match config.dialect() {
        Dialect::Sqlite => Ok(Box::new(SqliteDriver::open(config.sqlite_path(), &options)?)),
        #[cfg(feature = "mysql")]
        Dialect::MySql => Ok(Box::new(crate::core::db::mysql::MySqlDriver::connect(
            &config.url,
            config.user.as_deref(),
            config.password.as_deref(),
            &options,
        )?)),
        #[cfg(not(feature = "mysql"))]
        Dialect::MySql => Err(SchemaDbError::Config(format!(
            "{} requires the `mysql` feature",
            config.url
        ))),
    }
}

impl Database {
    /// Creates a handle; nothing is opened until the first query.
    pub fn new(config: DatabaseConfig) -> Self {
        Database {
            driver: None,
            catalog: Catalog::new(),
            statements: Arc::new(Mutex::new(StatementCache::with_capacity(
                config.statement_cache_size,
            ))),
            depth: 0,
            last_query: None,
            config,
        }
    }

    /// Creates a handle from a DSN and connects immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// let db = schemadb::Database::open(":memory:").unwrap();
    /// assert!(db.is_connected());
    /// ```
    pub fn open(dsn: &str) -> Result<Self> {
        let mut db = Database::new(DatabaseConfig::from_dsn(dsn));
        db.connect()?;
        Ok(db)
    }

    /// A fresh private in-memory SQLite database.
    pub fn in_memory() -> Result<Self> {
        Database::open(":memory:")
    }

    /// Wraps an already-connected driver.
    pub fn with_driver(config: DatabaseConfig, driver: Box<dyn Driver>) -> Self {
        let mut db = Database::new(config);
        db.attach(driver);
        db
    }

    fn attach(&mut self, mut driver: Box<dyn Driver>) {
        driver.set_statement_capacity(lock_cache(&self.statements).native_capacity());
        self.driver = Some(driver);
    }

    /// Opens the native connection if it is not open yet.
    pub fn connect(&mut self) -> Result<()> {
        if self.driver.is_none() {
            let driver = open_driver(&self.config)?;
            info!("Connected to {} database", driver.dialect());
            self.attach(driver);
        }
        Ok(())
    }

    /// Closes every cached statement and the native connection, and forgets
    /// all cached schemas. The next query reconnects.
    ///
    /// Fails with `SchemaDbError::Transaction` inside a transaction body; the
    /// transaction owns the connection until it commits or rolls back.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.depth > 0 {
            return Err(SchemaDbError::Transaction(
                "cannot disconnect inside a transaction".to_string(),
            ));
        }
        lock_cache(&self.statements).clear();
        self.catalog.clear();
        if let Some(mut driver) = self.driver.take() {
            driver.close()?;
            info!("Disconnected from {} database", driver.dialect());
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    pub fn dialect(&self) -> Dialect {
        self.driver
            .as_ref()
            .map(|d| d.dialect())
            .unwrap_or_else(|| self.config.dialect())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Current transaction nesting depth; 0 outside a transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// SQL and parameters of the most recent statement.
    pub fn last_query(&self) -> Option<&QueryContext> {
        self.last_query.as_ref()
    }

    pub fn statement_stats(&self) -> StatementStats {
        lock_cache(&self.statements).stats()
    }

    /// Connects if needed and returns the driver.
    pub(crate) fn driver(&mut self) -> Result<&mut dyn Driver> {
        self.connect()?;
        match self.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(SchemaDbError::Driver(DriverError::Closed)),
        }
    }

    /// Whether a locked statement started at `started` may run again. Only
    /// the embedded engine retries, and never inside a transaction, where
    /// the whole body restarts instead.
    pub(crate) fn may_retry_lock(&self, started: Instant) -> bool {
        self.depth == 0
            && self.dialect().retries_on_lock()
            && started.elapsed() < self.config.lock_timeout()
    }

    /// Column metadata for `table`, introspected on first use and cached.
    ///
    /// # Returns
    ///
    /// The table schema, or `SchemaDbError::Schema` if the table does not exist.
    pub fn describe(&mut self, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.catalog.cached(table) {
            return Ok(schema);
        }
        self.introspect(table, false)
    }

    /// Re-introspects `table`, replacing the cached schema.
    pub fn redescribe(&mut self, table: &str) -> Result<Arc<TableSchema>> {
        debug!("Forcing re-describe of {}", table);
        self.introspect(table, true)
    }

    /// Introspects `table`, retrying while the embedded engine reports the
    /// catalog locked, like any other statement outside a transaction.
    fn introspect(&mut self, table: &str, force: bool) -> Result<Arc<TableSchema>> {
        self.connect()?;
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let Database { driver, catalog, .. } = &mut *self;
            let outcome = match driver.as_deref_mut() {
                Some(driver) => catalog.describe(driver, table, force),
                None => Err(SchemaDbError::Driver(DriverError::Closed)),
            };
            match outcome {
                Err(e) if e.is_locked() && self.may_retry_lock(started) => {
                    debug!("Database locked (attempt {}), retrying describe of {}", attempt, table);
                    attempt += 1;
                    thread::sleep(self.config.retry_interval());
                }
                Err(e) => {
                    if e.is_locked() {
                        warn!(
                            "Database still locked after {} attempts describing {}",
                            attempt, table
                        );
                    }
                    return Err(e);
                }
                Ok(schema) => return Ok(schema),
            }
        }
    }

    /// Drops the cached schema for `table`; the next describe re-introspects.
    pub fn invalidate_schema(&mut self, table: &str) {
        self.catalog.invalidate(table);
    }

    /// Seeds the schema cache, e.g. for a backend whose introspection is
    /// unavailable.
    pub fn register_schema(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        self.catalog.insert(schema)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close() {
                warn!("Failed to close database connection: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.config.url)
            .field("connected", &self.is_connected())
            .field("depth", &self.depth)
            .field("tables", &self.catalog.len())
            .finish()
    }
}
