/// Transaction Module
///
/// Runs a closure inside one native transaction. The statement cache gets a
/// clean frame for the duration of the body. On the embedded dialect a body
/// that fails on lock contention is rolled back and re-run from the start
/// until the configured lock timeout elapses.
use crate::core::db::connection::Database;
use crate::core::db::statement::lock_cache;
use crate::core::error::{Result, SchemaDbError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

impl Database {
    /// Runs `body` in a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    ///
    /// Transactions do not nest: calling this from inside a body fails with
    /// `SchemaDbError::Transaction`. Because a locked body is re-run from the
    /// top, `body` must be safe to call more than once.
    ///
    /// # Examples
    ///
    /// ```
    /// use schemadb::{Database, Row};
    ///
    /// let mut db = Database::in_memory().unwrap();
    /// db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER)", ()).unwrap();
    /// let id = db
    ///     .transaction(|db| {
    ///         let mut row = Row::new().with("n", 1);
    ///         db.insert("t", &mut row)
    ///     })
    ///     .unwrap();
    /// assert_eq!(id, Some(1));
    /// ```
    pub fn transaction<T, F>(&mut self, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Database) -> Result<T>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            match self.run_transaction(&mut body) {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry_transaction(&e, started) => {
                    warn!(
                        "Transaction attempt {} hit a locked database, retrying: {}",
                        attempt, e
                    );
                    attempt += 1;
                    thread::sleep(self.config.retry_interval());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`Database::transaction`], but hands any failure to `on_error`
    /// and returns `None` instead of propagating it.
    pub fn try_transaction<T, F, E>(&mut self, body: F, on_error: E) -> Option<T>
    where
        F: FnMut(&mut Database) -> Result<T>,
        E: FnOnce(SchemaDbError),
    {
        match self.transaction(body) {
            Ok(value) => Some(value),
            Err(e) => {
                on_error(e);
                None
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    fn should_retry_transaction(&self, err: &SchemaDbError, started: Instant) -> bool {
        self.dialect().retries_on_lock()
            && err.is_locked()
            && started.elapsed() < self.config.lock_timeout()
    }

    /// One attempt: guard, begin, body, commit or rollback, restore.
    fn run_transaction<T, F>(&mut self, body: &mut F) -> Result<T>
    where
        F: FnMut(&mut Database) -> Result<T>,
    {
        if self.depth > 0 {
            return Err(SchemaDbError::Transaction(
                "already in a transaction".to_string(),
            ));
        }
        if self.depth >= self.config.max_nesting {
            return Err(SchemaDbError::Transaction(
                "too many nested transactions".to_string(),
            ));
        }
        self.connect()?;

        self.depth += 1;
        lock_cache(&self.statements).push_frame();
        debug!("Beginning transaction (depth {})", self.depth);

        let outcome = match self.driver().and_then(|d| d.begin().map_err(Into::into)) {
            Ok(()) => body(self),
            Err(e) => Err(e),
        };

        let outcome = match outcome {
            Ok(value) => match self.driver().and_then(|d| d.commit().map_err(Into::into)) {
                Ok(()) => {
                    info!("Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    self.rollback_quietly();
                    Err(e)
                }
            },
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                self.rollback_quietly();
                Err(e)
            }
        };

        self.depth -= 1;
        let mut statements = lock_cache(&self.statements);
        statements.pop_frame();
        if let Some(driver) = self.driver.as_deref_mut() {
            statements.discard_retired(driver);
        }
        drop(statements);
        outcome
    }

    fn rollback_quietly(&mut self) {
        if let Some(driver) = self.driver.as_deref_mut() {
            if let Err(e) = driver.rollback() {
                warn!("Rollback failed: {}", e);
            }
        }
    }
}
