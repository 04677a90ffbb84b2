/// # Test Utilities Module
///
/// Shared test infrastructure:
/// - log capture through the test writer
/// - an in-memory database fixture with a standard schema
/// - a scripted driver for exercising the client/server dialect offline
use crate::core::db::connection::Database;
use crate::core::db::driver::{Binding, Dialect, Driver, DriverError, NativeResult, NativeValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, PoisonError};

static LOGGING: Once = Once::new();

/// Routes `tracing` output to the test harness. Safe to call from every test.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Standard schema used by executor and transaction tests.
pub const USERS_SCHEMA: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    active BOOLEAN NOT NULL DEFAULT 1,
    logins INTEGER NOT NULL,
    born DATE,
    last_seen DATETIME,
    score REAL
)";

/// A private in-memory database holding the `users` table.
pub fn fixture() -> Database {
    init_test_logging();
    let mut db = Database::in_memory().expect("in-memory database opens");
    db.execute(USERS_SCHEMA, ()).expect("fixture schema applies");
    db
}

/// Calls a [`FakeDriver`] received, shared with the test after the driver
/// has been boxed into a handle.
#[derive(Debug, Clone, Default)]
pub struct DriverLog {
    executed: Arc<Mutex<Vec<String>>>,
    prepared: Arc<Mutex<Vec<String>>>,
    discarded: Arc<Mutex<Vec<String>>>,
    capacity: Arc<Mutex<Option<usize>>>,
}

fn record(list: &Mutex<Vec<String>>, entry: &str) {
    list.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(entry.to_string());
}

fn snapshot(list: &Mutex<Vec<String>>) -> Vec<String> {
    list.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

impl DriverLog {
    fn push(&self, entry: &str) {
        record(&self.executed, entry);
    }

    pub fn executed(&self) -> Vec<String> {
        snapshot(&self.executed)
    }

    /// SQL compiled through [`Driver::prepare`], in order.
    pub fn prepared(&self) -> Vec<String> {
        snapshot(&self.prepared)
    }

    /// SQL whose compile was discarded, in order.
    pub fn discarded(&self) -> Vec<String> {
        snapshot(&self.discarded)
    }

    /// The last compiled-statement capacity the driver was given.
    pub fn capacity(&self) -> Option<usize> {
        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scripted driver. Statements with a registered response return it; any
/// other statement succeeds with no rows.
#[derive(Debug)]
pub struct FakeDriver {
    dialect: Dialect,
    responses: HashMap<String, NativeResult>,
    last_insert_id: Option<i64>,
    rejected: Vec<String>,
    locked: usize,
    log: DriverLog,
}

impl FakeDriver {
    pub fn new(dialect: Dialect) -> Self {
        FakeDriver {
            dialect,
            responses: HashMap::new(),
            last_insert_id: None,
            rejected: Vec::new(),
            locked: 0,
            log: DriverLog::default(),
        }
    }

    pub fn mysql() -> Self {
        FakeDriver::new(Dialect::MySql)
    }

    pub fn sqlite() -> Self {
        FakeDriver::new(Dialect::Sqlite)
    }

    /// Registers the rows returned for `sql`. Cells are text; the literal
    /// `NULL` stands for a SQL NULL.
    pub fn respond(&mut self, sql: &str, columns: &[&str], rows: Vec<Vec<&str>>) {
        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        "NULL" => NativeValue::Null,
                        text => NativeValue::Text(text.to_string()),
                    })
                    .collect()
            })
            .collect();
        self.responses.insert(
            sql.to_string(),
            NativeResult {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                rows_affected: 0,
            },
        );
    }

    pub fn set_last_insert_id(&mut self, id: i64) {
        self.last_insert_id = Some(id);
    }

    /// Makes `sql` fail to compile.
    pub fn reject(&mut self, sql: &str) {
        self.rejected.push(sql.to_string());
    }

    /// Makes the next `count` executions report the database locked.
    pub fn lock_next(&mut self, count: usize) {
        self.locked = count;
    }

    pub fn log(&self) -> DriverLog {
        self.log.clone()
    }
}

impl Driver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn prepare(&mut self, sql: &str) -> Result<(), DriverError> {
        if self.rejected.iter().any(|r| r == sql) {
            return Err(DriverError::Unsupported(format!("cannot compile {}", sql)));
        }
        record(&self.log.prepared, sql);
        Ok(())
    }

    fn execute(&mut self, sql: &str, _bindings: &[Binding]) -> Result<NativeResult, DriverError> {
        self.log.push(sql);
        if self.locked > 0 {
            self.locked -= 1;
            return Err(DriverError::Locked("database is locked".to_string()));
        }
        Ok(self.responses.get(sql).cloned().unwrap_or(NativeResult {
            rows_affected: 1,
            ..NativeResult::default()
        }))
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.log.push("BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.log.push("COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.log.push("ROLLBACK");
        Ok(())
    }

    fn last_insert_id(&mut self) -> Result<Option<i64>, DriverError> {
        Ok(self.last_insert_id)
    }

    fn discard_statement(&mut self, sql: &str) {
        record(&self.log.discarded, sql);
    }

    fn set_statement_capacity(&mut self, capacity: usize) {
        *self
            .log
            .capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(capacity);
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_has_users_table() {
        let mut db = fixture();
        let schema = db.describe("users").unwrap();
        assert_eq!(schema.columns().len(), 8);
    }

    #[test]
    fn test_fake_driver_responses() {
        let mut driver = FakeDriver::mysql();
        driver.respond("SHOW TABLES", &["Tables"], vec![vec!["users"], vec!["NULL"]]);
        let log = driver.log();

        let result = driver.execute("SHOW TABLES", &[]).unwrap();
        assert_eq!(result.rows[1][0], NativeValue::Null);
        let other = driver.execute("DELETE FROM users", &[]).unwrap();
        assert_eq!(other.rows_affected, 1);
        assert_eq!(log.executed(), vec!["SHOW TABLES", "DELETE FROM users"]);
    }
}
