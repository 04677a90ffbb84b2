/// Driver Interface Module
///
/// The low-level contract the query layer consumes: prepare, execute with
/// bound parameters, fetch raw rows, and transaction primitives. Each
/// supported dialect provides one implementation.
use std::fmt;
use thiserror::Error;

/// The two supported backend engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Embedded file-based engine (SQLite)
    Sqlite,
    /// Client/server engine (MySQL/MariaDB)
    MySql,
}

impl Dialect {
    /// Resolves the dialect from a connection URL or file path.
    pub fn from_url(url: &str) -> Dialect {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("mysql:") || lower.starts_with("mariadb:") {
            Dialect::MySql
        } else {
            Dialect::Sqlite
        }
    }

    /// Quotes an identifier for generated SQL.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Whether `UPDATE ... LIMIT n` is accepted.
    pub fn supports_update_limit(&self) -> bool {
        matches!(self, Dialect::MySql)
    }

    /// Whether lock contention on this dialect is retried automatically.
    pub fn retries_on_lock(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => f.write_str("sqlite"),
            Dialect::MySql => f.write_str("mysql"),
        }
    }
}

/// Errors raised by a driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The embedded engine reported the database as busy or locked
    #[error("database is locked: {0}")]
    Locked(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "mysql")]
    #[error(transparent)]
    MySql(#[from] sqlx::Error),

    /// A parameter name or feature the driver cannot handle
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The connection was closed
    #[error("connection is closed")]
    Closed,
}

impl DriverError {
    pub fn is_locked(&self) -> bool {
        matches!(self, DriverError::Locked(_))
    }
}

/// Native bind kinds. Floats have no kind of their own and travel as text.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

/// Where a parameter is bound: a 1-based position or a `:name` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Position(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub target: BindTarget,
    pub value: BindValue,
}

/// A raw cell as returned by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl NativeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Null)
    }

    /// Text content, decoding UTF-8 blobs.
    pub fn as_text(&self) -> Option<String> {
        match self {
            NativeValue::Text(s) => Some(s.clone()),
            NativeValue::Blob(b) => String::from_utf8(b.clone()).ok(),
            NativeValue::Integer(i) => Some(i.to_string()),
            NativeValue::Real(f) => Some(f.to_string()),
            NativeValue::Null => None,
        }
    }
}

/// Everything one execution produced: the result columns, all rows, and the
/// affected-row count for writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<NativeValue>>,
    pub rows_affected: u64,
}

/// Low-level connection contract.
///
/// Implementations must not retry lock contention themselves; the query
/// layer owns the retry policy.
pub trait Driver: Send {
    fn dialect(&self) -> Dialect;

    /// Compiles `sql` into the driver's statement cache without running it,
    /// failing on syntax errors or unknown tables.
    fn prepare(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Runs `sql` with the given bindings, reusing the statement compiled by
    /// [`Driver::prepare`].
    fn execute(&mut self, sql: &str, bindings: &[Binding]) -> Result<NativeResult, DriverError>;

    /// Runs `sql` without keeping its compiled statement. Used for catalog
    /// queries the statement cache does not track.
    fn execute_direct(
        &mut self,
        sql: &str,
        bindings: &[Binding],
    ) -> Result<NativeResult, DriverError> {
        self.execute(sql, bindings)
    }

    fn begin(&mut self) -> Result<(), DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Id generated by the most recent insert, if any.
    fn last_insert_id(&mut self) -> Result<Option<i64>, DriverError>;

    /// Finalizes the cached compile of `sql`, if any.
    fn discard_statement(&mut self, _sql: &str) {}

    /// Number of compiled statements the driver keeps. The statement cache
    /// raises it before it would be exceeded.
    fn set_statement_capacity(&mut self, _capacity: usize) {}

    fn close(&mut self) -> Result<(), DriverError>;
}

/// SQL statement categories, classified by leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    /// BEGIN/COMMIT/ROLLBACK and savepoints
    Transaction,
    /// PRAGMA, DESCRIBE, SHOW, EXPLAIN
    Introspection,
    Other,
}

impl StatementKind {
    pub fn from_sql(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" => StatementKind::Select,
            "INSERT" | "REPLACE" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" => StatementKind::Create,
            "DROP" => StatementKind::Drop,
            "ALTER" => StatementKind::Alter,
            "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END" => {
                StatementKind::Transaction
            }
            "PRAGMA" | "DESCRIBE" | "DESC" | "SHOW" | "EXPLAIN" => StatementKind::Introspection,
            _ => StatementKind::Other,
        }
    }

    /// Whether statements of this kind produce a result set.
    pub fn returns_rows(&self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::Introspection)
    }
}
