/// SQLite Driver Module
///
/// Embedded-file dialect backed by rusqlite. SQLite's own busy handler is
/// disabled so that lock contention surfaces immediately as
/// [`DriverError::Locked`] and the query layer can apply its retry policy.
use crate::core::db::driver::{
    BindTarget, BindValue, Binding, Dialect, Driver, DriverError, NativeResult, NativeValue,
};
use rusqlite::ffi::ErrorCode;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, Statement, ToSql};
use std::time::Duration;
use tracing::debug;

impl ToSql for BindValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            BindValue::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            BindValue::Int(i) => ToSqlOutput::from(*i),
            BindValue::Bool(b) => ToSqlOutput::from(*b),
            BindValue::Text(s) => ToSqlOutput::from(s.as_str()),
            BindValue::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

/// Maps SQLITE_BUSY / SQLITE_LOCKED to [`DriverError::Locked`].
fn classify(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            DriverError::Locked(err.to_string())
        }
        _ => DriverError::Sqlite(err),
    }
}

fn native_value(value: ValueRef<'_>) -> NativeValue {
    match value {
        ValueRef::Null => NativeValue::Null,
        ValueRef::Integer(i) => NativeValue::Integer(i),
        ValueRef::Real(f) => NativeValue::Real(f),
        ValueRef::Text(t) => NativeValue::Text(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => NativeValue::Blob(b.to_vec()),
    }
}

/// Binds, runs and buffers one statement.
fn run_statement(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    bindings: &[Binding],
) -> Result<NativeResult, DriverError> {
    for binding in bindings {
        let index = match &binding.target {
            BindTarget::Position(pos) => *pos,
            BindTarget::Name(name) => stmt
                .parameter_index(name)
                .map_err(classify)?
                .ok_or_else(|| DriverError::Unsupported(format!("unknown parameter {}", name)))?,
        };
        stmt.raw_bind_parameter(index, &binding.value)
            .map_err(classify)?;
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut result = NativeResult {
        columns,
        ..NativeResult::default()
    };

    if result.columns.is_empty() {
        stmt.raw_execute().map_err(classify)?;
        result.rows_affected = conn.changes() as u64;
    } else {
        let column_count = result.columns.len();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(native_value(row.get_ref(i).map_err(classify)?));
            }
            result.rows.push(values);
        }
    }

    Ok(result)
}

pub struct SqliteDriver {
    connection: Option<Connection>,
}

impl SqliteDriver {
    /// Opens the database at `path`, or an in-memory database for `:memory:`.
    ///
    /// `pragmas` are applied in order after foreign keys are enabled.
    pub fn open(path: &str, pragmas: &[(String, String)]) -> Result<Self, DriverError> {
        let connection = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        connection.busy_timeout(Duration::ZERO)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;

        for (name, value) in pragmas {
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(DriverError::Unsupported(format!("invalid pragma name: {}", name)));
            }
            debug!("Applying PRAGMA {} = {}", name, value);
            connection
                .execute_batch(&format!("PRAGMA {} = {};", name, value))
                .map_err(classify)?;
        }

        Ok(SqliteDriver {
            connection: Some(connection),
        })
    }

    /// Wraps an already-open connection.
    pub fn from_connection(connection: Connection) -> Result<Self, DriverError> {
        connection.busy_timeout(Duration::ZERO)?;
        Ok(SqliteDriver {
            connection: Some(connection),
        })
    }

    fn conn(&self) -> Result<&Connection, DriverError> {
        self.connection.as_ref().ok_or(DriverError::Closed)
    }
}

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn prepare(&mut self, sql: &str) -> Result<(), DriverError> {
        self.conn()?.prepare_cached(sql).map_err(classify)?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, bindings: &[Binding]) -> Result<NativeResult, DriverError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql).map_err(classify)?;
        run_statement(conn, &mut stmt, bindings)
    }

    fn execute_direct(
        &mut self,
        sql: &str,
        bindings: &[Binding],
    ) -> Result<NativeResult, DriverError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        run_statement(conn, &mut stmt, bindings)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.conn()?.execute_batch("BEGIN").map_err(classify)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.conn()?.execute_batch("COMMIT").map_err(classify)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            // SQLite already rolled back (e.g. after SQLITE_FULL or an I/O error)
            return Ok(());
        }
        conn.execute_batch("ROLLBACK").map_err(classify)
    }

    fn last_insert_id(&mut self) -> Result<Option<i64>, DriverError> {
        let id = self.conn()?.last_insert_rowid();
        Ok(if id == 0 { None } else { Some(id) })
    }

    fn discard_statement(&mut self, sql: &str) {
        if let Some(conn) = &self.connection {
            match conn.prepare_cached(sql) {
                Ok(stmt) => stmt.discard(),
                Err(e) => debug!("Could not discard statement {}: {}", sql, e),
            }
        }
    }

    fn set_statement_capacity(&mut self, capacity: usize) {
        if let Some(conn) = &self.connection {
            debug!("Statement cache capacity set to {}", capacity);
            conn.set_prepared_statement_cache_capacity(capacity);
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if let Some(conn) = self.connection.take() {
            conn.close().map_err(|(_, e)| classify(e))?;
        }
        Ok(())
    }
}
