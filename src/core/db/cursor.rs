/// Row Cursor Module
///
/// Single-pass iteration over the results of one executed statement. Rows
/// are coerced one at a time as they are read. The statement goes back to
/// the cache when the cursor is exhausted, released or dropped.
use crate::core::db::coerce::coerce_row;
use crate::core::db::driver::NativeValue;
use crate::core::db::record::Row;
use crate::core::db::schema::TableSchema;
use crate::core::db::statement::{lock_cache, Statement, StatementCache};
use crate::core::db::value::Value;
use crate::core::error::{Result, SchemaDbError};
use std::sync::{Arc, Mutex, Weak};
use std::vec;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    NotStarted,
    Active,
    Exhausted,
}

pub struct RowCursor {
    statement: Option<Statement>,
    cache: Weak<Mutex<StatementCache>>,
    schema: Option<Arc<TableSchema>>,
    columns: Vec<String>,
    rows: vec::IntoIter<Vec<NativeValue>>,
    rows_affected: u64,
    state: CursorState,
}

impl RowCursor {
    pub(crate) fn new(
        mut statement: Statement,
        cache: Weak<Mutex<StatementCache>>,
        schema: Option<Arc<TableSchema>>,
    ) -> Self {
        let result = statement.take_result().unwrap_or_default();
        RowCursor {
            statement: Some(statement),
            cache,
            schema,
            columns: result.columns,
            rows: result.rows.into_iter(),
            rows_affected: result.rows_affected,
            state: CursorState::NotStarted,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The SQL this cursor was produced by.
    pub fn sql(&self) -> Option<&str> {
        self.statement.as_ref().map(Statement::sql)
    }

    /// Result column names, in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows changed by a write statement.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Advances the cursor.
    ///
    /// Returns `Ok(None)` once, when the last row has been read, and releases
    /// the statement at that point. Any further call is an iteration error.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.state == CursorState::Exhausted {
            return Err(SchemaDbError::Iteration(
                "cursor is exhausted and cannot be iterated again".to_string(),
            ));
        }
        Ok(self.advance())
    }

    /// Iterates the remaining rows.
    ///
    /// A cursor can be iterated in several steps, but not after it has been
    /// exhausted.
    pub fn iter(&mut self) -> Result<Rows<'_>> {
        if self.state == CursorState::Exhausted {
            return Err(SchemaDbError::Iteration(
                "cursor is exhausted and cannot be iterated again".to_string(),
            ));
        }
        Ok(Rows { cursor: self })
    }

    /// Reads every remaining row and releases the statement.
    pub fn fetch_all(mut self) -> Result<Vec<Row>> {
        let rows = self.iter()?.collect();
        Ok(rows)
    }

    /// Reads the next row, then releases the statement.
    pub fn fetch_row(mut self) -> Result<Option<Row>> {
        let row = self.next_row()?;
        self.release();
        Ok(row)
    }

    /// First column of the next row.
    pub fn fetch_value(self) -> Result<Option<Value>> {
        Ok(self
            .fetch_row()?
            .and_then(|row| row.get_index(0).cloned()))
    }

    /// Gives the statement back to the cache without reading further rows.
    pub fn release(mut self) {
        self.release_statement();
    }

    fn advance(&mut self) -> Option<Row> {
        match self.rows.next() {
            Some(raw) => {
                self.state = CursorState::Active;
                Some(coerce_row(&self.columns, raw, self.schema.as_deref()))
            }
            None => {
                self.state = CursorState::Exhausted;
                self.release_statement();
                None
            }
        }
    }

    fn release_statement(&mut self) {
        let Some(statement) = self.statement.take() else {
            return;
        };
        // Unread rows belong to the statement's open cursor
        self.rows = Vec::new().into_iter();
        match self.cache.upgrade() {
            Some(cache) => {
                trace!("Releasing statement: {}", statement.sql());
                lock_cache(&cache).release(statement);
            }
            None => trace!("Cache gone, dropping statement: {}", statement.sql()),
        }
    }
}

impl Drop for RowCursor {
    fn drop(&mut self) {
        self.release_statement();
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("sql", &self.sql())
            .field("columns", &self.columns)
            .field("state", &self.state)
            .finish()
    }
}

/// Borrowing iterator over a cursor's remaining rows.
pub struct Rows<'c> {
    cursor: &'c mut RowCursor,
}

impl Iterator for Rows<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        if self.cursor.state == CursorState::Exhausted {
            return None;
        }
        self.cursor.advance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::driver::NativeResult;
    use crate::core::db::schema::ColumnDescriptor;
    use crate::test_utils::FakeDriver;

    fn cursor(cache: &Arc<Mutex<StatementCache>>, rows: Vec<Vec<NativeValue>>) -> RowCursor {
        let mut statement = lock_cache(cache)
            .checkout("SELECT flag, n FROM t", &mut FakeDriver::sqlite())
            .unwrap();
        statement.attach(NativeResult {
            columns: vec!["flag".into(), "n".into()],
            rows,
            rows_affected: 0,
        });
        let schema = TableSchema::new(
            "t",
            vec![ColumnDescriptor::new("flag", "BOOLEAN")],
        );
        RowCursor::new(statement, Arc::downgrade(cache), Some(Arc::new(schema)))
    }

    fn two_rows() -> Vec<Vec<NativeValue>> {
        vec![
            vec![NativeValue::Integer(1), NativeValue::Integer(10)],
            vec![NativeValue::Integer(0), NativeValue::Integer(20)],
        ]
    }

    #[test]
    fn test_state_transitions_and_release() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        let mut cursor = cursor(&cache, two_rows());
        assert_eq!(cursor.state(), CursorState::NotStarted);

        let first = cursor.next_row().unwrap().unwrap();
        assert_eq!(first.get("flag"), Some(&Value::Bool(true)));
        assert_eq!(first.get("n"), Some(&Value::Int(10)));
        assert_eq!(cursor.state(), CursorState::Active);
        assert!(!lock_cache(&cache).contains("SELECT flag, n FROM t"));

        cursor.next_row().unwrap().unwrap();
        assert!(cursor.next_row().unwrap().is_none());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(lock_cache(&cache).contains("SELECT flag, n FROM t"));

        let err = cursor.next_row().unwrap_err();
        assert!(matches!(err, SchemaDbError::Iteration(_)));
    }

    #[test]
    fn test_second_pass_is_an_error() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        let mut cursor = cursor(&cache, two_rows());
        let rows: Vec<Row> = cursor.iter().unwrap().collect();
        assert_eq!(rows.len(), 2);
        assert!(matches!(cursor.iter(), Err(SchemaDbError::Iteration(_))));
    }

    #[test]
    fn test_iteration_can_resume_before_exhaustion() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        let mut cursor = cursor(&cache, two_rows());
        assert_eq!(cursor.iter().unwrap().take(1).count(), 1);
        assert_eq!(cursor.iter().unwrap().count(), 1);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[test]
    fn test_fetch_all_releases() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        let rows = cursor(&cache, two_rows()).fetch_all().unwrap();
        assert_eq!(rows[1].get("flag"), Some(&Value::Bool(false)));
        assert!(lock_cache(&cache).contains("SELECT flag, n FROM t"));
    }

    #[test]
    fn test_drop_mid_iteration_releases() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        {
            let mut cursor = cursor(&cache, two_rows());
            cursor.next_row().unwrap();
        }
        let cache = lock_cache(&cache);
        assert!(cache.contains("SELECT flag, n FROM t"));
    }

    #[test]
    fn test_fetch_value() {
        let cache = Arc::new(Mutex::new(StatementCache::new()));
        let value = cursor(&cache, two_rows()).fetch_value().unwrap();
        assert_eq!(value, Some(Value::Bool(true)));

        let empty = cursor(&cache, vec![]).fetch_value().unwrap();
        assert_eq!(empty, None);
    }
}
