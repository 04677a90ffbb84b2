/// Query Execution Module
///
/// Statement dispatch and the record-level operations built on it. Every
/// operation funnels through [`Database::execute`]-style dispatch, which
/// takes a statement from the cache, binds parameters and retries lock
/// contention outside transactions on the embedded dialect.
use crate::core::db::coerce::coerce_for_write;
use crate::core::db::connection::Database;
use crate::core::db::cursor::RowCursor;
use crate::core::db::driver::{Binding, Dialect, DriverError};
use crate::core::db::params::Params;
use crate::core::db::record::{Record, Row};
use crate::core::db::schema::{ColumnDescriptor, TableSchema};
use crate::core::db::statement::{lock_cache, Statement};
use crate::core::db::value::Value;
use crate::core::error::{QueryContext, Result, SchemaDbError};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

impl Database {
    /// Executes `sql` and returns a cursor over its results.
    ///
    /// A single value is treated as one positional parameter. For write
    /// statements the cursor yields no rows and reports
    /// [`RowCursor::rows_affected`].
    ///
    /// # Errors
    ///
    /// `SchemaDbError::Query` carrying the SQL and parameters when the
    /// backend rejects the statement, or when the database stays locked past
    /// the lock timeout.
    pub fn execute(&mut self, sql: &str, params: impl Into<Params>) -> Result<RowCursor> {
        self.dispatch(sql, params.into(), None)
    }

    /// Compiles `sql` into the statement cache without running it, surfacing
    /// syntax errors and unknown tables early.
    pub fn prepare(&mut self, sql: &str) -> Result<()> {
        self.connect()?;
        let driver = self
            .driver
            .as_deref_mut()
            .ok_or(SchemaDbError::Driver(DriverError::Closed))?;
        lock_cache(&self.statements)
            .acquire(sql, driver)
            .map_err(|e| {
                SchemaDbError::from_driver(
                    e,
                    QueryContext {
                        sql: sql.to_string(),
                        params: Vec::new(),
                    },
                )
            })?;
        Ok(())
    }

    /// Runs a read statement. Rows are converted structurally, without
    /// column metadata.
    pub fn query(&mut self, sql: &str, params: impl Into<Params>) -> Result<RowCursor> {
        self.dispatch(sql, params.into(), None)
    }

    /// Runs a read statement whose rows are coerced with `table`'s schema.
    /// Result columns not in the table are converted structurally.
    pub fn query_table(
        &mut self,
        table: &str,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<RowCursor> {
        let schema = self.describe(table)?;
        self.dispatch(sql, params.into(), Some(schema))
    }

    pub fn fetch_all(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Row>> {
        self.query(sql, params)?.fetch_all()
    }

    pub fn fetch_row(&mut self, sql: &str, params: impl Into<Params>) -> Result<Option<Row>> {
        self.query(sql, params)?.fetch_row()
    }

    /// First column of the first row.
    pub fn fetch_value(&mut self, sql: &str, params: impl Into<Params>) -> Result<Option<Value>> {
        self.query(sql, params)?.fetch_value()
    }

    /// Inserts `row` into `table`.
    ///
    /// Columns the row supplies are written after write coercion. Required
    /// columns the row omits are written with their zero value. When the
    /// table has an auto-increment column the generated id is stored back
    /// into `row` and returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use schemadb::{Database, Row, Value};
    ///
    /// let mut db = Database::in_memory().unwrap();
    /// db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)", ())
    ///     .unwrap();
    /// let mut row = Row::new().with("name", "Fred").with("email", "fred@fred.com");
    /// db.insert("users", &mut row).unwrap();
    /// assert_eq!(row.get("id"), Some(&Value::Int(1)));
    /// ```
    pub fn insert<R: Record + ?Sized>(&mut self, table: &str, row: &mut R) -> Result<Option<i64>> {
        let schema = self.describe(table)?;
        let (sql, params) = build_insert(self.dialect(), &schema, &*row)?;
        self.dispatch(&sql, params, None)?.release();

        let Some(column) = schema.auto_increment() else {
            return Ok(None);
        };
        if let Some(existing) = row.field(&column.name).filter(|v| !v.is_null()) {
            return Ok(existing.as_i64());
        }
        let id = self.driver()?.last_insert_id()?;
        if let Some(id) = id {
            row.set_field(&column.name, Value::Int(id));
        }
        Ok(id)
    }

    /// Updates the row of `table` identified by the primary key values in
    /// `row`, returning the number of rows changed.
    pub fn update<R: Record + ?Sized>(&mut self, table: &str, row: &R) -> Result<u64> {
        let schema = self.describe(table)?;
        let (sql, params) = build_update(self.dialect(), &schema, row)?;
        let cursor = self.dispatch(&sql, params, None)?;
        let affected = cursor.rows_affected();
        cursor.release();
        Ok(affected)
    }

    /// Inserts `row` if no row with its primary key exists, otherwise updates
    /// it. Returns the primary key values in key order.
    pub fn save<R: Record + ?Sized>(&mut self, table: &str, row: &mut R) -> Result<Vec<Value>> {
        let schema = self.describe(table)?;
        let keys = schema.primary_key();
        if keys.is_empty() {
            return Err(SchemaDbError::Schema(format!(
                "table {} has no primary key",
                table
            )));
        }

        let conditions = key_conditions(&schema, &*row)?;
        let exists = if conditions.len() == keys.len() {
            let (sql, params) = build_select(self.dialect(), &schema, "1", &conditions, Some(1));
            self.dispatch(&sql, params, None)?.fetch_row()?.is_some()
        } else {
            false
        };

        if !exists {
            self.insert(table, row)?;
        } else if settable_columns(&schema, &*row).is_empty() {
            debug!("Nothing to update in {}, keeping existing row", table);
        } else {
            let (sql, params) = build_update(self.dialect(), &schema, &*row)?;
            self.dispatch(&sql, params, None)?.release();
        }

        Ok(keys
            .iter()
            .map(|c| row.field(&c.name).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Looks a row up by its single-column primary key.
    pub fn find_row(&mut self, table: &str, key: impl Into<Value>) -> Result<Option<Row>> {
        let schema = self.describe(table)?;
        let keys = schema.primary_key();
        let [column] = keys.as_slice() else {
            return Err(SchemaDbError::query(format!(
                "find_row on {} needs a single-column primary key, found {}",
                table,
                keys.len()
            )));
        };
        let key = key.into();
        if key.is_null() {
            return Ok(None);
        }
        let value = coerce_for_write(key, column)?;
        let (sql, params) =
            build_select(self.dialect(), &schema, "*", &[(*column, value)], Some(1));
        self.dispatch(&sql, params, Some(Arc::clone(&schema)))?
            .fetch_row()
    }

    /// Rows of `table` matching every field of `conditions`. NULL fields
    /// match NULL columns.
    pub fn find_by<R: Record + ?Sized>(&mut self, table: &str, conditions: &R) -> Result<Vec<Row>> {
        let schema = self.describe(table)?;
        let mut predicates = Vec::new();
        for name in conditions.field_names() {
            let column = schema.require_column(&name)?;
            let value = conditions.field(&name).cloned().unwrap_or_default();
            let value = if value.is_null() {
                value
            } else {
                coerce_for_write(value, column)?
            };
            predicates.push((column, value));
        }
        let (sql, params) = build_select(self.dialect(), &schema, "*", &predicates, None);
        self.dispatch(&sql, params, Some(Arc::clone(&schema)))?
            .fetch_all()
    }

    /// Deletes the row identified by the primary key values in `row`.
    pub fn delete<R: Record + ?Sized>(&mut self, table: &str, row: &R) -> Result<u64> {
        let schema = self.describe(table)?;
        let (sql, params) = build_delete(self.dialect(), &schema, row)?;
        let cursor = self.dispatch(&sql, params, None)?;
        let affected = cursor.rows_affected();
        cursor.release();
        Ok(affected)
    }

    fn dispatch(
        &mut self,
        sql: &str,
        params: Params,
        schema: Option<Arc<TableSchema>>,
    ) -> Result<RowCursor> {
        let bindings = params.to_bindings()?;
        let context = QueryContext {
            sql: sql.to_string(),
            params: params.labelled(),
        };
        self.last_query = Some(context.clone());
        self.connect()?;

        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            match self.execute_once(sql, &bindings) {
                Ok(statement) => {
                    return Ok(RowCursor::new(
                        statement,
                        Arc::downgrade(&self.statements),
                        schema,
                    ))
                }
                Err(e) if self.should_retry_execute(&e, started) => {
                    debug!("Database locked (attempt {}), retrying: {}", attempt, sql);
                    attempt += 1;
                    thread::sleep(self.config.retry_interval());
                }
                Err(e) => {
                    if e.is_locked() {
                        warn!("Database still locked after {} attempts: {}", attempt, sql);
                    }
                    return Err(SchemaDbError::from_driver(e, context));
                }
            }
        }
    }

    fn should_retry_execute(&self, err: &DriverError, started: Instant) -> bool {
        err.is_locked() && self.may_retry_lock(started)
    }

    fn execute_once(
        &mut self,
        sql: &str,
        bindings: &[Binding],
    ) -> std::result::Result<Statement, DriverError> {
        let driver = self.driver.as_deref_mut().ok_or(DriverError::Closed)?;
        let mut cache = lock_cache(&self.statements);
        let mut statement = cache.checkout(sql, driver)?;
        match driver.execute(sql, bindings) {
            Ok(result) => {
                statement.attach(result);
                Ok(statement)
            }
            Err(e) => {
                cache.release(statement);
                Err(e)
            }
        }
    }
}

/// Placeholder for a column, unique within one statement.
fn param_name(column: &str, used: &mut HashSet<String>) -> String {
    let mut base: String = column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert_str(0, "p_");
    }
    let mut name = format!(":{}", base);
    let mut suffix = 2;
    while !used.insert(name.to_ascii_lowercase()) {
        name = format!(":{}_{}", base, suffix);
        suffix += 1;
    }
    name
}

/// `col = :p`, or the null-safe form when comparing against NULL.
fn predicate(dialect: Dialect, column: &ColumnDescriptor, param: &str, value: &Value) -> String {
    let op = match (value.is_null(), dialect) {
        (false, _) => "=",
        (true, Dialect::Sqlite) => "IS",
        // MySQL's IS only takes literals
        (true, Dialect::MySql) => "<=>",
    };
    format!("{} {} {}", dialect.quote_ident(&column.name), op, param)
}

fn where_clause(
    dialect: Dialect,
    conditions: &[(&ColumnDescriptor, Value)],
    used: &mut HashSet<String>,
    params: &mut Vec<(String, Value)>,
) -> String {
    let predicates: Vec<String> = conditions
        .iter()
        .map(|(column, value)| {
            let param = param_name(&column.name, used);
            let rendered = predicate(dialect, column, &param, value);
            params.push((param, value.clone()));
            rendered
        })
        .collect();
    predicates.join(" AND ")
}

/// Primary key columns of `schema` with the non-null values `row` supplies.
fn key_conditions<'s, R: Record + ?Sized>(
    schema: &'s TableSchema,
    row: &R,
) -> Result<Vec<(&'s ColumnDescriptor, Value)>> {
    schema
        .primary_key()
        .into_iter()
        .filter_map(|column| {
            row.field(&column.name)
                .filter(|v| !v.is_null())
                .map(|v| (column, v.clone()))
        })
        .map(|(column, value)| Ok((column, coerce_for_write(value, column)?)))
        .collect()
}

/// Non-key, non-generated columns present in `row`.
fn settable_columns<'s, R: Record + ?Sized>(
    schema: &'s TableSchema,
    row: &R,
) -> Vec<&'s ColumnDescriptor> {
    schema
        .columns()
        .iter()
        .filter(|c| !c.is_primary_key && !c.is_auto_increment && row.has_field(&c.name))
        .collect()
}

pub(crate) fn build_insert<R: Record + ?Sized>(
    dialect: Dialect,
    schema: &TableSchema,
    row: &R,
) -> Result<(String, Params)> {
    let mut used = HashSet::new();
    let mut names = Vec::new();
    let mut params = Vec::new();

    for column in schema.columns() {
        let value = match row.field(&column.name) {
            Some(v) if v.is_null() && column.is_auto_increment => continue,
            // Let the backend apply its own default
            Some(v) if v.is_null() && !column.is_nullable && column.default_value.is_some() => {
                continue
            }
            Some(v) => v.clone(),
            None if !column.is_nullable
                && column.default_value.is_none()
                && !column.is_auto_increment =>
            {
                Value::Null
            }
            None => continue,
        };
        let value = coerce_for_write(value, column)?;
        names.push(dialect.quote_ident(&column.name));
        params.push((param_name(&column.name, &mut used), value));
    }

    let table = dialect.quote_ident(schema.name());
    let sql = if names.is_empty() {
        match dialect {
            Dialect::Sqlite => format!("INSERT INTO {} DEFAULT VALUES", table),
            Dialect::MySql => format!("INSERT INTO {} () VALUES ()", table),
        }
    } else {
        let placeholders: Vec<&str> = params.iter().map(|(p, _)| p.as_str()).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            placeholders.join(", ")
        )
    };
    Ok((sql, Params::Named(params)))
}

pub(crate) fn build_update<R: Record + ?Sized>(
    dialect: Dialect,
    schema: &TableSchema,
    row: &R,
) -> Result<(String, Params)> {
    let conditions = key_conditions(schema, row)?;
    if conditions.is_empty() {
        return Err(SchemaDbError::query(format!(
            "cannot update {}: no primary key value in row",
            schema.name()
        )));
    }
    let columns = settable_columns(schema, row);
    if columns.is_empty() {
        return Err(SchemaDbError::query(format!(
            "cannot update {}: no fields to set",
            schema.name()
        )));
    }

    let mut used = HashSet::new();
    let mut params = Vec::new();
    let mut assignments = Vec::with_capacity(columns.len());
    for column in columns {
        let value = row.field(&column.name).cloned().unwrap_or_default();
        let value = coerce_for_write(value, column)?;
        let param = param_name(&column.name, &mut used);
        assignments.push(format!("{} = {}", dialect.quote_ident(&column.name), param));
        params.push((param, value));
    }

    let mut sql = format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.quote_ident(schema.name()),
        assignments.join(", "),
        where_clause(dialect, &conditions, &mut used, &mut params)
    );
    if dialect.supports_update_limit() {
        sql.push_str(" LIMIT 1");
    }
    Ok((sql, Params::Named(params)))
}

pub(crate) fn build_select(
    dialect: Dialect,
    schema: &TableSchema,
    projection: &str,
    conditions: &[(&ColumnDescriptor, Value)],
    limit: Option<usize>,
) -> (String, Params) {
    let mut used = HashSet::new();
    let mut params = Vec::new();
    let mut sql = format!("SELECT {} FROM {}", projection, dialect.quote_ident(schema.name()));
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause(dialect, conditions, &mut used, &mut params));
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    (sql, Params::Named(params))
}

pub(crate) fn build_delete<R: Record + ?Sized>(
    dialect: Dialect,
    schema: &TableSchema,
    row: &R,
) -> Result<(String, Params)> {
    let conditions = key_conditions(schema, row)?;
    if conditions.is_empty() {
        return Err(SchemaDbError::query(format!(
            "cannot delete from {}: no primary key value in row",
            schema.name()
        )));
    }
    let mut used = HashSet::new();
    let mut params = Vec::new();
    let mut sql = format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_ident(schema.name()),
        where_clause(dialect, &conditions, &mut used, &mut params)
    );
    if dialect.supports_update_limit() {
        sql.push_str(" LIMIT 1");
    }
    Ok((sql, Params::Named(params)))
}
