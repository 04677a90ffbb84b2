/// Schema Catalog Module
///
/// Introspects per-table column metadata for both dialects and caches it for
/// the lifetime of the database handle. Cached schemas are never edited in
/// place; a forced re-describe replaces the entry.
use crate::core::db::driver::{
    BindTarget, BindValue, Binding, Dialect, Driver, DriverError, NativeValue,
};
use crate::core::db::value::{Temporal, Value};
use crate::core::error::{Result, SchemaDbError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Dialect-independent column classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum LogicalType {
    Bool,
    Int,
    Float,
    Date,
    DateTime,
    Enum,
    Text,
}

/// Native type patterns, tried in order. The first match wins.
static TYPE_PATTERNS: Lazy<Vec<(Regex, LogicalType)>> = Lazy::new(|| {
    [
        (r"^(bool|boolean|tinyint\(1\)|bit\(1\))", LogicalType::Bool),
        (r"\b(tiny|small|medium|big)?int(eger)?\d*\b|^year", LogicalType::Int),
        (r"^(real|float|double|decimal|dec|numeric|fixed)", LogicalType::Float),
        (r"^(datetime|timestamp)", LogicalType::DateTime),
        (r"^date\b", LogicalType::Date),
        (r"^(enum|set)\s*\(", LogicalType::Enum),
    ]
    .into_iter()
    .map(|(pattern, ty)| {
        let regex = Regex::new(&format!("(?i){}", pattern)).expect("type pattern is valid");
        (regex, ty)
    })
    .collect()
});

impl LogicalType {
    /// Maps a backend's native type string. Unmatched types are Text.
    pub fn from_native(type_name: &str) -> Self {
        let type_name = type_name.trim();
        TYPE_PATTERNS
            .iter()
            .find(|(regex, _)| regex.is_match(type_name))
            .map(|(_, ty)| *ty)
            .unwrap_or(LogicalType::Text)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, LogicalType::Date | LogicalType::DateTime)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::Bool => "bool",
            LogicalType::Int => "int",
            LogicalType::Float => "float",
            LogicalType::Date => "date",
            LogicalType::DateTime => "datetime",
            LogicalType::Enum => "enum",
            LogicalType::Text => "text",
        }
    }
}

/// A column default: a literal value, or a SQL expression the backend
/// evaluates (e.g. `CURRENT_TIMESTAMP`).
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Value),
    Expression(String),
}

impl DefaultValue {
    /// Resolves the default to a value the application can write.
    ///
    /// `CURRENT_TIMESTAMP`-family expressions evaluate to the current time;
    /// other expressions cannot be evaluated client-side.
    pub fn resolve(&self, logical_type: LogicalType) -> Option<Value> {
        match self {
            DefaultValue::Literal(v) => Some(v.clone()),
            DefaultValue::Expression(expr) => {
                let upper = expr.trim().to_ascii_uppercase();
                if upper == "CURRENT_DATE" || upper == "CURDATE()" {
                    Some(Value::Temporal(Temporal::now(true)))
                } else if upper.starts_with("CURRENT_TIMESTAMP")
                    || upper.starts_with("NOW(")
                    || upper == "LOCALTIMESTAMP"
                {
                    Some(Value::Temporal(Temporal::now(logical_type == LogicalType::Date)))
                } else {
                    None
                }
            }
        }
    }
}

/// Metadata for one table column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Column name in its original case
    pub name: String,
    pub logical_type: LogicalType,
    /// Raw backend type string, for diagnostics
    pub original_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub default_value: Option<DefaultValue>,
}

impl ColumnDescriptor {
    pub fn new(name: &str, original_type: &str) -> Self {
        ColumnDescriptor {
            name: name.to_string(),
            logical_type: LogicalType::from_native(original_type),
            original_type: original_type.to_string(),
            is_nullable: true,
            is_primary_key: false,
            is_auto_increment: false,
            default_value: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default_value = Some(default);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let default = match &self.default_value {
            None => serde_json::Value::Null,
            Some(DefaultValue::Literal(v)) => v.to_json(),
            Some(DefaultValue::Expression(e)) => serde_json::json!({ "expression": e }),
        };
        serde_json::json!({
            "name": self.name,
            "type": self.logical_type.as_str(),
            "original_type": self.original_type,
            "nullable": self.is_nullable,
            "primary_key": self.is_primary_key,
            "auto_increment": self.is_auto_increment,
            "default": default,
        })
    }
}

/// Ordered column metadata for one table, with a lower-cased name index.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDescriptor>,
    index: HashMap<String, usize>,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnDescriptor>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        TableSchema {
            name: name.to_string(),
            columns,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in backend-reported order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| &self.columns[i])
    }

    /// Like [`TableSchema::column`], failing with a schema error.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor> {
        self.column(name).ok_or_else(|| {
            SchemaDbError::Schema(format!("no such column: {}.{}", self.name, name))
        })
    }

    pub fn primary_key(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    pub fn auto_increment(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.is_auto_increment)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "table": self.name,
            "columns": self.columns.iter().map(ColumnDescriptor::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Per-handle cache of table schemas keyed by table name.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Returns the cached schema for `table`, introspecting it when absent or
    /// when `force` is set.
    pub fn describe(
        &mut self,
        driver: &mut dyn Driver,
        table: &str,
        force: bool,
    ) -> Result<Arc<TableSchema>> {
        if !force {
            if let Some(schema) = self.tables.get(table) {
                return Ok(Arc::clone(schema));
            }
        }

        debug!("Describing table {} ({})", table, driver.dialect());
        let schema = match driver.dialect() {
            Dialect::Sqlite => introspect_sqlite(driver, table)?,
            Dialect::MySql => introspect_mysql(driver, table)?,
        };
        let schema = Arc::new(schema);
        self.tables.insert(table.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn cached(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(table).cloned()
    }

    /// Seeds the cache with an externally built schema.
    pub fn insert(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        self.tables
            .insert(schema.name().to_string(), Arc::clone(&schema));
        schema
    }

    pub fn invalidate(&mut self, table: &str) {
        self.tables.remove(table);
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn text_binding(value: &str) -> Binding {
    Binding {
        target: BindTarget::Position(1),
        value: BindValue::Text(value.to_string()),
    }
}

fn cell_text(cell: Option<&NativeValue>) -> Option<String> {
    cell.and_then(NativeValue::as_text)
}

fn cell_int(cell: Option<&NativeValue>) -> i64 {
    match cell {
        Some(NativeValue::Integer(i)) => *i,
        Some(other) => other.as_text().and_then(|s| s.parse().ok()).unwrap_or(0),
        None => 0,
    }
}

/// Parses a SQLite `dflt_value`, which is the default's SQL source text.
fn parse_sqlite_default(raw: &str) -> Option<DefaultValue> {
    let text = raw.trim();
    if text.eq_ignore_ascii_case("NULL") {
        return None;
    }
    if text.len() >= 2 && text.starts_with('(') && text.ends_with(')') {
        return parse_sqlite_default(&text[1..text.len() - 1]);
    }
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        let inner = text[1..text.len() - 1].replace("''", "'");
        return Some(DefaultValue::Literal(Value::Text(inner)));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(DefaultValue::Literal(Value::Int(i)));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Some(DefaultValue::Literal(Value::Float(f)));
    }
    if text.eq_ignore_ascii_case("TRUE") {
        return Some(DefaultValue::Literal(Value::Bool(true)));
    }
    if text.eq_ignore_ascii_case("FALSE") {
        return Some(DefaultValue::Literal(Value::Bool(false)));
    }
    Some(DefaultValue::Expression(text.to_string()))
}

/// Interprets a MySQL `Default` column, which is the raw default value.
fn parse_mysql_default(raw: &str, logical_type: LogicalType) -> DefaultValue {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.starts_with("CURRENT_TIMESTAMP")
        || upper.starts_with("NOW(")
        || upper == "CURRENT_DATE"
        || upper == "CURDATE()"
    {
        return DefaultValue::Expression(raw.to_string());
    }

    let literal = match logical_type {
        LogicalType::Int => raw.parse::<i64>().map(Value::Int).ok(),
        LogicalType::Float => raw.parse::<f64>().map(Value::Float).ok(),
        LogicalType::Bool => match raw {
            "1" | "b'1'" => Some(Value::Bool(true)),
            "0" | "b'0'" => Some(Value::Bool(false)),
            _ => None,
        },
        LogicalType::Date | LogicalType::DateTime => Temporal::parse(raw)
            .map(|t| t.with_date_only(logical_type == LogicalType::Date))
            .map(Value::Temporal),
        LogicalType::Enum | LogicalType::Text => None,
    };
    DefaultValue::Literal(literal.unwrap_or_else(|| Value::Text(raw.to_string())))
}

/// Lock contention stays a driver error so the caller can retry it.
fn introspection_error(table: &str, err: DriverError) -> SchemaDbError {
    if err.is_locked() {
        SchemaDbError::Driver(err)
    } else {
        SchemaDbError::Schema(format!("cannot describe {}: {}", table, err))
    }
}

fn introspect_sqlite(driver: &mut dyn Driver, table: &str) -> Result<TableSchema> {
    let info = driver
        .execute_direct(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
            &[text_binding(table)],
        )
        .map_err(|e| introspection_error(table, e))?;

    if info.rows.is_empty() {
        return Err(SchemaDbError::Schema(format!("no such table: {}", table)));
    }

    let mut columns: Vec<ColumnDescriptor> = info
        .rows
        .iter()
        .map(|row| {
            let name = cell_text(row.get(1)).unwrap_or_default();
            let type_name = cell_text(row.get(2)).unwrap_or_default();
            let mut column = ColumnDescriptor::new(&name, &type_name);
            column.is_nullable = cell_int(row.get(3)) == 0;
            column.is_primary_key = cell_int(row.get(5)) > 0;
            column.default_value = cell_text(row.get(4)).and_then(|d| parse_sqlite_default(&d));
            column
        })
        .collect();

    let pk_positions: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_primary_key)
        .map(|(i, _)| i)
        .collect();

    if let [only] = pk_positions.as_slice() {
        let integer_key = columns[*only].original_type.eq_ignore_ascii_case("INTEGER");
        let generated = is_generated_key(driver, table, integer_key)
            .map_err(|e| introspection_error(table, e))?;
        columns[*only].is_auto_increment = generated;
    }

    Ok(TableSchema::new(table, columns))
}

/// Whether the sole primary key column of `table` is assigned by the engine.
///
/// A sole INTEGER PRIMARY KEY aliases the rowid, unless the key is backed by
/// an index of its own, as in WITHOUT ROWID tables and for
/// `INTEGER PRIMARY KEY DESC`.
fn is_generated_key(
    driver: &mut dyn Driver,
    table: &str,
    integer_key: bool,
) -> std::result::Result<bool, DriverError> {
    if integer_key && !has_primary_key_index(driver, table)? {
        return Ok(true);
    }
    has_sequence_entry(driver, table)
}

/// Whether `table`'s primary key has an index of its own instead of being
/// the rowid.
fn has_primary_key_index(
    driver: &mut dyn Driver,
    table: &str,
) -> std::result::Result<bool, DriverError> {
    let indexes = driver.execute_direct(
        "SELECT 1 FROM pragma_index_list(?1) WHERE origin = 'pk'",
        &[text_binding(table)],
    )?;
    Ok(!indexes.rows.is_empty())
}

/// Whether `table` is registered in SQLite's AUTOINCREMENT sequence table.
fn has_sequence_entry(
    driver: &mut dyn Driver,
    table: &str,
) -> std::result::Result<bool, DriverError> {
    let registry = driver.execute_direct(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
        &[],
    )?;
    if registry.rows.is_empty() {
        return Ok(false);
    }
    let entry = driver.execute_direct(
        "SELECT 1 FROM sqlite_sequence WHERE name = ?1",
        &[text_binding(table)],
    )?;
    Ok(!entry.rows.is_empty())
}

fn introspect_mysql(driver: &mut dyn Driver, table: &str) -> Result<TableSchema> {
    let sql = format!("DESCRIBE {}", Dialect::MySql.quote_ident(table));
    let info = driver
        .execute_direct(&sql, &[])
        .map_err(|e| introspection_error(table, e))?;

    if info.rows.is_empty() {
        return Err(SchemaDbError::Schema(format!("no such table: {}", table)));
    }

    let position = |name: &str, fallback: usize| {
        info.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .unwrap_or(fallback)
    };
    let (field, ty, null, key, default, extra) = (
        position("Field", 0),
        position("Type", 1),
        position("Null", 2),
        position("Key", 3),
        position("Default", 4),
        position("Extra", 5),
    );

    let columns = info
        .rows
        .iter()
        .map(|row| {
            let name = cell_text(row.get(field)).unwrap_or_default();
            let type_name = cell_text(row.get(ty)).unwrap_or_default();
            let mut column = ColumnDescriptor::new(&name, &type_name);
            column.is_nullable = cell_text(row.get(null))
                .map(|n| n.eq_ignore_ascii_case("YES"))
                .unwrap_or(true);
            column.is_primary_key = cell_text(row.get(key))
                .map(|k| k.eq_ignore_ascii_case("PRI"))
                .unwrap_or(false);
            column.is_auto_increment = cell_text(row.get(extra))
                .map(|e| e.to_ascii_lowercase().contains("auto_increment"))
                .unwrap_or(false);
            column.default_value = cell_text(row.get(default))
                .map(|d| parse_mysql_default(&d, column.logical_type));
            column
        })
        .collect();

    Ok(TableSchema::new(table, columns))
}
