/// Type Coercion Module
///
/// Pure conversions between application values and backend values, driven
/// only by column metadata. Write coercion runs on insert/update; read
/// coercion runs per cell as rows are materialized.
use crate::core::db::driver::NativeValue;
use crate::core::db::record::Row;
use crate::core::db::schema::{ColumnDescriptor, LogicalType, TableSchema};
use crate::core::db::value::{Temporal, Value};
use crate::core::error::{Result, SchemaDbError};

/// The zero value written for a non-nullable column that received nothing.
fn zero_value(logical_type: LogicalType) -> Option<Value> {
    match logical_type {
        LogicalType::Int => Some(Value::Int(0)),
        LogicalType::Float => Some(Value::Float(0.0)),
        LogicalType::Bool => Some(Value::Bool(false)),
        LogicalType::Text => Some(Value::Text(String::new())),
        LogicalType::Date | LogicalType::DateTime | LogicalType::Enum => None,
    }
}

/// Converts an application value into one the backend accepts for `column`.
///
/// Rules, first applicable wins:
/// 1. `""` on a non-Text column: NULL when nullable, otherwise 0, false or
///    the current time depending on the column type.
/// 2. NULL on a non-nullable column: the column default, otherwise `''`, 0
///    or false. Date/DateTime and Enum columns without a default keep NULL.
/// 3. A number on a Date/DateTime column is a Unix timestamp.
/// 4. A string on a Date/DateTime column is parsed as a date expression.
/// 5. Anything else passes through.
///
/// Structured values are rejected.
pub fn coerce_for_write(value: Value, column: &ColumnDescriptor) -> Result<Value> {
    let ty = column.logical_type;

    if value.is_empty_string() && ty != LogicalType::Text {
        if column.is_nullable {
            return Ok(Value::Null);
        }
        return Ok(match ty {
            LogicalType::Int => Value::Int(0),
            LogicalType::Float => Value::Float(0.0),
            LogicalType::Bool => Value::Bool(false),
            LogicalType::Date => Value::Temporal(Temporal::now(true)),
            LogicalType::DateTime => Value::Temporal(Temporal::now(false)),
            LogicalType::Enum | LogicalType::Text => value,
        });
    }

    if value.is_null() {
        if column.is_nullable {
            return Ok(Value::Null);
        }
        let fallback = column
            .default_value
            .as_ref()
            .and_then(|d| d.resolve(ty))
            .or_else(|| zero_value(ty));
        return Ok(fallback.unwrap_or(Value::Null));
    }

    match (ty, value) {
        (LogicalType::Date | LogicalType::DateTime, Value::Int(seconds)) => {
            timestamp_value(seconds as f64, column)
        }
        (LogicalType::Date | LogicalType::DateTime, Value::Float(seconds)) => {
            timestamp_value(seconds, column)
        }
        (LogicalType::Date | LogicalType::DateTime, Value::Text(text)) => {
            match Temporal::parse(&text) {
                Some(t) if ty == LogicalType::Date => Ok(Value::Temporal(t.with_date_only(true))),
                Some(t) => Ok(Value::Temporal(t)),
                None => Err(SchemaDbError::Type(format!(
                    "cannot parse '{}' as a date for column {}",
                    text, column.name
                ))),
            }
        }
        (_, Value::Structured(v)) => Err(SchemaDbError::Type(format!(
            "column {} cannot store a structured value: {}",
            column.name, v
        ))),
        (_, other) => Ok(other),
    }
}

fn timestamp_value(seconds: f64, column: &ColumnDescriptor) -> Result<Value> {
    Temporal::from_timestamp(seconds, column.logical_type == LogicalType::Date)
        .map(Value::Temporal)
        .ok_or_else(|| {
            SchemaDbError::Type(format!(
                "timestamp {} is out of range for column {}",
                seconds, column.name
            ))
        })
}

/// Structural conversion of a raw cell, used when no column metadata applies.
pub fn native_to_value(raw: NativeValue) -> Value {
    match raw {
        NativeValue::Null => Value::Null,
        NativeValue::Integer(i) => Value::Int(i),
        NativeValue::Real(f) => Value::Float(f),
        NativeValue::Text(s) => Value::Text(s),
        NativeValue::Blob(b) => Value::Blob(b),
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" | "" => Some(false),
        other => other.parse::<f64>().ok().map(|f| f != 0.0),
    }
}

/// Converts a raw driver value to the typed value for `logical_type`.
///
/// NULL stays NULL. Text that cannot be read as the target type is kept as
/// text rather than guessed at.
pub fn coerce_for_read(raw: NativeValue, logical_type: LogicalType) -> Value {
    if raw.is_null() {
        return Value::Null;
    }

    match (logical_type, raw) {
        (LogicalType::Bool, NativeValue::Integer(i)) => Value::Bool(i != 0),
        (LogicalType::Bool, NativeValue::Real(f)) => Value::Bool(f != 0.0),
        (LogicalType::Bool, NativeValue::Text(s)) => {
            parse_bool(&s).map(Value::Bool).unwrap_or(Value::Text(s))
        }

        (LogicalType::Int, NativeValue::Real(f)) => Value::Int(f.trunc() as i64),
        (LogicalType::Int, NativeValue::Text(s)) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.trunc() as i64))
                .map(Value::Int)
                .unwrap_or(Value::Text(s))
        }

        (LogicalType::Float, NativeValue::Integer(i)) => Value::Float(i as f64),
        (LogicalType::Float, NativeValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(s)),

        (LogicalType::Date | LogicalType::DateTime, NativeValue::Integer(i)) => {
            Temporal::from_timestamp(i as f64, logical_type == LogicalType::Date)
                .map(Value::Temporal)
                .unwrap_or(Value::Int(i))
        }
        (LogicalType::Date | LogicalType::DateTime, NativeValue::Real(f)) => {
            Temporal::from_timestamp(f, logical_type == LogicalType::Date)
                .map(Value::Temporal)
                .unwrap_or(Value::Float(f))
        }
        (LogicalType::Date | LogicalType::DateTime, NativeValue::Text(s)) => {
            match Temporal::parse(&s) {
                Some(t) if logical_type == LogicalType::Date => {
                    Value::Temporal(t.with_date_only(true))
                }
                Some(t) => Value::Temporal(t),
                None => Value::Text(s),
            }
        }

        (_, other) => native_to_value(other),
    }
}

/// Materializes one result row, coercing each cell whose column appears in
/// `schema`. Aliased or computed columns are converted structurally.
pub fn coerce_row(
    columns: &[String],
    raw: Vec<NativeValue>,
    schema: Option<&TableSchema>,
) -> Row {
    let values = columns
        .iter()
        .zip(raw)
        .map(|(name, cell)| {
            match schema.and_then(|s| s.column(name)) {
                Some(column) if !cell.is_null() => coerce_for_read(cell, column.logical_type),
                _ => native_to_value(cell),
            }
        })
        .collect();
    Row::from_parts(columns.to_vec(), values)
}
