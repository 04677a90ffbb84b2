/// Error Module
///
/// This module defines the error types shared across the crate. Schema,
/// coercion, query, transaction and cursor failures each have their own
/// variant so callers can match on the class of failure.
use crate::core::db::driver::DriverError;
use crate::core::db::value::Value;
use std::fmt;
use thiserror::Error;

/// The SQL text and bound parameters of the statement that failed.
///
/// Attached to query errors so a failure can be reproduced from the
/// message alone.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sql: {}", self.sql)?;
        if !self.params.is_empty() {
            let rendered: Vec<String> = self
                .params
                .iter()
                .map(|(name, value)| format!("{} => {}", name, value.to_sql_literal()))
                .collect();
            write!(f, "; params: [{}]", rendered.join(", "))?;
        }
        Ok(())
    }
}

fn render_query_error(message: &str, context: &Option<QueryContext>) -> String {
    match context {
        Some(context) => format!("{} ({})", message, context),
        None => message.to_string(),
    }
}

/// Crate-wide error type.
///
/// - `Schema`: a table or column does not exist
/// - `Type`: a value cannot be coerced to a column's type
/// - `Query`: statement execution failed, or a generated statement is invalid
/// - `Transaction`: nesting violations
/// - `Iteration`: a cursor was iterated again after it was exhausted
#[derive(Error, Debug)]
pub enum SchemaDbError {
    /// Table or column not found
    #[error("Schema error: {0}")]
    Schema(String),

    /// Value not coercible to a column's type
    #[error("Type error: {0}")]
    Type(String),

    /// Native execution failure or an invalid generated statement
    #[error("Query error: {}", render_query_error(.message, .context))]
    Query {
        message: String,
        context: Option<QueryContext>,
        #[source]
        source: Option<DriverError>,
    },

    /// Re-entrant nesting violation or nesting depth exceeded
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Re-iterating an exhausted cursor
    #[error("Iteration error: {0}")]
    Iteration(String),

    /// Driver failures outside statement execution (connect, begin, commit)
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaDbError {
    /// Builds a query error for a statement that could not be generated or
    /// executed, without a native cause.
    pub fn query(message: impl Into<String>) -> Self {
        SchemaDbError::Query {
            message: message.into(),
            context: None,
            source: None,
        }
    }

    /// Wraps a native execution failure together with the statement that caused it.
    pub fn from_driver(source: DriverError, context: QueryContext) -> Self {
        SchemaDbError::Query {
            message: source.to_string(),
            context: Some(context),
            source: Some(source),
        }
    }

    /// Returns true when the failure is the embedded engine's lock contention
    /// signature, the only class retried automatically.
    pub fn is_locked(&self) -> bool {
        match self {
            SchemaDbError::Query {
                source: Some(source),
                ..
            } => source.is_locked(),
            SchemaDbError::Driver(source) => source.is_locked(),
            _ => false,
        }
    }

    /// The statement context attached to a query error, if any.
    pub fn query_context(&self) -> Option<&QueryContext> {
        match self {
            SchemaDbError::Query { context, .. } => context.as_ref(),
            _ => None,
        }
    }
}

/// Type alias for Result to use SchemaDbError as the error type.
pub type Result<T> = std::result::Result<T, SchemaDbError>;
