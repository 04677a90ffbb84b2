//! Schema-aware query execution for SQLite and MySQL.
//!
//! A [`Database`] handle introspects table schemas, coerces values to column
//! types on write and read, caches prepared statements per transaction level
//! and retries SQLite lock contention.

// Core infrastructure modules
pub mod config;
pub mod core;

#[cfg(test)]
mod test_utils;

pub use crate::config::{Config, DatabaseConfig};
pub use crate::core::db::{
    ColumnDescriptor, CursorState, Database, Dialect, LogicalType, Params, Record, Row,
    RowCursor, StatementStats, TableSchema, Temporal, Value,
};
pub use crate::core::{QueryContext, Result, SchemaDbError};
