/// Database Module
///
/// The schema-aware query layer, organized into focused submodules.
///
/// ## Architecture
///
/// - **Driver** (`driver.rs`, `sqlite.rs`, `mysql.rs`): the low-level contract and one implementation per dialect
/// - **Values** (`value.rs`, `record.rs`, `params.rs`): application values, rows and statement parameters
/// - **Schema Catalog** (`schema.rs`): per-table column metadata, introspected once and cached
/// - **Type Coercion** (`coerce.rs`): write and read conversions driven by column metadata
/// - **Statement Cache** (`statement.rs`): prepared statements scoped per transaction level
/// - **Connection** (`connection.rs`): the `Database` handle owning all of the above
/// - **Transactions** (`transaction.rs`): begin/commit/rollback with lock retry
/// - **Query Execution** (`query.rs`, `cursor.rs`): dispatch, record operations and row cursors
///
/// ## Error Handling
///
/// All operations return the crate-wide `SchemaDbError`.
pub mod coerce;
pub mod connection;
pub mod cursor;
pub mod driver;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod params;
pub mod query;
pub mod record;
pub mod schema;
pub mod sqlite;
pub mod statement;
pub mod transaction;
pub mod value;

pub use connection::{open_driver, Database};
pub use cursor::{CursorState, RowCursor, Rows};
pub use driver::{Dialect, Driver, DriverError, NativeValue};
pub use params::Params;
pub use record::{Record, Row};
pub use schema::{Catalog, ColumnDescriptor, DefaultValue, LogicalType, TableSchema};
pub use statement::StatementStats;
pub use value::{Temporal, Value};
