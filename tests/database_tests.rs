//! End-to-end tests for the database handle against real SQLite databases
//!
//! These cover:
//! - record operations and their coercion round trips
//! - statement reuse across cursors and transactions
//! - transaction nesting and rollback
//! - lock contention between two connections to one file

use schemadb::{
    CursorState, Database, DatabaseConfig, Record, Row, SchemaDbError, Temporal, Value,
};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const SCHEMA: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    active BOOLEAN NOT NULL DEFAULT 1,
    logins INTEGER NOT NULL,
    born DATE,
    last_seen DATETIME,
    score REAL
)";

fn memory_db() -> Database {
    let mut db = Database::in_memory().unwrap();
    db.execute(SCHEMA, ()).unwrap();
    db
}

fn file_db(path: &Path, lock_timeout: Duration) -> Database {
    let config = DatabaseConfig::from_dsn(path.to_str().unwrap()).with_lock_timeout(lock_timeout);
    let mut db = Database::new(config);
    db.connect().unwrap();
    db
}

fn count(db: &mut Database) -> i64 {
    db.fetch_value("SELECT COUNT(*) FROM users", ())
        .unwrap()
        .and_then(|v| v.as_i64())
        .unwrap()
}

#[test]
fn test_insert_sets_id_and_find_row_returns_it() {
    let mut db = memory_db();
    let mut row = Row::new().with("name", "Fred").with("email", "fred@fred.com");
    db.insert("users", &mut row).unwrap();

    let id = row.get("id").and_then(Value::as_i64).unwrap();
    assert!(id > 0);

    let found = db.find_row("users", id).unwrap().unwrap();
    assert_eq!(found.get("id"), Some(&Value::Int(id)));
    assert_eq!(found.get("name"), Some(&Value::from("Fred")));
    assert_eq!(found.get("email"), Some(&Value::from("fred@fred.com")));
    // Defaults and zero values filled in by insert
    assert_eq!(found.get("active"), Some(&Value::Bool(true)));
    assert_eq!(found.get("logins"), Some(&Value::Int(0)));
    assert_eq!(found.get("born"), Some(&Value::Null));
}

#[test]
fn test_coerced_values_round_trip() {
    let mut db = memory_db();
    let mut row: BTreeMap<String, Value> = BTreeMap::new();
    row.insert("name".into(), Value::from("Ada"));
    row.insert("active".into(), Value::Bool(false));
    row.insert("logins".into(), Value::from(""));
    row.insert("born".into(), Value::from("12-10-1815"));
    row.insert("last_seen".into(), Value::Int(1_700_000_000));
    row.insert("score".into(), Value::Float(98.5));
    row.insert("email".into(), Value::from(""));
    db.insert("users", &mut row).unwrap();

    let id = row.field("id").cloned().unwrap();
    let found = db.find_row("users", id).unwrap().unwrap();
    assert_eq!(found.get("active"), Some(&Value::Bool(false)));
    assert_eq!(found.get("logins"), Some(&Value::Int(0)));
    assert_eq!(found.get("born").unwrap().to_string(), "1815-12-10");
    assert!(found.get("born").unwrap().as_temporal().unwrap().is_date_only());
    assert_eq!(found.get("last_seen").unwrap().to_string(), "2023-11-14 22:13:20");
    assert_eq!(found.get("score"), Some(&Value::Float(98.5)));
    assert_eq!(found.get("email"), Some(&Value::from("")));
}

#[test]
fn test_unparseable_date_is_type_error() {
    let mut db = memory_db();
    let mut row = Row::new().with("name", "Bob").with("born", "not a date");
    let err = db.insert("users", &mut row).unwrap_err();
    assert!(matches!(err, SchemaDbError::Type(_)));
    assert_eq!(count(&mut db), 0);
}

#[test]
fn test_query_table_coerces_only_known_columns() {
    let mut db = memory_db();
    let mut row = Row::new().with("name", "Fred").with("active", true);
    db.insert("users", &mut row).unwrap();

    let rows = db
        .query_table("users", "SELECT active, active AS flag, logins + 1 AS next FROM users", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows[0].get("active"), Some(&Value::Bool(true)));
    assert_eq!(rows[0].get("flag"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get("next"), Some(&Value::Int(1)));
}

#[test]
fn test_update_save_and_delete() {
    let mut db = memory_db();
    let mut row = Row::new().with("name", "Fred");
    let keys = db.save("users", &mut row).unwrap();
    assert_eq!(keys.len(), 1);
    let id = keys[0].clone();
    assert!(id.as_i64().unwrap() > 0);

    row.set("name", "Frederick");
    row.set("last_seen", Temporal::parse("2024-05-06T07:08:09Z").unwrap());
    assert_eq!(db.save("users", &mut row).unwrap(), vec![id.clone()]);
    assert_eq!(count(&mut db), 1);

    let found = db.find_row("users", id.clone()).unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&Value::from("Frederick")));
    assert_eq!(found.get("last_seen").unwrap().to_string(), "2024-05-06 07:08:09");

    let changed = db
        .update("users", &Row::new().with("id", id.clone()).with("logins", 3))
        .unwrap();
    assert_eq!(changed, 1);

    assert_eq!(db.delete("users", &Row::new().with("id", id.clone())).unwrap(), 1);
    assert!(db.find_row("users", id).unwrap().is_none());
}

#[test]
fn test_update_without_key_fails() {
    let mut db = memory_db();
    let err = db
        .update("users", &Row::new().with("name", "nobody"))
        .unwrap_err();
    assert!(matches!(err, SchemaDbError::Query { .. }));
}

#[test]
fn test_find_by_matches_null() {
    let mut db = memory_db();
    db.insert("users", &mut Row::new().with("name", "a").with("email", "a@x")).unwrap();
    db.insert("users", &mut Row::new().with("name", "b")).unwrap();
    db.insert("users", &mut Row::new().with("name", "c")).unwrap();

    let without_email = db
        .find_by("users", &Row::new().with("email", Value::Null))
        .unwrap();
    assert_eq!(without_email.len(), 2);

    let named = db.find_by("users", &Row::new().with("NAME", "a")).unwrap();
    assert_eq!(named.len(), 1);

    let err = db
        .find_by("users", &Row::new().with("nickname", "x"))
        .unwrap_err();
    assert!(matches!(err, SchemaDbError::Schema(_)));
}

#[test]
fn test_missing_table_is_schema_error() {
    let mut db = memory_db();
    let err = db.insert("nope", &mut Row::new().with("a", 1)).unwrap_err();
    assert!(matches!(err, SchemaDbError::Schema(_)));
}

#[test]
fn test_exhausted_cursor_makes_statement_reusable() {
    let mut db = memory_db();
    let sql = "SELECT * FROM users WHERE logins >= ?";
    db.fetch_all(sql, 0).unwrap();
    let before = db.statement_stats();

    let mut cursor = db.query(sql, 0).unwrap();
    assert_eq!(cursor.state(), CursorState::NotStarted);
    assert!(cursor.next_row().unwrap().is_none());
    assert_eq!(cursor.state(), CursorState::Exhausted);

    let after = db.statement_stats();
    assert_eq!(after.prepared, before.prepared);
    assert_eq!(after.hits, before.hits + 1);

    db.fetch_all(sql, 0).unwrap();
    assert_eq!(db.statement_stats().prepared, before.prepared);

    assert!(matches!(cursor.next_row(), Err(SchemaDbError::Iteration(_))));
}

#[test]
fn test_abandoned_cursor_forces_new_prepare() {
    let mut db = memory_db();
    db.insert("users", &mut Row::new().with("name", "a")).unwrap();
    db.insert("users", &mut Row::new().with("name", "b")).unwrap();

    let sql = "SELECT name FROM users ORDER BY id";
    let mut cursor = db.query(sql, ()).unwrap();
    cursor.next_row().unwrap();
    std::mem::forget(cursor);

    let before = db.statement_stats();
    let rows = db.fetch_all(sql, ()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(db.statement_stats().prepared, before.prepared + 1);
}

#[test]
fn test_concurrent_cursors_over_same_sql() {
    let mut db = memory_db();
    for name in ["a", "b", "c"] {
        db.insert("users", &mut Row::new().with("name", name)).unwrap();
    }

    let sql = "SELECT name FROM users WHERE id > ? ORDER BY id";
    let mut first = db.query(sql, 0).unwrap();
    let mut second = db.query(sql, 1).unwrap();

    let a = first.next_row().unwrap().unwrap();
    let b = second.next_row().unwrap().unwrap();
    assert_eq!(a.get("name"), Some(&Value::from("a")));
    assert_eq!(b.get("name"), Some(&Value::from("b")));
    assert_eq!(first.fetch_all().unwrap().len(), 2);
    assert_eq!(second.fetch_all().unwrap().len(), 1);
}

#[test]
fn test_transaction_rolls_back_on_error() {
    let mut db = memory_db();
    let result: schemadb::Result<()> = db.transaction(|db| {
        db.insert("users", &mut Row::new().with("name", "a"))?;
        db.insert("users", &mut Row::new().with("name", "b"))?;
        Err(SchemaDbError::query("changed my mind"))
    });
    assert!(result.is_err());
    assert_eq!(count(&mut db), 0);

    db.transaction(|db| db.insert("users", &mut Row::new().with("name", "c")))
        .unwrap();
    assert_eq!(count(&mut db), 1);
}

#[test]
fn test_nested_transaction_is_rejected() {
    let mut db = memory_db();
    let err = db
        .transaction(|db| {
            db.insert("users", &mut Row::new().with("name", "outer"))?;
            db.transaction(|db| db.insert("users", &mut Row::new().with("name", "inner")))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        SchemaDbError::Transaction(ref m) if m.contains("already in a transaction")
    ));
    assert_eq!(count(&mut db), 0);
    assert_eq!(db.depth(), 0);
}

#[test]
fn test_disconnect_closes_statements_and_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_secs(1));
    db.execute(SCHEMA, ()).unwrap();
    db.insert("users", &mut Row::new().with("name", "Fred")).unwrap();

    let sql = "SELECT name FROM users";
    let pending = db.query(sql, ()).unwrap();
    db.disconnect().unwrap();
    drop(pending);

    let before = db.statement_stats();
    let name = db.fetch_value(sql, ()).unwrap();
    assert_eq!(name, Some(Value::from("Fred")));
    assert_eq!(db.statement_stats().prepared, before.prepared + 1);
}

#[test]
fn test_disconnect_inside_transaction_keeps_connection() {
    let mut db = memory_db();
    let err = db
        .transaction(|db| {
            db.insert("users", &mut Row::new().with("name", "a"))?;
            db.disconnect()
        })
        .unwrap_err();
    assert!(matches!(err, SchemaDbError::Transaction(_)));
    assert_eq!(db.depth(), 0);
    assert!(db.is_connected());
    assert_eq!(count(&mut db), 0);
}

#[test]
fn test_without_rowid_table_takes_supplied_key() {
    let mut db = memory_db();
    db.execute("CREATE TABLE w (id INTEGER PRIMARY KEY, x TEXT) WITHOUT ROWID", ())
        .unwrap();
    assert!(db.describe("w").unwrap().auto_increment().is_none());

    let mut row = Row::new().with("id", 7).with("x", "a");
    db.insert("w", &mut row).unwrap();
    assert_eq!(row.get("id"), Some(&Value::Int(7)));
    let found = db.find_row("w", 7).unwrap().unwrap();
    assert_eq!(found.get("x"), Some(&Value::from("a")));
}

#[test]
fn test_small_statement_cache_evicts_and_recompiles() {
    let config = DatabaseConfig::from_dsn(":memory:").with_statement_cache_size(2);
    let mut db = Database::new(config);
    db.execute(SCHEMA, ()).unwrap();
    db.insert("users", &mut Row::new().with("name", "a")).unwrap();

    let queries = ["SELECT name FROM users", "SELECT id FROM users", "SELECT logins FROM users"];
    for sql in queries {
        assert_eq!(db.fetch_all(sql, ()).unwrap().len(), 1);
    }
    let before = db.statement_stats();
    db.fetch_all(queries[2], ()).unwrap();
    assert_eq!(db.statement_stats().prepared, before.prepared);

    // Evicted by the later queries, so compiled again
    let name = db.fetch_value(queries[0], ()).unwrap();
    assert_eq!(name, Some(Value::from("a")));
    assert_eq!(db.statement_stats().prepared, before.prepared + 1);
}

/// Holds a write lock on `path` from another connection until `release`
/// receives a message or is dropped.
fn hold_write_lock(path: &Path) -> (thread::JoinHandle<()>, mpsc::Sender<()>) {
    hold_lock(path, "IMMEDIATE")
}

/// Like [`hold_write_lock`], but `EXCLUSIVE` also shuts out readers.
fn hold_lock(path: &Path, mode: &'static str) -> (thread::JoinHandle<()>, mpsc::Sender<()>) {
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let path = path.to_path_buf();
    let holder = thread::spawn(move || {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(&format!(
            "BEGIN {}; INSERT INTO users (name, logins) VALUES ('holder', 0);",
            mode
        ))
        .unwrap();
        locked_tx.send(()).unwrap();
        let _ = release_rx.recv();
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();
    (holder, release_tx)
}

#[test]
fn test_locked_execute_is_retried_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_secs(10));
    db.execute(SCHEMA, ()).unwrap();
    db.describe("users").unwrap();

    let (holder, release) = hold_write_lock(&path);
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        release.send(()).unwrap();
    });

    let started = Instant::now();
    db.insert("users", &mut Row::new().with("name", "Fred")).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    releaser.join().unwrap();
    holder.join().unwrap();
    assert_eq!(count(&mut db), 2);
}

#[test]
fn test_locked_execute_times_out_with_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_millis(50));
    db.execute(SCHEMA, ()).unwrap();
    db.describe("users").unwrap();

    let (holder, release) = hold_write_lock(&path);
    let started = Instant::now();
    let err = db
        .insert("users", &mut Row::new().with("name", "Fred"))
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(err.is_locked());
    let context = err.query_context().unwrap();
    assert!(context.sql.starts_with("INSERT INTO \"users\""));
    assert_eq!(context.params[0], (":name".to_string(), Value::from("Fred")));

    release.send(()).unwrap();
    holder.join().unwrap();
}

#[test]
fn test_locked_describe_is_retried_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_secs(5));
    db.execute(SCHEMA, ()).unwrap();

    let (holder, release) = hold_lock(&path, "EXCLUSIVE");
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        release.send(()).unwrap();
    });

    let started = Instant::now();
    let schema = db.describe("users").unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(schema.auto_increment().unwrap().name, "id");

    releaser.join().unwrap();
    holder.join().unwrap();
}

#[test]
fn test_locked_describe_times_out_as_lock_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_millis(50));
    db.execute(SCHEMA, ()).unwrap();

    let (holder, release) = hold_lock(&path, "EXCLUSIVE");
    let started = Instant::now();
    let err = db.describe("users").unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(err.is_locked());
    assert!(!matches!(err, SchemaDbError::Schema(_)));

    release.send(()).unwrap();
    holder.join().unwrap();

    // Nothing was cached by the failed attempt
    assert_eq!(db.describe("users").unwrap().columns().len(), 8);
}

#[test]
fn test_locked_describe_restarts_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_secs(10));
    db.execute(SCHEMA, ()).unwrap();

    let (holder, release) = hold_lock(&path, "EXCLUSIVE");
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        release.send(()).unwrap();
    });

    let attempts = Cell::new(0);
    db.transaction(|db| {
        attempts.set(attempts.get() + 1);
        db.insert("users", &mut Row::new().with("name", "Fred"))
    })
    .unwrap();
    assert!(attempts.get() > 1);

    releaser.join().unwrap();
    holder.join().unwrap();
    assert_eq!(count(&mut db), 2);
}

#[test]
fn test_locked_transaction_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let mut db = file_db(&path, Duration::from_secs(10));
    db.execute(SCHEMA, ()).unwrap();
    db.describe("users").unwrap();

    let (holder, release) = hold_write_lock(&path);
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        release.send(()).unwrap();
    });

    let attempts = Cell::new(0);
    db.transaction(|db| {
        attempts.set(attempts.get() + 1);
        db.insert("users", &mut Row::new().with("name", "Fred"))
    })
    .unwrap();
    assert!(attempts.get() > 1);

    releaser.join().unwrap();
    holder.join().unwrap();
    assert_eq!(count(&mut db), 2);
}
