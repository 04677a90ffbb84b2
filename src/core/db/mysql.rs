/// MySQL Driver Module
///
/// Client/server dialect backed by sqlx. Calls are driven to completion on a
/// private current-thread runtime so the driver keeps the same blocking
/// contract as the embedded one.
use crate::core::db::driver::{
    BindTarget, BindValue, Binding, Dialect, Driver, DriverError, NativeResult, NativeValue,
    StatementKind,
};
use crate::core::db::params::rewrite_named_placeholders;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, TypeInfo, ValueRef};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

pub struct MySqlDriver {
    runtime: Runtime,
    connection: Option<MySqlConnection>,
    last_insert_id: Option<i64>,
}

impl MySqlDriver {
    pub fn connect(
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        options: &[(String, String)],
    ) -> Result<Self, DriverError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DriverError::Unsupported(format!("cannot start runtime: {}", e)))?;

        let mut connect_options: MySqlConnectOptions = url.parse()?;
        if let Some(user) = user {
            connect_options = connect_options.username(user);
        }
        if let Some(password) = password {
            connect_options = connect_options.password(password);
        }
        for (name, value) in options {
            connect_options = match name.as_str() {
                "charset" => connect_options.charset(value),
                "collation" => connect_options.collation(value),
                "timezone" => connect_options.timezone(Some(value.clone())),
                other => {
                    warn!("Ignoring unsupported MySQL option {}", other);
                    connect_options
                }
            };
        }

        let connection = runtime.block_on(connect_options.connect())?;
        debug!("Connected to MySQL at {}", url);

        Ok(MySqlDriver {
            runtime,
            connection: Some(connection),
            last_insert_id: None,
        })
    }

    fn run_raw(&mut self, sql: &str) -> Result<(), DriverError> {
        let MySqlDriver {
            runtime, connection, ..
        } = self;
        let conn = connection.as_mut().ok_or(DriverError::Closed)?;
        runtime.block_on((&mut *conn).execute(sql))?;
        Ok(())
    }
}

/// Orders bindings to match the positional placeholders of the rewritten SQL.
fn ordered_values<'b>(
    names: &[String],
    bindings: &'b [Binding],
) -> Result<Vec<&'b BindValue>, DriverError> {
    if names.is_empty() {
        let mut positional: Vec<(usize, &BindValue)> = bindings
            .iter()
            .map(|b| match &b.target {
                BindTarget::Position(pos) => Ok((*pos, &b.value)),
                BindTarget::Name(name) => Err(DriverError::Unsupported(format!(
                    "named parameter {} in a statement without named placeholders",
                    name
                ))),
            })
            .collect::<Result<_, _>>()?;
        positional.sort_by_key(|(pos, _)| *pos);
        return Ok(positional.into_iter().map(|(_, v)| v).collect());
    }

    names
        .iter()
        .map(|name| {
            bindings
                .iter()
                .find(|b| matches!(&b.target, BindTarget::Name(n) if n == name))
                .map(|b| &b.value)
                .ok_or_else(|| DriverError::Unsupported(format!("unbound parameter {}", name)))
        })
        .collect()
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &BindValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Int(i) => query.bind(*i),
        BindValue::Bool(b) => query.bind(*b),
        BindValue::Text(s) => query.bind(s.clone()),
        BindValue::Blob(b) => query.bind(b.clone()),
    }
}

fn decode_cell(row: &MySqlRow, idx: usize) -> Result<NativeValue, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(NativeValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    Ok(match type_name.as_str() {
        "BOOLEAN" => NativeValue::Integer(i64::from(row.try_get_unchecked::<bool, _>(idx)?)),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            NativeValue::Integer(row.try_get_unchecked::<i64, _>(idx)?)
        }
        name if name.ends_with(" UNSIGNED") => {
            let unsigned = row.try_get_unchecked::<u64, _>(idx)?;
            match i64::try_from(unsigned) {
                Ok(i) => NativeValue::Integer(i),
                Err(_) => NativeValue::Text(unsigned.to_string()),
            }
        }
        "FLOAT" => NativeValue::Real(f64::from(row.try_get_unchecked::<f32, _>(idx)?)),
        "DOUBLE" => NativeValue::Real(row.try_get_unchecked::<f64, _>(idx)?),
        "DATE" => NativeValue::Text(
            row.try_get_unchecked::<chrono::NaiveDate, _>(idx)?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        "DATETIME" | "TIMESTAMP" => NativeValue::Text(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(idx)?
                .format("%Y-%m-%d %H:%M:%S%.f")
                .to_string(),
        ),
        "TIME" => NativeValue::Text(
            row.try_get_unchecked::<chrono::NaiveTime, _>(idx)?
                .format("%H:%M:%S")
                .to_string(),
        ),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            NativeValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?)
        }
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => NativeValue::Text(text),
            Err(_) => NativeValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        },
    })
}

fn collect_rows(rows: &[MySqlRow]) -> Result<NativeResult, sqlx::Error> {
    let columns: Vec<String> = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut result = NativeResult {
        columns,
        ..NativeResult::default()
    };
    for row in rows {
        let mut values = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            values.push(decode_cell(row, idx)?);
        }
        result.rows.push(values);
    }
    Ok(result)
}

impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn prepare(&mut self, sql: &str) -> Result<(), DriverError> {
        let (rewritten, _) = rewrite_named_placeholders(sql);
        let MySqlDriver {
            runtime, connection, ..
        } = self;
        let conn = connection.as_mut().ok_or(DriverError::Closed)?;
        runtime.block_on((&mut *conn).prepare(rewritten.as_str()))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, bindings: &[Binding]) -> Result<NativeResult, DriverError> {
        let (rewritten, names) = rewrite_named_placeholders(sql);
        let values = ordered_values(&names, bindings)?;
        let kind = StatementKind::from_sql(&rewritten);

        let MySqlDriver {
            runtime,
            connection,
            last_insert_id,
        } = self;
        let conn = connection.as_mut().ok_or(DriverError::Closed)?;

        runtime.block_on(async {
            if values.is_empty() {
                // Text protocol; DESCRIBE and SHOW are not always preparable
                if kind.returns_rows() {
                    let rows = (&mut *conn).fetch_all(rewritten.as_str()).await?;
                    return collect_rows(&rows).map_err(DriverError::from);
                }
                let done = (&mut *conn).execute(rewritten.as_str()).await?;
                *last_insert_id = i64::try_from(done.last_insert_id()).ok().filter(|id| *id > 0);
                return Ok(NativeResult {
                    rows_affected: done.rows_affected(),
                    ..NativeResult::default()
                });
            }

            let mut query = sqlx::query(rewritten.as_str());
            for value in values {
                query = bind_value(query, value);
            }
            if kind.returns_rows() {
                let rows = query.fetch_all(&mut *conn).await?;
                collect_rows(&rows).map_err(DriverError::from)
            } else {
                let done = query.execute(&mut *conn).await?;
                *last_insert_id = i64::try_from(done.last_insert_id()).ok().filter(|id| *id > 0);
                Ok(NativeResult {
                    rows_affected: done.rows_affected(),
                    ..NativeResult::default()
                })
            }
        })
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.run_raw("START TRANSACTION")
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.run_raw("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.run_raw("ROLLBACK")
    }

    fn last_insert_id(&mut self) -> Result<Option<i64>, DriverError> {
        Ok(self.last_insert_id)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if let Some(conn) = self.connection.take() {
            self.runtime.block_on(conn.close())?;
        }
        Ok(())
    }
}
