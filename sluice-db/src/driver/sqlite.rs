use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{ColumnInfo, Row};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Row as _, Sqlite, TypeInfo, ValueRef};

use super::{blob_to_value, float_to_value, Connection, Connector, ExecOutcome};

/// Opens SQLite connections in WAL mode so the read connection keeps working
/// while a slot connection holds a write transaction.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Options from a `sqlite://path` URL; the file is created if missing
    pub fn new(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5)) // Slots write from separate connections
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        Ok(Self { options })
    }

    pub fn from_options(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, sqlx::Error> {
        let conn = self.options.connect().await?;
        Ok(Box::new(SqliteConnection {
            conn,
            in_transaction: false,
        }))
    }
}

pub struct SqliteConnection {
    conn: sqlx::SqliteConnection,
    in_transaction: bool,
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> SqliteQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    })
}

fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            // Storage class of the value, not the declared column type
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => float_to_value(row.try_get_unchecked::<f64, _>(i)?),
                "BLOB" => blob_to_value(&row.try_get_unchecked::<Vec<u8>, _>(i)?),
                _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, sqlx::Error> {
        let done = bind_all(sql, params).execute(&mut self.conn).await?;
        let last_insert_id = u64::try_from(done.last_insert_rowid()).ok().filter(|id| *id > 0);
        Ok(ExecOutcome {
            rows_affected: done.rows_affected(),
            last_insert_id,
        })
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, sqlx::Error> {
        let rows = bind_all(sql, params).fetch_all(&mut self.conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn describe(&mut self, table: &str) -> Result<Vec<ColumnInfo>, sqlx::Error> {
        let sql = format!("PRAGMA table_info('{}')", table.replace('\'', "''"));
        let rows = sqlx::query(&sql).fetch_all(&mut self.conn).await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo, sqlx::Error> {
                let pk: i64 = row.try_get("pk")?;
                let notnull: i64 = row.try_get("notnull")?;
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    column_type: row.try_get("type")?,
                    nullable: notnull == 0,
                    key: if pk > 0 { "PRI".to_string() } else { String::new() },
                    default: row.try_get("dflt_value")?,
                    extra: String::new(),
                })
            })
            .collect()
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        if self.in_transaction {
            return Err(sqlx::Error::Protocol("transaction already active".into()));
        }
        sqlx::Executor::execute(&mut self.conn, "BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        sqlx::Executor::execute(&mut self.conn, "COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        let result = sqlx::Executor::execute(&mut self.conn, "ROLLBACK").await;
        self.in_transaction = false;
        result.map(|_| ())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error> {
        sqlx::Connection::close(self.conn).await
    }
}
