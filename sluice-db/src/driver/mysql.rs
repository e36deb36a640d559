use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sluice_core::{ColumnInfo, QueryBuilder, Row};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, MySql, Row as _, TypeInfo, ValueRef};

use super::{blob_to_value, float_to_value, Connection, Connector, ExecOutcome};

pub const DEFAULT_CHARSET: &str = "utf8mb4";

#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
}

impl MySqlConnector {
    pub fn new(url: &str, charset: &str) -> Result<Self, sqlx::Error> {
        let options = MySqlConnectOptions::from_str(url)?.charset(charset);
        Ok(Self { options })
    }

    pub fn from_options(options: MySqlConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, sqlx::Error> {
        let conn = self.options.connect().await?;
        Ok(Box::new(MySqlConnection {
            conn,
            in_transaction: false,
        }))
    }
}

pub struct MySqlConnection {
    conn: sqlx::MySqlConnection,
    in_transaction: bool,
}

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> MySqlQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    })
}

fn decode_row(row: &MySqlRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            out.insert(column.name().to_string(), Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "BOOLEAN" => Value::Bool(row.try_get_unchecked::<i64, _>(i)? != 0),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                Value::from(row.try_get_unchecked::<i64, _>(i)?)
            }
            name if name.ends_with("UNSIGNED") => {
                Value::from(row.try_get_unchecked::<u64, _>(i)?)
            }
            "FLOAT" => float_to_value(f64::from(row.try_get_unchecked::<f32, _>(i)?)),
            "DOUBLE" => float_to_value(row.try_get_unchecked::<f64, _>(i)?),
            "DATETIME" | "TIMESTAMP" => Value::String(
                row.try_get_unchecked::<NaiveDateTime, _>(i)?
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
            "DATE" => Value::String(row.try_get_unchecked::<NaiveDate, _>(i)?.to_string()),
            "TIME" => Value::String(row.try_get_unchecked::<NaiveTime, _>(i)?.to_string()),
            "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BIT" => {
                blob_to_value(&row.try_get_unchecked::<Vec<u8>, _>(i)?)
            }
            "JSON" => {
                let text = row.try_get_unchecked::<String, _>(i)?;
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            // DECIMAL arrives as text and stays text to keep its precision
            _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn text_column(row: &MySqlRow, name: &str) -> Result<String, sqlx::Error> {
    // SHOW COLUMNS reports some fields as binary strings
    let bytes: Option<Vec<u8>> = row.try_get_unchecked(name)?;
    Ok(bytes
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default())
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, sqlx::Error> {
        let done = bind_all(sql, params).execute(&mut self.conn).await?;
        let last_insert_id = Some(done.last_insert_id()).filter(|id| *id > 0);
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
        let statement = QueryBuilder::new(table).show_columns();
        let rows = match sqlx::Executor::fetch_all(&mut self.conn, statement.sql()).await {
            Ok(rows) => rows,
            // ER_NO_SUCH_TABLE
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("42S02") => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };
        rows.iter()
            .map(|row| -> Result<ColumnInfo, sqlx::Error> {
                let default: Option<Vec<u8>> = row.try_get_unchecked("Default")?;
                Ok(ColumnInfo {
                    name: text_column(row, "Field")?,
                    column_type: text_column(row, "Type")?,
                    nullable: text_column(row, "Null")?.eq_ignore_ascii_case("YES"),
                    key: text_column(row, "Key")?,
                    default: default.map(|b| String::from_utf8_lossy(&b).into_owned()),
                    extra: text_column(row, "Extra")?,
                })
            })
            .collect()
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        if self.in_transaction {
            return Err(sqlx::Error::Protocol("transaction already active".into()));
        }
        sqlx::Executor::execute(&mut self.conn, "START TRANSACTION").await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Integration tests require a real database
    // Run with: DATABASE_URL=mysql://... cargo test -p sluice-db

    async fn connection() -> Box<dyn Connection> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        MySqlConnector::new(&url, DEFAULT_CHARSET)
            .expect("invalid url")
            .connect()
            .await
            .expect("connect failed")
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn describe_and_round_trip() {
        let mut conn = connection().await;
        conn.execute("DROP TABLE IF EXISTS sluice_decode", &[])
            .await
            .expect("drop");
        conn.execute(
            "CREATE TABLE sluice_decode (id INT UNSIGNED AUTO_INCREMENT PRIMARY KEY, \
             name VARCHAR(32) NOT NULL, price DECIMAL(10,2) NULL)",
            &[],
        )
        .await
        .expect("create");

        let columns = conn.describe("sluice_decode").await.expect("describe");
        assert_eq!(columns.len(), 3);
        assert!(columns[0].is_primary_key());
        assert_eq!(columns[0].extra, "auto_increment");
        assert!(!columns[1].nullable);

        let done = conn
            .execute(
                "INSERT INTO sluice_decode (name, price) VALUES (?, ?)",
                &[json!("widget"), json!("9.50")],
            )
            .await
            .expect("insert");
        assert_eq!(done.rows_affected, 1);
        assert!(done.last_insert_id.is_some());

        let rows = conn
            .fetch_all("SELECT name, price FROM sluice_decode", &[])
            .await
            .expect("select");
        assert_eq!(Value::Object(rows[0].clone()), json!({"name": "widget", "price": "9.50"}));

        assert!(conn.describe("sluice_missing").await.expect("describe").is_empty());
        conn.execute("DROP TABLE sluice_decode", &[]).await.expect("drop");
    }
}
