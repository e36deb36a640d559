//! Driver boundary
//!
//! The pool and models only talk to [`Connection`] and [`Connector`]. The
//! sqlx-backed implementations live in [`mysql`] and [`sqlite`]; tests use
//! [`crate::mock`].
//!
//! Statements arrive already rewritten to `?` placeholders with values in
//! binding order (see `Statement::to_positional`).

pub mod mysql;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{ColumnInfo, Row};

pub use mysql::MySqlConnector;
pub use sqlite::SqliteConnector;

/// What a write statement reports back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// One open database connection
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, sqlx::Error>;

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, sqlx::Error>;

    /// Column metadata for `table`, empty if the table does not exist
    async fn describe(&mut self, table: &str) -> Result<Vec<ColumnInfo>, sqlx::Error>;

    async fn begin(&mut self) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    fn in_transaction(&self) -> bool;

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error>;
}

/// Opens connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, sqlx::Error>;
}

/// Text form of a blob column; invalid UTF-8 is replaced
pub(crate) fn blob_to_value(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// JSON numbers from a float, `null` for NaN and infinities
pub(crate) fn float_to_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
