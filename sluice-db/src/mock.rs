//! In-memory driver for tests
//!
//! [`MockConnector`] hands out [`MockConnection`]s that share one recorder:
//! every statement is logged with the serial number of the connection that
//! ran it, canned rows are served to reads in order, and statements matching
//! a pattern can be made to fail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{ColumnInfo, Row};

use crate::driver::{Connection, Connector, ExecOutcome};

/// A statement as seen by a mock connection
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// Serial of the connection, starting at 1 in open order
    pub connection: u64,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug)]
struct MockState {
    tables: HashMap<String, Vec<ColumnInfo>>,
    statements: Vec<ExecutedStatement>,
    responses: VecDeque<Vec<Row>>,
    fail_pattern: Option<String>,
    fail_connect: bool,
    rows_affected: u64,
    next_insert_id: u64,
    opened: u64,
    closed: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            statements: Vec::new(),
            responses: VecDeque::new(),
            fail_pattern: None,
            fail_connect: false,
            rows_affected: 1,
            next_insert_id: 1,
            opened: 0,
            closed: 0,
        }
    }
}

impl MockState {
    fn log(&mut self, connection: u64, sql: &str, params: &[Value]) -> Result<(), sqlx::Error> {
        self.statements.push(ExecutedStatement {
            connection,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        match &self.fail_pattern {
            Some(pattern) if sql.contains(pattern.as_str()) => {
                Err(sqlx::Error::Protocol(format!("mock failure for `{}`", sql)))
            }
            _ => Ok(()),
        }
    }
}

/// Connector whose connections record into shared state
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with untyped columns
    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        let columns = columns.iter().map(|c| ColumnInfo::new(*c, "")).collect();
        self.add_table(table, columns);
        self
    }

    pub fn add_table(&self, table: &str, columns: Vec<ColumnInfo>) {
        self.state().tables.insert(table.to_string(), columns);
    }

    /// Queue the rows returned by the next read
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.state().responses.push_back(rows);
    }

    /// Fail every statement whose SQL contains `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state().fail_pattern = Some(pattern.into());
    }

    pub fn clear_failure(&self) {
        self.state().fail_pattern = None;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Affected-row count reported by writes (default 1)
    pub fn set_rows_affected(&self, rows: u64) {
        self.state().rows_affected = rows;
    }

    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    pub fn connections_opened(&self) -> usize {
        self.state().opened as usize
    }

    pub fn connections_closed(&self) -> usize {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, sqlx::Error> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(sqlx::Error::PoolTimedOut);
        }
        state.opened += 1;
        Ok(Box::new(MockConnection {
            serial: state.opened,
            state: Arc::clone(&self.state),
            in_transaction: false,
        }))
    }
}

#[derive(Debug)]
pub struct MockConnection {
    serial: u64,
    state: Arc<Mutex<MockState>>,
    in_transaction: bool,
}

impl MockConnection {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, sqlx::Error> {
        let mut state = self.state();
        state.log(self.serial, sql, params)?;
        let last_insert_id = if sql.trim_start().starts_with("INSERT") {
            let id = state.next_insert_id;
            state.next_insert_id += 1;
            Some(id)
        } else {
            None
        };
        Ok(ExecOutcome {
            rows_affected: state.rows_affected,
            last_insert_id,
        })
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, sqlx::Error> {
        let mut state = self.state();
        state.log(self.serial, sql, params)?;
        Ok(state.responses.pop_front().unwrap_or_default())
    }

    async fn describe(&mut self, table: &str) -> Result<Vec<ColumnInfo>, sqlx::Error> {
        let mut state = self.state();
        state.log(self.serial, &format!("DESCRIBE {}", table), &[])?;
        Ok(state.tables.get(table).cloned().unwrap_or_default())
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        if self.in_transaction {
            return Err(sqlx::Error::Protocol("transaction already active".into()));
        }
        self.state().log(self.serial, "BEGIN", &[])?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.state().log(self.serial, "COMMIT", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.in_transaction = false;
        self.state().log(self.serial, "ROLLBACK", &[])
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_statements_per_connection() {
        let connector = MockConnector::new().with_table("users", &["id", "name"]);
        let mut a = connector.connect().await.unwrap();
        let mut b = connector.connect().await.unwrap();

        a.execute("INSERT INTO users (name) VALUES (?)", &[json!("ada")])
            .await
            .unwrap();
        b.fetch_all("SELECT * FROM users", &[]).await.unwrap();
        assert_eq!(b.describe("users").await.unwrap().len(), 2);

        let log = connector.statements();
        assert_eq!(log[0].connection, 1);
        assert_eq!(log[0].params, vec![json!("ada")]);
        assert_eq!(log[1].connection, 2);
        assert_eq!(log[2].sql, "DESCRIBE users");
    }

    #[tokio::test]
    async fn fail_pattern_errors_matching_statements() {
        let connector = MockConnector::new();
        connector.fail_on("DELETE");
        let mut conn = connector.connect().await.unwrap();
        assert!(conn.execute("DELETE FROM t WHERE id = ?", &[json!(1)]).await.is_err());
        assert!(conn.execute("UPDATE t SET a=1 WHERE id = ?", &[json!(1)]).await.is_ok());
    }

    #[tokio::test]
    async fn nested_begin_is_refused() {
        let connector = MockConnector::new();
        let mut conn = connector.connect().await.unwrap();
        conn.begin().await.unwrap();
        assert!(conn.begin().await.is_err());
        assert!(conn.in_transaction());

        let begins = connector.statements().iter().filter(|s| s.sql == "BEGIN").count();
        assert_eq!(begins, 1);
    }

    #[tokio::test]
    async fn dropped_connections_count_as_closed() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(connector.connections_opened(), 1);
        assert_eq!(connector.connections_closed(), 1);
    }
}
