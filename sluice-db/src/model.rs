//! Table-bound statement execution
//!
//! A [`Model`] owns one [`QueryBuilder`] for one table and a read connection
//! checked out for its whole lifetime. Fluent calls accumulate on the
//! builder; terminal calls compile, reset the builder, and run the statement.
//! Reads go to the model's own connection, writes and transaction control go
//! to the write slot of the model's [`ContextId`], so several models created
//! for the same context share one transaction.
//!
//! ```ignore
//! let mut orders = Model::new(&pool, ctx, "orders").await?;
//! orders.begin().await?;
//! orders.where_("id", 7).update([("status", "shipped")]).await?;
//! orders.commit().await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use sluice_core::{
    Aggregate, Condition, Conjunction, ExecutionResult, Order, QueryBuilder, Row, Statement,
    StatementKind, TableSchema, UpdateValue,
};
use tracing::{debug, error, warn};

use crate::context::ContextId;
use crate::error::{DbError, DbResult};
use crate::lifelog::{LifecycleSink, TracingSink};
use crate::pool::{PoolManager, PooledConnection};

/// Default primary key column used by [`Model::where_id`]
pub const DEFAULT_ID_COLUMN: &str = "id";

pub struct Model {
    pool: PoolManager,
    ctx: ContextId,
    builder: QueryBuilder,
    schema: TableSchema,
    read: PooledConnection,
    id_column: String,
    sink: Arc<dyn LifecycleSink>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("table", &self.builder.table())
            .field("context", &self.ctx)
            .field("read", &self.read.id())
            .finish()
    }
}

impl Model {
    /// Bind `table` for `ctx`, checking out a read connection and loading
    /// the table's columns.
    pub async fn new(pool: &PoolManager, ctx: ContextId, table: &str) -> DbResult<Self> {
        Self::with_sink(pool, ctx, table, Arc::new(TracingSink)).await
    }

    pub async fn with_sink(
        pool: &PoolManager,
        ctx: ContextId,
        table: &str,
        sink: Arc<dyn LifecycleSink>,
    ) -> DbResult<Self> {
        let mut read = pool.acquire_shared().await?;
        let describe = QueryBuilder::new(table).show_columns();

        let started = Instant::now();
        let columns = read
            .describe(table)
            .await
            .map_err(|source| DbError::execution(describe.sql(), describe.params().clone(), source))?;
        sink.record(StatementKind::ShowColumns.label(), started.elapsed(), describe.sql());

        if columns.is_empty() {
            warn!(table, "table has no columns; inserts will be rejected");
        }
        let schema = TableSchema::new(table, columns);
        debug!(table, columns = schema.len(), context = %ctx, "model ready");

        Ok(Self {
            pool: pool.clone(),
            ctx,
            builder: QueryBuilder::new(table).with_schema(schema.clone()),
            schema,
            read,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            sink,
        })
    }

    /// Use `column` instead of `id` for [`where_id`](Self::where_id)
    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn table(&self) -> &str {
        self.builder.table()
    }

    pub fn context(&self) -> ContextId {
        self.ctx
    }

    /// Columns discovered when the model was created
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The pending, not yet executed query
    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    /// `any_value(field) AS alias`, for [`fields`](Self::fields)
    pub fn field_any_value(field: &str, alias: &str) -> String {
        sluice_core::field_any_value(field, alias)
    }

    /// `count(field) AS alias`, for [`fields`](Self::fields)
    pub fn field_count(field: &str, alias: &str) -> String {
        sluice_core::field_count(field, alias)
    }

    // --- fluent forwarding ---

    pub fn fields(&mut self, fields: &str) -> &mut Self {
        self.builder.fields(fields);
        self
    }

    pub fn fields_array<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.builder.fields_array(fields);
        self
    }

    pub fn where_(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.builder.where_(field, value);
        self
    }

    pub fn where_op(&mut self, field: &str, op: &str, value: impl Into<Value>) -> &mut Self {
        self.builder.where_op(field, op, value);
        self
    }

    pub fn or_where(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.builder.or_where(field, value);
        self
    }

    pub fn or_where_op(&mut self, field: &str, op: &str, value: impl Into<Value>) -> &mut Self {
        self.builder.or_where_op(field, op, value);
        self
    }

    pub fn where_with(
        &mut self,
        field: &str,
        value: impl Into<Value>,
        op: &str,
        conjunction: Conjunction,
    ) -> &mut Self {
        self.builder.where_with(field, value, op, conjunction);
        self
    }

    /// `id_column = id`
    pub fn where_id(&mut self, id: impl Into<Value>) -> &mut Self {
        self.builder.where_(&self.id_column, id);
        self
    }

    pub fn where_array<I, K, C>(&mut self, conditions: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: AsRef<str>,
        C: Into<Condition>,
    {
        self.builder.where_array(conditions);
        self
    }

    pub fn or_where_array<I, K, C>(&mut self, conditions: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: AsRef<str>,
        C: Into<Condition>,
    {
        self.builder.or_where_array(conditions);
        self
    }

    pub fn where_array_with<I, K, C>(
        &mut self,
        conditions: I,
        op: &str,
        conjunction: Conjunction,
    ) -> &mut Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: AsRef<str>,
        C: Into<Condition>,
    {
        self.builder.where_array_with(conditions, op, conjunction);
        self
    }

    pub fn where_in<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.builder.where_in(field, values);
        self
    }

    pub fn or_where_in<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.builder.or_where_in(field, values);
        self
    }

    pub fn where_between(
        &mut self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.builder.where_between(field, low, high);
        self
    }

    pub fn or_where_between(
        &mut self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.builder.or_where_between(field, low, high);
        self
    }

    pub fn group_by(&mut self, expression: &str) -> &mut Self {
        self.builder.group_by(expression);
        self
    }

    pub fn having(&mut self, predicate: &str) -> &mut Self {
        self.builder.having(predicate);
        self
    }

    pub fn order_by(&mut self, field: &str, order: Order) -> &mut Self {
        self.builder.order_by(field, order);
        self
    }

    pub fn limit(&mut self, count: u64) -> &mut Self {
        self.builder.limit(count);
        self
    }

    pub fn limit_skip(&mut self, skip: u64, count: u64) -> &mut Self {
        self.builder.limit_skip(skip, count);
        self
    }

    pub fn alias(&mut self, alias: &str) -> &mut Self {
        self.builder.alias(alias);
        self
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.builder.distinct();
        self
    }

    pub fn left_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.builder.left_join(table, alias, on);
        self
    }

    pub fn inner_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.builder.inner_join(table, alias, on);
        self
    }

    pub fn right_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.builder.right_join(table, alias, on);
        self
    }

    pub fn full_outer_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.builder.full_outer_join(table, alias, on);
        self
    }

    pub fn allow_unconditional_writes(&mut self) -> &mut Self {
        self.builder.allow_unconditional_writes();
        self
    }

    /// Drop the pending query without running it
    pub fn reset(&mut self) -> &mut Self {
        self.builder.reset();
        self
    }

    // --- reads ---

    pub async fn select(&mut self) -> DbResult<ExecutionResult> {
        let stmt = self.compile(QueryBuilder::select)?;
        self.run(stmt).await
    }

    pub async fn find_one(&mut self) -> DbResult<ExecutionResult> {
        let stmt = self.compile(QueryBuilder::find_one)?;
        self.run(stmt).await
    }

    pub async fn count(&mut self, field: &str) -> DbResult<ExecutionResult> {
        self.run_aggregate(Aggregate::Count, field).await
    }

    pub async fn avg(&mut self, field: &str) -> DbResult<ExecutionResult> {
        self.run_aggregate(Aggregate::Avg, field).await
    }

    pub async fn max(&mut self, field: &str) -> DbResult<ExecutionResult> {
        self.run_aggregate(Aggregate::Max, field).await
    }

    pub async fn min(&mut self, field: &str) -> DbResult<ExecutionResult> {
        self.run_aggregate(Aggregate::Min, field).await
    }

    pub async fn sum(&mut self, field: &str) -> DbResult<ExecutionResult> {
        self.run_aggregate(Aggregate::Sum, field).await
    }

    async fn run_aggregate(&mut self, function: Aggregate, field: &str) -> DbResult<ExecutionResult> {
        let stmt = self.compile(|b| b.aggregate(function, field))?;
        self.run(stmt).await
    }

    // --- writes ---

    pub async fn insert_one<I, K, V>(&mut self, data: I) -> DbResult<ExecutionResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let stmt = self.compile(|b| b.insert_one(data))?;
        self.run(stmt).await
    }

    pub async fn insert_multiple(
        &mut self,
        fields: &str,
        rows: Vec<Vec<Value>>,
    ) -> DbResult<ExecutionResult> {
        let stmt = self.compile(|b| b.insert_multiple(fields, rows))?;
        self.run(stmt).await
    }

    pub async fn update<I, K, V>(&mut self, data: I) -> DbResult<ExecutionResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<UpdateValue>,
    {
        let stmt = self.compile(|b| b.update(data))?;
        self.run(stmt).await
    }

    /// `field=(field+step)` on the rows matched so far
    pub async fn increment(&mut self, field: &str, step: i64) -> DbResult<ExecutionResult> {
        self.update([(field, UpdateValue::increment(step))]).await
    }

    /// `field=(field-step)` on the rows matched so far
    pub async fn decrement(&mut self, field: &str, step: i64) -> DbResult<ExecutionResult> {
        self.update([(field, UpdateValue::decrement(step))]).await
    }

    pub async fn delete(&mut self) -> DbResult<ExecutionResult> {
        let stmt = self.compile(QueryBuilder::delete)?;
        self.run(stmt).await
    }

    // --- transactions ---

    /// Start a transaction on this context's write connection
    pub async fn begin(&mut self) -> DbResult<()> {
        let mut slot = self.pool.acquire_for(self.ctx).await?;
        if slot.in_transaction() {
            warn!(context = %self.ctx, table = self.table(), "begin inside an open transaction refused");
            return Err(DbError::TransactionActive { context: self.ctx });
        }
        let started = Instant::now();
        let result = slot.begin().await;
        slot.release();
        self.finish_control("BEGIN", started, result)
    }

    /// Commit; without an open transaction this only logs a warning
    pub async fn commit(&mut self) -> DbResult<()> {
        let mut slot = match self.pool.acquire_if_seeded(self.ctx).await? {
            Some(slot) if slot.in_transaction() => slot,
            _ => {
                warn!(context = %self.ctx, table = self.table(), "commit without an open transaction");
                return Ok(());
            }
        };
        let started = Instant::now();
        let result = slot.commit().await;
        slot.release();
        self.finish_control("COMMIT", started, result)
    }

    /// Roll back; without an open transaction this only logs a warning
    pub async fn rollback(&mut self) -> DbResult<()> {
        let mut slot = match self.pool.acquire_if_seeded(self.ctx).await? {
            Some(slot) if slot.in_transaction() => slot,
            _ => {
                warn!(context = %self.ctx, table = self.table(), "rollback without an open transaction");
                return Ok(());
            }
        };
        let started = Instant::now();
        let result = slot.rollback().await;
        slot.release();
        self.finish_control("ROLLBACK", started, result)
    }

    /// Whether this context's write connection has an open transaction
    pub async fn in_transaction(&mut self) -> DbResult<bool> {
        let slot = self.pool.acquire_if_seeded(self.ctx).await?;
        Ok(slot.is_some_and(|slot| slot.in_transaction()))
    }

    fn finish_control(
        &self,
        sql: &str,
        started: Instant,
        result: Result<(), sqlx::Error>,
    ) -> DbResult<()> {
        self.sink.record(&sql.to_ascii_lowercase(), started.elapsed(), sql);
        result.map_err(|source| {
            error!(context = %self.ctx, sql, error = %source, "transaction control failed");
            DbError::execution(sql, sluice_core::Params::empty(), source)
        })
    }

    // --- execution ---

    /// Compile with the pending state, then reset it whether or not
    /// compilation succeeded.
    fn compile<F>(&mut self, compile: F) -> DbResult<Statement>
    where
        F: FnOnce(&QueryBuilder) -> sluice_core::Result<Statement>,
    {
        let compiled = compile(&self.builder);
        self.builder.reset();
        Ok(compiled?)
    }

    async fn run(&mut self, stmt: Statement) -> DbResult<ExecutionResult> {
        let kind = stmt.kind();
        let (sql, values) = stmt.to_positional()?;

        let started = Instant::now();
        let outcome = if kind.is_write() {
            let mut slot = self.pool.acquire_for(self.ctx).await?;
            let outcome = slot.execute(&sql, &values).await;
            slot.release();
            outcome.map(|done| {
                ExecutionResult::from_write(kind, done.rows_affected, done.last_insert_id.unwrap_or(0))
            })
        } else {
            self.read
                .fetch_all(&sql, &values)
                .await
                .map(|rows| read_result(kind, rows))
        };
        self.sink.record(kind.label(), started.elapsed(), stmt.sql());

        outcome.map_err(|source| {
            error!(
                context = %self.ctx,
                sql = stmt.sql(),
                params = %stmt.params(),
                error = %source,
                "statement failed"
            );
            let (sql, params) = stmt.into_parts();
            DbError::execution(sql, params, source)
        })
    }
}

fn read_result(kind: StatementKind, rows: Vec<Row>) -> ExecutionResult {
    match kind {
        StatementKind::Select => ExecutionResult::query(rows),
        StatementKind::FindOne => ExecutionResult::query(rows).find_one(),
        StatementKind::ShowColumns => ExecutionResult::system(rows),
        StatementKind::Aggregate(function) => {
            let Some(mut row) = rows.into_iter().next() else {
                return ExecutionResult::failed();
            };
            let value = match row.remove(&function.alias()) {
                Some(value) => value,
                // Some drivers report the alias differently cased
                None => row.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
            };
            ExecutionResult::aggregate(function, value)
        }
        _ => ExecutionResult::failed(),
    }
}
