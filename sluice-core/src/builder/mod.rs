//! Stateful SQL compiler
//!
//! A [`QueryBuilder`] accumulates clauses through a fluent chain of `&mut self`
//! calls. Terminal methods (`select`, `insert_one`, `update`, ...) compile the
//! accumulated state into a [`Statement`] without consuming it; callers that
//! reuse a builder call [`QueryBuilder::reset`] between statements.
//!
//! ```
//! use sluice_core::{Order, QueryBuilder};
//!
//! let mut orders = QueryBuilder::new("orders");
//! orders
//!     .fields("id, total")
//!     .where_("status", "paid")
//!     .order_by("id", Order::Desc)
//!     .limit(5);
//! let stmt = orders.select().unwrap();
//! assert_eq!(
//!     stmt.sql(),
//!     "SELECT id,total FROM orders WHERE status = :status ORDER BY id DESC LIMIT 5"
//! );
//! ```

mod join;
mod predicate;
mod update;

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::schema::TableSchema;
use crate::statement::{Aggregate, BindMode, ParamSink, Params, Statement, StatementKind};

pub use join::JoinKind;
pub use predicate::{Condition, Conjunction};
pub use update::UpdateValue;

use join::Join;
use predicate::{render_where, Predicate, WhereEntry};

/// Sort direction for ORDER BY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Order {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            other => Err(QueryError::compilation(
                "ORDER BY",
                format!("expected ASC or DESC, got `{}`", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limit {
    skip: u64,
    count: u64,
}

impl Limit {
    fn render(&self) -> String {
        if self.skip == 0 {
            format!("LIMIT {}", self.count)
        } else {
            format!("LIMIT {},{}", self.skip, self.count)
        }
    }
}

/// `any_value(field) AS alias`, for use in a field list
pub fn field_any_value(field: &str, alias: &str) -> String {
    format!("any_value({}) AS {}", strip_quotes(field), strip_quotes(alias))
}

/// `count(field) AS alias`, for use in a field list
pub fn field_count(field: &str, alias: &str) -> String {
    format!("count({}) AS {}", strip_quotes(field), strip_quotes(alias))
}

/// Remove quote characters callers sometimes wrap identifiers in
fn strip_quotes(ident: &str) -> String {
    ident
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '`'))
        .collect()
}

/// Fluent SQL compiler bound to one table
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    schema: Option<TableSchema>,
    alias: Option<String>,
    distinct: bool,
    fields: Vec<String>,
    wheres: Vec<WhereEntry>,
    joins: Vec<Join>,
    group_by: Option<String>,
    having: Option<String>,
    order_by: Vec<(String, Order)>,
    limit: Option<Limit>,
    bind_mode: BindMode,
    unconditional_writes: bool,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            alias: None,
            distinct: false,
            fields: Vec::new(),
            wheres: Vec::new(),
            joins: Vec::new(),
            group_by: None,
            having: None,
            order_by: Vec::new(),
            limit: None,
            bind_mode: BindMode::Named,
            unconditional_writes: false,
        }
    }

    /// Attach the table's known columns; inserts drop fields not listed here
    pub fn with_schema(mut self, schema: TableSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn set_schema(&mut self, schema: TableSchema) {
        self.schema = Some(schema);
    }

    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn bind_mode(&self) -> BindMode {
        self.bind_mode
    }

    // --- field list ---

    /// Add comma-separated fields. Use [`fields_array`](Self::fields_array)
    /// for expressions that contain commas themselves.
    pub fn fields(&mut self, fields: &str) -> &mut Self {
        for field in fields.split(',') {
            self.push_field(field);
        }
        self
    }

    pub fn fields_array<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for field in fields {
            self.push_field(field.as_ref());
        }
        self
    }

    fn push_field(&mut self, field: &str) {
        let field = strip_quotes(field);
        if !field.is_empty() && !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    // --- WHERE ---

    /// `field = value`, joined with AND
    pub fn where_(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_with(field, value, "=", Conjunction::And)
    }

    /// `field op value`, joined with AND
    pub fn where_op(&mut self, field: &str, op: &str, value: impl Into<Value>) -> &mut Self {
        self.where_with(field, value, op, Conjunction::And)
    }

    /// `field = value`, joined with OR
    pub fn or_where(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_with(field, value, "=", Conjunction::Or)
    }

    /// `field op value`, joined with OR
    pub fn or_where_op(&mut self, field: &str, op: &str, value: impl Into<Value>) -> &mut Self {
        self.where_with(field, value, op, Conjunction::Or)
    }

    /// Add or replace the WHERE entry for `field`.
    ///
    /// The operator is validated when the statement is compiled. A repeated
    /// field replaces the earlier entry in place.
    pub fn where_with(
        &mut self,
        field: &str,
        value: impl Into<Value>,
        op: &str,
        conjunction: Conjunction,
    ) -> &mut Self {
        let predicate = Predicate::Compare {
            op: op.to_string(),
            value: value.into(),
        };
        self.push_where(field, conjunction, predicate)
    }

    /// Several entries at once, each compared with `=` and joined with AND.
    /// A [`Condition::Pair`] renders as a parenthesized two-sided test.
    pub fn where_array<I, K, C>(&mut self, conditions: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: AsRef<str>,
        C: Into<Condition>,
    {
        self.where_array_with(conditions, "=", Conjunction::And)
    }

    pub fn or_where_array<I, K, C>(&mut self, conditions: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: AsRef<str>,
        C: Into<Condition>,
    {
        self.where_array_with(conditions, "=", Conjunction::Or)
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
        for (field, condition) in conditions {
            let predicate = Predicate::from_condition(condition.into(), op);
            self.push_where(field.as_ref(), conjunction, predicate);
        }
        self
    }

    pub fn where_in<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push_where(field, Conjunction::And, Predicate::In(values))
    }

    pub fn or_where_in<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push_where(field, Conjunction::Or, Predicate::In(values))
    }

    pub fn where_between(
        &mut self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        let predicate = Predicate::Between(low.into(), high.into());
        self.push_where(field, Conjunction::And, predicate)
    }

    pub fn or_where_between(
        &mut self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        let predicate = Predicate::Between(low.into(), high.into());
        self.push_where(field, Conjunction::Or, predicate)
    }

    fn push_where(&mut self, field: &str, conjunction: Conjunction, predicate: Predicate) -> &mut Self {
        let entry = WhereEntry {
            field: strip_quotes(field),
            conjunction,
            predicate,
        };
        match self.wheres.iter_mut().find(|w| w.field == entry.field) {
            Some(existing) => *existing = entry,
            None => self.wheres.push(entry),
        }
        self
    }

    // --- shaping ---

    pub fn group_by(&mut self, expression: &str) -> &mut Self {
        let expression = strip_quotes(expression);
        self.group_by = (!expression.is_empty()).then_some(expression);
        self
    }

    /// Raw HAVING predicate, rendered verbatim
    pub fn having(&mut self, predicate: &str) -> &mut Self {
        let predicate = predicate.trim();
        self.having = (!predicate.is_empty()).then(|| predicate.to_string());
        self
    }

    /// Add an ORDER BY term; ordering the same field again only changes its direction
    pub fn order_by(&mut self, field: &str, order: Order) -> &mut Self {
        let field = strip_quotes(field);
        match self.order_by.iter_mut().find(|(f, _)| *f == field) {
            Some(existing) => existing.1 = order,
            None => self.order_by.push((field, order)),
        }
        self
    }

    pub fn limit(&mut self, count: u64) -> &mut Self {
        self.limit = Some(Limit { skip: 0, count });
        self
    }

    pub fn limit_skip(&mut self, skip: u64, count: u64) -> &mut Self {
        self.limit = Some(Limit { skip, count });
        self
    }

    pub fn alias(&mut self, alias: &str) -> &mut Self {
        let alias = strip_quotes(alias);
        self.alias = (!alias.is_empty()).then_some(alias);
        self
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.distinct = true;
        self
    }

    /// Permit the next UPDATE or DELETE to run without a WHERE clause.
    /// Cleared by [`reset`](Self::reset).
    pub fn allow_unconditional_writes(&mut self) -> &mut Self {
        self.unconditional_writes = true;
        self
    }

    // --- joins ---

    pub fn left_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.join(JoinKind::Left, table, alias, on)
    }

    pub fn inner_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.join(JoinKind::Inner, table, alias, on)
    }

    pub fn right_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.join(JoinKind::Right, table, alias, on)
    }

    pub fn full_outer_join(&mut self, table: &str, alias: &str, on: &str) -> &mut Self {
        self.join(JoinKind::FullOuter, table, alias, on)
    }

    /// Joined field names are ambiguous as bind names, so any join switches
    /// the builder to positional parameters until [`reset`](Self::reset).
    pub fn join(&mut self, kind: JoinKind, table: &str, alias: &str, on: &str) -> &mut Self {
        let join = Join {
            kind,
            table: strip_quotes(table),
            alias: strip_quotes(alias),
            on: on.trim().to_string(),
        };
        let existing = self
            .joins
            .iter_mut()
            .find(|j| !join.alias.is_empty() && j.alias == join.alias);
        match existing {
            Some(existing) => *existing = join,
            None => self.joins.push(join),
        }
        self.bind_mode = BindMode::Positional;
        self
    }

    /// Clear everything except the table name and schema
    pub fn reset(&mut self) {
        self.alias = None;
        self.distinct = false;
        self.fields.clear();
        self.wheres.clear();
        self.joins.clear();
        self.group_by = None;
        self.having = None;
        self.order_by.clear();
        self.limit = None;
        self.bind_mode = BindMode::Named;
        self.unconditional_writes = false;
    }

    // --- terminal compilers ---

    pub fn select(&self) -> Result<Statement> {
        let mut sink = ParamSink::new(self.bind_mode);
        let fields = self.field_list();
        let sql = self.render_select(&fields, self.distinct, self.limit, &mut sink)?;
        Ok(Statement::new(StatementKind::Select, sql, sink.finish()))
    }

    /// Like [`select`](Self::select) with `LIMIT 1`; any skip set through
    /// [`limit_skip`](Self::limit_skip) is dropped.
    pub fn find_one(&self) -> Result<Statement> {
        let mut sink = ParamSink::new(self.bind_mode);
        let fields = self.field_list();
        let limit = Limit { skip: 0, count: 1 };
        let sql = self.render_select(&fields, self.distinct, Some(limit), &mut sink)?;
        Ok(Statement::new(StatementKind::FindOne, sql, sink.finish()))
    }

    /// `COUNT(field)`; an empty field or `*` counts rows
    pub fn count(&self, field: &str) -> Result<Statement> {
        self.aggregate(Aggregate::Count, field)
    }

    pub fn avg(&self, field: &str) -> Result<Statement> {
        self.aggregate(Aggregate::Avg, field)
    }

    pub fn max(&self, field: &str) -> Result<Statement> {
        self.aggregate(Aggregate::Max, field)
    }

    pub fn min(&self, field: &str) -> Result<Statement> {
        self.aggregate(Aggregate::Min, field)
    }

    pub fn sum(&self, field: &str) -> Result<Statement> {
        self.aggregate(Aggregate::Sum, field)
    }

    pub fn aggregate(&self, function: Aggregate, field: &str) -> Result<Statement> {
        let mut field = strip_quotes(field);
        if field.is_empty() {
            if function != Aggregate::Count {
                return Err(QueryError::compilation(
                    function.function(),
                    "aggregate needs a field",
                ));
            }
            field.push('*');
        }
        let column = format!("{}({}) AS {}", function.function(), field, function.alias());
        let mut sink = ParamSink::new(self.bind_mode);
        let sql = self.render_select(&column, false, self.limit, &mut sink)?;
        Ok(Statement::new(
            StatementKind::Aggregate(function),
            sql,
            sink.finish(),
        ))
    }

    /// `INSERT INTO table (cols) VALUES (...)`. Fields not in the schema are
    /// dropped from both the column list and the parameters.
    pub fn insert_one<I, K, V>(&self, data: I) -> Result<Statement>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut sink = ParamSink::new(self.bind_mode);
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        for (field, value) in data {
            let field = strip_quotes(field.as_ref());
            if !self.is_known_column(&field) {
                continue;
            }
            placeholders.push(sink.bind(&field, None, value.into()));
            columns.push(field);
        }
        if columns.is_empty() {
            return Err(QueryError::compilation(
                format!("INSERT INTO {}", self.table),
                "no known columns to insert",
            ));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(","),
            placeholders.join(",")
        );
        Ok(Statement::new(StatementKind::InsertOne, sql, sink.finish()))
    }

    /// Multi-row insert. `fields` is comma-separated; every row must have
    /// one value per listed field, unknown fields are then dropped.
    pub fn insert_multiple(&self, fields: &str, rows: Vec<Vec<Value>>) -> Result<Statement> {
        let context = || format!("INSERT INTO {}", self.table);
        let fields: Vec<String> = fields
            .split(',')
            .map(strip_quotes)
            .filter(|f| !f.is_empty())
            .collect();
        if rows.is_empty() {
            return Err(QueryError::compilation(context(), "no rows to insert"));
        }
        let keep: Vec<usize> = (0..fields.len())
            .filter(|&i| self.is_known_column(&fields[i]))
            .collect();
        if keep.is_empty() {
            return Err(QueryError::compilation(context(), "no known columns to insert"));
        }

        let mut sink = ParamSink::new(self.bind_mode);
        let mut tuples = Vec::with_capacity(rows.len());
        for (row_index, row) in rows.into_iter().enumerate() {
            if row.len() != fields.len() {
                return Err(QueryError::compilation(
                    context(),
                    format!(
                        "row {} has {} values for {} fields",
                        row_index,
                        row.len(),
                        fields.len()
                    ),
                ));
            }
            let mut row: Vec<Option<Value>> = row.into_iter().map(Some).collect();
            let mut placeholders = Vec::with_capacity(keep.len());
            for &i in &keep {
                let value = row[i].take().unwrap_or(Value::Null);
                placeholders.push(sink.bind(&fields[i], Some(row_index), value));
            }
            tuples.push(format!("({})", placeholders.join(",")));
        }

        let columns: Vec<&str> = keep.iter().map(|&i| fields[i].as_str()).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            columns.join(","),
            tuples.join(",")
        );
        Ok(Statement::new(StatementKind::InsertMultiple, sql, sink.finish()))
    }

    /// `UPDATE table SET ... WHERE ...`; SET parameters precede WHERE ones
    pub fn update<I, K, V>(&self, data: I) -> Result<Statement>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<UpdateValue>,
    {
        self.guard_write("update")?;
        let mut sink = ParamSink::new(self.bind_mode);
        let mut assignments = Vec::new();
        for (field, value) in data {
            let field = strip_quotes(field.as_ref());
            assignments.push(value.into().render(&field, &mut sink));
        }
        if assignments.is_empty() {
            return Err(QueryError::compilation(
                format!("UPDATE {}", self.table),
                "nothing to set",
            ));
        }

        let mut parts = vec!["UPDATE".to_string(), self.table_ref()];
        parts.extend(self.render_joins()?);
        parts.push("SET".to_string());
        parts.push(assignments.join(","));
        parts.push(render_where(&self.wheres, &mut sink)?);
        Ok(Statement::new(
            StatementKind::Update,
            join_parts(parts),
            sink.finish(),
        ))
    }

    pub fn delete(&self) -> Result<Statement> {
        self.guard_write("delete")?;
        let mut sink = ParamSink::new(self.bind_mode);
        let parts = vec![
            "DELETE FROM".to_string(),
            self.table_ref(),
            render_where(&self.wheres, &mut sink)?,
        ];
        Ok(Statement::new(
            StatementKind::Delete,
            join_parts(parts),
            sink.finish(),
        ))
    }

    /// MySQL column introspection for this table
    pub fn show_columns(&self) -> Statement {
        let sql = format!("SHOW COLUMNS FROM `{}`", self.table.replace('`', ""));
        Statement::new(StatementKind::ShowColumns, sql, Params::empty())
    }

    // --- rendering helpers ---

    fn guard_write(&self, operation: &'static str) -> Result<()> {
        if self.wheres.is_empty() && !self.unconditional_writes {
            return Err(QueryError::precondition(operation, self.table.clone()));
        }
        Ok(())
    }

    fn is_known_column(&self, field: &str) -> bool {
        match &self.schema {
            Some(schema) => schema.contains(field),
            None => !field.is_empty(),
        }
    }

    fn field_list(&self) -> String {
        if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields.join(",")
        }
    }

    fn table_ref(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.table, alias),
            None => self.table.clone(),
        }
    }

    fn render_joins(&self) -> Result<Vec<String>> {
        self.joins.iter().map(Join::render).collect()
    }

    fn render_select(
        &self,
        fields: &str,
        distinct: bool,
        limit: Option<Limit>,
        sink: &mut ParamSink,
    ) -> Result<String> {
        let mut parts = vec!["SELECT".to_string()];
        if distinct {
            parts.push("DISTINCT".to_string());
        }
        parts.push(fields.to_string());
        parts.push("FROM".to_string());
        parts.push(self.table_ref());
        parts.extend(self.render_joins()?);
        parts.push(render_where(&self.wheres, sink)?);
        if let Some(group_by) = &self.group_by {
            parts.push(format!("GROUP BY {}", group_by));
        }
        if let Some(having) = &self.having {
            parts.push(format!("HAVING {}", having));
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|(field, order)| format!("{} {}", field, order))
                .collect();
            parts.push(format!("ORDER BY {}", terms.join(",")));
        }
        if let Some(limit) = limit {
            parts.push(limit.render());
        }
        Ok(join_parts(parts))
    }
}

fn join_parts(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
