//! Typed outcome of an executed statement

use serde::Serialize;
use serde_json::{Map, Value};

use crate::statement::{Aggregate, StatementKind};

/// A fetched row, column name to value
pub type Row = Map<String, Value>;

/// Operation-specific payload of an [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Fail,
    InsertOne { row_count: u64, insert_id: u64 },
    InsertMultiple { row_count: u64 },
    Update { row_count: u64 },
    Delete { row_count: u64 },
    Query { rows: Vec<Row> },
    Aggregate { function: Aggregate, value: Value },
    /// Rows of an introspection query
    System { rows: Vec<Row> },
}

/// Result of running a statement through a model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    success: bool,
    outcome: Outcome,
    find_one: bool,
}

impl ExecutionResult {
    /// A non-exceptional failure reported by the driver
    pub fn failed() -> Self {
        Self {
            success: false,
            outcome: Outcome::Fail,
            find_one: false,
        }
    }

    pub fn succeeded(outcome: Outcome) -> Self {
        Self {
            success: !matches!(outcome, Outcome::Fail),
            outcome,
            find_one: false,
        }
    }

    /// Wrap an affected-row count for a write statement of the given kind
    pub fn from_write(kind: StatementKind, row_count: u64, insert_id: u64) -> Self {
        match kind {
            StatementKind::InsertOne => Self::succeeded(Outcome::InsertOne {
                row_count,
                insert_id,
            }),
            StatementKind::InsertMultiple => Self::succeeded(Outcome::InsertMultiple { row_count }),
            StatementKind::Update => Self::succeeded(Outcome::Update { row_count }),
            StatementKind::Delete => Self::succeeded(Outcome::Delete { row_count }),
            _ => Self::failed(),
        }
    }

    pub fn query(rows: Vec<Row>) -> Self {
        Self::succeeded(Outcome::Query { rows })
    }

    pub fn aggregate(function: Aggregate, value: Value) -> Self {
        Self::succeeded(Outcome::Aggregate { function, value })
    }

    pub fn system(rows: Vec<Row>) -> Self {
        Self::succeeded(Outcome::System { rows })
    }

    /// Only the first row is returned from [`to_array`](Self::to_array)
    pub fn find_one(mut self) -> Self {
        self.find_one = true;
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Affected rows for write outcomes, row count for queries
    pub fn row_count(&self) -> u64 {
        match &self.outcome {
            Outcome::InsertOne { row_count, .. }
            | Outcome::InsertMultiple { row_count }
            | Outcome::Update { row_count }
            | Outcome::Delete { row_count } => *row_count,
            Outcome::Query { rows } | Outcome::System { rows } => rows.len() as u64,
            Outcome::Fail | Outcome::Aggregate { .. } => 0,
        }
    }

    /// Generated id of a single-row insert, 0 otherwise
    pub fn insert_id(&self) -> u64 {
        match &self.outcome {
            Outcome::InsertOne { insert_id, .. } => *insert_id,
            _ => 0,
        }
    }

    /// Raw aggregate scalar
    pub fn aggregate_value(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Aggregate { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn count(&self) -> i64 {
        self.aggregate_value().map(value_as_i64).unwrap_or(0)
    }

    pub fn avg(&self) -> f64 {
        self.aggregate_f64()
    }

    pub fn max(&self) -> f64 {
        self.aggregate_f64()
    }

    pub fn min(&self) -> f64 {
        self.aggregate_f64()
    }

    pub fn sum(&self) -> f64 {
        self.aggregate_f64()
    }

    fn aggregate_f64(&self) -> f64 {
        self.aggregate_value().map(value_as_f64).unwrap_or(0.0)
    }

    pub fn rows(&self) -> &[Row] {
        match &self.outcome {
            Outcome::Query { rows } | Outcome::System { rows } => rows,
            _ => &[],
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows().first()
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self.outcome {
            Outcome::Query { rows } | Outcome::System { rows } => rows,
            _ => Vec::new(),
        }
    }

    /// Rows as JSON: an array of objects, or the first object after
    /// [`find_one`](Self::find_one). No rows yields an empty array.
    pub fn to_array(&self) -> Value {
        let rows = self.rows();
        match (self.find_one, rows.first()) {
            (_, None) => Value::Array(Vec::new()),
            (true, Some(first)) => Value::Object(first.clone()),
            (false, Some(_)) => Value::Array(rows.iter().cloned().map(Value::Object).collect()),
        }
    }
}

/// Drivers report DECIMAL aggregates as strings, so numeric strings count too
fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn value_as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn find_one_returns_first_row_only() {
        let result = ExecutionResult::query(vec![
            row(json!({"id": 1})),
            row(json!({"id": 2})),
        ]);
        assert_eq!(result.to_array(), json!([{"id": 1}, {"id": 2}]));
        assert_eq!(result.row_count(), 2);

        let one = result.find_one();
        assert_eq!(one.to_array(), json!({"id": 1}));
    }

    #[test]
    fn empty_query_is_empty_array() {
        let result = ExecutionResult::query(Vec::new()).find_one();
        assert!(result.success());
        assert_eq!(result.to_array(), json!([]));
        assert!(result.first().is_none());
    }

    #[test]
    fn write_outcomes_expose_counts() {
        let insert = ExecutionResult::from_write(StatementKind::InsertOne, 1, 42);
        assert!(insert.success());
        assert_eq!(insert.insert_id(), 42);
        assert_eq!(insert.row_count(), 1);

        let update = ExecutionResult::from_write(StatementKind::Update, 3, 0);
        assert_eq!(update.row_count(), 3);
        assert_eq!(update.insert_id(), 0);

        let misuse = ExecutionResult::from_write(StatementKind::Select, 1, 0);
        assert!(!misuse.success());
    }

    #[test]
    fn aggregate_accessors_coerce_driver_values() {
        let count = ExecutionResult::aggregate(Aggregate::Count, json!(7));
        assert_eq!(count.count(), 7);

        let avg = ExecutionResult::aggregate(Aggregate::Avg, json!("12.50"));
        assert_eq!(avg.avg(), 12.5);

        let empty = ExecutionResult::aggregate(Aggregate::Max, Value::Null);
        assert_eq!(empty.max(), 0.0);
        assert!(empty.rows().is_empty());
    }

    #[test]
    fn failed_result_has_no_payload() {
        let result = ExecutionResult::failed();
        assert!(!result.success());
        assert_eq!(result.outcome(), &Outcome::Fail);
        assert_eq!(result.to_array(), json!([]));
    }
}
