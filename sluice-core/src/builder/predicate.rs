//! WHERE clause entries and their rendering
//!
//! Entries are chained left to right with their own conjunction and are
//! never grouped, so `a = 1 OR b = 2 AND c = 3` reads exactly as the SQL
//! engine's precedence rules say. Only the two-sided condition on a single
//! field is wrapped in parentheses.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::statement::ParamSink;

/// Comparison operators accepted in WHERE entries (upper-cased)
const OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "<=>", "LIKE", "NOT LIKE", "REGEXP", "IS", "IS NOT",
];

/// How an entry joins the entries before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

impl Conjunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Conjunction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            other => Err(QueryError::compilation(
                "conjunction",
                format!("expected AND or OR, got `{}`", other),
            )),
        }
    }
}

/// Right-hand side of a `where_array` entry
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Compared with the operator given to `where_array`
    Value(Value),
    /// `(field op1 val1 conj field op2 val2)`
    Pair {
        op1: String,
        val1: Value,
        conjunction: Conjunction,
        op2: String,
        val2: Value,
    },
}

impl Condition {
    pub fn pair(
        op1: impl Into<String>,
        val1: impl Into<Value>,
        conjunction: Conjunction,
        op2: impl Into<String>,
        val2: impl Into<Value>,
    ) -> Self {
        Self::Pair {
            op1: op1.into(),
            val1: val1.into(),
            conjunction,
            op2: op2.into(),
            val2: val2.into(),
        }
    }
}

macro_rules! condition_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Condition {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

condition_from!(Value, &str, String, i32, i64, u32, u64, f64, bool);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    Compare {
        op: String,
        value: Value,
    },
    Pair {
        op1: String,
        val1: Value,
        conjunction: Conjunction,
        op2: String,
        val2: Value,
    },
    In(Vec<Value>),
    Between(Value, Value),
}

impl Predicate {
    pub(crate) fn from_condition(condition: Condition, op: &str) -> Self {
        match condition {
            Condition::Value(value) => Self::Compare {
                op: op.to_string(),
                value,
            },
            Condition::Pair {
                op1,
                val1,
                conjunction,
                op2,
                val2,
            } => Self::Pair {
                op1,
                val1,
                conjunction,
                op2,
                val2,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WhereEntry {
    pub(crate) field: String,
    pub(crate) conjunction: Conjunction,
    pub(crate) predicate: Predicate,
}

impl WhereEntry {
    fn render(&self, sink: &mut ParamSink) -> Result<String> {
        let field = self.field.as_str();
        match &self.predicate {
            Predicate::Compare { op, value } => comparison(field, op, value, None, sink),
            Predicate::Pair {
                op1,
                val1,
                conjunction,
                op2,
                val2,
            } => {
                let left = comparison(field, op1, val1, Some(1), sink)?;
                let right = comparison(field, op2, val2, Some(2), sink)?;
                Ok(format!("({} {} {})", left, conjunction, right))
            }
            Predicate::In(values) => {
                if values.is_empty() {
                    return Err(QueryError::compilation(
                        format!("WHERE `{}` IN", field),
                        "value list is empty",
                    ));
                }
                let placeholders = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| sink.bind(field, Some(i), v.clone()))
                    .collect::<Vec<_>>();
                Ok(format!("{} IN ({})", field, placeholders.join(",")))
            }
            Predicate::Between(low, high) => {
                let p1 = sink.bind(field, Some(1), low.clone());
                let p2 = sink.bind(field, Some(2), high.clone());
                Ok(format!("{} BETWEEN {} AND {}", field, p1, p2))
            }
        }
    }
}

/// Render `WHERE ...` or an empty string when there are no entries
pub(crate) fn render_where(entries: &[WhereEntry], sink: &mut ParamSink) -> Result<String> {
    let mut sql = String::new();
    for entry in entries {
        let fragment = entry.render(sink)?;
        if sql.is_empty() {
            sql.push_str("WHERE ");
        } else {
            sql.push(' ');
            sql.push_str(entry.conjunction.as_str());
            sql.push(' ');
        }
        sql.push_str(&fragment);
    }
    Ok(sql)
}

/// `field op :param`. `IS` and `IS NOT` only take NULL, TRUE or FALSE,
/// which are rendered inline since they cannot be bound.
fn comparison(
    field: &str,
    op: &str,
    value: &Value,
    index: Option<usize>,
    sink: &mut ParamSink,
) -> Result<String> {
    let op = normalize_operator(field, op)?;
    let rhs = if op == "IS" || op == "IS NOT" {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            other => {
                return Err(QueryError::compilation(
                    format!("WHERE `{}` {}", field, op),
                    format!("expected null or a boolean, got {}", other),
                ))
            }
        }
    } else {
        sink.bind(field, index, value.clone())
    };
    Ok(format!("{} {} {}", field, op, rhs))
}

fn normalize_operator(field: &str, op: &str) -> Result<String> {
    let normalized = op.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    if OPERATORS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(QueryError::compilation(
            format!("WHERE `{}`", field),
            format!("unsupported operator `{}`", op),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::BindMode;
    use serde_json::json;

    fn entry(field: &str, conjunction: Conjunction, predicate: Predicate) -> WhereEntry {
        WhereEntry {
            field: field.into(),
            conjunction,
            predicate,
        }
    }

    #[test]
    fn flat_chain_keeps_conjunctions_in_order() {
        let entries = vec![
            entry("a", Conjunction::And, Predicate::Compare { op: "=".into(), value: json!(1) }),
            entry("b", Conjunction::Or, Predicate::Compare { op: ">".into(), value: json!(2) }),
            entry("c", Conjunction::And, Predicate::Compare { op: "like".into(), value: json!("x%") }),
        ];
        let mut sink = ParamSink::new(BindMode::Named);
        let sql = render_where(&entries, &mut sink).unwrap();
        assert_eq!(sql, "WHERE a = :a OR b > :b AND c LIKE :c");
    }

    #[test]
    fn pair_is_parenthesized() {
        let entries = vec![entry(
            "age",
            Conjunction::And,
            Predicate::from_condition(
                Condition::pair(">", 13, Conjunction::And, "<", 20),
                "=",
            ),
        )];
        let mut sink = ParamSink::new(BindMode::Named);
        let sql = render_where(&entries, &mut sink).unwrap();
        assert_eq!(sql, "WHERE (age > :age_1 AND age < :age_2)");
    }

    #[test]
    fn unknown_operator_is_a_compilation_error() {
        let entries = vec![entry(
            "age",
            Conjunction::And,
            Predicate::Compare { op: "=~".into(), value: json!(1) },
        )];
        let mut sink = ParamSink::new(BindMode::Named);
        let err = render_where(&entries, &mut sink).unwrap_err();
        assert!(matches!(err, QueryError::Compilation { .. }));
    }

    #[test]
    fn is_operators_render_literals_without_binding() {
        let entries = vec![
            entry("deleted_at", Conjunction::And, Predicate::Compare { op: "is".into(), value: Value::Null }),
            entry("email", Conjunction::And, Predicate::Compare { op: "IS  NOT".into(), value: Value::Null }),
            entry("active", Conjunction::Or, Predicate::Compare { op: "IS".into(), value: json!(true) }),
        ];
        let mut sink = ParamSink::new(BindMode::Named);
        let sql = render_where(&entries, &mut sink).unwrap();
        assert_eq!(
            sql,
            "WHERE deleted_at IS NULL AND email IS NOT NULL OR active IS TRUE"
        );
        assert!(sink.finish().is_empty());
    }

    #[test]
    fn is_operator_rejects_other_values() {
        let entries = vec![entry(
            "age",
            Conjunction::And,
            Predicate::Compare { op: "IS".into(), value: json!(3) },
        )];
        let mut sink = ParamSink::new(BindMode::Positional);
        let err = render_where(&entries, &mut sink).unwrap_err();
        assert!(matches!(err, QueryError::Compilation { .. }));
    }

    #[test]
    fn conjunction_parses_case_insensitively() {
        assert_eq!("or".parse::<Conjunction>().unwrap(), Conjunction::Or);
        assert_eq!(" And ".parse::<Conjunction>().unwrap(), Conjunction::And);
        assert!("xor".parse::<Conjunction>().is_err());
    }
}
