//! Compiled statements: SQL text plus the parameters bound to it.
//!
//! Named parameters are recorded in the order their placeholders appear in
//! the SQL, so drivers that only understand `?` can rewrite the text and
//! bind values positionally via [`Statement::to_positional`].

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{QueryError, Result};

/// Placeholder used in positional mode
pub const POSITIONAL_PLACEHOLDER: &str = "?";

/// Prefix of the reserved aliases given to aggregate columns
pub const AGGREGATE_ALIAS_PREFIX: &str = "sluice";

static NON_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("invalid placeholder regex"));

/// How parameters are referenced from the SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// `:field` / `:field_idx`
    #[default]
    Named,
    /// `?`, forced once a JOIN makes bare field names ambiguous
    Positional,
}

/// Parameter set of a compiled statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    /// Placeholder name (without the leading colon) and value, in SQL order
    Named(Vec<(String, Value)>),
    /// Values in SQL order
    Positional(Vec<Value>),
}

impl Params {
    pub fn empty() -> Self {
        Self::Named(Vec::new())
    }

    pub fn mode(&self) -> BindMode {
        match self {
            Self::Named(_) => BindMode::Named,
            Self::Positional(_) => BindMode::Positional,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Named(pairs) => pairs.len(),
            Self::Positional(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a named parameter; accepts the name with or without `:`
    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = name.strip_prefix(':').unwrap_or(name);
        match self {
            Self::Named(pairs) => pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Self::Positional(_) => None,
        }
    }

    /// All values in binding order
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Self::Named(pairs) => pairs.iter().map(|(_, v)| v).collect(),
            Self::Positional(values) => values.iter().collect(),
        }
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(pairs) => {
                write!(f, "{{")?;
                for (i, (name, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, ":{}={}", name, value)?;
                }
                write!(f, "}}")
            }
            Self::Positional(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Aggregate functions with a reserved result alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Count,
    Avg,
    Max,
    Min,
    Sum,
}

impl Aggregate {
    pub fn function(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Avg => "AVG",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Sum => "SUM",
        }
    }

    /// Column alias the aggregate is selected as, e.g. `sluice_count`
    pub fn alias(&self) -> String {
        format!("{}_{}", AGGREGATE_ALIAS_PREFIX, self.function().to_lowercase())
    }
}

/// Which terminal operation produced a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    FindOne,
    Aggregate(Aggregate),
    InsertOne,
    InsertMultiple,
    Update,
    Delete,
    ShowColumns,
}

impl StatementKind {
    /// Writes run on the context's slot connection, everything else on the
    /// shared read connection.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::InsertOne | Self::InsertMultiple | Self::Update | Self::Delete
        )
    }

    /// Short label for lifecycle logging
    pub fn label(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::FindOne => "find_one",
            Self::Aggregate(Aggregate::Count) => "count",
            Self::Aggregate(Aggregate::Avg) => "avg",
            Self::Aggregate(Aggregate::Max) => "max",
            Self::Aggregate(Aggregate::Min) => "min",
            Self::Aggregate(Aggregate::Sum) => "sum",
            Self::InsertOne => "insert_one",
            Self::InsertMultiple => "insert_multiple",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ShowColumns => "show_columns",
        }
    }
}

/// A compiled statement ready for a driver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    kind: StatementKind,
    sql: String,
    params: Params,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>, params: Params) -> Self {
        Self {
            kind,
            sql: sql.into(),
            params,
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn into_parts(self) -> (String, Params) {
        (self.sql, self.params)
    }

    /// Rewrite named placeholders to `?` and return values in binding order.
    ///
    /// Every named parameter must be referenced at least once, and in
    /// positional mode the number of `?` must match the value count.
    pub fn to_positional(&self) -> Result<(String, Vec<Value>)> {
        let placeholders = scan_placeholders(&self.sql);
        match &self.params {
            Params::Positional(values) => {
                let found = placeholders.iter().filter(|p| p.name.is_none()).count();
                if found != values.len() {
                    return Err(QueryError::compilation(
                        "positional parameters",
                        format!("{} placeholders but {} values", found, values.len()),
                    ));
                }
                Ok((self.sql.clone(), values.clone()))
            }
            Params::Named(pairs) => {
                let mut sql = String::with_capacity(self.sql.len());
                let mut values = Vec::with_capacity(pairs.len());
                let mut used = vec![false; pairs.len()];
                let mut cursor = 0;

                for placeholder in &placeholders {
                    let Some(name) = placeholder.name else {
                        continue;
                    };
                    let Some(index) = pairs.iter().position(|(n, _)| n == name) else {
                        continue;
                    };
                    sql.push_str(&self.sql[cursor..placeholder.start]);
                    sql.push_str(POSITIONAL_PLACEHOLDER);
                    cursor = placeholder.end;
                    values.push(pairs[index].1.clone());
                    used[index] = true;
                }
                sql.push_str(&self.sql[cursor..]);

                if let Some(unused) = used.iter().position(|u| !u) {
                    return Err(QueryError::compilation(
                        "named parameters",
                        format!("`:{}` is never referenced", pairs[unused].0),
                    ));
                }
                Ok((sql, values))
            }
        }
    }

    /// SQL with parameter values interpolated. For logs and error messages
    /// only; never send this to a database.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut cursor = 0;
        let positional: &[Value] = match &self.params {
            Params::Positional(values) => values,
            Params::Named(_) => &[],
        };
        let mut positional = positional.iter();

        for placeholder in scan_placeholders(&self.sql) {
            let value = match placeholder.name {
                Some(name) => self.params.get(name),
                None => positional.next(),
            };
            if let Some(value) = value {
                out.push_str(&self.sql[cursor..placeholder.start]);
                out.push_str(&sql_literal(value));
                cursor = placeholder.end;
            }
        }
        out.push_str(&self.sql[cursor..]);
        out
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sql, self.params)
    }
}

/// Render a value as a SQL literal (debug output only)
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Placeholder name for a field, optionally suffixed with an index.
///
/// Characters that cannot appear in a bind name (such as the `.` in
/// `o.status`) become `_`.
pub fn placeholder_name(field: &str, index: Option<usize>) -> String {
    let mut name = NON_IDENT_RE.replace_all(field, "_").into_owned();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "p_");
    }
    match index {
        Some(index) => format!("{}_{}", name, index),
        None => name,
    }
}

/// Collects parameters while a statement is being rendered
#[derive(Debug)]
pub(crate) struct ParamSink {
    mode: BindMode,
    named: Vec<(String, Value)>,
    positional: Vec<Value>,
}

impl ParamSink {
    pub(crate) fn new(mode: BindMode) -> Self {
        Self {
            mode,
            named: Vec::new(),
            positional: Vec::new(),
        }
    }

    /// Bind a value and return the placeholder text to splice into the SQL.
    ///
    /// Distinct fields can sanitize to the same name (`a-b` and `a_b`, or
    /// non-ASCII columns), so a taken name gets a `_2`, `_3`, ... suffix.
    pub(crate) fn bind(&mut self, field: &str, index: Option<usize>, value: Value) -> String {
        match self.mode {
            BindMode::Named => {
                let base = placeholder_name(field, index);
                let mut name = base.clone();
                let mut suffix = 2;
                while self.is_bound(&name) {
                    name = format!("{}_{}", base, suffix);
                    suffix += 1;
                }
                let placeholder = format!(":{}", name);
                self.named.push((name, value));
                placeholder
            }
            BindMode::Positional => {
                self.positional.push(value);
                POSITIONAL_PLACEHOLDER.to_string()
            }
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.named.iter().any(|(n, _)| n == name)
    }

    pub(crate) fn finish(self) -> Params {
        match self.mode {
            BindMode::Named => Params::Named(self.named),
            BindMode::Positional => Params::Positional(self.positional),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: Option<&'a str>,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Find `?` and `:name` placeholders outside quoted literals and identifiers
fn scan_placeholders(sql: &str) -> Vec<Placeholder<'_>> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' && q != b'`' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'?' => found.push(Placeholder {
                start: i,
                end: i + 1,
                name: None,
            }),
            b':' if i + 1 < bytes.len()
                && is_ident_start(bytes[i + 1])
                && (i == 0 || bytes[i - 1] != b':') =>
            {
                let mut end = i + 1;
                while end < bytes.len() && is_ident_char(bytes[end]) {
                    end += 1;
                }
                found.push(Placeholder {
                    start: i,
                    end,
                    name: Some(&sql[i + 1..end]),
                });
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scanner_skips_quoted_text_and_casts() {
        let sql = "SELECT ':nope', `a?b` FROM t WHERE x = :x AND y::int = ? AND z = 'it''s :z'";
        let names: Vec<_> = scan_placeholders(sql).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec![Some("x"), None]);
    }

    #[test]
    fn named_params_rewrite_in_sql_order() {
        let stmt = Statement::new(
            StatementKind::Select,
            "SELECT * FROM t WHERE b = :b AND a IN (:a_0,:a_1)",
            Params::Named(vec![
                ("a_0".into(), json!(1)),
                ("a_1".into(), json!(2)),
                ("b".into(), json!("x")),
            ]),
        );
        let (sql, values) = stmt.to_positional().unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE b = ? AND a IN (?,?)");
        assert_eq!(values, vec![json!("x"), json!(1), json!(2)]);
    }

    #[test]
    fn unused_named_param_is_rejected() {
        let stmt = Statement::new(
            StatementKind::Select,
            "SELECT * FROM t",
            Params::Named(vec![("ghost".into(), json!(1))]),
        );
        let err = stmt.to_positional().unwrap_err();
        assert!(err.to_string().contains(":ghost"));
    }

    #[test]
    fn positional_count_mismatch_is_rejected() {
        let stmt = Statement::new(
            StatementKind::Delete,
            "DELETE FROM t WHERE a = ?",
            Params::Positional(vec![json!(1), json!(2)]),
        );
        assert!(stmt.to_positional().is_err());
    }

    #[test]
    fn render_interpolates_literals() {
        let stmt = Statement::new(
            StatementKind::Select,
            "SELECT * FROM t WHERE name = :name AND age > :age",
            Params::Named(vec![
                ("name".into(), json!("O'Brien")),
                ("age".into(), json!(30)),
            ]),
        );
        assert_eq!(
            stmt.render(),
            "SELECT * FROM t WHERE name = 'O''Brien' AND age > 30"
        );
    }

    #[test]
    fn placeholder_names_are_sanitized() {
        assert_eq!(placeholder_name("status", None), "status");
        assert_eq!(placeholder_name("o.status", Some(2)), "o_status_2");
        assert_eq!(placeholder_name("1st", None), "p_1st");
    }

    #[test]
    fn colliding_placeholder_names_get_suffixes() {
        let mut sink = ParamSink::new(BindMode::Named);
        assert_eq!(sink.bind("名字", None, json!("ada")), ":__");
        assert_eq!(sink.bind("年龄", None, json!(3)), ":___2");
        assert_eq!(sink.bind("a-b", None, json!(1)), ":a_b");
        assert_eq!(sink.bind("a_b", None, json!(2)), ":a_b_2");
        assert_eq!(sink.bind("a_b_2", None, json!(3)), ":a_b_2_2");
        assert_eq!(sink.finish().len(), 5);
    }

    #[test]
    fn aggregate_aliases_are_reserved() {
        assert_eq!(Aggregate::Count.alias(), "sluice_count");
        assert_eq!(Aggregate::Sum.alias(), "sluice_sum");
        assert!(StatementKind::Update.is_write());
        assert!(!StatementKind::Aggregate(Aggregate::Max).is_write());
    }
}
