//! JOIN clauses

use crate::error::{QueryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
    Right,
    FullOuter,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Left => "LEFT JOIN",
            Self::Inner => "INNER JOIN",
            Self::Right => "RIGHT JOIN",
            Self::FullOuter => "FULL OUTER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Join {
    pub(crate) kind: JoinKind,
    pub(crate) table: String,
    pub(crate) alias: String,
    /// Raw ON predicate, rendered verbatim
    pub(crate) on: String,
}

impl Join {
    pub(crate) fn render(&self) -> Result<String> {
        if self.table.trim().is_empty() {
            return Err(QueryError::compilation(self.kind.as_sql(), "join table is empty"));
        }
        if self.on.trim().is_empty() {
            return Err(QueryError::compilation(
                format!("{} {}", self.kind.as_sql(), self.table),
                "ON predicate is empty",
            ));
        }
        if self.alias.is_empty() {
            Ok(format!("{} {} ON {}", self.kind.as_sql(), self.table, self.on))
        } else {
            Ok(format!(
                "{} {} AS {} ON {}",
                self.kind.as_sql(),
                self.table,
                self.alias,
                self.on
            ))
        }
    }
}
