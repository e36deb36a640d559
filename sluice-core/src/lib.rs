//! SQL compilation for sluice
//!
//! This crate is pure: it turns fluent builder calls into SQL text plus
//! bound parameters and wraps execution outcomes. Connections, pooling and
//! execution live in `sluice-db`.

pub mod builder;
pub mod error;
pub mod result;
pub mod schema;
pub mod statement;

pub use builder::{
    field_any_value, field_count, Condition, Conjunction, JoinKind, Order, QueryBuilder,
    UpdateValue,
};
pub use error::{QueryError, Result};
pub use result::{ExecutionResult, Outcome, Row};
pub use schema::{ColumnInfo, TableSchema};
pub use statement::{Aggregate, BindMode, Params, Statement, StatementKind};

pub use serde_json::Value;
