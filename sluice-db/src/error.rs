//! Error types for sluice-db

use std::path::PathBuf;

use sluice_core::{Params, QueryError};
use thiserror::Error;

use crate::context::ContextId;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// The builder refused or failed to compile the statement; nothing was sent
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The driver rejected a statement
    #[error("statement failed: {source} [sql: {sql}] [params: {params}]")]
    Execution {
        sql: String,
        params: Params,
        source: sqlx::Error,
    },

    /// BEGIN while the context's write connection is already in a transaction
    #[error("{context} already has an open transaction")]
    TransactionActive { context: ContextId },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DbError {
    pub fn execution(sql: impl Into<String>, params: Params, source: sqlx::Error) -> Self {
        Self::Execution {
            sql: sql.into(),
            params,
            source,
        }
    }

    /// SQL text of a failed statement, if this is an execution error
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Execution { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

/// Checkout failures. Waiting for capacity never errors; only opening a
/// connection or using a pool after shutdown does.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("connection pool is shut down")]
    Closed,

    #[error("failed to open database connection: {0}")]
    Connect(#[source] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: `{value}`")]
    Env { var: &'static str, value: String },

    #[error("invalid database config: {0}")]
    Invalid(String),
}
