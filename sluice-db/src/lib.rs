//! Connection pooling and statement execution for sluice
//!
//! - [`PoolManager`]: bounded pool of shared connections plus one write slot
//!   per [`ContextId`]
//! - [`Model`]: runs compiled statements for one table, reads on its own
//!   connection and writes on the context's slot
//! - [`driver`]: the connection boundary, with MySQL and SQLite over sqlx
//! - [`LifecycleSink`]: receives per-statement timings

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod lifelog;
pub mod mock;
pub mod model;
pub mod pool;

pub use config::{load_dotenv, DatabaseConfig, Driver};
pub use context::ContextId;
pub use driver::{Connection, Connector, ExecOutcome};
pub use error::{ConfigError, DbError, DbResult, PoolError};
pub use lifelog::{LifeEntry, LifeLog, LifecycleSink, TracingSink};
pub use model::Model;
pub use pool::{
    ConnectionId, PoolConfig, PoolManager, PoolStatus, PooledConnection, SlotGuard, WriteSeeding,
};

pub use sluice_core::{
    Condition, Conjunction, ExecutionResult, Order, Outcome, QueryBuilder, QueryError, UpdateValue,
};
