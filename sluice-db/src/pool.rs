//! Connection pool with per-context write slots
//!
//! Reads check out any idle connection. Writes go through a capacity-1
//! slot keyed by [`ContextId`]: the first write for a context seeds the slot
//! from the shared pool, and every later write for that context gets the very
//! same connection back, so a transaction begun by one statement is seen by
//! the next. The slot is drained back into the shared pool by [`retire`].
//!
//! Slot connections count against `max_connections` like any other checkout.
//!
//! [`retire`]: PoolManager::retire

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, Driver};
use crate::context::ContextId;
use crate::driver::{Connection, Connector, MySqlConnector, SqliteConnector};
use crate::error::PoolError;

/// Default pool size, matching a typical worker's request concurrency
pub const DEFAULT_MAX_CONNECTIONS: u32 = 64;

/// When a context's write slot gets its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSeeding {
    /// On the context's first write
    #[default]
    Lazy,
    /// As soon as the context is opened with [`PoolManager::open`]
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub write_seeding: WriteSeeding,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            write_seeding: WriteSeeding::Lazy,
        }
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            write_seeding: config.write_seeding,
        }
    }
}

/// Stable identity of an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    /// Connections opened and not yet closed
    pub open: usize,
    pub idle: usize,
    /// Checked out, including connections parked in write slots
    pub in_use: usize,
    pub slots: usize,
}

type IdleConnection = (ConnectionId, Box<dyn Connection>);
type Slot = Arc<AsyncMutex<SlotState>>;

#[derive(Default)]
struct SlotState {
    conn: Option<PooledConnection>,
    /// Set once the slot is removed from the map; waiters holding the old
    /// handle must look the context up again.
    retired: bool,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    slots: Mutex<HashMap<ContextId, Slot>>,
    next_id: AtomicU64,
    open: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ContextId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Shared handle to the pool; clones are cheap and refer to the same pool
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolManager {
    /// Create a pool that opens connections lazily through `connector`
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let max = config.max_connections.max(1) as usize;
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::with_capacity(max)),
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Build the sqlx connector for `config` and warm the pool up to
    /// `min_connections`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PoolError> {
        let connector: Arc<dyn Connector> = match config.driver {
            Driver::Mysql => Arc::new(
                MySqlConnector::new(&config.url, &config.charset).map_err(PoolError::Connect)?,
            ),
            Driver::Sqlite => {
                Arc::new(SqliteConnector::new(&config.url).map_err(PoolError::Connect)?)
            }
        };
        let pool = Self::new(PoolConfig::from(config), connector);
        pool.warm().await?;
        info!(
            driver = ?config.driver,
            max_connections = config.max_connections,
            "database pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Open connections until `min_connections` are idle or checked out
    pub async fn warm(&self) -> Result<(), PoolError> {
        let target = self.inner.config.min_connections.min(self.inner.config.max_connections);
        let mut warmed = Vec::with_capacity(target as usize);
        for _ in 0..target {
            warmed.push(self.acquire_shared().await?);
        }
        debug!(connections = warmed.len(), "pool warmed");
        Ok(())
    }

    /// Check out a connection from the shared pool, waiting while the pool
    /// is at capacity.
    pub async fn acquire_shared(&self) -> Result<PooledConnection, PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let reused = self.inner.lock_idle().pop();
        let (id, conn) = match reused {
            Some(idle) => idle,
            None => self.open_connection().await?,
        };
        debug!(connection = %id, "checked out shared connection");
        Ok(PooledConnection {
            pool: Arc::downgrade(&self.inner),
            id,
            conn: Some(conn),
            _permit: permit,
        })
    }

    async fn open_connection(&self) -> Result<IdleConnection, PoolError> {
        let conn = self
            .inner
            .connector
            .connect()
            .await
            .map_err(PoolError::Connect)?;
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.open.fetch_add(1, Ordering::AcqRel);
        debug!(connection = %id, "opened connection");
        Ok((id, conn))
    }

    /// Check out the write connection of `ctx`.
    ///
    /// Seeds the slot from the shared pool on first use. While another task
    /// holds the slot this waits, so at most one connection is ever checked
    /// out per context.
    pub async fn acquire_for(&self, ctx: ContextId) -> Result<SlotGuard, PoolError> {
        loop {
            let slot = {
                if self.inner.is_closed() {
                    return Err(PoolError::Closed);
                }
                let mut slots = self.inner.lock_slots();
                Arc::clone(slots.entry(ctx).or_default())
            };

            let mut state = slot.lock_owned().await;
            if state.retired {
                continue;
            }
            if state.conn.is_none() {
                let conn = self.acquire_shared().await?;
                debug!(context = %ctx, connection = %conn.id(), "seeded write slot");
                state.conn = Some(conn);
            }
            match OwnedMutexGuard::try_map(state, |s| s.conn.as_mut()) {
                Ok(conn) => return Ok(SlotGuard { ctx, conn }),
                Err(_) => continue,
            }
        }
    }

    /// Like [`acquire_for`](Self::acquire_for), but never seeds: `None` when
    /// `ctx` has no slot or its slot holds no connection yet.
    pub async fn acquire_if_seeded(&self, ctx: ContextId) -> Result<Option<SlotGuard>, PoolError> {
        loop {
            let slot = {
                if self.inner.is_closed() {
                    return Err(PoolError::Closed);
                }
                match self.inner.lock_slots().get(&ctx) {
                    Some(slot) => Arc::clone(slot),
                    None => return Ok(None),
                }
            };

            let state = slot.lock_owned().await;
            if state.retired {
                continue;
            }
            return Ok(OwnedMutexGuard::try_map(state, |s| s.conn.as_mut())
                .ok()
                .map(|conn| SlotGuard { ctx, conn }));
        }
    }

    /// Register a context. With [`WriteSeeding::Eager`] its slot is seeded now.
    pub async fn open(&self, ctx: ContextId) -> Result<(), PoolError> {
        if self.inner.config.write_seeding == WriteSeeding::Eager {
            self.acquire_for(ctx).await?.release();
        }
        Ok(())
    }

    /// Drain the slot of `ctx` back into the shared pool and forget it.
    ///
    /// Waits for a current holder to release first. An open transaction is
    /// rolled back. Unknown contexts are ignored.
    pub async fn retire(&self, ctx: ContextId) {
        let slot = self.inner.lock_slots().remove(&ctx);
        let Some(slot) = slot else {
            return;
        };
        let mut state = slot.lock().await;
        state.retired = true;
        if let Some(conn) = state.conn.take() {
            settle(ctx, conn).await;
        }
    }

    /// Refuse new checkouts, drain every slot and close idle connections.
    /// Connections still checked out are closed when they come back.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let slots: Vec<(ContextId, Slot)> = self.inner.lock_slots().drain().collect();
        for (ctx, slot) in slots {
            let mut state = slot.lock().await;
            state.retired = true;
            if let Some(conn) = state.conn.take() {
                settle(ctx, conn).await;
            }
        }

        let idle = std::mem::take(&mut *self.inner.lock_idle());
        for (id, conn) in idle {
            self.inner.open.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = conn.close().await {
                warn!(connection = %id, error = %e, "failed to close connection");
            }
        }
        info!("database pool shut down");
    }

    pub fn status(&self) -> PoolStatus {
        let open = self.inner.open.load(Ordering::Acquire);
        let idle = self.inner.lock_idle().len();
        PoolStatus {
            max_connections: self.inner.config.max_connections,
            open,
            idle,
            in_use: open.saturating_sub(idle),
            slots: self.inner.lock_slots().len(),
        }
    }
}

/// Return a drained slot connection to the shared pool, rolling back an
/// abandoned transaction first. A connection that fails to roll back is
/// closed instead.
async fn settle(ctx: ContextId, mut conn: PooledConnection) {
    if conn.in_transaction() {
        warn!(context = %ctx, connection = %conn.id(), "rolling back open transaction of retired context");
        if let Err(e) = conn.rollback().await {
            warn!(context = %ctx, error = %e, "rollback failed, closing connection");
            conn.close().await;
            return;
        }
    }
    debug!(context = %ctx, connection = %conn.id(), "drained write slot");
}

/// A checked-out connection; returned to the idle list when dropped
pub struct PooledConnection {
    pool: Weak<PoolInner>,
    id: ConnectionId,
    conn: Option<Box<dyn Connection>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Return the connection now instead of at end of scope
    pub fn release(self) {
        drop(self);
    }

    /// Close the underlying connection instead of returning it
    pub async fn close(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.open.fetch_sub(1, Ordering::AcqRel);
        }
        if let Err(e) = conn.close().await {
            warn!(connection = %self.id, error = %e, "failed to close connection");
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        // Checked under the idle lock so shutdown never misses a late return
        let mut idle = pool.lock_idle();
        if pool.is_closed() {
            drop(idle);
            pool.open.fetch_sub(1, Ordering::AcqRel);
            drop(conn);
        } else {
            idle.push((self.id, conn));
        }
    }
}

/// Exclusive access to a context's write connection. Dropping it (or
/// calling [`release`](Self::release)) puts the connection back into the
/// same slot, never into the shared pool.
pub struct SlotGuard {
    ctx: ContextId,
    conn: OwnedMappedMutexGuard<SlotState, PooledConnection>,
}

impl SlotGuard {
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("context", &self.ctx)
            .field("connection", &self.id())
            .finish()
    }
}

impl Deref for SlotGuard {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for SlotGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
