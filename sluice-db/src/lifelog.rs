//! Lifecycle timing sinks
//!
//! A [`Model`](crate::Model) reports every statement it runs (label, time
//! spent, SQL) to a [`LifecycleSink`]. [`TracingSink`] forwards each record
//! straight to `tracing`; [`LifeLog`] collects the records of one request
//! context and emits them together when the context finishes.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::context::ContextId;

pub trait LifecycleSink: Send + Sync {
    fn record(&self, label: &str, elapsed: Duration, sql: &str);
}

/// Emits one `debug!` event per statement
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LifecycleSink for TracingSink {
    fn record(&self, label: &str, elapsed: Duration, sql: &str) {
        debug!(
            target: "sluice::lifecycle",
            label,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            sql,
            "statement executed"
        );
    }
}

/// One numbered record in a [`LifeLog`]
#[derive(Debug, Clone, PartialEq)]
pub struct LifeEntry {
    /// 1-based position within the log
    pub node: usize,
    pub label: String,
    /// Time spent in the statement itself
    pub elapsed: Duration,
    /// Time since the first record of the log
    pub since_start: Duration,
    pub sql: String,
}

/// Per-context collector of lifecycle records
#[derive(Debug)]
pub struct LifeLog {
    ctx: ContextId,
    inner: Mutex<LifeLogInner>,
}

#[derive(Debug, Default)]
struct LifeLogInner {
    started: Option<Instant>,
    entries: Vec<LifeEntry>,
}

impl LifeLog {
    pub fn new(ctx: ContextId) -> Self {
        Self {
            ctx,
            inner: Mutex::new(LifeLogInner::default()),
        }
    }

    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn entries(&self) -> Vec<LifeEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Span from the first record to the last one
    pub fn total(&self) -> Duration {
        self.lock()
            .entries
            .last()
            .map(|e| e.since_start)
            .unwrap_or_default()
    }

    /// Emit every record, then a summary line, and clear the log
    pub fn finish(&self) {
        let entries = {
            let mut inner = self.lock();
            inner.started = None;
            std::mem::take(&mut inner.entries)
        };
        if entries.is_empty() {
            return;
        }
        for entry in &entries {
            debug!(
                target: "sluice::lifecycle",
                "({} node {}: {}) - <{:.6}s, +{:.6}s> | {}",
                self.ctx,
                entry.node,
                entry.label,
                entry.elapsed.as_secs_f64(),
                entry.since_start.as_secs_f64(),
                entry.sql
            );
        }
        let total = entries.last().map(|e| e.since_start).unwrap_or_default();
        info!(
            target: "sluice::lifecycle",
            context = %self.ctx,
            statements = entries.len(),
            total_ms = total.as_secs_f64() * 1000.0,
            "context finished"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifeLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LifecycleSink for LifeLog {
    fn record(&self, label: &str, elapsed: Duration, sql: &str) {
        let now = Instant::now();
        let mut inner = self.lock();
        let started = *inner.started.get_or_insert(now);
        let node = inner.entries.len() + 1;
        inner.entries.push(LifeEntry {
            node,
            label: label.to_string(),
            elapsed,
            since_start: now.duration_since(started),
            sql: sql.to_string(),
        });
    }
}
