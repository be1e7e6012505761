/// Database node: one pool plus its health and usage counters
use super::pool::NodePool;
use super::NodeRole;
use crate::utils::RollingAverage;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// A pooled database endpoint.
///
/// Counters are updated concurrently from every connection that borrows
/// from the pool, so all of them are atomics.
pub struct Node {
    name: String,
    pool: Arc<dyn NodePool>,
    primary: AtomicBool,
    healthy: AtomicBool,
    lag_ms: AtomicU64,
    lag_bytes: AtomicU64,
    active: AtomicUsize,
    acquired: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_health_check: Mutex<Option<SystemTime>>,
    latency: RollingAverage,
}

/// Serializable view of a node's counters
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub role: NodeRole,
    pub healthy: bool,
    pub lag_ms: u64,
    pub lag_bytes: u64,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub acquired_total: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub queries: u64,
    pub avg_latency_ms: f64,
}

impl Node {
    pub fn new<S: Into<String>>(name: S, role: NodeRole, pool: Arc<dyn NodePool>) -> Self {
        Self {
            name: name.into(),
            pool,
            primary: AtomicBool::new(role == NodeRole::Primary),
            // Nodes start healthy; the first failed acquire or monitor poll says otherwise
            healthy: AtomicBool::new(true),
            lag_ms: AtomicU64::new(0),
            lag_bytes: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_health_check: Mutex::new(None),
            latency: RollingAverage::new(),
        }
    }

    pub fn primary(pool: Arc<dyn NodePool>) -> Self {
        Self::new("primary", NodeRole::Primary, pool)
    }

    pub fn replica<S: Into<String>>(name: S, pool: Arc<dyn NodePool>) -> Self {
        Self::new(name, NodeRole::Replica, pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<dyn NodePool> {
        &self.pool
    }

    pub fn role(&self) -> NodeRole {
        if self.primary.load(Ordering::Acquire) {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role() == NodeRole::Primary
    }

    pub(crate) fn set_role(&self, role: NodeRole) {
        self.primary
            .store(role == NodeRole::Primary, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        if let Ok(mut checked) = self.last_health_check.lock() {
            *checked = Some(SystemTime::now());
        }
    }

    pub fn last_health_check(&self) -> Option<SystemTime> {
        self.last_health_check.lock().ok().and_then(|c| *c)
    }

    pub fn lag_ms(&self) -> u64 {
        self.lag_ms.load(Ordering::Acquire)
    }

    pub fn lag_bytes(&self) -> u64 {
        self.lag_bytes.load(Ordering::Acquire)
    }

    /// Record the latest replication lag reported by the monitor
    pub fn set_lag(&self, lag_ms: u64, lag_bytes: u64) {
        self.lag_ms.store(lag_ms, Ordering::Release);
        self.lag_bytes.store(lag_bytes, Ordering::Release);
    }

    pub(crate) fn on_acquire(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_release(&self) {
        // Never wraps below zero even if release is reported twice
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Count a failure and remember its message
    pub fn record_error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message.to_string());
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency.average_ms()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let status = self.pool.status();
        let active = self.active_connections();
        NodeSnapshot {
            name: self.name.clone(),
            role: self.role(),
            healthy: self.is_healthy(),
            lag_ms: self.lag_ms(),
            lag_bytes: self.lag_bytes(),
            total_connections: status.total.max(active),
            active_connections: active,
            idle_connections: status.idle,
            max_connections: status.max_size,
            acquired_total: self.acquired.load(Ordering::Relaxed),
            errors: self.error_count(),
            last_error: self.last_error(),
            queries: self.latency.samples(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("role", &self.role())
            .field("healthy", &self.is_healthy())
            .field("lag_ms", &self.lag_ms())
            .finish()
    }
}
