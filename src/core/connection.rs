/// Connection management for the primary and its replicas
///
/// The manager owns one pool per node, hands out RAII connection guards,
/// recovers nodes after pool-level failures and promotes a replica when the
/// primary cannot be recovered.
use super::balancer::{LagAware, LoadBalancingAlgorithm};
use super::events::{ClusterEvent, EventBus};
use super::node::{Node, NodeSnapshot};
use super::pool::Connection;
use super::{NodeRole, QueryResult, SqlValue};
use crate::config::{ConfigError, RecoveryConfig};
use crate::error::{RouterError, RouterResult};
use crate::utils::backoff_delay;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Backoff recovery settings for failed nodes
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single `SELECT 1` liveness probe
    pub probe_timeout: Duration,
    pub promote_on_failure: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            promote_on_failure: true,
        }
    }
}

impl RecoveryPolicy {
    pub fn from_config(config: &RecoveryConfig, probe_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            probe_timeout,
            promote_on_failure: config.promote_on_failure,
        }
    }
}

/// Cluster-wide view of every node's counters
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub primary: NodeSnapshot,
    pub replicas: Vec<NodeSnapshot>,
    pub healthy_replicas: usize,
    pub recovering: Vec<String>,
    pub write_unavailable: bool,
}

struct Inner {
    primary: RwLock<Arc<Node>>,
    replicas: RwLock<Vec<Arc<Node>>>,
    balancer: Box<dyn LoadBalancingAlgorithm>,
    recovery: RecoveryPolicy,
    events: EventBus,
    recovering: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    promotion: tokio::sync::Mutex<()>,
    write_unavailable: AtomicBool,
    shutdown: AtomicBool,
}

/// Owner of every node pool in the cluster
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager with lag-aware balancing and default recovery
    pub fn new(primary: Arc<Node>, replicas: Vec<Arc<Node>>) -> Self {
        Self::with_options(
            primary,
            replicas,
            Box::new(LagAware::new()),
            RecoveryPolicy::default(),
            EventBus::new(),
        )
    }

    pub fn with_options(
        primary: Arc<Node>,
        replicas: Vec<Arc<Node>>,
        balancer: Box<dyn LoadBalancingAlgorithm>,
        recovery: RecoveryPolicy,
        events: EventBus,
    ) -> Self {
        primary.set_role(NodeRole::Primary);
        for replica in &replicas {
            replica.set_role(NodeRole::Replica);
        }

        info!(
            "Connection manager initialized with primary {} and {} replicas",
            primary.name(),
            replicas.len()
        );

        Self {
            inner: Arc::new(Inner {
                primary: RwLock::new(primary),
                replicas: RwLock::new(replicas),
                balancer,
                recovery,
                events,
                recovering: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                promotion: tokio::sync::Mutex::new(()),
                write_unavailable: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn primary(&self) -> Arc<Node> {
        Arc::clone(&*self.inner.primary.read().await)
    }

    pub async fn replicas(&self) -> Vec<Arc<Node>> {
        self.inner.replicas.read().await.clone()
    }

    /// Look up a node by name, primary included
    pub async fn node(&self, name: &str) -> Option<Arc<Node>> {
        let primary = self.primary().await;
        if primary.name() == name {
            return Some(primary);
        }
        self.inner
            .replicas
            .read()
            .await
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub fn is_write_unavailable(&self) -> bool {
        self.inner.write_unavailable.load(Ordering::Acquire)
    }

    /// Re-enable writes after an operator restored the primary
    pub fn clear_write_unavailable(&self) {
        if self.inner.write_unavailable.swap(false, Ordering::AcqRel) {
            info!("Write availability restored");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Borrow a connection to the primary
    pub async fn get_primary_connection(&self) -> RouterResult<ManagedConnection> {
        if self.is_shutdown() {
            return Err(RouterError::Shutdown);
        }
        if self.is_write_unavailable() {
            return Err(RouterError::write_unavailable(
                "primary is down and no replica could be promoted",
            ));
        }

        let primary = self.primary().await;
        self.acquire(primary).await
    }

    /// Borrow a connection to a healthy replica.
    ///
    /// `preferred` indexes the configured replica list and is honored when
    /// that replica is healthy. With no healthy replica the primary serves
    /// the read.
    pub async fn get_replica_connection(
        &self,
        preferred: Option<usize>,
    ) -> RouterResult<ManagedConnection> {
        if self.is_shutdown() {
            return Err(RouterError::Shutdown);
        }

        let replicas = self.replicas().await;
        if let Some(node) = preferred.and_then(|i| replicas.get(i)) {
            if node.is_healthy() {
                return self.acquire(Arc::clone(node)).await;
            }
        }

        let healthy: Vec<Arc<Node>> = replicas.into_iter().filter(|n| n.is_healthy()).collect();
        self.select_from(healthy, "no healthy replicas").await
    }

    /// Borrow a connection to a healthy replica lagging strictly less than
    /// `max_lag`, falling back to the primary
    pub async fn get_bounded_replica_connection(
        &self,
        max_lag: Duration,
    ) -> RouterResult<ManagedConnection> {
        if self.is_shutdown() {
            return Err(RouterError::Shutdown);
        }

        let bound = max_lag.as_millis() as u64;
        let candidates: Vec<Arc<Node>> = self
            .replicas()
            .await
            .into_iter()
            .filter(|n| n.is_healthy() && n.lag_ms() < bound)
            .collect();
        self.select_from(candidates, "no replica within lag bound")
            .await
    }

    async fn select_from(
        &self,
        candidates: Vec<Arc<Node>>,
        reason: &str,
    ) -> RouterResult<ManagedConnection> {
        match self.inner.balancer.select_backend(&candidates) {
            Some(index) => self.acquire(Arc::clone(&candidates[index])).await,
            None => {
                debug!("Routing read to primary: {}", reason);
                if self.is_write_unavailable() {
                    return Err(RouterError::no_healthy_node(format!(
                        "{} and the primary is unavailable",
                        reason
                    )));
                }
                let primary = self.primary().await;
                self.acquire(primary).await
            }
        }
    }

    async fn acquire(&self, node: Arc<Node>) -> RouterResult<ManagedConnection> {
        match node.pool().acquire().await {
            Ok(conn) => {
                node.on_acquire();
                Ok(ManagedConnection::new(conn, node, self.clone()))
            }
            Err(e) => {
                self.report_error(&node, &e);
                Err(e)
            }
        }
    }

    /// Run one statement on the primary or a replica
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        use_primary: bool,
    ) -> RouterResult<QueryResult> {
        let mut conn = if use_primary {
            self.get_primary_connection().await?
        } else {
            self.get_replica_connection(None).await?
        };
        conn.query(sql, params).await
    }

    /// True when the named node exists and is healthy
    pub async fn is_healthy(&self, name: &str) -> bool {
        self.node(name)
            .await
            .map(|n| n.is_healthy())
            .unwrap_or(false)
    }

    pub async fn get_stats(&self) -> ClusterStats {
        let primary = self.primary().await.snapshot();
        let replicas: Vec<NodeSnapshot> = self
            .replicas()
            .await
            .iter()
            .map(|n| n.snapshot())
            .collect();
        let healthy_replicas = replicas.iter().filter(|r| r.healthy).count();
        let mut recovering: Vec<String> = self
            .inner
            .recovering
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        recovering.sort();

        ClusterStats {
            primary,
            replicas,
            healthy_replicas,
            recovering,
            write_unavailable: self.is_write_unavailable(),
        }
    }

    /// Add a replica at the end of the promotion order
    pub async fn register_replica(&self, node: Arc<Node>) -> RouterResult<()> {
        if self.node(node.name()).await.is_some() {
            return Err(ConfigError::ValidationError(format!(
                "node {} is already registered",
                node.name()
            ))
            .into());
        }

        node.set_role(NodeRole::Replica);
        info!("Registered replica {}", node.name());
        self.inner.replicas.write().await.push(node);
        Ok(())
    }

    /// Remove a replica and close its pool
    pub async fn deregister_replica(&self, name: &str) -> Option<Arc<Node>> {
        let removed = {
            let mut replicas = self.inner.replicas.write().await;
            let position = replicas.iter().position(|n| n.name() == name)?;
            replicas.remove(position)
        };

        removed.pool().close().await;
        info!("Deregistered replica {}", name);
        Some(removed)
    }

    /// Account for a failed acquire or statement on `node`
    fn report_error(&self, node: &Arc<Node>, error: &RouterError) {
        match error {
            RouterError::Network(_) | RouterError::Connection { .. } => {
                self.handle_pool_error(node, error)
            }
            _ => node.record_error(&error.to_string()),
        }
    }

    /// Pool-level failure: mark the node down and start backoff recovery
    pub fn handle_pool_error(&self, node: &Arc<Node>, error: &RouterError) {
        let message = error.to_string();
        node.record_error(&message);
        node.set_healthy(false);
        warn!("Node {} marked unhealthy: {}", node.name(), message);

        self.inner.events.emit(ClusterEvent::NodeError {
            node: node.name().to_string(),
            message,
        });

        self.spawn_recovery(Arc::clone(node));
    }

    fn spawn_recovery(&self, node: Arc<Node>) {
        if self.is_shutdown() {
            return;
        }

        let newly_recovering = self
            .inner
            .recovering
            .lock()
            .map(|mut r| r.insert(node.name().to_string()))
            .unwrap_or(false);
        if !newly_recovering {
            return;
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.recover(node).await;
        });

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    async fn recover(&self, node: Arc<Node>) {
        let policy = &self.inner.recovery;
        let mut attempts = 0;

        while attempts < policy.max_attempts {
            attempts += 1;
            tokio::time::sleep(backoff_delay(policy.base_delay, attempts, policy.max_delay)).await;
            if self.is_shutdown() {
                self.finish_recovery(node.name());
                return;
            }

            debug!("Recovery attempt {} for {}", attempts, node.name());
            if self.probe(&node).await {
                node.set_healthy(true);
                self.finish_recovery(node.name());
                info!("Node {} recovered after {} attempts", node.name(), attempts);
                self.inner.events.emit(ClusterEvent::NodeRecovered {
                    node: node.name().to_string(),
                    attempts,
                });
                return;
            }
        }

        self.finish_recovery(node.name());
        error!(
            "Node {} failed to recover after {} attempts",
            node.name(),
            attempts
        );
        self.inner.events.emit(ClusterEvent::RecoveryFailed {
            node: node.name().to_string(),
            attempts,
        });

        let is_current_primary = Arc::ptr_eq(&node, &self.primary().await);
        if is_current_primary && policy.promote_on_failure {
            if let Err(e) = self.promote().await {
                error!("Promotion failed: {}", e);
            }
        }
    }

    fn finish_recovery(&self, name: &str) {
        if let Ok(mut recovering) = self.inner.recovering.lock() {
            recovering.remove(name);
        }
    }

    /// `SELECT 1` straight through the pool, bypassing node counters
    async fn probe(&self, node: &Node) -> bool {
        let check = async {
            let mut conn = node.pool().acquire().await?;
            conn.query("SELECT 1", &[]).await
        };
        matches!(
            timeout(self.inner.recovery.probe_timeout, check).await,
            Ok(Ok(_))
        )
    }

    /// Replace the primary with the first healthy replica that answers a
    /// liveness probe.
    ///
    /// When none qualifies the cluster becomes write-unavailable; writes are
    /// never routed to a replica.
    pub async fn promote(&self) -> RouterResult<Arc<Node>> {
        let _guard = self.inner.promotion.lock().await;
        if self.is_shutdown() {
            return Err(RouterError::Shutdown);
        }

        let candidates = self.replicas().await;
        for candidate in candidates.iter().filter(|n| n.is_healthy()) {
            if !self.probe(candidate).await {
                debug!("Promotion candidate {} failed its probe", candidate.name());
                continue;
            }

            let previous = {
                let mut primary = self.inner.primary.write().await;
                let mut replicas = self.inner.replicas.write().await;
                let Some(position) = replicas.iter().position(|n| Arc::ptr_eq(n, candidate))
                else {
                    continue;
                };
                let promoted = replicas.remove(position);
                promoted.set_role(NodeRole::Primary);
                std::mem::replace(&mut *primary, promoted)
            };

            previous.pool().close().await;
            self.inner.write_unavailable.store(false, Ordering::Release);

            warn!(
                "Promoted {} to primary, replacing {}",
                candidate.name(),
                previous.name()
            );
            self.inner.events.emit(ClusterEvent::Promoted {
                node: candidate.name().to_string(),
                previous: previous.name().to_string(),
            });
            return Ok(Arc::clone(candidate));
        }

        self.inner.write_unavailable.store(true, Ordering::Release);
        let message = "primary unrecoverable and no replica passed a liveness probe".to_string();
        error!("CRITICAL: {}", message);
        self.inner
            .events
            .emit(ClusterEvent::NoHealthyConnection {
                message: message.clone(),
            });
        Err(RouterError::write_unavailable(message))
    }

    /// Stop recovery and close every pool. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let primary = self.primary().await;
        primary.pool().close().await;
        for replica in self.replicas().await {
            replica.pool().close().await;
        }
        info!("Connection manager shut down");
    }
}

/// A borrowed connection tied to its node.
///
/// Statement latency and failures are recorded on the node. Dropping the
/// guard releases the node's active count; a guard dropped mid-transaction
/// discards the connection instead of returning it to the pool.
pub struct ManagedConnection {
    conn: Box<dyn Connection>,
    node: Arc<Node>,
    manager: ConnectionManager,
    in_transaction: bool,
}

impl ManagedConnection {
    fn new(conn: Box<dyn Connection>, node: Arc<Node>, manager: ConnectionManager) -> Self {
        Self {
            conn,
            node,
            manager,
            in_transaction: false,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn node_name(&self) -> &str {
        self.node.name()
    }

    pub fn is_primary(&self) -> bool {
        self.node.is_primary()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// Close the connection on release instead of pooling it
    pub(crate) fn discard(&mut self) {
        self.conn.mark_broken();
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> RouterResult<QueryResult> {
        let start = Instant::now();
        match self.conn.query(sql, params).await {
            Ok(result) => {
                self.node.record_latency(start.elapsed());
                Ok(result)
            }
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    pub async fn batch_execute(&mut self, sql: &str) -> RouterResult<()> {
        match self.conn.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    fn on_error(&mut self, error: &RouterError) {
        if error.is_connection_error() {
            self.conn.mark_broken();
        }
        self.manager.report_error(&self.node, error);
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!(
                "Connection to {} dropped inside a transaction, discarding it",
                self.node.name()
            );
            self.conn.mark_broken();
        }
        self.node.on_release();
    }
}
