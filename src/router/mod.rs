/// Query router: the public entry point
///
/// The router analyzes each statement, serves cacheable reads from the
/// result cache, picks a node by consistency level and falls back or
/// retries on the primary when a node fails. Transactions always run on
/// the primary.
pub mod cache;
pub mod options;
pub mod stats;

pub use cache::{LocalCache, SharedCache};
pub use options::{IsolationLevel, QueryOptions, TransactionOptions};
pub use stats::{RouterStats, RouterStatsSnapshot};

use crate::analyzer::{AnalysisContext, ConsistencyLevel, QueryAnalysis, QueryAnalyzer};
use crate::config::Config;
use crate::core::{
    ClusterEvent, ClusterStats, ConnectionManager, FromRow, ManagedConnection, QueryResult,
    SqlValue, StickinessManager,
};
use crate::error::{RouterError, RouterResult};
use crate::health::metrics::{MetricKind, PrometheusWriter};
use crate::health::{
    LagProbe, MonitorSettings, MonitorState, PostgresLagProbe, ReplicationMetrics,
    ReplicationMonitor,
};
use crate::utils::{backoff_delay, generate_id};
use futures::future::BoxFuture;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type FallbackLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Routing, retry and cache tuning
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub stickiness_window: Duration,
    /// Lag bound for bounded reads that do not name one
    pub default_max_lag: Duration,
    pub default_max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_fallbacks_per_sec: u32,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub shared_cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub cache_sweep_interval: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            stickiness_window: Duration::from_secs(30),
            default_max_lag: Duration::from_secs(1),
            default_max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(5),
            max_fallbacks_per_sec: 100,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(60),
            shared_cache_ttl: Duration::from_secs(300),
            cache_max_entries: 1_000,
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for RouterSettings {
    fn from(config: &Config) -> Self {
        let routing = &config.routing;
        let cache = &config.cache;
        Self {
            stickiness_window: Duration::from_millis(routing.stickiness_window_ms),
            default_max_lag: Duration::from_millis(routing.default_max_lag_ms),
            default_max_retries: routing.default_max_retries,
            retry_base_delay: Duration::from_millis(routing.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(routing.retry_max_delay_ms),
            max_fallbacks_per_sec: routing.max_fallbacks_per_sec,
            cache_enabled: cache.enabled,
            cache_ttl: Duration::from_millis(cache.default_ttl_ms),
            shared_cache_ttl: Duration::from_millis(cache.shared_ttl_ms),
            cache_max_entries: cache.max_entries,
            cache_sweep_interval: Duration::from_millis(cache.sweep_interval_ms),
        }
    }
}

/// Health of a single node as reported by [`QueryRouter::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealth {
    pub name: String,
    pub healthy: bool,
    pub lag_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// The primary accepts writes
    pub healthy: bool,
    pub primary: NodeHealth,
    pub replicas: Vec<NodeHealth>,
    pub write_unavailable: bool,
    pub monitor: MonitorState,
}

/// Router counters merged with node and replication state
#[derive(Debug, Clone, Serialize)]
pub struct RouterReport {
    pub queries: RouterStatsSnapshot,
    pub cache_hit_rate: f64,
    pub cluster: ClusterStats,
    pub replication_lag_ms: BTreeMap<String, u64>,
    pub replication: ReplicationMetrics,
    pub monitor: MonitorState,
    pub sticky_sessions: usize,
    pub cache_entries: usize,
    pub frequent_queries: Vec<(String, u64)>,
}

/// Where a read is sent before any fallback
enum ReadTarget {
    Primary,
    AnyReplica,
    Bounded(Duration),
}

struct RouterInner {
    manager: ConnectionManager,
    analyzer: QueryAnalyzer,
    monitor: ReplicationMonitor,
    stickiness: StickinessManager,
    local_cache: Arc<LocalCache>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    stats: RouterStats,
    fallbacks: FallbackLimiter,
    settings: RouterSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Assembles a [`QueryRouter`] around an existing [`ConnectionManager`]
pub struct RouterBuilder {
    manager: ConnectionManager,
    analyzer: Option<QueryAnalyzer>,
    probe: Option<Arc<dyn LagProbe>>,
    monitor_settings: MonitorSettings,
    settings: RouterSettings,
    shared_cache: Option<Arc<dyn SharedCache>>,
}

impl RouterBuilder {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            analyzer: None,
            probe: None,
            monitor_settings: MonitorSettings::default(),
            settings: RouterSettings::default(),
            shared_cache: None,
        }
    }

    pub fn analyzer(mut self, analyzer: QueryAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Lag source for the replication monitor, `pg_stat_replication` by default
    pub fn probe(mut self, probe: Arc<dyn LagProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn monitor_settings(mut self, settings: MonitorSettings) -> Self {
        self.monitor_settings = settings;
        self
    }

    pub fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    /// Build the router. Must be called from within a Tokio runtime: the
    /// promotion listener and the cache sweep are spawned here.
    pub fn build(self) -> QueryRouter {
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(PostgresLagProbe::new()));
        let monitor = ReplicationMonitor::new(self.manager.clone(), probe, self.monitor_settings);
        let stickiness = StickinessManager::new(self.settings.stickiness_window);
        let local_cache = Arc::new(LocalCache::new(self.settings.cache_max_entries));
        let quota = Quota::per_second(
            NonZeroU32::new(self.settings.max_fallbacks_per_sec).unwrap_or(NonZeroU32::MIN),
        );

        let tasks = vec![
            spawn_promotion_listener(&self.manager, stickiness.clone()),
            spawn_cache_sweep(
                Arc::downgrade(&local_cache),
                self.settings.cache_sweep_interval,
            ),
        ];

        QueryRouter {
            inner: Arc::new(RouterInner {
                manager: self.manager,
                analyzer: self.analyzer.unwrap_or_else(|| {
                    QueryAnalyzer::new(Vec::<String>::new(), Vec::<String>::new())
                }),
                monitor,
                stickiness,
                local_cache,
                shared_cache: self.shared_cache,
                stats: RouterStats::new(),
                fallbacks: RateLimiter::direct(quota),
                settings: self.settings,
                tasks: Mutex::new(tasks),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

/// Promotion changes which node holds recent writes, so sticky sessions
/// pointing at the old primary are dropped
fn spawn_promotion_listener(
    manager: &ConnectionManager,
    stickiness: StickinessManager,
) -> JoinHandle<()> {
    let mut events = manager.events().subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ClusterEvent::Promoted { node, previous } = event {
                let cleared = stickiness.clear_all().await;
                info!(
                    "Primary moved from {} to {}, cleared {} sticky sessions",
                    previous, node, cleared
                );
            }
        }
    })
}

fn spawn_cache_sweep(cache: Weak<LocalCache>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let purged = cache.purge_expired();
            if purged > 0 {
                debug!("Purged {} expired cache entries", purged);
            }
        }
    })
}

/// Routes statements across the primary and its replicas.
///
/// Cloning is cheap; clones share caches, statistics and the monitor.
#[derive(Clone)]
pub struct QueryRouter {
    inner: Arc<RouterInner>,
}

impl QueryRouter {
    pub fn builder(manager: ConnectionManager) -> RouterBuilder {
        RouterBuilder::new(manager)
    }

    /// Router with default settings and the Postgres lag probe
    pub fn new(manager: ConnectionManager) -> Self {
        Self::builder(manager).build()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.inner.analyzer
    }

    pub fn monitor(&self) -> &ReplicationMonitor {
        &self.inner.monitor
    }

    pub fn stickiness(&self) -> &StickinessManager {
        &self.inner.stickiness
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.inner.settings
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Start replication monitoring
    pub async fn start(&self) -> RouterResult<()> {
        self.ensure_running()?;
        self.inner.monitor.start().await;
        info!("Query router started");
        Ok(())
    }

    fn ensure_running(&self) -> RouterResult<()> {
        if self.is_shutdown() {
            Err(RouterError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Analyze a statement as `query` would, without running it
    pub fn analyze(&self, sql: &str, params: &[SqlValue], options: &QueryOptions) -> QueryAnalysis {
        let context = AnalysisContext {
            session_id: options.session_id.clone(),
            user_id: options.user_id.clone(),
            requested: options.consistency,
        };
        self.inner.analyzer.analyze(sql, params, &context)
    }

    /// Run one statement on the node its analysis and options call for
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        self.ensure_running()?;
        let start = Instant::now();
        let analysis = self.analyze(sql, params, options);
        let on_primary = analysis.requires_primary || options.force_write;
        self.inner.stats.record_query(on_primary);

        let result = if analysis.changes_session {
            self.run_session_statement(sql, params, options).await
        } else if on_primary {
            debug!(
                "Routing {} to primary (tables: {:?})",
                analysis.query_type, analysis.tables
            );
            let result = self.run_on_primary(sql, params, options).await;
            // A failed write may still have committed
            if let Some(key) = options.sticky_key() {
                self.inner.stickiness.mark(key).await;
            }
            result
        } else {
            self.read(sql, params, options, &analysis).await
        };

        match &result {
            Ok(_) => self.inner.stats.record_latency(on_primary, start.elapsed()),
            Err(e) => {
                self.inner.stats.record_error();
                debug!("Query failed after {:?}: {}", start.elapsed(), e);
            }
        }
        result
    }

    /// [`query`](Self::query), decoding each row into `T`
    pub async fn query_as<T: FromRow>(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult<T>> {
        self.query(sql, params, options).await?.decode()
    }

    async fn read(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
        analysis: &QueryAnalysis,
    ) -> RouterResult<QueryResult> {
        let cache_key = analysis
            .cache_key
            .as_deref()
            .filter(|_| options.cached && self.inner.settings.cache_enabled);

        if let Some(key) = cache_key {
            if let Some(hit) = self.cache_lookup(key).await {
                self.inner.stats.record_cache_hit();
                debug!("Cache hit for {}", key);
                return Ok(hit);
            }
            self.inner.stats.record_cache_miss();
        }

        let target = self.read_target(analysis.consistency_level, options).await;
        let result = self.run_read(target, sql, params, options).await?;

        if let Some(key) = cache_key {
            self.cache_store(key, &result, options.cache_ttl).await;
        }
        Ok(result)
    }

    async fn read_target(&self, level: ConsistencyLevel, options: &QueryOptions) -> ReadTarget {
        match level {
            ConsistencyLevel::Strong => ReadTarget::Primary,
            ConsistencyLevel::Bounded => ReadTarget::Bounded(
                options
                    .max_lag
                    .unwrap_or(self.inner.settings.default_max_lag),
            ),
            ConsistencyLevel::ReadYourWrites => match options.sticky_key() {
                Some(key) if self.inner.stickiness.is_sticky(key).await => {
                    debug!("Session {} wrote recently, reading from primary", key);
                    ReadTarget::Primary
                }
                _ => ReadTarget::AnyReplica,
            },
            ConsistencyLevel::Eventual => ReadTarget::AnyReplica,
        }
    }

    /// Run a session statement on the primary and close the connection
    /// afterwards, so the state it sets never reaches another caller.
    /// Use [`QueryOptions::timeout`] or [`transaction`](Self::transaction)
    /// for settings that must apply to later statements.
    async fn run_session_statement(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        let mut conn = self.inner.manager.get_primary_connection().await?;
        let result = self.execute_on(&mut conn, sql, params, options).await;
        debug!(
            "Session statement ran on {}, discarding connection",
            conn.node_name()
        );
        conn.discard();
        result
    }

    /// Run a read on its target. A failure on a replica is retried on the
    /// primary once, within the fallback rate limit unless the caller asked
    /// for retries.
    async fn run_read(
        &self,
        target: ReadTarget,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        let manager = &self.inner.manager;
        let acquired = match target {
            ReadTarget::Primary => return self.run_on_primary(sql, params, options).await,
            ReadTarget::AnyReplica => manager.get_replica_connection(None).await,
            ReadTarget::Bounded(max_lag) => manager.get_bounded_replica_connection(max_lag).await,
        };

        let (result, replica) = match acquired {
            Ok(mut conn) => {
                let replica = !conn.is_primary();
                (self.execute_on(&mut conn, sql, params, options).await, replica)
            }
            Err(e) => {
                // With no healthy replica the acquire targeted the primary
                let primary = manager.primary().await;
                let replica = e.node().map_or(false, |node| node != primary.name());
                (Err(e), replica)
            }
        };

        match result {
            Err(e) if replica && e.is_retryable() => {
                if !options.retry_on_failure && self.inner.fallbacks.check().is_err() {
                    self.inner.stats.record_fallback_suppressed();
                    warn!("Replica read failed and fallback limit reached: {}", e);
                    return Err(e);
                }
                warn!("Replica read failed, falling back to primary: {}", e);
                self.inner.stats.record_fallback();
                self.run_on_primary(sql, params, options).await
            }
            other => other,
        }
    }

    /// Run on the primary, retrying retryable failures with backoff when
    /// the caller asked for it
    async fn run_on_primary(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        let settings = &self.inner.settings;
        let max_retries = if options.retry_on_failure {
            options.max_retries.unwrap_or(settings.default_max_retries)
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let result = match self.inner.manager.get_primary_connection().await {
                Ok(mut conn) => self.execute_on(&mut conn, sql, params, options).await,
                Err(e) => Err(e),
            };

            match result {
                Err(e) if max_retries > 0 && e.is_retryable() => {
                    if attempt >= max_retries {
                        error!("Giving up after {} retries: {}", max_retries, e);
                        return Err(RouterError::RetriesExhausted {
                            attempts: max_retries,
                            last_error: e.to_string(),
                        });
                    }
                    attempt += 1;
                    self.inner.stats.record_retry();
                    let delay =
                        backoff_delay(settings.retry_base_delay, attempt, settings.retry_max_delay);
                    warn!(
                        "Primary attempt failed, retry {}/{} in {:?}: {}",
                        attempt, max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn execute_on(
        &self,
        conn: &mut ManagedConnection,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        self.inner.stats.record_executed();
        let Some(limit) = options.timeout else {
            return conn.query(sql, params).await;
        };

        conn.batch_execute(&format!("SET statement_timeout = {}", limit.as_millis()))
            .await?;
        let result = conn.query(sql, params).await;
        if let Err(e) = conn.batch_execute("RESET statement_timeout").await {
            warn!(
                "Could not reset statement_timeout on {}, discarding connection: {}",
                conn.node_name(),
                e
            );
            conn.discard();
        }
        result
    }

    async fn cache_lookup(&self, key: &str) -> Option<QueryResult> {
        if let Some(hit) = self.inner.local_cache.get(key) {
            return Some(hit);
        }

        let shared = self.inner.shared_cache.as_ref()?;
        match shared.get(key).await {
            Ok(Some(hit)) => {
                self.inner
                    .local_cache
                    .insert(key, hit.clone(), self.inner.settings.cache_ttl);
                Some(hit)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Shared cache lookup failed, treating as miss: {}", e);
                None
            }
        }
    }

    async fn cache_store(&self, key: &str, result: &QueryResult, ttl: Option<Duration>) {
        let settings = &self.inner.settings;
        self.inner
            .local_cache
            .insert(key, result.clone(), ttl.unwrap_or(settings.cache_ttl));
        self.inner.stats.record_cached();

        if let Some(shared) = &self.inner.shared_cache {
            let shared_ttl = ttl.unwrap_or(settings.shared_cache_ttl);
            if let Err(e) = shared.set(key, result, shared_ttl).await {
                warn!("Shared cache store failed for {}: {}", key, e);
            }
        }
    }

    /// Run `f` inside a transaction on the primary.
    ///
    /// Isolation, read-only and deferrable options are applied as session
    /// defaults before `BEGIN` and reset afterwards. An error from `f` rolls
    /// the transaction back before it is returned.
    pub async fn transaction<T, F>(&self, options: TransactionOptions, f: F) -> RouterResult<T>
    where
        F: for<'c> FnOnce(&'c mut ManagedConnection) -> BoxFuture<'c, RouterResult<T>>,
    {
        self.ensure_running()?;
        let start = Instant::now();
        self.inner.stats.record_query(true);
        self.inner.stats.record_transaction();

        let result = self.run_transaction(&options, f).await;
        if let Some(session) = &options.session_id {
            self.inner.stickiness.mark(session).await;
        }

        match &result {
            Ok(_) => self.inner.stats.record_latency(true, start.elapsed()),
            Err(e) => {
                self.inner.stats.record_error();
                warn!("Transaction failed: {}", e);
            }
        }
        result
    }

    async fn run_transaction<T, F>(&self, options: &TransactionOptions, f: F) -> RouterResult<T>
    where
        F: for<'c> FnOnce(&'c mut ManagedConnection) -> BoxFuture<'c, RouterResult<T>>,
    {
        let mut conn = self.inner.manager.get_primary_connection().await?;
        let settings = options.session_settings();
        let tx_id = generate_id("tx");

        for (set, _) in &settings {
            if let Err(e) = conn.batch_execute(set).await {
                conn.discard();
                return Err(e);
            }
        }

        if let Err(e) = conn.batch_execute("BEGIN").await {
            conn.discard();
            return Err(e);
        }
        conn.set_in_transaction(true);
        debug!("Transaction {} started on {}", tx_id, conn.node_name());

        let result = match f(&mut conn).await {
            Ok(value) => match conn.batch_execute("COMMIT").await {
                Ok(()) => {
                    conn.set_in_transaction(false);
                    debug!("Transaction {} committed", tx_id);
                    Ok(value)
                }
                Err(e) => Err(RouterError::transaction(format!("COMMIT failed: {}", e))),
            },
            Err(e) => {
                debug!("Transaction {} rolling back: {}", tx_id, e);
                match conn.batch_execute("ROLLBACK").await {
                    Ok(()) => conn.set_in_transaction(false),
                    Err(rollback) => warn!(
                        "ROLLBACK failed on {}, discarding connection: {}",
                        conn.node_name(),
                        rollback
                    ),
                }
                Err(e)
            }
        };

        // A connection still inside the transaction is discarded on drop
        if !conn.in_transaction() {
            for (_, reset) in &settings {
                if let Err(e) = conn.batch_execute(reset).await {
                    warn!("{} failed, discarding connection: {}", reset, e);
                    conn.discard();
                    break;
                }
            }
        }
        result
    }

    /// Register a named statement for [`execute`](Self::execute)
    pub fn prepare<N: Into<String>, S: Into<String>>(&self, name: N, sql: S) {
        self.inner.analyzer.prepare(name, sql);
    }

    /// Run a statement registered with [`prepare`](Self::prepare)
    pub async fn execute(
        &self,
        name: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> RouterResult<QueryResult> {
        let statement = self.inner.analyzer.get_prepared(name)?;
        self.query(&statement.sql, params, options).await
    }

    /// Remove cached results whose key matches `pattern` (everything when
    /// `None`) from both tiers. Keys look like `q:{tables}:{hash}`, so
    /// `q:properties*` targets reads of `properties`.
    pub async fn clear_cache(&self, pattern: Option<&str>) -> usize {
        let mut cleared = self.inner.local_cache.clear(pattern);
        if let Some(shared) = &self.inner.shared_cache {
            match shared.clear(pattern).await {
                Ok(removed) => cleared += removed as usize,
                Err(e) => warn!("Shared cache clear failed: {}", e),
            }
        }
        info!(
            "Cleared {} cached results matching {}",
            cleared,
            pattern.unwrap_or("*")
        );
        cleared
    }

    pub async fn health_check(&self) -> HealthReport {
        let manager = &self.inner.manager;
        let primary = manager.primary().await;
        let replicas = manager
            .replicas()
            .await
            .iter()
            .map(|node| NodeHealth {
                name: node.name().to_string(),
                healthy: node.is_healthy(),
                lag_ms: node.lag_ms(),
            })
            .collect();
        let write_unavailable = manager.is_write_unavailable();

        HealthReport {
            healthy: primary.is_healthy() && !write_unavailable && !self.is_shutdown(),
            primary: NodeHealth {
                name: primary.name().to_string(),
                healthy: primary.is_healthy(),
                lag_ms: 0,
            },
            replicas,
            write_unavailable,
            monitor: self.inner.monitor.state(),
        }
    }

    pub async fn get_stats(&self) -> RouterReport {
        let queries = self.inner.stats.snapshot();
        RouterReport {
            cache_hit_rate: queries.cache_hit_rate(),
            queries,
            cluster: self.inner.manager.get_stats().await,
            replication_lag_ms: self.inner.monitor.lag_map().await,
            replication: self.inner.monitor.metrics().await,
            monitor: self.inner.monitor.state(),
            sticky_sessions: self.inner.stickiness.count().await,
            cache_entries: self.inner.local_cache.len(),
            frequent_queries: self.inner.analyzer.frequent_queries(10),
        }
    }

    /// Query counters, pool utilization and replication lag in Prometheus
    /// text format
    pub async fn prometheus_metrics(&self) -> String {
        let stats = self.inner.stats.snapshot();
        let cluster = self.inner.manager.get_stats().await;
        let mut w = PrometheusWriter::new();

        w.family("queries_total", MetricKind::Counter, "Routed statements")
            .sample("queries_total", &[("kind", "read")], stats.read_queries as f64)
            .sample("queries_total", &[("kind", "write")], stats.write_queries as f64);
        w.single(
            "executed_queries_total",
            MetricKind::Counter,
            "Statements sent to a node",
            stats.executed_queries as f64,
        );
        w.single(
            "transactions_total",
            MetricKind::Counter,
            "Transactions run on the primary",
            stats.transactions as f64,
        );
        w.family("cache_lookups_total", MetricKind::Counter, "Result cache lookups")
            .sample("cache_lookups_total", &[("result", "hit")], stats.cache_hits as f64)
            .sample("cache_lookups_total", &[("result", "miss")], stats.cache_misses as f64);
        w.single(
            "cached_results_total",
            MetricKind::Counter,
            "Results written to the cache",
            stats.cached_results as f64,
        );
        w.single(
            "query_errors_total",
            MetricKind::Counter,
            "Statements that returned an error",
            stats.errors as f64,
        );
        w.family("fallbacks_total", MetricKind::Counter, "Replica reads retried on the primary")
            .sample("fallbacks_total", &[("outcome", "taken")], stats.fallbacks as f64)
            .sample(
                "fallbacks_total",
                &[("outcome", "suppressed")],
                stats.fallbacks_suppressed as f64,
            );
        w.single(
            "retries_total",
            MetricKind::Counter,
            "Primary retries after retryable failures",
            stats.retries as f64,
        );
        w.family(
            "query_latency_avg_ms",
            MetricKind::Gauge,
            "Rolling average statement latency",
        )
        .sample("query_latency_avg_ms", &[("kind", "all")], stats.avg_latency_ms)
        .sample("query_latency_avg_ms", &[("kind", "read")], stats.avg_read_latency_ms)
        .sample("query_latency_avg_ms", &[("kind", "write")], stats.avg_write_latency_ms);

        let nodes: Vec<_> = std::iter::once(&cluster.primary)
            .chain(cluster.replicas.iter())
            .collect();
        w.family(
            "pool_connections",
            MetricKind::Gauge,
            "Pooled connections per node by state",
        );
        for node in &nodes {
            w.sample(
                "pool_connections",
                &[("node", node.name.as_str()), ("state", "active")],
                node.active_connections as f64,
            )
            .sample(
                "pool_connections",
                &[("node", node.name.as_str()), ("state", "idle")],
                node.idle_connections as f64,
            );
        }
        w.family("pool_max_connections", MetricKind::Gauge, "Pool capacity per node");
        for node in &nodes {
            w.sample(
                "pool_max_connections",
                &[("node", node.name.as_str())],
                node.max_connections as f64,
            );
        }
        w.family("node_healthy", MetricKind::Gauge, "1 when the node accepts connections");
        for node in &nodes {
            let role = node.role.to_string();
            w.sample(
                "node_healthy",
                &[("node", node.name.as_str()), ("role", role.as_str())],
                if node.healthy { 1.0 } else { 0.0 },
            );
        }
        w.family("node_errors_total", MetricKind::Counter, "Errors recorded per node");
        for node in &nodes {
            w.sample("node_errors_total", &[("node", node.name.as_str())], node.errors as f64);
        }
        w.single(
            "write_unavailable",
            MetricKind::Gauge,
            "1 when no primary can accept writes",
            if cluster.write_unavailable { 1.0 } else { 0.0 },
        );

        w.append(&self.inner.monitor.prometheus_metrics().await);
        w.finish()
    }

    /// Stop the monitor, then close every pool. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down query router");

        self.inner.monitor.stop().await;
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        self.inner.manager.shutdown().await;
    }
}
