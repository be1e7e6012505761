/// Replication monitoring for the replica set
pub mod metrics;
pub mod postgres;

pub use metrics::{MetricKind, PrometheusWriter};
pub use postgres::PostgresLagProbe;

use crate::config::MonitorConfig;
use crate::core::{ClusterEvent, ConnectionManager, Node};
use crate::error::RouterResult;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// One row of the primary's replication view
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalSender {
    pub application_name: String,
    pub client_addr: Option<String>,
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub sync_priority: Option<i64>,
    pub sent_lsn: Option<String>,
    pub replay_lsn: Option<String>,
    pub write_lag_bytes: u64,
    pub flush_lag_bytes: u64,
    pub replay_lag_bytes: u64,
    pub replay_lag_ms: Option<u64>,
    pub reply_age_ms: Option<u64>,
}

/// What a replica reports about itself
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplicaProbe {
    pub in_recovery: bool,
    pub lag_ms: u64,
    pub lag_bytes: u64,
    pub receive_lsn: Option<String>,
    pub replay_lsn: Option<String>,
}

/// Source of replication lag readings
#[async_trait]
pub trait LagProbe: Send + Sync {
    /// Standbys connected to the primary
    async fn wal_senders(&self, primary: &Node) -> RouterResult<Vec<WalSender>>;

    /// Recovery state and lag reported by one replica
    async fn replica_status(&self, replica: &Node) -> RouterResult<ReplicaProbe>;
}

/// Latest replication state of one replica
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStatus {
    pub replica: String,
    pub healthy: bool,
    pub in_recovery: bool,
    pub lag_ms: u64,
    pub lag_bytes: u64,
    /// Milliseconds since the Unix epoch
    pub last_check_ms: u64,
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub sync_priority: Option<i64>,
    pub write_lag_bytes: Option<u64>,
    pub flush_lag_bytes: Option<u64>,
    pub reply_age_ms: Option<u64>,
    pub receive_lsn: Option<String>,
    pub replay_lsn: Option<String>,
    pub error: Option<String>,
}

/// Aggregates over the last check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplicationMetrics {
    pub avg_lag_ms: f64,
    pub max_lag_ms: u64,
    pub min_lag_ms: u64,
    pub healthy_replicas: usize,
    pub unhealthy_replicas: usize,
    pub total_replicas: usize,
    pub checks: u64,
    pub last_check_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Running,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Stopped => write!(f, "stopped"),
            MonitorState::Running => write!(f, "running"),
        }
    }
}

/// Monitor timing and thresholds
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub check_timeout: Duration,
    pub max_acceptable_lag: Duration,
    pub alert_threshold: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(2),
            max_acceptable_lag: Duration::from_secs(10),
            alert_threshold: Duration::from_secs(5),
        }
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            check_timeout: Duration::from_millis(config.check_timeout_ms),
            max_acceptable_lag: Duration::from_millis(config.max_acceptable_lag_ms),
            alert_threshold: Duration::from_millis(config.alert_threshold_ms),
        }
    }
}

struct MonitorInner {
    manager: ConnectionManager,
    probe: Arc<dyn LagProbe>,
    settings: MonitorSettings,
    status: RwLock<BTreeMap<String, ReplicationStatus>>,
    metrics: RwLock<ReplicationMetrics>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    check_lock: tokio::sync::Mutex<()>,
}

/// Polls the primary and every replica for replication lag.
///
/// `Stopped -> Running` on [`start`](Self::start), which checks once
/// immediately and then on a fixed interval; `Running -> Stopped` on
/// [`stop`](Self::stop).
#[derive(Clone)]
pub struct ReplicationMonitor {
    inner: Arc<MonitorInner>,
}

impl ReplicationMonitor {
    pub fn new(
        manager: ConnectionManager,
        probe: Arc<dyn LagProbe>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                manager,
                probe,
                settings,
                status: RwLock::new(BTreeMap::new()),
                metrics: RwLock::new(ReplicationMetrics::default()),
                task: Mutex::new(None),
                check_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        let running = self
            .inner
            .task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false);
        if running {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Check once now, then keep checking on the configured interval
    pub async fn start(&self) {
        if self.is_running() {
            return;
        }

        self.force_check().await;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = self.clone();
        let period = self.inner.settings.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.force_check().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Replication monitor loop exited");
        });

        let mut started = false;
        if let Ok(mut task) = self.inner.task.lock() {
            if task.is_none() {
                *task = Some((stop_tx, handle));
                started = true;
            } else {
                handle.abort();
            }
        }

        if started {
            info!(
                "Replication monitor started (interval {:?})",
                self.inner.settings.interval
            );
            self.inner.manager.events().emit(ClusterEvent::MonitorStarted);
        }
    }

    /// Stop the polling loop, letting an in-flight check finish
    pub async fn stop(&self) {
        let task = self.inner.task.lock().ok().and_then(|mut t| t.take());
        let Some((stop_tx, handle)) = task else {
            return;
        };

        let _ = stop_tx.send(true);
        let grace = self.inner.settings.check_timeout * 2 + Duration::from_millis(100);
        let abort = handle.abort_handle();
        if timeout(grace, handle).await.is_err() {
            warn!("Replication monitor did not stop in time, aborting");
            abort.abort();
        }

        info!("Replication monitor stopped");
        self.inner.manager.events().emit(ClusterEvent::MonitorStopped);
    }

    /// Run one full check cycle now
    pub async fn force_check(&self) -> ReplicationMetrics {
        let _guard = self.inner.check_lock.lock().await;
        let started = Instant::now();
        let settings = &self.inner.settings;
        let events = self.inner.manager.events();

        let primary = self.inner.manager.primary().await;
        let replicas = self.inner.manager.replicas().await;

        let senders = match timeout(settings.check_timeout, self.inner.probe.wal_senders(&primary)).await
        {
            Ok(Ok(senders)) => senders,
            Ok(Err(e)) => {
                warn!("Failed to read replication state from {}: {}", primary.name(), e);
                Vec::new()
            }
            Err(_) => {
                warn!("Timed out reading replication state from {}", primary.name());
                Vec::new()
            }
        };

        let max_lag_ms = settings.max_acceptable_lag.as_millis() as u64;
        let alert_ms = settings.alert_threshold.as_millis() as u64;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut statuses = BTreeMap::new();
        for replica in &replicas {
            if replica.is_primary() {
                continue;
            }

            let sender = senders
                .iter()
                .find(|s| sender_matches(&s.application_name, replica.name()));

            let probe = timeout(settings.check_timeout, self.inner.probe.replica_status(replica)).await;
            let status = match probe {
                Ok(Ok(probe)) => {
                    let healthy = probe.in_recovery && probe.lag_ms < max_lag_ms;
                    let lag_bytes = sender
                        .map(|s| s.replay_lag_bytes)
                        .filter(|b| *b > 0)
                        .unwrap_or(probe.lag_bytes);
                    replica.set_lag(probe.lag_ms, lag_bytes);
                    replica.set_healthy(healthy);

                    if !probe.in_recovery {
                        warn!("Replica {} is not in recovery", replica.name());
                    }
                    if probe.lag_ms > alert_ms {
                        warn!(
                            "Replica {} lag {}ms exceeds alert threshold {}ms",
                            replica.name(),
                            probe.lag_ms,
                            alert_ms
                        );
                        events.emit(ClusterEvent::HighLag {
                            replica: replica.name().to_string(),
                            lag_ms: probe.lag_ms,
                        });
                    }

                    ReplicationStatus {
                        replica: replica.name().to_string(),
                        healthy,
                        in_recovery: probe.in_recovery,
                        lag_ms: probe.lag_ms,
                        lag_bytes,
                        last_check_ms: now_ms,
                        state: sender.and_then(|s| s.state.clone()),
                        sync_state: sender.and_then(|s| s.sync_state.clone()),
                        sync_priority: sender.and_then(|s| s.sync_priority),
                        write_lag_bytes: sender.map(|s| s.write_lag_bytes),
                        flush_lag_bytes: sender.map(|s| s.flush_lag_bytes),
                        reply_age_ms: sender.and_then(|s| s.reply_age_ms),
                        receive_lsn: probe.receive_lsn,
                        replay_lsn: probe.replay_lsn,
                        error: None,
                    }
                }
                failed => {
                    let message = match failed {
                        Ok(Err(e)) => e.to_string(),
                        _ => format!("check timed out after {:?}", settings.check_timeout),
                    };
                    warn!("Replication check failed for {}: {}", replica.name(), message);
                    replica.record_error(&message);
                    replica.set_healthy(false);

                    ReplicationStatus {
                        replica: replica.name().to_string(),
                        healthy: false,
                        in_recovery: false,
                        lag_ms: replica.lag_ms(),
                        lag_bytes: replica.lag_bytes(),
                        last_check_ms: now_ms,
                        state: sender.and_then(|s| s.state.clone()),
                        sync_state: sender.and_then(|s| s.sync_state.clone()),
                        sync_priority: sender.and_then(|s| s.sync_priority),
                        write_lag_bytes: sender.map(|s| s.write_lag_bytes),
                        flush_lag_bytes: sender.map(|s| s.flush_lag_bytes),
                        reply_age_ms: sender.and_then(|s| s.reply_age_ms),
                        receive_lsn: None,
                        replay_lsn: None,
                        error: Some(message),
                    }
                }
            };
            statuses.insert(status.replica.clone(), status);
        }

        let healthy_lags: Vec<u64> = statuses
            .values()
            .filter(|s| s.healthy)
            .map(|s| s.lag_ms)
            .collect();
        let total = statuses.len();
        let healthy = healthy_lags.len();
        let unhealthy = total - healthy;

        if total > 0 && unhealthy * 2 > total {
            error!(
                "CRITICAL: {} of {} replicas are unhealthy",
                unhealthy, total
            );
            events.emit(ClusterEvent::CriticalHealth { unhealthy, total });
        }

        let metrics = {
            let mut metrics = self.inner.metrics.write().await;
            metrics.avg_lag_ms = if healthy_lags.is_empty() {
                0.0
            } else {
                healthy_lags.iter().sum::<u64>() as f64 / healthy_lags.len() as f64
            };
            metrics.max_lag_ms = healthy_lags.iter().copied().max().unwrap_or(0);
            metrics.min_lag_ms = healthy_lags.iter().copied().min().unwrap_or(0);
            metrics.healthy_replicas = healthy;
            metrics.unhealthy_replicas = unhealthy;
            metrics.total_replicas = total;
            metrics.checks += 1;
            metrics.last_check_duration_ms = started.elapsed().as_millis() as u64;
            metrics.clone()
        };

        *self.inner.status.write().await = statuses;

        debug!(
            "Replication check completed: {}/{} healthy in {}ms",
            healthy, total, metrics.last_check_duration_ms
        );
        events.emit(ClusterEvent::CheckCompleted { healthy, unhealthy });
        metrics
    }

    /// Latest status of every replica, by name
    pub async fn get_status(&self) -> Vec<ReplicationStatus> {
        self.inner.status.read().await.values().cloned().collect()
    }

    pub async fn get_replica_status(&self, name: &str) -> Option<ReplicationStatus> {
        self.inner.status.read().await.get(name).cloned()
    }

    /// Healthy replicas, lowest lag first
    pub async fn get_healthy_replicas(&self) -> Vec<ReplicationStatus> {
        let mut healthy: Vec<ReplicationStatus> = self
            .inner
            .status
            .read()
            .await
            .values()
            .filter(|s| s.healthy)
            .cloned()
            .collect();
        healthy.sort_by(|a, b| a.lag_ms.cmp(&b.lag_ms).then_with(|| a.replica.cmp(&b.replica)));
        healthy
    }

    pub async fn get_best_replica(&self) -> Option<ReplicationStatus> {
        self.get_healthy_replicas().await.into_iter().next()
    }

    pub async fn metrics(&self) -> ReplicationMetrics {
        self.inner.metrics.read().await.clone()
    }

    /// Lag in milliseconds per replica
    pub async fn lag_map(&self) -> BTreeMap<String, u64> {
        self.inner
            .status
            .read()
            .await
            .iter()
            .map(|(name, s)| (name.clone(), s.lag_ms))
            .collect()
    }

    /// Start monitoring a new replica; it is checked on the next cycle
    pub async fn add_replica(&self, node: Arc<Node>) -> RouterResult<()> {
        self.inner.manager.register_replica(node).await
    }

    /// Stop monitoring a replica and drop its pool
    pub async fn remove_replica(&self, name: &str) -> bool {
        let removed = self.inner.manager.deregister_replica(name).await.is_some();
        self.inner.status.write().await.remove(name);
        removed
    }

    /// Replication gauges in Prometheus text format
    pub async fn prometheus_metrics(&self) -> String {
        let statuses = self.get_status().await;
        let metrics = self.metrics().await;
        let mut w = PrometheusWriter::new();

        w.family(
            "replication_lag_ms",
            MetricKind::Gauge,
            "Replay lag reported by each replica in milliseconds",
        );
        for s in &statuses {
            w.sample("replication_lag_ms", &[("replica", s.replica.as_str())], s.lag_ms as f64);
        }

        w.family(
            "replication_lag_bytes",
            MetricKind::Gauge,
            "WAL bytes not yet replayed by each replica",
        );
        for s in &statuses {
            w.sample("replication_lag_bytes", &[("replica", s.replica.as_str())], s.lag_bytes as f64);
        }

        w.family(
            "replica_healthy",
            MetricKind::Gauge,
            "1 when the replica is in recovery and within the acceptable lag",
        );
        for s in &statuses {
            w.sample(
                "replica_healthy",
                &[("replica", s.replica.as_str())],
                if s.healthy { 1.0 } else { 0.0 },
            );
        }

        w.single(
            "replication_lag_avg_ms",
            MetricKind::Gauge,
            "Average lag across healthy replicas",
            metrics.avg_lag_ms,
        );
        w.single(
            "replicas_unhealthy",
            MetricKind::Gauge,
            "Replicas failing their last check",
            metrics.unhealthy_replicas as f64,
        );
        w.single(
            "replication_checks_total",
            MetricKind::Counter,
            "Completed replication check cycles",
            metrics.checks as f64,
        );
        w.finish()
    }
}

/// Standbys report `application_name`; match it to a replica by name or by
/// the trailing number both share (`replica-2` and `standby2`)
fn sender_matches(application_name: &str, replica: &str) -> bool {
    if application_name.eq_ignore_ascii_case(replica) {
        return true;
    }
    match (numeric_suffix(application_name), numeric_suffix(replica)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn numeric_suffix(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}
