//! End-to-end routing scenarios against in-memory node pools
use replica_router::analyzer::ConsistencyLevel;
use replica_router::backends::MemoryPool;
use replica_router::core::{
    ClusterEvent, ConnectionManager, EventBus, LagAware, Node, RecoveryPolicy,
};
use replica_router::health::{MonitorSettings, PostgresLagProbe};
use replica_router::router::RouterSettings;
use replica_router::{
    QueryAnalyzer, QueryOptions, QueryResult, QueryRouter, QueryType, Row, SqlValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

struct TestCluster {
    router: QueryRouter,
    primary: Arc<MemoryPool>,
    replicas: Vec<Arc<MemoryPool>>,
}

impl TestCluster {
    fn new(replica_count: usize, recovery: RecoveryPolicy) -> Self {
        let primary = Arc::new(MemoryPool::new("primary"));
        let replicas: Vec<Arc<MemoryPool>> = (1..=replica_count)
            .map(|i| Arc::new(MemoryPool::new(format!("replica-{}", i))))
            .collect();

        let manager = ConnectionManager::with_options(
            Arc::new(Node::primary(primary.clone())),
            replicas
                .iter()
                .map(|p| Arc::new(Node::replica(p.name(), p.clone())))
                .collect(),
            Box::new(LagAware::new()),
            recovery,
            EventBus::new(),
        );
        let router = QueryRouter::builder(manager)
            .analyzer(QueryAnalyzer::new(["properties", "areas"], ["sessions"]))
            .probe(Arc::new(PostgresLagProbe::new()))
            .monitor_settings(MonitorSettings {
                interval: Duration::from_millis(50),
                check_timeout: Duration::from_millis(20),
                max_acceptable_lag: Duration::from_millis(10_000),
                alert_threshold: Duration::from_millis(5_000),
            })
            .settings(RouterSettings {
                stickiness_window: Duration::from_secs(30),
                ..RouterSettings::default()
            })
            .build();

        Self {
            router,
            primary,
            replicas,
        }
    }

    fn replica_executed(&self) -> usize {
        self.replicas.iter().map(|r| r.executed_count()).sum()
    }
}

fn served_by(result: &QueryResult) -> String {
    result
        .first()
        .and_then(|row| row.get_str("node"))
        .unwrap_or_default()
        .to_string()
}

fn fast_recovery() -> RecoveryPolicy {
    RecoveryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(50),
        promote_on_failure: true,
    }
}

#[tokio::test]
async fn second_cacheable_read_is_served_from_cache() {
    let cluster = TestCluster::new(2, RecoveryPolicy::default());
    let sql = "SELECT * FROM properties WHERE id = $1";
    let params = [SqlValue::Int(42)];
    let options = QueryOptions::new().cached();

    let first = assert_ok!(cluster.router.query(sql, &params, &options).await);
    let executed = cluster.replica_executed();
    let hits = cluster.router.get_stats().await.queries.cache_hits;

    let second = assert_ok!(cluster.router.query(sql, &params, &options).await);
    assert_eq!(first, second);
    assert_eq!(cluster.replica_executed(), executed);

    let stats = cluster.router.get_stats().await.queries;
    assert_eq!(stats.cache_hits, hits + 1);
    assert_eq!(stats.executed_queries, 1);
}

#[tokio::test]
async fn clear_cache_forces_a_miss() {
    let cluster = TestCluster::new(1, RecoveryPolicy::default());
    let sql = "SELECT name FROM areas";
    let options = QueryOptions::new().cached();

    assert_ok!(cluster.router.query(sql, &[], &options).await);
    assert_eq!(cluster.router.clear_cache(None).await, 1);
    assert_ok!(cluster.router.query(sql, &[], &options).await);

    let stats = cluster.router.get_stats().await.queries;
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(cluster.replicas[0].executed_count(), 2);
}

#[tokio::test]
async fn unhealthy_replicas_send_reads_to_primary() {
    let cluster = TestCluster::new(2, RecoveryPolicy::default());
    for node in cluster.router.manager().replicas().await {
        node.set_healthy(false);
    }

    for level in [
        ConsistencyLevel::Eventual,
        ConsistencyLevel::Bounded,
        ConsistencyLevel::ReadYourWrites,
    ] {
        let options = QueryOptions::new().consistency(level).session("S");
        let result = assert_ok!(
            cluster
                .router
                .query("SELECT * FROM properties", &[], &options)
                .await
        );
        assert_eq!(served_by(&result), "primary");
    }

    assert_eq!(cluster.replica_executed(), 0);
    assert_eq!(cluster.router.get_stats().await.queries.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn session_reads_its_writes_until_window_closes() {
    let cluster = TestCluster::new(1, RecoveryPolicy::default());
    let read = QueryOptions::new()
        .consistency(ConsistencyLevel::ReadYourWrites)
        .session("S");

    assert_ok!(
        cluster
            .router
            .query(
                "UPDATE properties SET price = 10 WHERE id = 1",
                &[],
                &QueryOptions::new().session("S"),
            )
            .await
    );

    let result = assert_ok!(
        cluster
            .router
            .query("SELECT * FROM properties WHERE id = 1", &[], &read)
            .await
    );
    assert_eq!(served_by(&result), "primary");

    // Another session is unaffected
    let other = QueryOptions::new()
        .consistency(ConsistencyLevel::ReadYourWrites)
        .session("T");
    let result = assert_ok!(
        cluster
            .router
            .query("SELECT * FROM properties WHERE id = 1", &[], &other)
            .await
    );
    assert_eq!(served_by(&result), "replica-1");

    tokio::time::advance(Duration::from_secs(31)).await;

    let result = assert_ok!(
        cluster
            .router
            .query("SELECT * FROM properties WHERE id = 1", &[], &read)
            .await
    );
    assert_eq!(served_by(&result), "replica-1");
}

#[tokio::test]
async fn properties_lookup_analysis() {
    let analyzer = QueryAnalyzer::new(["properties"], ["sessions"]);
    let analysis = analyzer.analyze(
        "SELECT * FROM properties WHERE id = $1",
        &[SqlValue::Int(1)],
        &Default::default(),
    );

    assert_eq!(analysis.query_type, QueryType::Select);
    assert!(!analysis.is_write);
    assert!(!analysis.requires_primary);
    assert_eq!(analysis.tables, vec!["properties".to_string()]);
    assert!(analysis.cacheable);
}

#[tokio::test]
async fn high_lag_replica_raises_alert() {
    let cluster = TestCluster::new(2, RecoveryPolicy::default());
    cluster
        .primary
        .respond_to("pg_stat_replication", QueryResult::empty());
    for (pool, lag_ms) in cluster.replicas.iter().zip([6_000, 10]) {
        pool.respond_to(
            "pg_is_in_recovery",
            QueryResult::new(vec![Row::from_pairs([
                ("in_recovery", SqlValue::Bool(true)),
                ("lag_bytes", SqlValue::Int(4096)),
                ("lag_ms", SqlValue::Int(lag_ms)),
            ])]),
        );
    }
    let mut events = cluster.router.manager().events().subscribe();

    cluster.router.monitor().force_check().await;

    let mut alerts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClusterEvent::HighLag { replica, lag_ms } = event {
            alerts.push((replica, lag_ms));
        }
    }
    assert_eq!(alerts, vec![("replica-1".to_string(), 6_000)]);
}

#[tokio::test]
async fn lost_primary_is_replaced_by_healthy_replica() {
    let cluster = TestCluster::new(2, fast_recovery());
    let replicas = cluster.router.manager().replicas().await;
    replicas[0].set_healthy(false);
    cluster.replicas[0].set_unreachable(true);

    let mut events = cluster.router.manager().events().subscribe();
    cluster.primary.set_unreachable(true);
    assert_err!(
        cluster
            .router
            .query("INSERT INTO areas (name) VALUES ('north')", &[], &QueryOptions::new())
            .await
    );

    let promoted = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(ClusterEvent::Promoted { node, previous }) => break (node, previous),
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(promoted, ("replica-2".to_string(), "primary".to_string()));

    let before = cluster.replicas[1].executed_count();
    let result = assert_ok!(
        cluster
            .router
            .query("INSERT INTO areas (name) VALUES ('south')", &[], &QueryOptions::new())
            .await
    );
    assert_eq!(served_by(&result), "replica-2");
    assert_eq!(cluster.replicas[1].executed_count(), before + 1);

    let conn = assert_ok!(cluster.router.manager().get_primary_connection().await);
    assert_eq!(conn.node_name(), "replica-2");
    assert_eq!(cluster.primary.close_count(), 1);
}

#[tokio::test]
async fn shutdown_twice_closes_pools_once() {
    let cluster = TestCluster::new(2, RecoveryPolicy::default());
    assert_ok!(cluster.router.start().await);

    cluster.router.shutdown().await;
    cluster.router.shutdown().await;

    assert!(cluster.router.is_shutdown());
    assert_eq!(cluster.primary.close_count(), 1);
    for replica in &cluster.replicas {
        assert_eq!(replica.close_count(), 1);
    }
    assert_err!(
        cluster
            .router
            .query("SELECT * FROM properties", &[], &QueryOptions::new())
            .await
    );
}
