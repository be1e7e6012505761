//! Replica Router - replication-aware query routing for PostgreSQL clusters
//!
//! The router sits between an application and a primary/replica cluster:
//! 1. Writes, transactions and read-your-writes sessions go to the primary
//! 2. Reads go to a healthy replica whose measured lag fits the caller's bound
//! 3. Cacheable reads are served from a local tier, optionally backed by Redis
//!
//! Node failures trigger background recovery and, when the primary is lost,
//! promotion of the least-lagged healthy replica.
pub mod analyzer;
pub mod backends;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod router;
pub mod utils;

pub use crate::analyzer::{QueryAnalysis, QueryAnalyzer, QueryType};
pub use crate::config::Config;
pub use crate::core::{ConnectionManager, QueryResult, Row, SqlValue};
pub use crate::error::{RouterError, RouterResult};
pub use crate::router::{QueryOptions, QueryRouter, RouterBuilder, TransactionOptions};

use crate::backends::{PgPool, RedisCache};
use crate::core::{balancer, EventBus, Node, RecoveryPolicy};
use crate::health::MonitorSettings;
use crate::router::RouterSettings;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build a router for the cluster described by `config`.
///
/// Pools are warmed to `pool.min_size`; a node that cannot be reached is
/// handed to recovery instead of failing the call. The replication monitor
/// is not started here, call [`QueryRouter::start`] once ready.
pub async fn connect(config: &Config) -> RouterResult<QueryRouter> {
    config.validate()?;

    let (primary, replicas) = PgPool::cluster(config);
    let manager = ConnectionManager::with_options(
        primary,
        replicas,
        balancer::from_strategy(config.routing.balancing),
        RecoveryPolicy::from_config(
            &config.recovery,
            Duration::from_millis(config.monitor.check_timeout_ms),
        ),
        EventBus::new(),
    );

    let mut nodes = vec![manager.primary().await];
    nodes.extend(manager.replicas().await);
    join_all(
        nodes
            .iter()
            .map(|node| warm_up(&manager, node, config.pool.min_size)),
    )
    .await;

    let mut builder = QueryRouter::builder(manager)
        .analyzer(QueryAnalyzer::from_config(&config.cache))
        .monitor_settings(MonitorSettings::from(&config.monitor))
        .settings(RouterSettings::from(config));

    if let Some(url) = &config.cache.shared_url {
        let cache = RedisCache::from_url(url, config.pool.connect_timeout())?;
        info!("Shared cache tier enabled at {}", cache.endpoint().addr);
        builder = builder.shared_cache(Arc::new(cache));
    }

    Ok(builder.build())
}

/// Open `count` connections on `node` and return them to its idle set
async fn warm_up(manager: &ConnectionManager, node: &Arc<Node>, count: usize) {
    let mut held = Vec::with_capacity(count);
    for _ in 0..count {
        match node.pool().acquire().await {
            Ok(conn) => held.push(conn),
            Err(e) => {
                warn!(
                    "Warm-up of {} stopped after {} connections: {}",
                    node.name(),
                    held.len(),
                    e
                );
                manager.handle_pool_error(node, &e);
                break;
            }
        }
    }
    info!("Node {} warmed with {} connections", node.name(), held.len());
}
