/// Replica selection algorithms
use super::Node;
use crate::config::BalancingStrategy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Select a replica from the healthy candidates, returning its index
    fn select_backend(&self, candidates: &[Arc<Node>]) -> Option<usize>;
}

/// Build the configured algorithm
pub fn from_strategy(strategy: BalancingStrategy) -> Box<dyn LoadBalancingAlgorithm> {
    match strategy {
        BalancingStrategy::RoundRobin => Box::new(RoundRobin::new()),
        BalancingStrategy::LagAware => Box::new(LagAware::new()),
    }
}

/// Round-robin load balancing algorithm
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for RoundRobin {
    fn select_backend(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(index)
    }
}

/// Round-robin that prefers the lowest known replication lag.
///
/// The rotation decides the starting point; the first candidate with the
/// minimum lag from there wins, so equal lags degrade to plain round-robin.
pub struct LagAware {
    counter: AtomicUsize,
}

impl LagAware {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for LagAware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for LagAware {
    fn select_backend(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let len = candidates.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        if len == 1 {
            return Some(0);
        }

        let mut best = start;
        let mut best_lag = candidates[start].lag_ms();
        for offset in 1..len {
            let index = (start + offset) % len;
            let lag = candidates[index].lag_ms();
            if lag < best_lag {
                best = index;
                best_lag = lag;
            }
        }
        Some(best)
    }
}
