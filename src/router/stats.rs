/// Query counters maintained by the router
use crate::utils::RollingAverage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RouterStats {
    total: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    transactions: AtomicU64,
    /// Results written to the cache
    cached: AtomicU64,
    /// Statements actually sent to a node
    executed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
    fallbacks_suppressed: AtomicU64,
    retries: AtomicU64,
    latency: RollingAverage,
    read_latency: RollingAverage,
    write_latency: RollingAverage,
}

/// Point-in-time copy of [`RouterStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStatsSnapshot {
    pub total_queries: u64,
    pub read_queries: u64,
    pub write_queries: u64,
    pub transactions: u64,
    pub cached_results: u64,
    pub executed_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub fallbacks_suppressed: u64,
    pub retries: u64,
    pub avg_latency_ms: f64,
    pub avg_read_latency_ms: f64,
    pub avg_write_latency_ms: f64,
}

impl RouterStatsSnapshot {
    /// Hits over lookups, 0 when the cache was never consulted
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, is_write: bool) {
        bump(&self.total);
        bump(if is_write { &self.writes } else { &self.reads });
    }

    pub fn record_transaction(&self) {
        bump(&self.transactions);
    }

    pub fn record_latency(&self, is_write: bool, elapsed: Duration) {
        self.latency.record(elapsed);
        if is_write {
            self.write_latency.record(elapsed);
        } else {
            self.read_latency.record(elapsed);
        }
    }

    pub fn record_executed(&self) {
        bump(&self.executed);
    }

    pub fn record_cached(&self) {
        bump(&self.cached);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_error(&self) {
        bump(&self.errors);
    }

    pub fn record_fallback(&self) {
        bump(&self.fallbacks);
    }

    pub fn record_fallback_suppressed(&self) {
        bump(&self.fallbacks_suppressed);
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RouterStatsSnapshot {
            total_queries: load(&self.total),
            read_queries: load(&self.reads),
            write_queries: load(&self.writes),
            transactions: load(&self.transactions),
            cached_results: load(&self.cached),
            executed_queries: load(&self.executed),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            errors: load(&self.errors),
            fallbacks: load(&self.fallbacks),
            fallbacks_suppressed: load(&self.fallbacks_suppressed),
            retries: load(&self.retries),
            avg_latency_ms: self.latency.average_ms(),
            avg_read_latency_ms: self.read_latency.average_ms(),
            avg_write_latency_ms: self.write_latency.average_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RouterStats::new();
        stats.record_query(false);
        stats.record_query(false);
        stats.record_query(true);
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_cache_miss();
        stats.record_latency(false, Duration::from_millis(4));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_queries, 3);
        assert_eq!(snapshot.read_queries, 2);
        assert_eq!(snapshot.write_queries, 1);
        assert!((snapshot.cache_hit_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.avg_read_latency_ms - 4.0).abs() < 1e-9);
        assert_eq!(snapshot.avg_write_latency_ms, 0.0);
    }
}
