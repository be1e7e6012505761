/// In-memory scripted pool for tests, benches and dry runs
use crate::core::pool::{Connection, NodePool, PoolStatus};
use crate::core::{QueryResult, Row, SqlValue};
use crate::error::{RouterError, RouterResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Failure {
    Query(String),
    Timeout(String),
}

#[derive(Default)]
struct State {
    responses: Vec<(String, QueryResult)>,
    failures: Vec<(String, Failure)>,
    pending_connection_failures: usize,
    executed: Vec<(String, Vec<SqlValue>)>,
    active: usize,
    idle: usize,
}

/// A pool whose connections answer from a script.
///
/// Queries are matched by substring against the registered failures first,
/// then the registered responses; anything else returns one row naming the
/// node, which makes routing decisions observable.
pub struct MemoryPool {
    name: String,
    max_size: usize,
    state: Arc<Mutex<State>>,
    unreachable: Arc<AtomicBool>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MemoryPool {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            max_size: 10,
            state: Arc::new(Mutex::new(State::default())),
            unreachable: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer statements containing `pattern` with `result`
    pub fn respond_to<P: Into<String>>(&self, pattern: P, result: QueryResult) {
        self.with_state(|s| s.responses.push((pattern.into(), result)));
    }

    /// Reject statements containing `pattern` with a server error
    pub fn fail_with<P: Into<String>, M: Into<String>>(&self, pattern: P, message: M) {
        self.with_state(|s| {
            s.failures
                .push((pattern.into(), Failure::Query(message.into())))
        });
    }

    /// Cancel statements containing `pattern` as if they hit `statement_timeout`
    pub fn time_out_on<P: Into<String>>(&self, pattern: P) {
        self.with_state(|s| {
            s.failures.push((
                pattern.into(),
                Failure::Timeout("canceling statement due to statement timeout".to_string()),
            ))
        });
    }

    /// Fail the next `count` statements with a connection error
    pub fn drop_next(&self, count: usize) {
        self.with_state(|s| s.pending_connection_failures += count);
    }

    /// Refuse new connections and fail statements on existing ones
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Reset scripted responses and failures
    pub fn clear_script(&self) {
        self.with_state(|s| {
            s.responses.clear();
            s.failures.clear();
            s.pending_connection_failures = 0;
        });
    }

    /// Every statement run so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.with_state(|s| s.executed.iter().map(|(sql, _)| sql.clone()).collect())
    }

    /// Parameters bound to the most recent statement containing `pattern`
    pub fn last_params(&self, pattern: &str) -> Option<Vec<SqlValue>> {
        self.with_state(|s| {
            s.executed
                .iter()
                .rev()
                .find(|(sql, _)| sql.contains(pattern))
                .map(|(_, params)| params.clone())
        })
    }

    pub fn executed_count(&self) -> usize {
        self.with_state(|s| s.executed.len())
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl NodePool for MemoryPool {
    async fn acquire(&self) -> RouterResult<Box<dyn Connection>> {
        if self.is_closed() {
            return Err(RouterError::connection(&self.name, "pool is closed"));
        }
        if self.unreachable.load(Ordering::Acquire) {
            return Err(RouterError::connection(&self.name, "connection refused"));
        }

        self.with_state(|s| {
            s.idle = s.idle.saturating_sub(1);
            s.active += 1;
        });

        Ok(Box::new(MemoryConnection {
            node: self.name.clone(),
            state: Arc::clone(&self.state),
            unreachable: Arc::clone(&self.unreachable),
            broken: false,
        }))
    }

    fn status(&self) -> PoolStatus {
        self.with_state(|s| PoolStatus {
            total: s.active + s.idle,
            idle: s.idle,
            max_size: self.max_size,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_count.fetch_add(1, Ordering::AcqRel);
            self.with_state(|s| s.idle = 0);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct MemoryConnection {
    node: String,
    state: Arc<Mutex<State>>,
    unreachable: Arc<AtomicBool>,
    broken: bool,
}

impl MemoryConnection {
    fn run(&mut self, sql: &str, params: &[SqlValue]) -> RouterResult<QueryResult> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.executed.push((sql.to_string(), params.to_vec()));

        if self.unreachable.load(Ordering::Acquire) {
            return Err(RouterError::connection(&self.node, "connection reset by peer"));
        }
        if state.pending_connection_failures > 0 {
            state.pending_connection_failures -= 1;
            return Err(RouterError::connection(&self.node, "connection reset by peer"));
        }

        if let Some((_, failure)) = state.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Err(match failure {
                Failure::Query(message) => RouterError::query(&self.node, message.clone()),
                Failure::Timeout(message) => {
                    RouterError::statement_timeout(&self.node, message.clone())
                }
            });
        }

        if let Some((_, result)) = state
            .responses
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
        {
            return Ok(result.clone());
        }

        Ok(QueryResult::new(vec![Row::from_pairs([(
            "node",
            SqlValue::Text(self.node.clone()),
        )])]))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> RouterResult<QueryResult> {
        self.run(sql, params)
    }

    async fn batch_execute(&mut self, sql: &str) -> RouterResult<()> {
        self.run(sql, &[]).map(|_| ())
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = state.active.saturating_sub(1);
        if !self.broken {
            state.idle += 1;
        }
    }
}
