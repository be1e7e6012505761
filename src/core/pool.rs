/// Pool abstractions implemented by each database backend
use super::{QueryResult, SqlValue};
use crate::error::RouterResult;
use async_trait::async_trait;

/// A single borrowed database connection.
///
/// Dropping the connection returns it to its pool unless it was marked
/// broken, in which case the pool closes it instead.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement with positional parameters and collect its rows
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> RouterResult<QueryResult>;

    /// Run one or more parameterless statements (SET, BEGIN, COMMIT, ...)
    async fn batch_execute(&mut self, sql: &str) -> RouterResult<()>;

    /// Prevent the connection from being reused after drop
    fn mark_broken(&mut self);
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or in use
    pub total: usize,
    /// Open connections waiting in the pool
    pub idle: usize,
    pub max_size: usize,
}

/// A bounded pool of connections to one node
#[async_trait]
pub trait NodePool: Send + Sync {
    /// Borrow a connection, waiting at most the pool's connect timeout
    async fn acquire(&self) -> RouterResult<Box<dyn Connection>>;

    fn status(&self) -> PoolStatus;

    /// Close idle connections and refuse new acquisitions
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
