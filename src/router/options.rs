/// Per-call routing and transaction options
use crate::analyzer::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Options accepted by [`QueryRouter::query`](super::QueryRouter::query)
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Route to the primary regardless of analysis
    pub force_write: bool,
    pub consistency: Option<ConsistencyLevel>,
    /// Lag bound for bounded reads
    pub max_lag: Option<Duration>,
    /// Opt in to the result cache
    pub cached: bool,
    pub cache_ttl: Option<Duration>,
    /// Session-level `statement_timeout` for this statement
    pub timeout: Option<Duration>,
    pub retry_on_failure: bool,
    pub max_retries: Option<u32>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self) -> Self {
        self.force_write = true;
        self
    }

    pub fn consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = Some(level);
        self
    }

    pub fn max_lag(mut self, max_lag: Duration) -> Self {
        self.max_lag = Some(max_lag);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cached = true;
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry retryable failures on the primary, up to `max_retries` times
    pub fn retry(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = Some(max_retries);
        self
    }

    pub fn session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn user<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Key used for read-your-writes stickiness
    pub fn sticky_key(&self) -> Option<&str> {
        self.session_id.as_deref().or(self.user_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read uncommitted",
            IsolationLevel::ReadCommitted => "read committed",
            IsolationLevel::RepeatableRead => "repeatable read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Options accepted by [`QueryRouter::transaction`](super::QueryRouter::transaction)
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
    /// Session made sticky once the transaction ends
    pub session_id: Option<String>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }

    pub fn session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Session settings applied before `BEGIN`, paired with their resets
    pub(crate) fn session_settings(&self) -> Vec<(String, &'static str)> {
        let on_off = |v: bool| if v { "on" } else { "off" };
        let mut settings = Vec::new();
        if let Some(level) = self.isolation_level {
            settings.push((
                format!("SET default_transaction_isolation = '{}'", level.as_sql()),
                "RESET default_transaction_isolation",
            ));
        }
        if let Some(read_only) = self.read_only {
            settings.push((
                format!("SET default_transaction_read_only = {}", on_off(read_only)),
                "RESET default_transaction_read_only",
            ));
        }
        if let Some(deferrable) = self.deferrable {
            settings.push((
                format!("SET default_transaction_deferrable = {}", on_off(deferrable)),
                "RESET default_transaction_deferrable",
            ));
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options_builder() {
        let options = QueryOptions::new()
            .consistency(ConsistencyLevel::Bounded)
            .max_lag(Duration::from_millis(500))
            .cache_ttl(Duration::from_secs(10))
            .retry(2)
            .user("u-1");

        assert!(options.cached);
        assert!(options.retry_on_failure);
        assert_eq!(options.max_retries, Some(2));
        assert_eq!(options.sticky_key(), Some("u-1"));
        assert_eq!(options.clone().session("s-1").sticky_key(), Some("s-1"));
    }

    #[test]
    fn test_transaction_settings() {
        let options = TransactionOptions::new()
            .isolation(IsolationLevel::Serializable)
            .read_only(true)
            .deferrable(true);
        let settings = options.session_settings();

        assert_eq!(
            settings[0].0,
            "SET default_transaction_isolation = 'serializable'"
        );
        assert_eq!(settings[1].0, "SET default_transaction_read_only = on");
        assert_eq!(settings[2].1, "RESET default_transaction_deferrable");
        assert!(TransactionOptions::default().session_settings().is_empty());
    }
}
