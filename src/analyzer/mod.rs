/// Query analysis: classification, consistency and cacheability
pub mod patterns;

use crate::config::CacheConfig;
use crate::core::SqlValue;
use crate::error::{RouterError, RouterResult};
use crate::utils::stable_hash;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Frequency table bound before pruning
const MAX_TRACKED_QUERIES: usize = 1_000;
/// Entries kept when the frequency table is pruned
const PRUNED_QUERIES: usize = 500;
const MAX_MEMOIZED: usize = 10_000;
const DEFAULT_MAX_PREPARED: usize = 256;
/// Bytes of SHA-256 kept in cache keys
const CACHE_KEY_HASH_BYTES: usize = 16;

/// Statement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Copy,
    Ddl,
    Lock,
    Transaction,
    /// SET, SHOW, EXPLAIN and friends
    Utility,
    Unknown,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Merge => "MERGE",
            QueryType::Copy => "COPY",
            QueryType::Ddl => "DDL",
            QueryType::Lock => "LOCK",
            QueryType::Transaction => "TRANSACTION",
            QueryType::Utility => "UTILITY",
            QueryType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// Freshness guarantee a read asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Any healthy replica
    Eventual,
    /// A replica within the lag bound
    Bounded,
    /// Primary only
    Strong,
    /// Primary while the session's stickiness window is open
    ReadYourWrites,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyLevel::Eventual => write!(f, "eventual"),
            ConsistencyLevel::Bounded => write!(f, "bounded"),
            ConsistencyLevel::Strong => write!(f, "strong"),
            ConsistencyLevel::ReadYourWrites => write!(f, "read_your_writes"),
        }
    }
}

impl FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eventual" => Ok(ConsistencyLevel::Eventual),
            "bounded" => Ok(ConsistencyLevel::Bounded),
            "strong" => Ok(ConsistencyLevel::Strong),
            "read_your_writes" => Ok(ConsistencyLevel::ReadYourWrites),
            other => Err(format!("unknown consistency level: {}", other)),
        }
    }
}

/// Caller-side inputs to consistency selection
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Explicit level requested by the caller
    pub requested: Option<ConsistencyLevel>,
}

impl AnalysisContext {
    /// Stickiness key: the session id, else the user id
    pub fn sticky_key(&self) -> Option<&str> {
        self.session_id.as_deref().or(self.user_id.as_deref())
    }
}

/// Everything the router needs to know about one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub is_write: bool,
    pub is_transaction: bool,
    pub requires_primary: bool,
    pub tables: Vec<String>,
    pub consistency_level: ConsistencyLevel,
    pub estimated_cost: u32,
    pub cacheable: bool,
    pub cache_key: Option<String>,
    pub has_for_update: bool,
    pub has_returning: bool,
    /// `SET`, `RESET`, `DISCARD` and `DEALLOCATE`: state tied to one pooled
    /// connection that later statements cannot rely on
    pub changes_session: bool,
}

/// Context-free facts about a statement text
#[derive(Debug, Clone)]
struct Classification {
    normalized: String,
    query_type: QueryType,
    is_write: bool,
    changes_session: bool,
    tables: Vec<String>,
    has_for_update: bool,
    has_returning: bool,
    has_non_deterministic: bool,
    hint: Option<ConsistencyLevel>,
    estimated_cost: u32,
}

/// A named statement registered with [`QueryAnalyzer::prepare`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
}

#[derive(Default)]
struct AnalyzerState {
    memo: FnvHashMap<String, Classification>,
    frequency: FnvHashMap<String, u64>,
    prepared: FnvHashMap<String, String>,
    prepared_order: VecDeque<String>,
}

/// Classifies statements and decides their routing requirements.
///
/// Classification is memoized by normalized text, so the regex corpus runs
/// once per distinct statement.
pub struct QueryAnalyzer {
    cacheable_tables: HashSet<String>,
    volatile_tables: HashSet<String>,
    max_prepared: usize,
    state: Mutex<AnalyzerState>,
}

impl QueryAnalyzer {
    pub fn new<I, J, S, T>(cacheable_tables: I, volatile_tables: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            cacheable_tables: cacheable_tables
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
            volatile_tables: volatile_tables
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
            max_prepared: DEFAULT_MAX_PREPARED,
            state: Mutex::new(AnalyzerState::default()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.cacheable_tables, &config.volatile_tables)
    }

    pub fn with_max_prepared(mut self, max_prepared: usize) -> Self {
        self.max_prepared = max_prepared.max(1);
        self
    }

    /// Classify `sql` and decide how it must be routed
    pub fn analyze(
        &self,
        sql: &str,
        params: &[SqlValue],
        context: &AnalysisContext,
    ) -> QueryAnalysis {
        let c = self.classify(sql);

        let is_transaction = c.query_type == QueryType::Transaction;
        let requires_primary = c.is_write
            || is_transaction
            || c.changes_session
            || c.has_for_update
            || c.has_returning;

        let consistency_level = if requires_primary {
            ConsistencyLevel::Strong
        } else if let Some(level) = context.requested {
            level
        } else if let Some(level) = c.hint {
            level
        } else if context.sticky_key().is_some() {
            ConsistencyLevel::ReadYourWrites
        } else {
            ConsistencyLevel::Eventual
        };

        let cacheable = c.query_type == QueryType::Select
            && !requires_primary
            && !c.has_non_deterministic
            && !c.tables.is_empty()
            && c.tables.iter().all(|t| self.cacheable_tables.contains(t))
            && !c.tables.iter().any(|t| self.volatile_tables.contains(t));

        let cache_key = cacheable.then(|| cache_key(&c.normalized, &c.tables, params));

        QueryAnalysis {
            query_type: c.query_type,
            is_write: c.is_write,
            is_transaction,
            requires_primary,
            tables: c.tables,
            consistency_level,
            estimated_cost: c.estimated_cost,
            cacheable,
            cache_key,
            has_for_update: c.has_for_update,
            has_returning: c.has_returning,
            changes_session: c.changes_session,
        }
    }

    fn classify(&self, sql: &str) -> Classification {
        let normalized = patterns::normalize(sql);
        // Hints live in comments, which normalization removes
        let hint = patterns::consistency_hint(sql);

        let mut state = self.lock_state();
        record_frequency(&mut state.frequency, &normalized);

        if let Some(cached) = state.memo.get(&normalized) {
            let mut cached = cached.clone();
            cached.hint = hint;
            return cached;
        }

        let skeleton = patterns::skeleton(&normalized);
        let query_type = patterns::statement_type(&skeleton);
        let tables = patterns::extract_tables(&skeleton);
        let classification = Classification {
            query_type,
            is_write: patterns::is_write(query_type, &skeleton),
            changes_session: query_type == QueryType::Utility
                && patterns::changes_session(&skeleton),
            has_for_update: patterns::has_for_update(&skeleton),
            has_returning: patterns::has_returning(&skeleton),
            has_non_deterministic: patterns::has_non_deterministic(&skeleton),
            estimated_cost: patterns::estimate_cost(query_type, &skeleton, tables.len()),
            tables,
            hint,
            normalized: normalized.clone(),
        };

        if state.memo.len() >= MAX_MEMOIZED {
            state.memo.clear();
        }
        state.memo.insert(normalized, classification.clone());
        classification
    }

    /// Register a named statement, replacing any previous definition.
    /// The oldest registration is evicted once the registry is full.
    pub fn prepare<N: Into<String>, S: Into<String>>(&self, name: N, sql: S) {
        let name = name.into();
        let sql = sql.into();
        let mut state = self.lock_state();

        if state.prepared.insert(name.clone(), sql).is_some() {
            state.prepared_order.retain(|n| n != &name);
        }
        state.prepared_order.push_back(name);

        while state.prepared_order.len() > self.max_prepared {
            if let Some(oldest) = state.prepared_order.pop_front() {
                state.prepared.remove(&oldest);
                tracing::debug!("Evicted prepared statement {}", oldest);
            }
        }
    }

    pub fn get_prepared(&self, name: &str) -> RouterResult<PreparedStatement> {
        let state = self.lock_state();
        state
            .prepared
            .get(name)
            .map(|sql| PreparedStatement {
                name: name.to_string(),
                sql: sql.clone(),
            })
            .ok_or_else(|| RouterError::UnknownStatement {
                name: name.to_string(),
            })
    }

    pub fn prepared_count(&self) -> usize {
        self.lock_state().prepared.len()
    }

    /// Most frequently analyzed statements, most frequent first
    pub fn frequent_queries(&self, limit: usize) -> Vec<(String, u64)> {
        let state = self.lock_state();
        let mut entries: Vec<(String, u64)> = state
            .frequency
            .iter()
            .map(|(q, n)| (q.clone(), *n))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }

    pub fn tracked_query_count(&self) -> usize {
        self.lock_state().frequency.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AnalyzerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn record_frequency(frequency: &mut FnvHashMap<String, u64>, normalized: &str) {
    if let Some(count) = frequency.get_mut(normalized) {
        *count += 1;
        return;
    }

    frequency.insert(normalized.to_string(), 1);
    if frequency.len() > MAX_TRACKED_QUERIES {
        let mut entries: Vec<(String, u64)> = frequency.drain().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(PRUNED_QUERIES);
        frequency.extend(entries);
    }
}

/// `q:<tables>:<hash>`; the table prefix lets invalidation target tables
pub fn cache_key(normalized: &str, tables: &[String], params: &[SqlValue]) -> String {
    let params = serde_json::to_vec(params).unwrap_or_default();
    format!(
        "q:{}:{}",
        tables.join(","),
        stable_hash(&[normalized.as_bytes(), &params], CACHE_KEY_HASH_BYTES)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(["properties", "areas"], ["sessions", "activity_logs"])
    }

    #[test]
    fn test_properties_lookup() {
        let analysis = analyzer().analyze(
            "SELECT * FROM properties WHERE id = $1",
            &[SqlValue::Int(1)],
            &AnalysisContext::default(),
        );

        assert_eq!(analysis.query_type, QueryType::Select);
        assert!(!analysis.is_write);
        assert!(!analysis.requires_primary);
        assert_eq!(analysis.tables, vec!["properties"]);
        assert!(analysis.cacheable);
        assert_eq!(analysis.consistency_level, ConsistencyLevel::Eventual);
        assert!(analysis
            .cache_key
            .as_deref()
            .unwrap()
            .starts_with("q:properties:"));
    }

    #[test]
    fn test_primary_statements_are_strong() {
        let a = analyzer();
        let context = AnalysisContext {
            requested: Some(ConsistencyLevel::Eventual),
            ..Default::default()
        };

        for sql in [
            "INSERT INTO properties (id) VALUES ($1)",
            "UPDATE properties SET price = $1 WHERE id = $2",
            "DELETE FROM areas WHERE id = $1",
            "BEGIN",
            "SELECT * FROM properties WHERE id = $1 FOR UPDATE",
            "SELECT * FROM areas /* consistency: eventual */ FOR SHARE",
            "WITH x AS (UPDATE areas SET name = $1 RETURNING id) SELECT * FROM x",
            "ALTER TABLE properties ADD COLUMN sold boolean",
        ] {
            let analysis = a.analyze(sql, &[], &context);
            assert!(analysis.requires_primary, "{}", sql);
            assert_eq!(analysis.consistency_level, ConsistencyLevel::Strong, "{}", sql);
            assert!(!analysis.cacheable, "{}", sql);
        }

        let returning = a.analyze("DELETE FROM areas WHERE id = 1 RETURNING *", &[], &context);
        assert!(returning.has_returning);
        let transaction = a.analyze("COMMIT", &[], &context);
        assert!(transaction.is_transaction);
    }

    #[test]
    fn test_session_statements_pin_to_primary() {
        let a = analyzer();

        let set = a.analyze("SET search_path = tenant_7", &[], &AnalysisContext::default());
        assert_eq!(set.query_type, QueryType::Utility);
        assert!(set.changes_session);
        assert!(!set.is_write);
        assert!(set.requires_primary);
        assert_eq!(set.consistency_level, ConsistencyLevel::Strong);

        let explain = a.analyze(
            "EXPLAIN ANALYZE DELETE FROM areas WHERE id = 1",
            &[],
            &AnalysisContext::default(),
        );
        assert!(explain.is_write);
        assert!(!explain.changes_session);
        assert!(explain.requires_primary);

        let show = a.analyze("SHOW search_path", &[], &AnalysisContext::default());
        assert!(!show.changes_session);
        assert!(!show.requires_primary);
    }

    #[test]
    fn test_consistency_precedence() {
        let a = analyzer();
        let sql = "/* consistency: bounded */ SELECT * FROM areas";

        let hinted = a.analyze(sql, &[], &AnalysisContext::default());
        assert_eq!(hinted.consistency_level, ConsistencyLevel::Bounded);

        let explicit = a.analyze(
            sql,
            &[],
            &AnalysisContext {
                requested: Some(ConsistencyLevel::Strong),
                ..Default::default()
            },
        );
        assert_eq!(explicit.consistency_level, ConsistencyLevel::Strong);

        let session = a.analyze(
            "SELECT * FROM areas",
            &[],
            &AnalysisContext {
                session_id: Some("S".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(session.consistency_level, ConsistencyLevel::ReadYourWrites);

        // Same text without the hint is memoized separately from the hint
        let plain = a.analyze("SELECT * FROM areas", &[], &AnalysisContext::default());
        assert_eq!(plain.consistency_level, ConsistencyLevel::Eventual);
    }

    #[test]
    fn test_cacheability_rules() {
        let a = analyzer();
        let ctx = AnalysisContext::default();

        assert!(!a.analyze("SELECT * FROM listings", &[], &ctx).cacheable);
        assert!(
            !a.analyze("SELECT * FROM properties p JOIN sessions s ON s.id = p.id", &[], &ctx)
                .cacheable
        );
        assert!(
            !a.analyze("SELECT * FROM properties WHERE listed_at > now()", &[], &ctx)
                .cacheable
        );
        assert!(!a.analyze("SELECT 1", &[], &ctx).cacheable);
        assert!(
            a.analyze("SELECT * FROM Properties JOIN public.areas ON true", &[], &ctx)
                .cacheable
        );
    }

    #[test]
    fn test_cache_key_depends_on_params() {
        let a = analyzer();
        let ctx = AnalysisContext::default();
        let sql = "SELECT * FROM properties WHERE id = $1";

        let k1 = a.analyze(sql, &[SqlValue::Int(1)], &ctx).cache_key;
        let k2 = a.analyze(sql, &[SqlValue::Int(2)], &ctx).cache_key;
        let k3 = a
            .analyze("SELECT *\n   FROM properties WHERE id = $1;", &[SqlValue::Int(1)], &ctx)
            .cache_key;
        assert_ne!(k1, k2);
        assert_eq!(k1, k3);
    }

    #[test]
    fn test_frequency_pruning() {
        let a = analyzer();
        let ctx = AnalysisContext::default();
        for _ in 0..3 {
            a.analyze("SELECT * FROM areas", &[], &ctx);
        }
        for i in 0..MAX_TRACKED_QUERIES {
            a.analyze(&format!("SELECT {} FROM properties", i), &[], &ctx);
        }

        assert_eq!(a.tracked_query_count(), PRUNED_QUERIES);
        let top = a.frequent_queries(1);
        assert_eq!(top[0], ("SELECT * FROM areas".to_string(), 3));
    }

    #[test]
    fn test_prepared_registry() {
        let a = analyzer().with_max_prepared(2);
        a.prepare("by_id", "SELECT * FROM properties WHERE id = $1");
        a.prepare("by_area", "SELECT * FROM properties WHERE area_id = $1");
        a.prepare("by_id", "SELECT id FROM properties WHERE id = $1");
        a.prepare("areas", "SELECT * FROM areas");

        assert_eq!(a.prepared_count(), 2);
        assert!(matches!(
            a.get_prepared("by_area"),
            Err(RouterError::UnknownStatement { .. })
        ));
        assert_eq!(
            a.get_prepared("by_id").unwrap().sql,
            "SELECT id FROM properties WHERE id = $1"
        );
    }

    #[test]
    fn test_consistency_level_parse() {
        assert_eq!("STRONG".parse::<ConsistencyLevel>(), Ok(ConsistencyLevel::Strong));
        assert!("linearizable".parse::<ConsistencyLevel>().is_err());
        assert_eq!(ConsistencyLevel::ReadYourWrites.to_string(), "read_your_writes");
    }
}
