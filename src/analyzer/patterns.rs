/// Ordered SQL pattern corpus used by the analyzer
///
/// Classification is heuristic: statements are matched against regular
/// expressions over comment-free, whitespace-normalized text. It does not
/// parse SQL and can be fooled by unusual formatting.
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use lazy_static::lazy_static;
use regex::Regex;

use super::{ConsistencyLevel, QueryType};

/// Functions whose result changes between calls
const NON_DETERMINISTIC: &[&str] = &[
    "NOW(",
    "CURRENT_TIMESTAMP",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "LOCALTIME",
    "CLOCK_TIMESTAMP(",
    "STATEMENT_TIMESTAMP(",
    "TRANSACTION_TIMESTAMP(",
    "TIMEOFDAY(",
    "RANDOM(",
    "GEN_RANDOM_UUID(",
    "UUID_GENERATE_",
    "TXID_CURRENT",
    "PG_BACKEND_PID(",
    "PG_SLEEP",
];

/// Words the table regex can capture that are never table names
const KEYWORDS: &[&str] = &[
    "select", "where", "set", "values", "lateral", "only", "as", "on", "using", "join", "inner",
    "left", "right", "full", "cross", "natural", "outer", "group", "order", "limit", "offset",
    "having", "union", "intersect", "except", "from", "into", "table", "default", "returning",
    "if", "not", "exists", "unnest", "generate_series", "skip", "nowait", "of", "stdin", "stdout",
];

lazy_static! {
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").expect("valid regex");
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").expect("valid regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid regex");
    static ref STRING_LITERAL: Regex = Regex::new(r"'(?:[^']|'')*'").expect("valid regex");
    static ref CONSISTENCY_HINT: Regex = Regex::new(
        r"(?i)/\*\s*consistency\s*:\s*(strong|bounded|eventual|read_your_writes)\s*\*/"
    )
    .expect("valid regex");

    /// Checked in order; the first match decides the statement type
    static ref STATEMENT_PATTERNS: Vec<(Regex, QueryType)> = vec![
        (
            Regex::new(r"(?i)^(BEGIN|START\s+TRANSACTION|COMMIT|ROLLBACK|SAVEPOINT|RELEASE|END|ABORT|PREPARE\s+TRANSACTION)\b")
                .expect("valid regex"),
            QueryType::Transaction,
        ),
        (Regex::new(r"(?i)^INSERT\b").expect("valid regex"), QueryType::Insert),
        (Regex::new(r"(?i)^UPDATE\b").expect("valid regex"), QueryType::Update),
        (Regex::new(r"(?i)^DELETE\b").expect("valid regex"), QueryType::Delete),
        (Regex::new(r"(?i)^MERGE\b").expect("valid regex"), QueryType::Merge),
        (Regex::new(r"(?i)^COPY\b").expect("valid regex"), QueryType::Copy),
        (
            Regex::new(r"(?i)^(CREATE|ALTER|DROP|TRUNCATE|GRANT|REVOKE|COMMENT|REINDEX|VACUUM|CLUSTER|REFRESH)\b")
                .expect("valid regex"),
            QueryType::Ddl,
        ),
        (Regex::new(r"(?i)^LOCK\b").expect("valid regex"), QueryType::Lock),
        (Regex::new(r"(?i)^(SELECT|WITH|VALUES|TABLE)\b").expect("valid regex"), QueryType::Select),
        (
            Regex::new(r"(?i)^(SET|SHOW|RESET|EXPLAIN|DISCARD|DEALLOCATE)\b").expect("valid regex"),
            QueryType::Utility,
        ),
    ];

    /// Data-modifying clauses inside a CTE or an explained statement
    static ref DML_CLAUSE: Regex =
        Regex::new(r"(?i)\b(INSERT\s+INTO|UPDATE\s+\S+\s+SET|DELETE\s+FROM|MERGE\s+INTO)\b")
            .expect("valid regex");
    /// Reads with side effects on the primary
    static ref WRITING_FUNCTION: Regex = Regex::new(
        r"(?i)\b(nextval|setval|pg_advisory_lock|pg_advisory_xact_lock|pg_try_advisory_lock|pg_try_advisory_xact_lock)\s*\("
    )
    .expect("valid regex");
    /// `EXPLAIN ANALYZE` executes the statement it explains
    static ref EXPLAIN_ANALYZE: Regex =
        Regex::new(r"(?i)^EXPLAIN\s+(ANALYZE\b|\([^)]*\bANALYZE\b[^)]*\))").expect("valid regex");
    /// Statements that change state carried by the pooled connection
    static ref SESSION_STATEMENT: Regex =
        Regex::new(r"(?i)^(SET|RESET|DISCARD|DEALLOCATE)\b").expect("valid regex");
    static ref SELECT_INTO: Regex =
        Regex::new(r"(?i)^SELECT\b.*\bINTO\s+(TEMP|TEMPORARY|UNLOGGED|TABLE|\w+\s+FROM)\b")
            .expect("valid regex");
    static ref FOR_UPDATE: Regex =
        Regex::new(r"(?i)\bFOR\s+(UPDATE|NO\s+KEY\s+UPDATE|SHARE|KEY\s+SHARE)\b")
            .expect("valid regex");
    static ref RETURNING: Regex = Regex::new(r"(?i)\bRETURNING\b").expect("valid regex");

    /// `FROM a, b` lists and single-table clauses
    static ref TABLE_REF: Regex = Regex::new(
        r#"(?i)\b(?:FROM|JOIN|INTO|UPDATE|TABLE|TRUNCATE|COPY)\s+(?:ONLY\s+)?(?:IF\s+(?:NOT\s+)?EXISTS\s+)?((?:"[^"]+"|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"[^"]+"|[A-Za-z_][\w$]*))?)"#
    )
    .expect("valid regex");
    static ref FROM_LIST: Regex = Regex::new(
        r#"(?i)\bFROM\s+((?:"[^"]+"|[A-Za-z_][\w$.]*)(?:\s+(?:AS\s+)?[A-Za-z_]\w*)?(?:\s*,\s*(?:"[^"]+"|[A-Za-z_][\w$.]*)(?:\s+(?:AS\s+)?[A-Za-z_]\w*)?)+)"#
    )
    .expect("valid regex");
    /// Function calls whose syntax contains FROM
    static ref FROM_FUNCTIONS: Regex =
        Regex::new(r"(?i)\b(EXTRACT|SUBSTRING|TRIM|OVERLAY|POSITION)\s*\([^()]*\)")
            .expect("valid regex");

    static ref JOIN: Regex = Regex::new(r"(?i)\bJOIN\b").expect("valid regex");
    static ref SUBQUERY: Regex = Regex::new(r"(?i)\(\s*SELECT\b").expect("valid regex");
    static ref AGGREGATION: Regex =
        Regex::new(r"(?i)\b(GROUP\s+BY|HAVING|DISTINCT|COUNT\s*\(|SUM\s*\(|AVG\s*\(|MIN\s*\(|MAX\s*\()")
            .expect("valid regex");
    static ref WHERE: Regex = Regex::new(r"(?i)\bWHERE\b").expect("valid regex");

    static ref NON_DETERMINISTIC_FINDER: AhoCorasick = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(NON_DETERMINISTIC)
        .expect("Failed to create non-deterministic function finder");
}

/// Strip comments, collapse whitespace and drop a trailing semicolon
pub fn normalize(sql: &str) -> String {
    let without_blocks = BLOCK_COMMENT.replace_all(sql, " ");
    let without_lines = LINE_COMMENT.replace_all(&without_blocks, " ");
    let collapsed = WHITESPACE.replace_all(&without_lines, " ");
    collapsed.trim().trim_end_matches(';').trim_end().to_string()
}

/// Normalized text with string literals blanked, so keywords inside
/// literals do not influence classification
pub fn skeleton(normalized: &str) -> String {
    STRING_LITERAL.replace_all(normalized, "''").into_owned()
}

/// Inline `/* consistency: ... */` hint, read before comments are stripped
pub fn consistency_hint(sql: &str) -> Option<ConsistencyLevel> {
    CONSISTENCY_HINT
        .captures(sql)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn statement_type(skeleton: &str) -> QueryType {
    STATEMENT_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(skeleton))
        .map(|(_, query_type)| *query_type)
        .unwrap_or(QueryType::Unknown)
}

/// Whether a statement of `query_type` modifies data
pub fn is_write(query_type: QueryType, skeleton: &str) -> bool {
    match query_type {
        QueryType::Select => {
            DML_CLAUSE.is_match(skeleton)
                || WRITING_FUNCTION.is_match(skeleton)
                || SELECT_INTO.is_match(skeleton)
        }
        QueryType::Utility => EXPLAIN_ANALYZE.is_match(skeleton) && DML_CLAUSE.is_match(skeleton),
        _ => true,
    }
}

/// Whether the statement changes connection-scoped session state
pub fn changes_session(skeleton: &str) -> bool {
    SESSION_STATEMENT.is_match(skeleton)
}

pub fn has_for_update(skeleton: &str) -> bool {
    FOR_UPDATE.is_match(skeleton)
}

pub fn has_returning(skeleton: &str) -> bool {
    RETURNING.is_match(skeleton)
}

pub fn has_non_deterministic(skeleton: &str) -> bool {
    NON_DETERMINISTIC_FINDER.is_match(skeleton)
}

/// Tables referenced by the statement, lowercased and unqualified, in
/// order of first appearance
pub fn extract_tables(skeleton: &str) -> Vec<String> {
    let text = FROM_FUNCTIONS.replace_all(skeleton, " ");
    let mut tables: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        if let Some(name) = clean_identifier(raw) {
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
    };

    for capture in TABLE_REF.captures_iter(&text) {
        if let Some(m) = capture.get(1) {
            push(m.as_str());
        }
    }

    for capture in FROM_LIST.captures_iter(&text) {
        if let Some(m) = capture.get(1) {
            for item in m.as_str().split(',') {
                if let Some(first) = item.split_whitespace().next() {
                    push(first);
                }
            }
        }
    }

    tables
}

fn clean_identifier(raw: &str) -> Option<String> {
    let unqualified = raw.rsplit('.').next().unwrap_or(raw);
    let name = unqualified.trim().trim_matches('"').to_lowercase();
    if name.is_empty() || KEYWORDS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

/// Relative cost score for observability
pub fn estimate_cost(query_type: QueryType, skeleton: &str, table_count: usize) -> u32 {
    let mut cost = 2 * JOIN.find_iter(skeleton).count() as u32;
    cost += 3 * nested_subqueries(skeleton);
    if AGGREGATION.is_match(skeleton) {
        cost += 2;
    }
    if query_type == QueryType::Select && table_count > 0 && !WHERE.is_match(skeleton) {
        cost += 3;
    }
    cost + table_count as u32
}

/// Subqueries opened while another subquery is still open
fn nested_subqueries(skeleton: &str) -> u32 {
    let starts: Vec<usize> = SUBQUERY.find_iter(skeleton).map(|m| m.start()).collect();
    let mut open: Vec<bool> = Vec::new();
    let mut nested = 0;
    for (i, c) in skeleton.char_indices() {
        match c {
            '(' => {
                let is_subquery = starts.binary_search(&i).is_ok();
                if is_subquery && open.iter().any(|enclosing| *enclosing) {
                    nested += 1;
                }
                open.push(is_subquery);
            }
            ')' => {
                open.pop();
            }
            _ => {}
        }
    }
    nested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let sql = "  SELECT *\n  FROM properties -- list\n  WHERE id = $1; ";
        assert_eq!(normalize(sql), "SELECT * FROM properties WHERE id = $1");
        assert_eq!(
            normalize("/* consistency: strong */ SELECT 1"),
            "SELECT 1"
        );
    }

    #[test]
    fn test_statement_corpus() {
        let corpus = [
            ("SELECT * FROM areas", QueryType::Select),
            ("select count(*) from areas", QueryType::Select),
            ("WITH t AS (SELECT 1) SELECT * FROM t", QueryType::Select),
            ("INSERT INTO properties (id) VALUES ($1)", QueryType::Insert),
            ("UPDATE properties SET price = $1", QueryType::Update),
            ("DELETE FROM properties WHERE id = $1", QueryType::Delete),
            ("MERGE INTO properties p USING staged s ON p.id = s.id", QueryType::Merge),
            ("COPY properties FROM STDIN", QueryType::Copy),
            ("CREATE INDEX idx ON properties (price)", QueryType::Ddl),
            ("TRUNCATE activity_logs", QueryType::Ddl),
            ("LOCK TABLE properties IN EXCLUSIVE MODE", QueryType::Lock),
            ("BEGIN", QueryType::Transaction),
            ("start transaction isolation level serializable", QueryType::Transaction),
            ("COMMIT", QueryType::Transaction),
            ("SHOW statement_timeout", QueryType::Utility),
            ("VACUUM ANALYZE properties", QueryType::Ddl),
            ("CALL refresh_stats()", QueryType::Unknown),
        ];

        for (sql, expected) in corpus {
            assert_eq!(statement_type(&skeleton(&normalize(sql))), expected, "{}", sql);
        }
    }

    #[test]
    fn test_reads_with_side_effects() {
        for sql in [
            "SELECT nextval('properties_id_seq')",
            "SELECT pg_advisory_lock(42)",
            "WITH moved AS (DELETE FROM queue WHERE id = $1 RETURNING *) SELECT * FROM moved",
            "SELECT * INTO TEMP snapshot FROM properties",
        ] {
            let sk = skeleton(&normalize(sql));
            assert!(is_write(statement_type(&sk), &sk), "{}", sql);
        }

        let sk = skeleton("SELECT * FROM properties WHERE note = 'insert into x'");
        assert!(!is_write(statement_type(&sk), &sk));
    }

    #[test]
    fn test_explain_analyze_of_dml_is_write() {
        for sql in [
            "EXPLAIN ANALYZE UPDATE properties SET price = 1 WHERE id = 2",
            "explain (analyze, buffers) delete from sessions where expired",
            "EXPLAIN ANALYZE INSERT INTO areas (name) VALUES ('north')",
        ] {
            let sk = skeleton(&normalize(sql));
            assert_eq!(statement_type(&sk), QueryType::Utility, "{}", sql);
            assert!(is_write(QueryType::Utility, &sk), "{}", sql);
        }

        for sql in [
            "EXPLAIN UPDATE properties SET price = 1",
            "EXPLAIN ANALYZE SELECT * FROM properties",
            "SHOW search_path",
        ] {
            let sk = skeleton(&normalize(sql));
            assert!(!is_write(QueryType::Utility, &sk), "{}", sql);
        }
    }

    #[test]
    fn test_session_statements() {
        for sql in [
            "SET search_path = tenant_7",
            "set local statement_timeout = 100",
            "RESET ALL",
            "DISCARD ALL",
            "DEALLOCATE stmt_1",
        ] {
            assert!(changes_session(&normalize(sql)), "{}", sql);
        }
        assert!(!changes_session("SHOW search_path"));
        assert!(!changes_session("SELECT set_config('a', 'b', false)"));
        assert!(!changes_session("UPDATE properties SET price = 1"));
    }

    #[test]
    fn test_locking_clauses() {
        assert!(has_for_update("SELECT * FROM properties WHERE id = 1 FOR UPDATE"));
        assert!(has_for_update("select * from t for no key update"));
        assert!(has_for_update("SELECT * FROM t FOR SHARE SKIP LOCKED"));
        assert!(!has_for_update(&skeleton("SELECT 'for update' FROM t")));
        assert!(has_returning("INSERT INTO t (a) VALUES (1) RETURNING id"));
    }

    #[test]
    fn test_extract_tables() {
        assert_eq!(
            extract_tables("SELECT * FROM public.\"Properties\" p JOIN areas a ON a.id = p.area_id"),
            vec!["properties", "areas"]
        );
        assert_eq!(
            extract_tables("SELECT * FROM properties, areas WHERE properties.area_id = areas.id"),
            vec!["properties", "areas"]
        );
        assert_eq!(
            extract_tables("INSERT INTO listings (id) VALUES (1)"),
            vec!["listings"]
        );
        assert_eq!(
            extract_tables("SELECT EXTRACT(YEAR FROM listed_at) FROM listings"),
            vec!["listings"]
        );
        assert_eq!(
            extract_tables("CREATE TABLE IF NOT EXISTS audit (id int)"),
            vec!["audit"]
        );
        assert!(extract_tables("SELECT 1").is_empty());
    }

    #[test]
    fn test_consistency_hint() {
        assert_eq!(
            consistency_hint("/* consistency: bounded */ SELECT * FROM areas"),
            Some(ConsistencyLevel::Bounded)
        );
        assert_eq!(
            consistency_hint("SELECT 1 /* Consistency: READ_YOUR_WRITES */"),
            Some(ConsistencyLevel::ReadYourWrites)
        );
        assert_eq!(consistency_hint("/* consistency: maybe */ SELECT 1"), None);
    }

    #[test]
    fn test_non_deterministic() {
        assert!(has_non_deterministic("SELECT * FROM t WHERE created_at > now() - interval '1 day'"));
        assert!(has_non_deterministic("SELECT random()"));
        assert!(!has_non_deterministic("SELECT * FROM known_areas"));
    }

    #[test]
    fn test_cost() {
        let simple = "SELECT * FROM properties WHERE id = $1";
        assert_eq!(estimate_cost(QueryType::Select, simple, 1), 1);

        let heavy = "SELECT a.name, COUNT(*) FROM areas a JOIN properties p ON p.area_id = a.id \
                     WHERE p.id IN (SELECT id FROM listings) GROUP BY a.name";
        // join 2 + aggregation 2 + 3 tables; a single-level subquery adds nothing
        assert_eq!(estimate_cost(QueryType::Select, heavy, 3), 7);

        assert_eq!(estimate_cost(QueryType::Select, "SELECT * FROM areas", 1), 4);
    }

    #[test]
    fn test_cost_counts_nested_subqueries_only() {
        let nested = "SELECT * FROM areas WHERE id IN (SELECT area_id FROM properties \
                      WHERE owner_id IN (SELECT id FROM owners WHERE active))";
        assert_eq!(nested_subqueries(nested), 1);
        assert_eq!(estimate_cost(QueryType::Select, nested, 3), 6);

        let siblings = "SELECT (SELECT max(price) FROM properties), (SELECT count(*) FROM areas)";
        assert_eq!(nested_subqueries(siblings), 0);

        let deep = "SELECT * FROM a WHERE x IN (SELECT x FROM b WHERE y IN \
                    (SELECT y FROM c WHERE z IN (SELECT z FROM d)))";
        assert_eq!(nested_subqueries(deep), 2);
    }
}
