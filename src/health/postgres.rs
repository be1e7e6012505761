/// Replication lag probes over the catalog views
use super::{LagProbe, ReplicaProbe, WalSender};
use crate::core::{Node, Row};
use crate::error::RouterResult;
use async_trait::async_trait;

/// Per-standby WAL positions as seen by the primary
pub const PRIMARY_REPLICATION_SQL: &str = "SELECT application_name, \
    client_addr::text AS client_addr, state, sync_state, \
    sync_priority::bigint AS sync_priority, \
    sent_lsn::text AS sent_lsn, replay_lsn::text AS replay_lsn, \
    COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), write_lsn), 0)::bigint AS write_lag_bytes, \
    COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), flush_lsn), 0)::bigint AS flush_lag_bytes, \
    COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)::bigint AS replay_lag_bytes, \
    (EXTRACT(EPOCH FROM replay_lag) * 1000)::bigint AS replay_lag_ms, \
    (EXTRACT(EPOCH FROM (clock_timestamp() - reply_time)) * 1000)::bigint AS reply_age_ms \
    FROM pg_stat_replication";

/// Recovery state and replay lag as seen by a standby.
///
/// A standby that has replayed everything it received reports zero lag,
/// otherwise idle periods on the primary would read as growing lag.
pub const REPLICA_STATUS_SQL: &str = "SELECT pg_is_in_recovery() AS in_recovery, \
    pg_last_wal_receive_lsn()::text AS receive_lsn, \
    pg_last_wal_replay_lsn()::text AS replay_lsn, \
    COALESCE(pg_wal_lsn_diff(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()), 0)::bigint AS lag_bytes, \
    CASE WHEN pg_last_wal_receive_lsn() = pg_last_wal_replay_lsn() THEN 0 \
    ELSE COALESCE((EXTRACT(EPOCH FROM (clock_timestamp() - pg_last_xact_replay_timestamp())) * 1000)::bigint, 0) \
    END AS lag_ms";

/// [`LagProbe`] that queries `pg_stat_replication` and the standby's
/// recovery functions through the node's own pool
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresLagProbe;

impl PostgresLagProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LagProbe for PostgresLagProbe {
    async fn wal_senders(&self, primary: &Node) -> RouterResult<Vec<WalSender>> {
        let mut conn = primary.pool().acquire().await?;
        let result = conn.query(PRIMARY_REPLICATION_SQL, &[]).await?;
        Ok(result.rows.iter().map(wal_sender_from_row).collect())
    }

    async fn replica_status(&self, replica: &Node) -> RouterResult<ReplicaProbe> {
        let mut conn = replica.pool().acquire().await?;
        let result = conn.query(REPLICA_STATUS_SQL, &[]).await?;
        let row = result.first().cloned().unwrap_or_else(|| Row::new(vec![], vec![]));
        Ok(replica_probe_from_row(&row))
    }
}

fn non_negative(row: &Row, column: &str) -> Option<u64> {
    row.get_i64(column).map(|v| v.max(0) as u64)
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get_str(column).map(str::to_string)
}

pub(crate) fn wal_sender_from_row(row: &Row) -> WalSender {
    WalSender {
        application_name: text(row, "application_name").unwrap_or_default(),
        client_addr: text(row, "client_addr"),
        state: text(row, "state"),
        sync_state: text(row, "sync_state"),
        sync_priority: row.get_i64("sync_priority"),
        sent_lsn: text(row, "sent_lsn"),
        replay_lsn: text(row, "replay_lsn"),
        write_lag_bytes: non_negative(row, "write_lag_bytes").unwrap_or(0),
        flush_lag_bytes: non_negative(row, "flush_lag_bytes").unwrap_or(0),
        replay_lag_bytes: non_negative(row, "replay_lag_bytes").unwrap_or(0),
        replay_lag_ms: non_negative(row, "replay_lag_ms"),
        reply_age_ms: non_negative(row, "reply_age_ms"),
    }
}

pub(crate) fn replica_probe_from_row(row: &Row) -> ReplicaProbe {
    let lag_bytes = non_negative(row, "lag_bytes").unwrap_or(0);
    ReplicaProbe {
        in_recovery: row.get_bool("in_recovery").unwrap_or(false),
        lag_ms: if lag_bytes == 0 {
            0
        } else {
            non_negative(row, "lag_ms").unwrap_or(0)
        },
        lag_bytes,
        receive_lsn: text(row, "receive_lsn"),
        replay_lsn: text(row, "replay_lsn"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryPool;
    use crate::core::{QueryResult, SqlValue};
    use std::sync::Arc;

    #[test]
    fn test_replica_row_parsing() {
        let row = Row::from_pairs([
            ("in_recovery", SqlValue::Bool(true)),
            ("receive_lsn", SqlValue::from("0/3000148")),
            ("replay_lsn", SqlValue::from("0/3000060")),
            ("lag_bytes", SqlValue::Int(232)),
            ("lag_ms", SqlValue::Int(850)),
        ]);
        let probe = replica_probe_from_row(&row);
        assert!(probe.in_recovery);
        assert_eq!(probe.lag_ms, 850);
        assert_eq!(probe.lag_bytes, 232);
        assert_eq!(probe.replay_lsn.as_deref(), Some("0/3000060"));
    }

    #[test]
    fn test_caught_up_replica_has_zero_lag() {
        let row = Row::from_pairs([
            ("in_recovery", SqlValue::Bool(true)),
            ("lag_bytes", SqlValue::Int(0)),
            ("lag_ms", SqlValue::Int(60_000)),
        ]);
        assert_eq!(replica_probe_from_row(&row).lag_ms, 0);
    }

    #[test]
    fn test_sender_row_clamps_negative_diffs() {
        let row = Row::from_pairs([
            ("application_name", SqlValue::from("replica-1")),
            ("state", SqlValue::from("streaming")),
            ("replay_lag_bytes", SqlValue::Int(-16)),
            ("reply_age_ms", SqlValue::Null),
        ]);
        let sender = wal_sender_from_row(&row);
        assert_eq!(sender.application_name, "replica-1");
        assert_eq!(sender.replay_lag_bytes, 0);
        assert_eq!(sender.reply_age_ms, None);
    }

    #[tokio::test]
    async fn test_probe_through_pool() {
        let pool = Arc::new(MemoryPool::new("replica-1"));
        pool.respond_to(
            "pg_is_in_recovery",
            QueryResult::new(vec![Row::from_pairs([
                ("in_recovery", SqlValue::Bool(true)),
                ("lag_bytes", SqlValue::Int(64)),
                ("lag_ms", SqlValue::Int(40)),
            ])]),
        );
        let node = Node::replica("replica-1", pool);

        let probe = PostgresLagProbe::new().replica_status(&node).await.unwrap();
        assert_eq!(probe.lag_ms, 40);
    }
}
