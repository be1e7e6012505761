/// Bounded tokio-postgres pool
///
/// A semaphore caps open connections per node; released connections wait
/// in an idle queue and are closed on the next acquire once they outlive
/// the idle timeout.
use crate::config::{Config, DatabaseConfig, NodeConfig, PoolConfig};
use crate::core::{Connection, Node, NodePool, PoolStatus, QueryResult, Row, SqlValue};
use crate::error::{RouterError, RouterResult};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

const APPLICATION_NAME: &str = "replica-router";

struct IdleClient {
    client: Client,
    since: Instant,
}

struct PoolShared {
    idle: Mutex<VecDeque<IdleClient>>,
    /// Open connections, idle or in use
    open: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleClient>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connection pool for one PostgreSQL node
pub struct PgPool {
    name: String,
    config: tokio_postgres::Config,
    permits: Arc<Semaphore>,
    shared: Arc<PoolShared>,
    max_size: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl PgPool {
    pub fn new<S: Into<String>>(
        name: S,
        node: &NodeConfig,
        database: &DatabaseConfig,
        pool: &PoolConfig,
    ) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&node.host)
            .port(node.port)
            .user(&database.user)
            .dbname(&database.dbname)
            .application_name(APPLICATION_NAME)
            .connect_timeout(pool.connect_timeout());
        if let Some(password) = &database.password {
            config.password(password);
        }

        Self {
            name: name.into(),
            config,
            permits: Arc::new(Semaphore::new(pool.max_size)),
            shared: Arc::new(PoolShared {
                idle: Mutex::new(VecDeque::new()),
                open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
            max_size: pool.max_size,
            idle_timeout: pool.idle_timeout(),
            connect_timeout: pool.connect_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes for every configured endpoint: the primary, then replicas in
    /// promotion order
    pub fn cluster(config: &Config) -> (Arc<Node>, Vec<Arc<Node>>) {
        let database = &config.database;
        let primary = Arc::new(Node::primary(Arc::new(PgPool::new(
            "primary",
            &database.primary,
            database,
            &config.pool,
        ))));
        let replicas = database
            .replicas
            .iter()
            .zip(database.replica_names())
            .map(|(node, name)| {
                let pool = PgPool::new(name.clone(), node, database, &config.pool);
                Arc::new(Node::replica(name, Arc::new(pool)))
            })
            .collect();
        (primary, replicas)
    }

    fn take_idle(&self) -> Option<Client> {
        let mut idle = self.shared.idle();
        while let Some(entry) = idle.pop_front() {
            if entry.client.is_closed() || entry.since.elapsed() >= self.idle_timeout {
                self.shared.forget();
                continue;
            }
            return Some(entry.client);
        }
        None
    }

    async fn connect(&self, remaining: Duration) -> RouterResult<Client> {
        let (client, connection) = match timeout(remaining, self.config.connect(NoTls)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(map_error(&self.name, e)),
            Err(_) => {
                return Err(RouterError::connection(
                    &self.name,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ))
            }
        };

        let node = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to {} ended: {}", node, e);
            }
        });

        self.shared.open.fetch_add(1, Ordering::AcqRel);
        debug!("Opened connection to {}", self.name);
        Ok(client)
    }
}

#[async_trait]
impl NodePool for PgPool {
    async fn acquire(&self) -> RouterResult<Box<dyn Connection>> {
        if self.is_closed() {
            return Err(RouterError::connection(&self.name, "pool is closed"));
        }

        let started = Instant::now();
        let permit = match timeout(self.connect_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RouterError::connection(&self.name, "pool is closed")),
            Err(_) => {
                return Err(RouterError::PoolTimeout {
                    node: self.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        let client = match self.take_idle() {
            Some(client) => client,
            None => {
                self.connect(self.connect_timeout.saturating_sub(started.elapsed()))
                    .await?
            }
        };

        Ok(Box::new(PgConnection {
            node: self.name.clone(),
            client: Some(client),
            shared: Arc::clone(&self.shared),
            _permit: permit,
            broken: false,
        }))
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            total: self.shared.open.load(Ordering::Acquire),
            idle: self.shared.idle().len(),
            max_size: self.max_size,
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained: Vec<IdleClient> = self.shared.idle().drain(..).collect();
        for _ in &drained {
            self.shared.forget();
        }
        info!(
            "Closed pool for {} ({} idle connections)",
            self.name,
            drained.len()
        );
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// A pooled client; returns to the idle queue on drop unless broken
struct PgConnection {
    node: String,
    client: Option<Client>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
}

impl PgConnection {
    fn client(&self) -> RouterResult<&Client> {
        self.client
            .as_ref()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| RouterError::connection(&self.node, "connection is closed"))
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> RouterResult<QueryResult> {
        let client = self.client()?;
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let statement = client
            .prepare(sql)
            .await
            .map_err(|e| map_error(&self.node, e))?;

        if statement.columns().is_empty() {
            let affected = client
                .execute(&statement, &bound)
                .await
                .map_err(|e| map_error(&self.node, e))?;
            return Ok(QueryResult::with_row_count(Vec::new(), affected));
        }

        let rows = client
            .query(&statement, &bound)
            .await
            .map_err(|e| map_error(&self.node, e))?;
        let rows = rows
            .iter()
            .map(decode_row)
            .collect::<RouterResult<Vec<Row>>>()?;
        Ok(QueryResult::new(rows))
    }

    async fn batch_execute(&mut self, sql: &str) -> RouterResult<()> {
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| map_error(&self.node, e))
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if self.broken || client.is_closed() || self.shared.closed.load(Ordering::Acquire) {
            self.shared.forget();
            return;
        }
        self.shared.idle().push_back(IdleClient {
            client,
            since: Instant::now(),
        });
    }
}

/// Server errors keep their message verbatim; a cancelled statement is a
/// timeout; transport failures are connection errors
fn map_error(node: &str, error: tokio_postgres::Error) -> RouterError {
    if let Some(db) = error.as_db_error() {
        if db.code() == &SqlState::QUERY_CANCELED {
            return RouterError::statement_timeout(node, db.message());
        }
        return RouterError::Query {
            node: node.to_string(),
            message: db.message().to_string(),
            code: Some(db.code().code().to_string()),
        };
    }

    let transport = error.is_closed()
        || error
            .source()
            .map(|s| s.is::<io::Error>())
            .unwrap_or(false);
    if transport {
        RouterError::connection(node, error.to_string())
    } else {
        RouterError::query(node, error.to_string())
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn decode_row(row: &tokio_postgres::Row) -> RouterResult<Row> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(SqlValue::from),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .map(|v| SqlValue::from(v.map(|v| SqlValue::Int(v as i64)))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .map(|v| SqlValue::from(v.map(|v| SqlValue::Int(v as i64)))),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(SqlValue::from),
            Type::OID => row
                .try_get::<_, Option<u32>>(idx)
                .map(|v| SqlValue::from(v.map(|v| SqlValue::Int(v as i64)))),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| SqlValue::from(v.map(|v| SqlValue::Float(v as f64)))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(SqlValue::from),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .map(|v| SqlValue::from(v.map(SqlValue::Bytes))),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .map(SqlValue::from),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .map(|v| SqlValue::from(v.map(|t| t.to_rfc3339()))),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map(|v| SqlValue::from(v.map(|t| t.to_string()))),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)
                .map(|v| SqlValue::from(v.map(|d| d.to_string()))),
            _ => row.try_get::<_, Option<String>>(idx).map(SqlValue::from),
        }
        .map_err(|e| {
            RouterError::decode(format!(
                "column '{}' of type {}: {}",
                column.name(),
                ty,
                e
            ))
        })?;
        columns.push(column.name().to_string());
        values.push(value);
    }
    Ok(Row::new(columns, values))
}
