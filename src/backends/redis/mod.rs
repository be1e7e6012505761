/// Shared cache tier over a single Redis connection
pub mod resp;

use self::resp::RespValue;
use crate::config::ConfigError;
use crate::core::QueryResult;
use crate::error::CacheError;
use crate::router::SharedCache;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 6379;
const SCAN_COUNT: &str = "200";
/// Keys written by the router; clearing everything stays inside it
const KEY_SPACE: &str = "q:*";

/// Parsed `redis://[[user]:password@]host[:port][/db]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: u32,
}

impl RedisEndpoint {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::ValidationError(format!("Invalid redis url: {}", url));
        let rest = url.strip_prefix("redis://").ok_or_else(invalid)?;

        let (credentials, rest) = match rest.rsplit_once('@') {
            Some((credentials, rest)) => (Some(credentials), rest),
            None => (None, rest),
        };
        let (username, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (
                    Some(user.to_string()).filter(|u| !u.is_empty()),
                    Some(password.to_string()),
                ),
                None => (None, Some(credentials.to_string())),
            },
            None => (None, None),
        };

        let (host_port, db) = match rest.split_once('/') {
            Some((host_port, db)) if !db.is_empty() => {
                (host_port, db.parse::<u32>().map_err(|_| invalid())?)
            }
            Some((host_port, _)) => (host_port, 0),
            None => (rest, 0),
        };
        let addr = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                port.parse::<u16>().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid());
                }
                host_port.to_string()
            }
            None if !host_port.is_empty() => format!("{}:{}", host_port, DEFAULT_PORT),
            None => return Err(invalid()),
        };

        Ok(Self {
            addr,
            username,
            password,
            db,
        })
    }
}

struct RespConnection {
    stream: TcpStream,
    buf: BytesMut,
}

impl RespConnection {
    async fn call(&mut self, args: &[&[u8]]) -> Result<RespValue, CacheError> {
        let mut out = BytesMut::new();
        resp::encode_command(args, &mut out);
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| CacheError::unavailable(e.to_string()))?;

        loop {
            if let Some((value, used)) = resp::parse(&self.buf)? {
                self.buf.advance(used);
                return Ok(value);
            }
            let read = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| CacheError::unavailable(e.to_string()))?;
            if read == 0 {
                return Err(CacheError::unavailable("connection closed by server"));
            }
        }
    }
}

/// [`SharedCache`] backed by Redis: `GET`, `SET .. PX`, `SCAN MATCH` and
/// `DEL`. Values are JSON-encoded results.
///
/// One connection is shared and reopened lazily after any I/O failure.
pub struct RedisCache {
    endpoint: RedisEndpoint,
    io_timeout: Duration,
    conn: Mutex<Option<RespConnection>>,
}

impl RedisCache {
    pub fn new(endpoint: RedisEndpoint, io_timeout: Duration) -> Self {
        Self {
            endpoint,
            io_timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn from_url(url: &str, io_timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self::new(RedisEndpoint::parse(url)?, io_timeout))
    }

    pub fn endpoint(&self) -> &RedisEndpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<RespConnection, CacheError> {
        let stream = TcpStream::connect(&self.endpoint.addr)
            .await
            .map_err(|e| CacheError::unavailable(format!("{}: {}", self.endpoint.addr, e)))?;
        stream.set_nodelay(true).ok();
        let mut conn = RespConnection {
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        if let Some(password) = &self.endpoint.password {
            let reply = match &self.endpoint.username {
                Some(user) => {
                    conn.call(&[b"AUTH".as_slice(), user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => conn.call(&[b"AUTH".as_slice(), password.as_bytes()]).await?,
            };
            expect_ok("AUTH", reply)?;
        }
        if self.endpoint.db != 0 {
            let db = self.endpoint.db.to_string();
            expect_ok("SELECT", conn.call(&[b"SELECT".as_slice(), db.as_bytes()]).await?)?;
        }

        debug!("Connected to shared cache at {}", self.endpoint.addr);
        Ok(conn)
    }

    /// Run one command, reconnecting first if needed. The connection is
    /// dropped on any transport or protocol failure.
    async fn call(&self, args: &[&[u8]]) -> Result<RespValue, CacheError> {
        let mut slot = self.conn.lock().await;
        let attempt = async {
            if slot.is_none() {
                *slot = Some(self.open().await?);
            }
            match slot.as_mut() {
                Some(conn) => conn.call(args).await,
                None => Err(CacheError::unavailable("no connection")),
            }
        };

        let result = match timeout(self.io_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::unavailable(format!(
                "timed out after {:?}",
                self.io_timeout
            ))),
        };
        if matches!(
            result,
            Err(CacheError::Unavailable { .. } | CacheError::Protocol { .. })
        ) {
            *slot = None;
        }
        result
    }
}

fn command_name(args: &[&[u8]]) -> String {
    args.first()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .unwrap_or_default()
}

fn expect_ok(command: &str, reply: RespValue) -> Result<(), CacheError> {
    match reply {
        RespValue::SimpleString(_) => Ok(()),
        RespValue::Error(message) => Err(CacheError::command(command, message)),
        other => Err(CacheError::protocol(format!(
            "unexpected {} reply: {:?}",
            command, other
        ))),
    }
}

/// Glob for `SCAN MATCH`; patterns without wildcards match as substrings
fn scan_pattern(pattern: Option<&str>) -> String {
    match pattern {
        None => KEY_SPACE.to_string(),
        Some(p) if p.contains(|c| c == '*' || c == '?') => p.to_string(),
        Some(p) => format!("*{}*", p),
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<QueryResult>, CacheError> {
        let args: [&[u8]; 2] = [b"GET", key.as_bytes()];
        match self.call(&args).await? {
            RespValue::BulkString(Some(data)) => Ok(Some(serde_json::from_slice(&data)?)),
            RespValue::BulkString(None) => Ok(None),
            RespValue::Error(message) => Err(CacheError::command(command_name(&args), message)),
            other => Err(CacheError::protocol(format!("unexpected GET reply: {:?}", other))),
        }
    }

    async fn set(&self, key: &str, value: &QueryResult, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(value)?;
        let millis = ttl.as_millis().max(1).to_string();
        let reply = self
            .call(&[
                b"SET".as_slice(),
                key.as_bytes(),
                payload.as_slice(),
                b"PX",
                millis.as_bytes(),
            ])
            .await?;
        expect_ok("SET", reply)
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<u64, CacheError> {
        let pattern = scan_pattern(pattern);
        let mut cursor = "0".to_string();
        let mut removed = 0u64;

        loop {
            let reply = self
                .call(&[
                    b"SCAN".as_slice(),
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    SCAN_COUNT.as_bytes(),
                ])
                .await?;
            let (next, keys) = scan_reply(reply)?;

            if !keys.is_empty() {
                let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
                args.push(b"DEL");
                args.extend(keys.iter().map(|k| k.as_slice()));
                match self.call(&args).await? {
                    RespValue::Integer(n) => removed += n.max(0) as u64,
                    RespValue::Error(message) => return Err(CacheError::command("DEL", message)),
                    other => {
                        warn!("Unexpected DEL reply: {:?}", other);
                    }
                }
            }

            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

/// `SCAN` replies `[cursor, [key, ...]]`
fn scan_reply(reply: RespValue) -> Result<(String, Vec<Vec<u8>>), CacheError> {
    let invalid = || CacheError::protocol("malformed SCAN reply");
    match reply {
        RespValue::Array(Some(mut parts)) if parts.len() == 2 => {
            let keys = match parts.pop() {
                Some(RespValue::Array(Some(keys))) => keys
                    .iter()
                    .filter_map(|k| k.as_bytes().map(<[u8]>::to_vec))
                    .collect(),
                Some(RespValue::Array(None)) => Vec::new(),
                _ => return Err(invalid()),
            };
            let cursor = parts
                .pop()
                .and_then(|c| c.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()))
                .ok_or_else(invalid)?;
            Ok((cursor, keys))
        }
        RespValue::Error(message) => Err(CacheError::command("SCAN", message)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Row, SqlValue};
    use crate::utils::glob_match;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    type Store = Arc<std::sync::Mutex<BTreeMap<String, Bytes>>>;

    /// Minimal single-connection RESP server answering the commands the
    /// cache sends
    async fn fake_redis(store: Store) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        while let Some((frame, used)) = resp::parse(&buf).unwrap() {
                            buf.advance(used);
                            let reply = answer(&store, frame);
                            let mut out = BytesMut::new();
                            resp::encode_value(&reply, &mut out);
                            socket.write_all(&out).await.unwrap();
                        }
                        if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn answer(store: &Store, frame: RespValue) -> RespValue {
        let RespValue::Array(Some(parts)) = frame else {
            return RespValue::Error("ERR expected array".to_string());
        };
        let args: Vec<String> = parts
            .iter()
            .map(|p| String::from_utf8_lossy(p.as_bytes().unwrap_or_default()).into_owned())
            .collect();
        let mut store = store.lock().unwrap();

        match args[0].as_str() {
            "AUTH" | "SELECT" => RespValue::SimpleString("OK".to_string()),
            "GET" => RespValue::BulkString(store.get(&args[1]).cloned()),
            "SET" => {
                let value = parts[2].as_bytes().unwrap_or_default();
                store.insert(args[1].clone(), Bytes::copy_from_slice(value));
                RespValue::SimpleString("OK".to_string())
            }
            "SCAN" => {
                let keys = store
                    .keys()
                    .filter(|k| glob_match(&args[3], k))
                    .map(|k| RespValue::BulkString(Some(Bytes::from(k.clone()))))
                    .collect();
                RespValue::Array(Some(vec![
                    RespValue::BulkString(Some(Bytes::from("0"))),
                    RespValue::Array(Some(keys)),
                ]))
            }
            "DEL" => {
                let removed = args[1..].iter().filter(|k| store.remove(*k).is_some()).count();
                RespValue::Integer(removed as i64)
            }
            other => RespValue::Error(format!("ERR unknown command '{}'", other)),
        }
    }

    fn result(id: i64) -> QueryResult {
        QueryResult::new(vec![Row::from_pairs([("id", SqlValue::Int(id))])])
    }

    #[test]
    fn test_parse_url() {
        let endpoint = RedisEndpoint::parse("redis://:s3cret@10.0.1.20:6380/2").unwrap();
        assert_eq!(endpoint.addr, "10.0.1.20:6380");
        assert_eq!(endpoint.username, None);
        assert_eq!(endpoint.password.as_deref(), Some("s3cret"));
        assert_eq!(endpoint.db, 2);

        let endpoint = RedisEndpoint::parse("redis://cache.internal").unwrap();
        assert_eq!(endpoint.addr, "cache.internal:6379");
        assert_eq!(endpoint.db, 0);

        let endpoint = RedisEndpoint::parse("redis://app:pw@cache:6379").unwrap();
        assert_eq!(endpoint.username.as_deref(), Some("app"));

        assert!(RedisEndpoint::parse("http://cache:6379").is_err());
        assert!(RedisEndpoint::parse("redis://cache:notaport").is_err());
    }

    #[test]
    fn test_scan_pattern() {
        assert_eq!(scan_pattern(None), "q:*");
        assert_eq!(scan_pattern(Some("q:areas*")), "q:areas*");
        assert_eq!(scan_pattern(Some("areas")), "*areas*");
    }

    #[tokio::test]
    async fn test_round_trip_and_clear() {
        let store: Store = Arc::default();
        let addr = fake_redis(store.clone()).await;
        let cache =
            RedisCache::from_url(&format!("redis://:pw@{}/1", addr), Duration::from_secs(2))
                .unwrap();

        assert_eq!(cache.get("q:areas:01").await.unwrap(), None);
        cache
            .set("q:areas:01", &result(1), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("q:properties:02", &result(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("q:areas:01").await.unwrap(), Some(result(1)));

        assert_eq!(cache.clear(Some("q:areas*")).await.unwrap(), 1);
        assert_eq!(cache.get("q:areas:01").await.unwrap(), None);
        assert_eq!(cache.clear(None).await.unwrap(), 1);
        assert!(store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache =
            RedisCache::from_url(&format!("redis://{}", addr), Duration::from_secs(1)).unwrap();
        let error = cache.get("q:areas:01").await.unwrap_err();
        assert!(matches!(error, CacheError::Unavailable { .. }));
    }
}
