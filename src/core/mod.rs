/// Core abstractions shared by the connection manager, monitor and router
pub mod balancer;
pub mod connection;
pub mod events;
pub mod node;
pub mod pool;
pub mod session;

pub use balancer::{LagAware, LoadBalancingAlgorithm, RoundRobin};
pub use connection::{ClusterStats, ConnectionManager, ManagedConnection, RecoveryPolicy};
pub use events::{ClusterEvent, EventBus};
pub use node::{Node, NodeSnapshot};
pub use pool::{Connection, NodePool, PoolStatus};
pub use session::StickinessManager;

use crate::error::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a node currently plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// A query parameter or result cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Float(v) => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(v) => Some(*v != 0),
            SqlValue::Text(s) => match s.as_str() {
                "t" | "true" | "on" | "1" => Some(true),
                "f" | "false" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A result row with named columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        let (columns, values): (Vec<String>, Vec<SqlValue>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(SqlValue::as_bool)
    }

    /// Fetch a column that must be present
    pub fn try_get(&self, column: &str) -> RouterResult<&SqlValue> {
        self.get(column)
            .ok_or_else(|| RouterError::decode(format!("missing column '{}'", column)))
    }
}

/// Binds a raw [`Row`] to a caller-chosen type
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> RouterResult<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> RouterResult<Self> {
        Ok(row.clone())
    }
}

/// Rows returned by a statement plus the affected row count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<R = Row> {
    pub rows: Vec<R>,
    pub row_count: u64,
}

impl<R> QueryResult<R> {
    pub fn new(rows: Vec<R>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    pub fn with_row_count(rows: Vec<R>, row_count: u64) -> Self {
        Self { rows, row_count }
    }

    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            row_count: 0,
        }
    }

    pub fn first(&self) -> Option<&R> {
        self.rows.first()
    }
}

impl QueryResult<Row> {
    /// Decode every row into `T`
    pub fn decode<T: FromRow>(&self) -> RouterResult<QueryResult<T>> {
        let rows = self
            .rows
            .iter()
            .map(T::from_row)
            .collect::<RouterResult<Vec<T>>>()?;
        Ok(QueryResult {
            rows,
            row_count: self.row_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Property {
        id: i64,
        address: String,
    }

    impl FromRow for Property {
        fn from_row(row: &Row) -> RouterResult<Self> {
            Ok(Self {
                id: row
                    .get_i64("id")
                    .ok_or_else(|| RouterError::decode("id"))?,
                address: row
                    .get_str("address")
                    .ok_or_else(|| RouterError::decode("address"))?
                    .to_string(),
            })
        }
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::from_pairs([
            ("id", SqlValue::Int(7)),
            ("lag", SqlValue::Float(12.5)),
            ("in_recovery", SqlValue::Text("t".to_string())),
        ]);

        assert_eq!(row.len(), 3);
        assert_eq!(row.get_i64("id"), Some(7));
        assert_eq!(row.get_f64("lag"), Some(12.5));
        assert_eq!(row.get_bool("in_recovery"), Some(true));
        assert!(row.get("missing").is_none());
        assert!(row.try_get("missing").is_err());
    }

    #[test]
    fn test_decode_rows() {
        let result = QueryResult::new(vec![Row::from_pairs([
            ("id", SqlValue::from(1)),
            ("address", SqlValue::from("1 High Street")),
        ])]);

        let decoded = result.decode::<Property>().unwrap();
        assert_eq!(decoded.row_count, 1);
        assert_eq!(
            decoded.rows[0],
            Property {
                id: 1,
                address: "1 High Street".to_string()
            }
        );
    }

    #[test]
    fn test_option_into_null() {
        let value: SqlValue = Option::<i64>::None.into();
        assert!(value.is_null());
        let value: SqlValue = Some("x").into();
        assert_eq!(value, SqlValue::Text("x".to_string()));
    }
}
