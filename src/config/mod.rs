/// Configuration management for replica-router
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main replica-router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster topology and credentials
    pub database: DatabaseConfig,
    /// Per-node pool sizing
    pub pool: PoolConfig,
    /// Pool-level error recovery
    pub recovery: RecoveryConfig,
    /// Replication monitor configuration
    pub monitor: MonitorConfig,
    /// Query routing configuration
    pub routing: RoutingConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// Observability endpoint configuration
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster topology and shared credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    /// The single writable node
    pub primary: NodeConfig,
    /// Read-only followers, in promotion order
    #[serde(default)]
    pub replicas: Vec<NodeConfig>,
}

/// A single database endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Explicit node name; replicas default to `replica-N`
    #[serde(default)]
    pub name: Option<String>,
}

/// Connection pool sizing, applied to every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Idle connections older than this are closed on the next acquire
    pub idle_timeout_ms: u64,
    /// Bound on both connecting and waiting for a free slot
    pub connect_timeout_ms: u64,
}

/// Backoff recovery after a pool-level error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Promote a replica when the primary cannot be recovered
    pub promote_on_failure: bool,
}

/// Replication monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Per-check timeout for each node query
    pub check_timeout_ms: u64,
    /// Replicas lagging beyond this are unhealthy
    pub max_acceptable_lag_ms: u64,
    /// Replicas lagging beyond this raise a high-lag event
    pub alert_threshold_ms: u64,
}

/// Replica selection strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    RoundRobin,
    #[default]
    LagAware,
}

/// Query routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// How long a session reads from the primary after writing
    pub stickiness_window_ms: u64,
    /// Lag threshold for bounded reads without an explicit bound
    pub default_max_lag_ms: u64,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound on replica-to-primary fallbacks per second
    pub max_fallbacks_per_sec: u32,
    #[serde(default)]
    pub balancing: BalancingStrategy,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    /// Local tier capacity in entries
    pub max_entries: usize,
    pub sweep_interval_ms: u64,
    /// Low-churn tables whose reads may be cached
    #[serde(default)]
    pub cacheable_tables: Vec<String>,
    /// Volatile tables that are never cached
    #[serde(default)]
    pub volatile_tables: Vec<String>,
    /// Optional shared tier, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default)]
    pub shared_url: Option<String>,
    /// Independent TTL for the shared tier
    pub shared_ttl_ms: u64,
}

/// Observability endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address serving /health and /metrics
    pub listen_addr: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                user: "postgres".to_string(),
                password: None,
                dbname: "postgres".to_string(),
                primary: NodeConfig {
                    host: "127.0.0.1".to_string(),
                    port: 5432,
                    name: None,
                },
                replicas: Vec::new(),
            },
            pool: PoolConfig {
                min_size: 2,
                max_size: 20,
                idle_timeout_ms: 30_000,
                connect_timeout_ms: 2_000,
            },
            recovery: RecoveryConfig {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                promote_on_failure: true,
            },
            monitor: MonitorConfig {
                interval_ms: 5_000,
                check_timeout_ms: 2_000,
                max_acceptable_lag_ms: 10_000,
                alert_threshold_ms: 5_000,
            },
            routing: RoutingConfig {
                stickiness_window_ms: 30_000,
                default_max_lag_ms: 1_000,
                default_max_retries: 3,
                retry_base_delay_ms: 1_000,
                retry_max_delay_ms: 5_000,
                max_fallbacks_per_sec: 100,
                balancing: BalancingStrategy::LagAware,
            },
            cache: CacheConfig {
                enabled: true,
                default_ttl_ms: 60_000,
                max_entries: 1_000,
                sweep_interval_ms: 60_000,
                cacheable_tables: Vec::new(),
                volatile_tables: vec![
                    "sessions".to_string(),
                    "activity_logs".to_string(),
                ],
                shared_url: None,
                shared_ttl_ms: 300_000,
            },
            server: ServerConfig {
                listen_addr: "0.0.0.0:9187".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl NodeConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            name: None,
        }
    }
}

impl DatabaseConfig {
    /// Resolved replica names in configuration order
    pub fn replica_names(&self) -> Vec<String> {
        self.replicas
            .iter()
            .enumerate()
            .map(|(index, node)| {
                node.name
                    .clone()
                    .unwrap_or_else(|| format!("replica-{}", index + 1))
            })
            .collect()
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Override credentials and endpoints from `REPLICA_ROUTER_*` variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup("REPLICA_ROUTER_DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("REPLICA_ROUTER_DB_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(dbname) = lookup("REPLICA_ROUTER_DB_NAME") {
            self.database.dbname = dbname;
        }
        if let Some(primary) = lookup("REPLICA_ROUTER_PRIMARY") {
            self.database.primary = parse_endpoint(&primary)?;
        }
        if let Some(replicas) = lookup("REPLICA_ROUTER_REPLICAS") {
            self.database.replicas = replicas
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_endpoint)
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(url) = lookup("REPLICA_ROUTER_CACHE_URL") {
            self.cache.shared_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(level) = lookup("REPLICA_ROUTER_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate topology
        if self.database.primary.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "primary host cannot be empty".to_string(),
            ));
        }

        let mut names = self.database.replica_names();
        names.push("primary".to_string());
        names.sort();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::ValidationError(
                "node names must be unique".to_string(),
            ));
        }

        for replica in &self.database.replicas {
            if replica.host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica host cannot be empty".to_string(),
                ));
            }
        }

        // Validate pool config
        if self.pool.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool max_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.min_size > self.pool.max_size {
            return Err(ConfigError::ValidationError(
                "pool min_size cannot exceed max_size".to_string(),
            ));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pool connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate monitor config
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.check_timeout_ms >= self.monitor.interval_ms {
            return Err(ConfigError::ValidationError(
                "monitor check_timeout_ms must be less than interval_ms".to_string(),
            ));
        }

        if self.monitor.alert_threshold_ms > self.monitor.max_acceptable_lag_ms {
            return Err(ConfigError::ValidationError(
                "monitor alert_threshold_ms cannot exceed max_acceptable_lag_ms".to_string(),
            ));
        }

        // Validate routing config
        if self.routing.retry_base_delay_ms > self.routing.retry_max_delay_ms {
            return Err(ConfigError::ValidationError(
                "routing retry_base_delay_ms cannot exceed retry_max_delay_ms".to_string(),
            ));
        }

        if self.routing.max_fallbacks_per_sec == 0 {
            return Err(ConfigError::ValidationError(
                "routing max_fallbacks_per_sec must be greater than 0".to_string(),
            ));
        }

        // Validate cache config
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache max_entries must be greater than 0".to_string(),
            ));
        }

        if self.cache.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "cache sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.cache.shared_url {
            if !url.starts_with("redis://") {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid shared cache url: {}",
                    url
                )));
            }
        }

        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.server.listen_addr
                ))
            })?;

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut config = Config::default();
        config.database.user = "app".to_string();
        config.database.dbname = "planning".to_string();
        config.database.primary = NodeConfig::new("10.0.1.10", 5432);
        config.database.replicas = vec![
            NodeConfig::new("10.0.1.11", 5432),
            NodeConfig::new("10.0.1.12", 5432),
        ];
        config.cache.cacheable_tables = vec![
            "properties".to_string(),
            "areas".to_string(),
            "planning_applications".to_string(),
        ];
        config.cache.shared_url = Some("redis://10.0.1.20:6379/0".to_string());

        config.save_to_file(path)
    }
}

/// Parse `host:port` into a node endpoint
fn parse_endpoint(endpoint: &str) -> Result<NodeConfig, ConfigError> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        ConfigError::ValidationError(format!(
            "Invalid endpoint format '{}': must be host:port",
            endpoint
        ))
    })?;

    let port = port.parse::<u16>().map_err(|_| {
        ConfigError::ValidationError(format!("Invalid port in endpoint '{}'", endpoint))
    })?;

    Ok(NodeConfig::new(host, port))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.stickiness_window_ms, 30_000);
        assert_eq!(config.routing.default_max_retries, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Test invalid pool sizing
        config.pool.max_size = 0;
        assert!(config.validate().is_err());

        config.pool.max_size = 10;
        assert!(config.validate().is_ok());

        config.monitor.alert_threshold_ms = config.monitor.max_acceptable_lag_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let mut config = Config::default();
        config.database.replicas = vec![
            NodeConfig::new("10.0.0.2", 5432),
            NodeConfig {
                host: "10.0.0.3".to_string(),
                port: 5432,
                name: Some("replica-1".to_string()),
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replica_names() {
        let mut config = Config::default();
        config.database.replicas = vec![
            NodeConfig::new("10.0.0.2", 5432),
            NodeConfig {
                host: "10.0.0.3".to_string(),
                port: 5432,
                name: Some("standby_east".to_string()),
            },
        ];
        assert_eq!(
            config.database.replica_names(),
            vec!["replica-1".to_string(), "standby_east".to_string()]
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REPLICA_ROUTER_PRIMARY", "db-primary:6432"),
            ("REPLICA_ROUTER_REPLICAS", "db-r1:5432, db-r2:5433"),
            ("REPLICA_ROUTER_DB_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.primary, NodeConfig::new("db-primary", 6432));
        assert_eq!(config.database.replicas.len(), 2);
        assert_eq!(config.database.replicas[1].port, 5433);
        assert_eq!(config.database.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_override_rejects_bad_endpoint() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "REPLICA_ROUTER_PRIMARY").then(|| "no-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
        assert!(loaded_config
            .cache
            .cacheable_tables
            .contains(&"properties".to_string()));
    }
}
