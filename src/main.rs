use anyhow::{anyhow, Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use replica_router::analyzer::{AnalysisContext, ConsistencyLevel};
use replica_router::config::{Config, ConfigError};
use replica_router::{QueryAnalyzer, QueryRouter};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replica-router")]
#[command(about = "Replication-aware query routing for primary/replica PostgreSQL clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Replica Router Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router and serve health and metrics endpoints
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print how a statement would be routed
    Analyze {
        /// SQL text to analyze
        sql: String,
        /// Configuration supplying the cacheable and volatile table lists
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Requested consistency (strong, bounded, eventual)
        #[arg(long)]
        consistency: Option<String>,
        /// Session id used for read-your-writes stickiness
        #[arg(long)]
        session: Option<String>,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_router(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Analyze {
            sql,
            config,
            consistency,
            session,
        } => analyze_statement(sql, config, consistency, session)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_router(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting replica-router v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!(
        "Primary {}:{} with {} replicas",
        config.database.primary.host,
        config.database.primary.port,
        config.database.replicas.len()
    );

    let router = replica_router::connect(&config)
        .await
        .context("Failed to connect to cluster")?;
    router.start().await.context("Failed to start router")?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(router.clone());

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!("Serving /health and /metrics on {}", config.server.listen_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down router");
    router.shutdown().await;

    if let Err(e) = served {
        error!("Observability server failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

async fn health_handler(State(router): State<QueryRouter>) -> impl IntoResponse {
    let report = router.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics_handler(State(router): State<QueryRouter>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        router.prometheus_metrics().await,
    )
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  replica-router run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!(
                "  Primary: {}:{}",
                config.database.primary.host, config.database.primary.port
            );
            println!("  Replicas: {} instances", config.database.replicas.len());
            for (name, node) in config
                .database
                .replica_names()
                .iter()
                .zip(&config.database.replicas)
            {
                println!("    {}: {}:{}", name, node.host, node.port);
            }
            println!(
                "  Pool: {}..{} connections",
                config.pool.min_size, config.pool.max_size
            );
            println!("  Balancing: {:?}", config.routing.balancing);
            println!(
                "  Shared cache: {}",
                config.cache.shared_url.as_deref().unwrap_or("disabled")
            );
            println!("  Metrics address: {}", config.server.listen_addr);
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn analyze_statement(
    sql: String,
    config: Option<PathBuf>,
    consistency: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let analyzer = match config {
        Some(path) => QueryAnalyzer::from_config(&Config::load_from_file(&path)?.cache),
        None => QueryAnalyzer::from_config(&Config::default().cache),
    };
    let requested = consistency
        .map(|level| level.parse::<ConsistencyLevel>())
        .transpose()
        .map_err(|e| anyhow!(e))?;
    let context = AnalysisContext {
        session_id: session,
        user_id: None,
        requested,
    };

    let analysis = analyzer.analyze(&sql, &[], &context);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn show_version() {
    println!("replica-router v{}", env!("CARGO_PKG_VERSION"));
    println!("Replication-aware query routing for primary/replica PostgreSQL clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Read/write splitting with lag-bounded replica selection");
    println!("  • Read-your-writes session stickiness");
    println!("  • Two-tier result cache with Redis backing");
    println!("  • Replica recovery and automatic primary promotion");
    println!("  • Prometheus metrics for lag, pools and query counts");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
