use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use nodemesh::config::{Config, NodeRole};
use nodemesh::{ActionRegistry, ApiServer, Enrollment, KeywordIndex, NodeMesh};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "nodemesh-server")]
#[command(about = "nodemesh master/child node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "nodemesh.toml")]
    config: String,

    /// Address to bind to, overrides server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,

    /// Run as master or child, overrides node.role
    #[arg(long, value_parser = ["master", "child"])]
    role: Option<String>,

    /// Log format: pretty or json
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

fn init_tracing(config: &Config, format: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.observability.log_level.clone()),
    );
    let format = format.unwrap_or(&config.observability.log_format);

    if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn metrics_routes() -> Result<Router> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_create(Path::new(&args.config))?;
    if let Some(bind) = &args.bind {
        config.server.bind_addr = bind.clone();
    }
    if let Some(role) = &args.role {
        config.node.role = if role == "child" {
            NodeRole::Child
        } else {
            NodeRole::Master
        };
    }
    config.validate()?;

    init_tracing(&config, args.log_format.as_deref());

    tracing::info!(
        "Starting nodemesh {} node {} on {}",
        config.node.role.as_str(),
        config.node.node_id,
        config.server.bind_addr
    );
    tracing::info!("Config file: {}", args.config);
    if !config.node.enabled {
        tracing::warn!("Node features are disabled; serving local requests only");
    }

    // Local data served to other nodes
    let index = Arc::new(KeywordIndex::new());
    let actions = Arc::new(ActionRegistry::new());
    index.register_actions(&actions);

    let mesh = Arc::new(NodeMesh::new(config.clone(), index, actions)?);

    let mut server = ApiServer::new(mesh.clone());
    if config.observability.metrics_enabled {
        server = server.with_routes(metrics_routes()?);
        tracing::info!("Prometheus metrics at GET /metrics");
    }

    let monitor = if config.node.enabled {
        mesh.start_health_monitor()
    } else {
        None
    };

    let enrollment = if config.node.enabled && config.node.role == NodeRole::Child {
        let enrollment = Arc::new(Enrollment::new(&config)?);
        enrollment.clone().start();
        Some(enrollment)
    } else {
        None
    };

    let maintenance = {
        let mesh = mesh.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                let tokens = mesh.auth().purge_expired();
                let buckets = mesh.rate_limiter().cleanup();
                tracing::debug!(
                    "Maintenance: {} expired refresh tokens, {} idle rate limit buckets dropped",
                    tokens,
                    buckets
                );
            }
        })
    };

    let addr = config.server.bind_addr.clone();
    tokio::select! {
        result = server.serve(&addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    maintenance.abort();
    if let Some(enrollment) = enrollment {
        enrollment.stop();
    }
    if monitor.is_some() {
        mesh.health_monitor().stop();
    }

    Ok(())
}
