//! Provenance Synchronizer Server
//!
//! Main entry point for the provenance synchronizer.
//! This binary sets up the journal, services and background workers, and
//! serves `/health` and `/metrics` with graceful shutdown.

mod config;
mod metrics;
mod telemetry;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use provenance_service::{GitCli, HttpCatalog, RegistryClient, ArtifactCatalog, Services};
use provenance_store::{create_pool, InMemoryJournal, Journal, PoolConfig, SqliteJournal, IN_MEMORY_URL};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use config::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory
    #[arg(short, long, env = "CONFIG_DIR", default_value = "config")]
    config_dir: String,

    /// Environment (development, production, etc.)
    #[arg(short, long, env = "ENVIRONMENT", default_value = "development")]
    environment: String,

    /// Server host
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Journal URL (`memory` or a sqlite URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Artifact registry base URL
    #[arg(long, env = "REGISTRY_URL")]
    registry_url: Option<String>,
}

/// Shared state of the HTTP handlers
#[derive(Clone)]
struct AppState {
    services: Services,
    journal: Arc<dyn Journal>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = ServerConfig::load_or_default(&args.config_dir, &args.environment);

    // Override with command-line arguments
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database_url) = args.database_url {
        config.store.url = database_url;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if let Some(registry_url) = args.registry_url {
        config.registry.base_url = registry_url;
    }

    let telemetry_config = if std::env::var_os("LOG_FORMAT").is_some() {
        telemetry::TelemetryConfig::from_env()
    } else {
        telemetry::TelemetryConfig::from(&config.logging)
    };
    telemetry::init_with_config(telemetry_config);
    config.validate().context("Invalid configuration")?;
    metrics::init_metrics();

    info!("Starting Provenance Synchronizer");
    info!("Environment: {}", args.environment);
    info!("Server: {}", config.bind_address());
    info!("Registry: {}", config.registry.base_url);
    info!("Journal: {}", config.store.url);

    let journal = setup_journal(&config).await?;
    let services = setup_services(&config, Arc::clone(&journal))?;

    let shutdown = CancellationToken::new();
    let pipeline_handle = services.pipeline.spawn(shutdown.clone());
    let resync_handle = {
        let resync = Arc::clone(&services.resync);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { resync.run(shutdown).await })
    };

    let app = build_router(AppState {
        services: services.clone(),
        journal,
    });

    let http_addr: SocketAddr = config
        .bind_address()
        .parse()
        .context("Invalid HTTP bind address")?;

    info!("HTTP Server listening on http://{}", http_addr);

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .context("Failed to bind HTTP server")?;

    let http_result = if config.server.graceful_shutdown {
        let token = shutdown.clone();
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                token.cancel();
            })
            .await
            .context("HTTP Server error")
    } else {
        axum::serve(http_listener, app)
            .await
            .context("HTTP Server error")
    };
    shutdown.cancel();

    let timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    info!("Waiting up to {} seconds for background work", timeout.as_secs());
    let drained = tokio::time::timeout(timeout, async {
        let _ = pipeline_handle.await;
        let _ = resync_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Background work did not stop in time");
    }

    http_result?;
    info!("Server shutdown complete");
    Ok(())
}

/// Open the configured journal
async fn setup_journal(config: &ServerConfig) -> Result<Arc<dyn Journal>> {
    if config.store.url == IN_MEMORY_URL {
        warn!("Using the in-memory journal; state is lost on restart");
        return Ok(Arc::new(InMemoryJournal::new()));
    }

    info!("Connecting to journal database");
    let pool_config = PoolConfig::new(&config.store.url)
        .max_connections(config.store.max_connections)
        .enable_logging(config.logging.level != "error");
    let pool = create_pool(&pool_config)
        .await
        .context("Failed to create journal connection pool")?;

    let journal = SqliteJournal::new(pool);
    journal.init().await.context("Failed to initialize journal schema")?;
    info!("Journal database ready");
    Ok(Arc::new(journal))
}

/// Build the registry, catalog and commit source, then wire the services
fn setup_services(config: &ServerConfig, journal: Arc<dyn Journal>) -> Result<Services> {
    let registry = RegistryClient::new(config.registry_client_config()?)
        .context("Failed to create registry client")?;

    let catalog: Arc<dyn ArtifactCatalog> = match &config.catalog.base_url {
        Some(base_url) => {
            let base_url = Url::parse(base_url).context("Invalid catalog URL")?;
            Arc::new(
                HttpCatalog::new(
                    base_url,
                    &config.registry.user_agent,
                    Duration::from_secs(config.registry.timeout_seconds),
                )
                .context("Failed to create catalog client")?,
            )
        }
        None => {
            let catalog = config.static_catalog()?;
            info!(artifacts = catalog.len(), "Using static catalog");
            Arc::new(catalog)
        }
    };

    let commits = GitCli::new(
        config.resolution.checkout_dir.clone(),
        Duration::from_secs(config.resolution.timeout_seconds),
    );

    Services::new(
        journal,
        Arc::new(registry),
        catalog,
        Arc::new(commits),
        config.service_settings(),
    )
    .context("Failed to start services")
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.journal.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    metrics::refresh(&state.services);
    match metrics::render_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

/// Graceful shutdown signal handler
///
/// Waits for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
