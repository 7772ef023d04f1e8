//! visitgate - visitor-tracking reverse proxy
//!
//! This server handles:
//! - Classification of every public request (crawlers, whitelisted operators, visitors)
//! - Per-address visit ledger and time-based bans
//! - Diversion of banned addresses away from the real site
//! - Forwarding of allowed traffic to the upstream origin
//! - Admin inspection and ban/unban endpoints

mod abuse;
mod client_ip;
mod config;
mod db;
mod redis;
mod routes;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use visitgate_core::{MemoryVisitStore, VisitStore};

#[derive(Parser)]
#[command(name = "visitgate")]
#[command(author, version, about = "Visitor-tracking reverse proxy with time-based bans", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy (default)
    Serve,

    /// Create or upgrade the ledger schema and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,visitgate_server=debug,visitgate_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config::Config::from_env()?).await,
        Commands::Migrate => migrate().await,
    }
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    START_TIME.get_or_init(SystemTime::now);

    tracing::info!("Starting visitgate on {}", config.bind_addr());
    tracing::info!("Target URL: {}", config.target_url);
    tracing::info!("Ban duration: {} hours", config.ban_duration_hours);
    tracing::info!("Allow search bots: {}", config.allow_search_bots);
    tracing::info!("Diversion: {:?} after {:?}", config.diversion_strategy, config.redirect_delay);

    // Initialize ledger
    let store: Arc<dyn VisitStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url, config.db_max_connections, config.storage_timeout)?;
            tracing::info!("Running database migrations...");
            let report = db::run_migrations(&pool).await;
            if report.is_clean() {
                tracing::info!("Schema ready ({} applied, {} already present)", report.applied, report.skipped);
            } else {
                tracing::warn!("Schema setup had {} failed statements, continuing", report.failed);
            }
            Arc::new(db::PgVisitStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory ledger (state is lost on restart)");
            Arc::new(MemoryVisitStore::new())
        }
    };

    // Initialize Redis
    let redis_client = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            match redis::init_client(url).await {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!("Redis unavailable, rate limiting per instance: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set, admin routes will reject all requests");
    }

    let addr: SocketAddr = config.bind_addr().parse()?;
    let state = routes::AppState::new(config, store, redis_client)?;

    // Periodic cleanup of local rate-limit windows
    let limiter = state.rate_limiter.clone();
    let window = Duration::from_secs(state.config.rate_limit_window_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            limiter.cleanup_local(window);
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Schema setup only needs the database
async fn migrate() -> anyhow::Result<()> {
    let url = std::env::var("DATABASE_URL").map_err(|_| config::ConfigError::MissingEnv("DATABASE_URL"))?;

    let timeout = Duration::from_millis(visitgate_core::constants::DEFAULT_STORAGE_TIMEOUT_MS);
    let pool = db::init_pool(&url, 1, timeout)?;
    let report = db::run_migrations(&pool).await;

    tracing::info!(
        "Migration finished: {} applied, {} already present, {} failed",
        report.applied,
        report.skipped,
        report.failed
    );

    if !report.is_clean() {
        anyhow::bail!("{} schema statements failed", report.failed);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

static START_TIME: std::sync::OnceLock<SystemTime> = std::sync::OnceLock::new();

/// Health check endpoint
async fn health_check(State(state): State<routes::AppState>) -> impl IntoResponse {
    let store = state.engine.store();
    let ledger_status = store.ping().await.map(|_| "ok").unwrap_or("error");

    let status = if ledger_status == "ok" { "healthy" } else { "degraded" };

    let uptime = START_TIME
        .get_or_init(SystemTime::now)
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(serde_json::json!({
        "status": status,
        "timestamp": timestamp,
        "uptime_seconds": uptime,
        "ledger": {
            "backend": store.backend_name(),
            "status": ledger_status,
        }
    }))
}
