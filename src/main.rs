//! Application entry point for the `radar-knowledge-base` service.
//!
//! This binary orchestrates the startup sequence of the knowledge base
//! generator, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing PostgreSQL pools for the legacy source and the target
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! The schema is not created here: every run migrates it idempotently as
//! its first phase.
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – knowledge base PostgreSQL connection string
//! - `SOURCE_DATABASE_URL` (**required**) – legacy report database
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`config`] for the pipeline tunables.
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP) by
//! delegating configuration parsing to `config`, persistence to `store`,
//! the run itself to `pipeline` and route registration to `routes`.
use std::{env, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

mod assign;
mod config;
mod error;
mod features;
mod grid;
mod models;
mod normalize;
mod pipeline;
mod quality;
mod routes;
mod schema;
mod store;

pub use config::Config;

// Re-exported for routes/*.rs so they depend on their parent module rather
// than on the layout of `store`.
pub use store::{SourceStore, TargetStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let source_pool = connect("source", &cfg.source_db_url, cfg.db_pool_max).await?;
    let target_pool = connect("target", &cfg.db_url, cfg.db_pool_max).await?;

    let source: Arc<dyn SourceStore> = Arc::new(store::postgres::PgSourceStore::new(source_pool));
    let target: Arc<dyn TargetStore> = Arc::new(store::postgres::PgTargetStore::new(target_pool));

    let addr = cfg.listen_addr;

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(routes::AppState::new(source, target, cfg));

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open a connection pool, naming the database in the error.
async fn connect(name: &str, url: &str, max_connections: u32) -> Result<PgPool> {
    // ---
    tracing::info!("Attempting to connect to {} database", name);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {} database: {}", name, e))?;

    tracing::info!("Successfully connected to {} database", name);
    Ok(pool)
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off  
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
