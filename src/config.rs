//! Configuration loader for the `radar-knowledge-base` service.
//!
//! Centralizes every runtime setting and its default, loading from
//! environment variables (with optional `.env` file support provided by the
//! caller). Values are validated here so that the pipeline never sees an
//! out-of-range resolution, batch size or threshold.
//!
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::pipeline::PipelineSettings;
use crate::quality::QualityThresholds;
use crate::grid::StudyArea;

/// Resolutions (meters) the grid can be generated at.
pub const SUPPORTED_RESOLUTIONS: [i32; 2] = [500, 1000];

/// Parse an optional environment variable into `$ty` with a default value.
macro_rules! parse_env {
    ($get:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $get($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($get:expr, $var_name:expr) => {
        $get($var_name)
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Knowledge base (target) PostgreSQL connection string.
    pub db_url: String,

    /// Legacy report (source) PostgreSQL connection string.
    pub source_db_url: String,

    /// Maximum number of connections per pool.
    pub db_pool_max: u32,

    pub listen_addr: SocketAddr,

    /// Default grid resolution in meters.
    pub cell_resolution: i32,

    /// Requested rows per write batch; shrunk further to the store's bound.
    pub batch_size: usize,

    /// Default processing window in days.
    pub days_back: u32,

    /// Deadline applied to every triggered run.
    pub run_timeout: Duration,

    pub thresholds: QualityThresholds,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – knowledge base PostgreSQL connection string
/// - `SOURCE_DATABASE_URL` – legacy report PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` (5), `LISTEN_ADDR` (`0.0.0.0:8080`)
/// - `KB_CELL_RESOLUTION` (500), `KB_BATCH_SIZE` (500), `KB_DAYS_BACK` (365)
/// - `KB_RUN_TIMEOUT_SECS` (1800)
/// - `KB_MIN_SPATIAL_COVERAGE` (0.10), `KB_MAX_DUPLICATION_RATE` (0.50)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    load_with(|name| env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
pub fn load_with<F>(get: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let db_url = require_env!(get, "DATABASE_URL");
    let source_db_url = require_env!(get, "SOURCE_DATABASE_URL");
    let db_pool_max = parse_env!(get, "DB_POOL_MAX", u32, 5);
    let listen_addr = parse_env!(
        get,
        "LISTEN_ADDR",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );
    let cell_resolution = parse_env!(get, "KB_CELL_RESOLUTION", i32, 500);
    let batch_size = parse_env!(get, "KB_BATCH_SIZE", usize, 500);
    let days_back = parse_env!(get, "KB_DAYS_BACK", u32, 365);
    let run_timeout_secs = parse_env!(get, "KB_RUN_TIMEOUT_SECS", u64, 1800);
    let min_spatial_coverage = parse_env!(get, "KB_MIN_SPATIAL_COVERAGE", f64, 0.10);
    let max_duplication_rate = parse_env!(get, "KB_MAX_DUPLICATION_RATE", f64, 0.50);

    if !SUPPORTED_RESOLUTIONS.contains(&cell_resolution) {
        bail!("KB_CELL_RESOLUTION must be one of {SUPPORTED_RESOLUTIONS:?}, got {cell_resolution}");
    }
    if batch_size == 0 {
        bail!("KB_BATCH_SIZE must be positive");
    }
    if days_back == 0 {
        bail!("KB_DAYS_BACK must be positive");
    }
    if run_timeout_secs == 0 {
        bail!("KB_RUN_TIMEOUT_SECS must be positive");
    }
    for (name, value) in [
        ("KB_MIN_SPATIAL_COVERAGE", min_spatial_coverage),
        ("KB_MAX_DUPLICATION_RATE", max_duplication_rate),
    ] {
        if !(0.0..=1.0).contains(&value) {
            bail!("{name} must be within [0, 1], got {value}");
        }
    }

    Ok(Config {
        db_url,
        source_db_url,
        db_pool_max,
        listen_addr,
        cell_resolution,
        batch_size,
        days_back,
        run_timeout: Duration::from_secs(run_timeout_secs),
        thresholds: QualityThresholds {
            min_spatial_coverage,
            max_duplication_rate,
        },
    })
}

/// Replace the password of a connection URL with `****`.
fn mask_password(url: &str) -> String {
    // ---
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // `scheme://host` has its only colon before the slashes
            if !url[colon_pos..at_pos].starts_with("://") {
                return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}

impl Config {
    /// Pipeline settings for a run, with optional per-request overrides.
    pub fn pipeline_settings(&self, resolution: Option<i32>, days_back: Option<u32>) -> PipelineSettings {
        PipelineSettings {
            area: StudyArea::CAMPINAS,
            resolution: resolution.unwrap_or(self.cell_resolution),
            days_back: days_back.unwrap_or(self.days_back),
            batch_size: self.batch_size,
            thresholds: self.thresholds,
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the database passwords while showing all configuration values
    /// that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL            : {}", mask_password(&self.db_url));
        tracing::info!("  SOURCE_DATABASE_URL     : {}", mask_password(&self.source_db_url));
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  LISTEN_ADDR             : {}", self.listen_addr);
        tracing::info!("  KB_CELL_RESOLUTION      : {}", self.cell_resolution);
        tracing::info!("  KB_BATCH_SIZE           : {}", self.batch_size);
        tracing::info!("  KB_DAYS_BACK            : {}", self.days_back);
        tracing::info!("  KB_RUN_TIMEOUT_SECS     : {}", self.run_timeout.as_secs());
        tracing::info!("  KB_MIN_SPATIAL_COVERAGE : {}", self.thresholds.min_spatial_coverage);
        tracing::info!("  KB_MAX_DUPLICATION_RATE : {}", self.thresholds.max_duplication_rate);
    }
}
