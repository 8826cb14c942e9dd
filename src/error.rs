//! Error taxonomy for the knowledge base pipeline.
//!
//! Per-record (`ValidationError`) and per-batch (`BatchWriteError`) failures
//! are recovered inside a phase and only show up in its counters. The
//! variants of `PipelineError` are phase-terminal and abort the run.

use std::fmt;

use crate::models::Phase;

// ---

/// Failure of a single store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (I/O, TLS, pool exhaustion).
    #[error("store unreachable: {0}")]
    Connectivity(#[source] sqlx::Error),

    /// The store was reached but the statement failed.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// The store refused the operation for a non-SQL reason.
    #[error("operation rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // ---
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connectivity(err),
            other => StoreError::Query(other),
        }
    }
}

/// A write batch that failed; its rows are skipped and counted as failures.
#[derive(Debug, thiserror::Error)]
#[error("batch write to {table} failed for {rows} rows: {source}")]
pub struct BatchWriteError {
    pub table: &'static str,
    pub rows: usize,
    #[source]
    pub source: StoreError,
}

/// A quality metric outside its configured bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBreach {
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
}

impl fmt::Display for ThresholdBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={:.4} (threshold {:.4})",
            self.metric, self.value, self.threshold
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("quality thresholds breached: {}", format_breaches(.breaches))]
pub struct QualityThresholdError {
    pub breaches: Vec<ThresholdBreach>,
}

fn format_breaches(breaches: &[ThresholdBreach]) -> String {
    breaches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Phase-terminal failure. Aborts the remaining phases of a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("schema migration failed: {0}")]
    Schema(#[source] StoreError),

    #[error("store unreachable during {phase}: {source}")]
    Connectivity {
        phase: Phase,
        #[source]
        source: StoreError,
    },

    #[error("store operation failed during {phase}: {source}")]
    Store {
        phase: Phase,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    QualityThreshold(#[from] QualityThresholdError),

    #[error("{phase} cancelled before completion")]
    Cancelled { phase: Phase },
}

impl PipelineError {
    /// Classify a store failure that a phase cannot recover from.
    pub fn from_store(phase: Phase, source: StoreError) -> Self {
        // ---
        if source.is_connectivity() {
            PipelineError::Connectivity { phase, source }
        } else if phase == Phase::Migrate {
            PipelineError::Schema(source)
        } else {
            PipelineError::Store { phase, source }
        }
    }

    /// Short machine-readable kind, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Schema(_) => "schema",
            PipelineError::Connectivity { .. } => "connectivity",
            PipelineError::Store { .. } => "store",
            PipelineError::QualityThreshold(_) => "quality_threshold",
            PipelineError::Cancelled { .. } => "cancelled",
        }
    }
}
