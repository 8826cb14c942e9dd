//! Knowledge base trigger and read-only queries.
//!
//! - `POST /api/v1/knowledge-base/generate` runs the pipeline once
//! - `GET  /api/v1/knowledge-base/health` checks both stores and the schema
//! - `GET  /api/v1/knowledge-base/status` reports table counts and the
//!   latest execution and quality report
//!
//! A run is spawned onto its own task so that a client disconnect does not
//! abort it halfway; the run lock guard travels with the task.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::AppState;
use crate::config::SUPPORTED_RESOLUTIONS;
use crate::error::PipelineError;
use crate::pipeline::{KnowledgeBaseGenerator, PipelineContext, RunFailure};
use crate::schema::KB_SCHEMAS;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/v1/knowledge-base/generate", post(generate))
        .route("/api/v1/knowledge-base/health", get(health))
        .route("/api/v1/knowledge-base/status", get(status))
}

/// Query parameters of the trigger. Kept as text so that malformed values
/// produce a 400 with a readable message instead of a rejection.
#[derive(Debug, Default, Deserialize)]
struct GenerateQuery {
    cell_resolution: Option<String>,
    days_back: Option<String>,
}

/// Validated overrides; `None` falls back to the configured default.
fn parse_params(params: &GenerateQuery) -> Result<(Option<i32>, Option<u32>), String> {
    // ---
    let present = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let resolution = match present(&params.cell_resolution) {
        None => None,
        Some(raw) => match raw.parse::<i32>() {
            Ok(v) if SUPPORTED_RESOLUTIONS.contains(&v) => Some(v),
            _ => {
                return Err(format!(
                    "cell_resolution must be one of {SUPPORTED_RESOLUTIONS:?}, got '{raw}'"
                ))
            }
        },
    };

    let days_back = match present(&params.days_back) {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) if v > 0 => Some(v),
            _ => return Err(format!("days_back must be a positive integer, got '{raw}'")),
        },
    };

    Ok((resolution, days_back))
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "error": message.into() })),
    )
        .into_response()
}

fn failure_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Cancelled { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure_response(failure: RunFailure) -> Response {
    // ---
    let body = json!({
        "status": "error",
        "execution_id": failure.execution_id,
        "phase": failure.phase,
        "error_kind": failure.error.kind(),
        "error": failure.error.to_string(),
        "elapsed_ms": u64::try_from(failure.elapsed.as_millis()).unwrap_or(u64::MAX),
        "counts": failure.counts,
    });
    (failure_status(&failure.error), Json(body)).into_response()
}

async fn cancel_after(cancel: CancellationToken, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    warn!("Run deadline of {:?} reached, cancelling", timeout);
    cancel.cancel();
}

/// Handle `POST /api/v1/knowledge-base/generate`.
async fn generate(Query(params): Query<GenerateQuery>, State(state): State<AppState>) -> Response {
    // ---
    let (resolution, days_back) = match parse_params(&params) {
        Ok(parsed) => parsed,
        Err(message) => return error_body(StatusCode::BAD_REQUEST, message),
    };

    let Ok(guard) = state.run_lock.clone().try_lock_owned() else {
        return error_body(
            StatusCode::CONFLICT,
            "a knowledge base run is already in progress",
        );
    };

    let settings = state.config.pipeline_settings(resolution, days_back);
    let timeout = state.config.run_timeout;
    let generator = KnowledgeBaseGenerator::new(state.source.clone(), state.target.clone(), settings);
    let cancel = CancellationToken::new();
    let ctx = PipelineContext::new(Utc::now(), cancel.clone());
    info!(
        "POST /api/v1/knowledge-base/generate - execution {} (resolution={}, days_back={})",
        ctx.execution_id,
        generator.settings().resolution,
        generator.settings().days_back
    );

    let task = tokio::spawn(async move {
        let _guard = guard;
        let deadline = tokio::spawn(cancel_after(cancel, timeout));
        let result = generator.run(&ctx).await;
        deadline.abort();
        result
    });

    match task.await {
        Ok(Ok(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(Err(failure)) => {
            error!("{}", failure);
            failure_response(failure)
        }
        Err(e) => {
            error!("Knowledge base task aborted: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "knowledge base run aborted")
        }
    }
}

fn check<T>(result: &Result<T, impl ToString>) -> Value {
    match result {
        Ok(_) => json!({ "status": "ok" }),
        Err(e) => json!({ "status": "error", "error": e.to_string() }),
    }
}

/// Handle `GET /api/v1/knowledge-base/health`.
async fn health(State(state): State<AppState>) -> Response {
    // ---
    let source = state.source.ping().await;
    let target = state.target.ping().await;
    let schemas = state.target.schema_health().await;

    let expected = KB_SCHEMAS.len() as i64;
    let schema_check = match &schemas {
        Ok(count) if *count == expected => json!({ "status": "ok", "count": count, "expected": expected }),
        Ok(count) => json!({ "status": "missing", "count": count, "expected": expected }),
        Err(e) => json!({ "status": "error", "error": e.to_string(), "expected": expected }),
    };

    let healthy = source.is_ok() && target.is_ok() && matches!(schemas, Ok(n) if n == expected);
    let overall = if healthy { "healthy" } else { "degraded" };
    let body = json!({
        "status": overall,
        "checks": {
            "source_database": check(&source),
            "target_database": check(&target),
            "schemas": schema_check,
        },
        "timestamp": Utc::now(),
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// Handle `GET /api/v1/knowledge-base/status`.
///
/// Each section is queried independently; a failing one is reported under
/// `errors` and left null.
async fn status(State(state): State<AppState>) -> Response {
    // ---
    let mut errors: BTreeMap<&'static str, String> = BTreeMap::new();

    let tables = state
        .target
        .table_counts()
        .await
        .map_err(|e| errors.insert("tables", e.to_string()))
        .ok();
    let execution = state
        .target
        .latest_execution()
        .await
        .map_err(|e| errors.insert("last_execution", e.to_string()))
        .ok()
        .flatten();
    let quality = state
        .target
        .latest_quality_report()
        .await
        .map_err(|e| errors.insert("quality", e.to_string()))
        .ok()
        .flatten();

    let body = json!({
        "tables": tables,
        "last_execution": execution,
        "quality": quality,
        "errors": errors,
        "timestamp": Utc::now(),
    });
    (StatusCode::OK, Json(body)).into_response()
}
