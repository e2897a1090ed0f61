//! HTTP request handlers: diagnostics report, health and error payloads.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::error;

use edgetune_core::probe::ReportSnapshot;

use crate::state::{PerfError, SharedService};

// ============================================================
// Error payloads
// ============================================================

/// Body of every non-200 diagnostics answer.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct ErrorBody {
    /// One of `rate_limited`, `check_failed`, `check_timeout`, `no_report`.
    pub(crate) error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) retry_after_seconds: Option<f64>,
}

impl IntoResponse for PerfError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            PerfError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            PerfError::CheckFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "check_failed"),
            PerfError::NoReport(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no_report"),
            PerfError::CheckTimeout => (StatusCode::GATEWAY_TIMEOUT, "check_timeout"),
        };
        let retry_after = match &self {
            PerfError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let body = ErrorBody {
            error: error.to_string(),
            retry_after_seconds: retry_after.map(|d| d.as_secs_f64()),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(wait) = retry_after {
            // Retry-After carries whole seconds, rounded up
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Diagnostics report
// ============================================================

#[utoipa::path(
    get,
    path = "/perf",
    responses(
        (status = 200, description = "Current device report (cached up to the TTL)", body = ReportSnapshot),
        (status = 429, description = "Global rate limit hit", body = ErrorBody),
        (status = 500, description = "Probe failed or left no report", body = ErrorBody),
        (status = 504, description = "Probe timed out", body = ErrorBody)
    )
)]
pub(crate) async fn handle_perf(State(service): State<SharedService>) -> Response {
    let served = match service.request().await {
        Ok(served) => served,
        Err(e) => return e.into_response(),
    };
    let json = match serde_json::to_string(served.snapshot()) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to serialize report");
            return PerfError::CheckFailed(e.to_string()).into_response();
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-cache", served.cache_label())
        .body(Body::from(json))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[utoipa::path(
    get,
    path = "/perf/raw",
    responses(
        (status = 200, description = "Alias of /perf", body = ReportSnapshot),
        (status = 429, description = "Global rate limit hit", body = ErrorBody),
        (status = 500, description = "Probe failed or left no report", body = ErrorBody),
        (status = 504, description = "Probe timed out", body = ErrorBody)
    )
)]
pub(crate) async fn handle_perf_raw(state: State<SharedService>) -> Response {
    handle_perf(state).await
}
