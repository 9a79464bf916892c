//! Public HTTP surface: submit a tape, read job status and results, cancel,
//! and a health report that includes the cached prover compatibility probe.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gateway_types::{now_unix_s, validate_tape, JobStatus, PublicJobView, TapeError};
use prover_client::ProverClient;
use serde::{Deserialize, Serialize};
use storage::blobs::BlobStore;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, CreateJobOutcome, JobCounts};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub blobs: Arc<dyn BlobStore>,
    pub prover: Arc<ProverClient>,
    pub max_tape_bytes: usize,
    pub api_key: Option<String>,
    pub started_at: u64,
}

pub async fn serve(state: AppState, bind_addr: &str, cors_allowed_origin: Option<String>) -> anyhow::Result<()> {
    let app = router(state, cors_allowed_origin);
    let listener = TcpListener::bind(bind_addr).await?;
    info!("gateway listening on {bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState, cors_allowed_origin: Option<String>) -> Router {
    let cors = match cors_allowed_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin(value)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(Any),
            Err(_) => {
                warn!("ignoring unparseable CORS origin {origin:?}");
                CorsLayer::new()
            }
        },
        None => CorsLayer::new(),
    };

    let body_limit = state.max_tape_bytes + 4096;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/proofs/jobs", post(submit_job))
        .route("/api/proofs/jobs/:job_id", get(get_job).delete(cancel_job))
        .route("/api/proofs/jobs/:job_id/result", get(get_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── auth ──

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn is_request_authorized(headers: &HeaderMap, required: Option<&str>) -> bool {
    let Some(required) = required else {
        return true;
    };
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if key == required {
            return true;
        }
    }
    bearer_token(headers) == Some(required)
}

fn unauthorized() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized")
}

// ── responses ──

#[derive(Debug, Serialize)]
struct JobCreatedResponse {
    success: bool,
    status_url: String,
    job: PublicJobView,
}

#[derive(Debug, Serialize)]
struct BusyResponse {
    success: bool,
    error: &'static str,
    error_code: &'static str,
    active_job: PublicJobView,
}

#[derive(Debug, Serialize)]
struct JobViewResponse {
    success: bool,
    job: PublicJobView,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_secs: u64,
    ruleset: &'static str,
    rules_digest: u32,
    auth_required: bool,
    max_tape_bytes: usize,
    jobs: JobCounts,
    prover: serde_json::Value,
}

fn error_response(status: StatusCode, message: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": message.into(),
            "error_code": code,
        })),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    warn!("request failed: {e:#}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error",
        "internal_error",
    )
}

fn status_url(job_id: Uuid) -> String {
    format!("/api/proofs/jobs/{job_id}")
}

// ── handlers ──

#[derive(Debug, Default, Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    claimant: Option<String>,
}

async fn submit_job(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_request_authorized(&headers, state.api_key.as_deref()) {
        return unauthorized();
    }

    let Some(claimant) = query
        .claimant
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "claimant query parameter is required",
            "missing_claimant",
        );
    };

    let metadata = match validate_tape(&body, state.max_tape_bytes) {
        Ok(metadata) => metadata,
        Err(e) => {
            let status = match e {
                TapeError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return error_response(status, e.to_string(), e.code());
        }
    };

    match state.coordinator.create_job(&body, metadata, claimant).await {
        Ok(CreateJobOutcome::Accepted(record)) => (
            StatusCode::ACCEPTED,
            Json(JobCreatedResponse {
                success: true,
                status_url: status_url(record.job_id),
                job: record.public_view(),
            }),
        )
            .into_response(),
        Ok(CreateJobOutcome::Busy(active)) => (
            StatusCode::CONFLICT,
            Json(BusyResponse {
                success: false,
                error: "a proof job is already active",
                error_code: "prover_busy",
                active_job: active.public_view(),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_request_authorized(&headers, state.api_key.as_deref()) {
        return unauthorized();
    }
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id", "invalid_job_id");
    };

    let record = match state.coordinator.get_job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "job not found", "job_not_found")
        }
        Err(e) => return internal_error(e),
    };

    // Freshen in-flight jobs with a single cheap poll before answering.
    let record = if !record.is_terminal() && record.prover.prover_job_id.is_some() {
        if let Err(e) = state.coordinator.kick_alarm().await {
            warn!(job_id = %job_id, "kick poll failed: {e:#}");
        }
        match state.coordinator.get_job(job_id).await {
            Ok(Some(fresh)) => fresh,
            _ => record,
        }
    } else {
        record
    };

    Json(JobViewResponse {
        success: true,
        job: record.public_view(),
    })
    .into_response()
}

async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_request_authorized(&headers, state.api_key.as_deref()) {
        return unauthorized();
    }
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id", "invalid_job_id");
    };

    let record = match state.coordinator.get_job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "job not found", "job_not_found")
        }
        Err(e) => return internal_error(e),
    };

    if record.status != JobStatus::Succeeded {
        return error_response(
            StatusCode::CONFLICT,
            "proof has not succeeded",
            "result_not_ready",
        );
    }
    let Some(result) = record.result else {
        return error_response(
            StatusCode::NOT_FOUND,
            "result artifact missing",
            "result_missing",
        );
    };

    match state.blobs.get(&result.artifact_key).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "result artifact missing",
            "result_missing",
        ),
        Err(e) => internal_error(e.into()),
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_request_authorized(&headers, state.api_key.as_deref()) {
        return unauthorized();
    }
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id", "invalid_job_id");
    };

    let record = match state.coordinator.get_job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "job not found", "job_not_found")
        }
        Err(e) => return internal_error(e),
    };
    if record.is_terminal() {
        return error_response(
            StatusCode::CONFLICT,
            "job already reached a terminal state",
            "job_terminal",
        );
    }

    if let Err(e) = state
        .coordinator
        .mark_failed(job_id, "cancelled by client".to_string())
        .await
    {
        return internal_error(e);
    }

    match state.coordinator.get_job(job_id).await {
        Ok(Some(record)) => Json(JobViewResponse {
            success: true,
            job: record.public_view(),
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "job not found", "job_not_found"),
        Err(e) => internal_error(e),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let jobs = match state.coordinator.job_counts().await {
        Ok(counts) => counts,
        Err(e) => return internal_error(e),
    };

    let prover = match state.prover.health_check().await {
        Ok(health) => serde_json::json!({
            "status": "compatible",
            "image_id": health.image_id,
            "ruleset": health.ruleset,
            "rules_digest": health.rules_digest,
        }),
        Err(e) => serde_json::json!({
            "status": "degraded",
            "error": e.to_string(),
        }),
    };

    Json(HealthResponse {
        status: "ok",
        service: "proof-gateway",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: now_unix_s().saturating_sub(state.started_at),
        ruleset: gateway_types::RULESET,
        rules_digest: gateway_types::EXPECTED_RULES_DIGEST,
        auth_required: state.api_key.is_some(),
        max_tape_bytes: state.max_tape_bytes,
        jobs,
        prover,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_parses_and_rejects() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(bearer_token(&headers), Some("secret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn auth_open_when_no_key_configured() {
        assert!(is_request_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn auth_accepts_either_header_and_rejects_wrong_key() {
        let mut headers = HeaderMap::new();
        assert!(!is_request_authorized(&headers, Some("secret")));

        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(is_request_authorized(&headers, Some("secret")));

        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(!is_request_authorized(&headers, Some("secret")));

        headers.remove("x-api-key");
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(is_request_authorized(&headers, Some("secret")));
    }
}
