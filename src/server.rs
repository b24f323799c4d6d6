//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload a document (base64 content) |
//! | `GET`  | `/documents/{id}` | Document status with per-stage progress |
//! | `POST` | `/documents/{id}/ask` | Ask a question about a document |
//! | `POST` | `/documents/{id}/reprocess` | Reset and requeue an original |
//! | `GET`  | `/owners/{id}/quota` | Upload quota usage for an owner |
//! | `GET`  | `/cache/savings` | Aggregate cache savings counters |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "retry after 540s" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `duplicate_reference`
//! (409), `not_ready` (409), `quota_exceeded` (403), `rate_limited` (429,
//! with a `Retry-After` header), `stage_failure`/`internal` (500),
//! `backend_unavailable` (503). Ask responses carry a `rate` object with
//! the actor's current budget on every outcome, error or not.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::DomainError;
use crate::models::RateDecision;
use crate::service::{AppService, AskRequest, UploadRequest};

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config, service: Arc<AppService>) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload))
        .route("/documents/{id}", get(handle_document))
        .route("/documents/{id}/ask", post(handle_ask))
        .route("/documents/{id}/reprocess", post(handle_reprocess))
        .route("/owners/{id}/quota", get(handle_quota))
        .route("/cache/savings", get(handle_savings))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service);

    tracing::info!("listening on http://{}", config.server.bind);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    /// Rate-limit metadata, present on `rate_limited` responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    rate: Option<RateInfo>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Serialize)]
struct RateInfo {
    limit: i64,
    remaining: i64,
    reset_at: i64,
    retry_after_secs: i64,
}

impl From<RateDecision> for RateInfo {
    fn from(d: RateDecision) -> Self {
        RateInfo {
            limit: d.limit,
            remaining: d.remaining,
            reset_at: d.reset_at,
            retry_after_secs: d.retry_after_secs,
        }
    }
}

/// Converts a domain error into the HTTP error envelope. Rate-limit
/// denials additionally carry a `Retry-After` header.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    rate: Option<RateInfo>,
}

impl AppError {
    /// Fills in rate metadata when the error itself carried none. A 429
    /// keeps its own numbers.
    fn with_rate(mut self, decision: RateDecision) -> Self {
        if self.rate.is_none() {
            self.rate = Some(decision.into());
        }
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retry_after = self.rate.as_ref().map(|r| r.retry_after_secs);
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
            rate: self.rate,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        let status = match &err {
            DomainError::Validation(_) => StatusCode::BAD_REQUEST,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::Conflict { .. } | DomainError::NotReady { .. } => StatusCode::CONFLICT,
            DomainError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            DomainError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DomainError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::StageFailure { .. } | DomainError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let rate = match &err {
            DomainError::RateLimited {
                limit,
                remaining,
                reset_at,
                retry_after_secs,
            } => Some(RateInfo {
                limit: *limit,
                remaining: *remaining,
                reset_at: *reset_at,
                retry_after_secs: *retry_after_secs,
            }),
            _ => None,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(%err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            rate,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        rate: None,
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct UploadBody {
    owner_id: String,
    #[serde(default = "default_role")]
    role: String,
    title: Option<String>,
    filename: String,
    /// Base64-encoded file bytes.
    content: String,
}

fn default_role() -> String {
    "basic".to_string()
}

async fn handle_upload(
    State(service): State<Arc<AppService>>,
    Json(body): Json<UploadBody>,
) -> Result<impl IntoResponse, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.content)
        .map_err(|_| bad_request("content must be valid base64"))?;

    let receipt = service
        .upload(UploadRequest {
            owner_id: body.owner_id,
            role: body.role,
            title: body.title,
            filename: body.filename,
            bytes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn handle_document(
    State(service): State<Arc<AppService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.document_view(&id).await?))
}

#[derive(Deserialize)]
struct AskBody {
    actor_id: String,
    #[serde(default = "default_role")]
    role: String,
    question: String,
    conversation_id: Option<String>,
    language: Option<String>,
    page_anchor: Option<i64>,
}

/// Ask responses report the actor's rate budget on every outcome: success
/// carries it in the body, errors carry it in the envelope's `rate` field.
async fn handle_ask(
    State(service): State<Arc<AppService>>,
    Path(id): Path<String>,
    Json(body): Json<AskBody>,
) -> Result<impl IntoResponse, AppError> {
    let actor_id = body.actor_id.clone();
    let role = body.role.clone();
    let result = service
        .ask(AskRequest {
            document_id: id,
            actor_id: body.actor_id,
            role: body.role,
            question: body.question,
            conversation_id: body.conversation_id,
            language: body.language,
            page_anchor: body.page_anchor,
        })
        .await;
    match result {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            let rate = service.query_rate(&actor_id, &role).await;
            Err(AppError::from(err).with_rate(rate))
        }
    }
}

async fn handle_reprocess(
    State(service): State<Arc<AppService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let document = service.reprocess(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

#[derive(Deserialize)]
struct QuotaParams {
    #[serde(default = "default_role")]
    role: String,
}

async fn handle_quota(
    State(service): State<Arc<AppService>>,
    Path(id): Path<String>,
    Query(params): Query<QuotaParams>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.quota(&id, &params.role).await?))
}

async fn handle_savings(
    State(service): State<Arc<AppService>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.cache_savings().await?))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peeked() -> RateDecision {
        RateDecision {
            allowed: true,
            limit: 100,
            remaining: 42,
            reset_at: 900,
            retry_after_secs: 0,
        }
    }

    #[test]
    fn test_ask_errors_gain_rate_metadata() {
        let err = AppError::from(DomainError::NotFound("document d1".to_string()))
            .with_rate(peeked());
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let rate = err.rate.expect("rate metadata");
        assert_eq!(rate.limit, 100);
        assert_eq!(rate.remaining, 42);
        assert_eq!(rate.reset_at, 900);
    }

    #[test]
    fn test_rate_limited_keeps_its_own_metadata() {
        let err = AppError::from(DomainError::RateLimited {
            limit: 100,
            remaining: 0,
            reset_at: 900,
            retry_after_secs: 890,
        })
        .with_rate(peeked());
        let rate = err.rate.unwrap();
        assert_eq!(rate.remaining, 0);
        assert_eq!(rate.retry_after_secs, 890);
    }

    #[test]
    fn test_envelope_serializes_rate_only_when_present() {
        let body = ErrorBody {
            error: ErrorDetail {
                code: "not_ready".to_string(),
                message: "still processing".to_string(),
            },
            rate: Some(peeked().into()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["rate"]["limit"], 100);
        assert_eq!(json["error"]["code"], "not_ready");

        let bare = ErrorBody {
            error: ErrorDetail {
                code: "internal".to_string(),
                message: "boom".to_string(),
            },
            rate: None,
        };
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("rate").is_none());
    }
}
