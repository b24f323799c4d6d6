//! Domain error taxonomy.
//!
//! Synchronous callers (upload, ask) see validation, conflict, quota,
//! not-ready, and rate-limit errors directly. Stage failures during the
//! detached pipeline are never propagated to the original caller; they are
//! recorded in the stage-event log and surface through status queries.
//! Backend outages (cache or rate-limit store) are never surfaced to end
//! users at all — those paths fail open with a warning log.

use crate::models::QuotaUsage;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    /// Bad input: missing file, oversized file, unsupported type, empty question.
    #[error("validation: {0}")]
    Validation(String),

    /// The owner already holds a reference to the same content; carries the
    /// existing document id.
    #[error("document already in collection: {existing_id}")]
    Conflict { existing_id: String },

    /// Upload quota exhausted; carries current/limit for client upgrade prompts.
    #[error("quota exceeded: {current} of {limit}")]
    QuotaExceeded { current: i64, limit: i64 },

    /// Querying a document that is still processing or has failed.
    #[error("document not ready: status is {status}")]
    NotReady { status: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limiter denied the request; carries seconds until the window ends.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        limit: i64,
        remaining: i64,
        reset_at: i64,
        retry_after_secs: i64,
    },

    /// Extraction/embedding/index failure inside the pipeline.
    #[error("stage failure in {stage}: {message}")]
    StageFailure { stage: String, message: String },

    /// Cache or rate-limit backend unavailable. Handled internally by failing
    /// open; only constructed so adapters can report the condition upward.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Anything unexpected from storage or the model backends.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DomainError::Validation(msg.into())
    }

    pub fn quota(usage: &QuotaUsage) -> Self {
        DomainError::QuotaExceeded {
            current: usage.current,
            limit: usage.limit,
        }
    }

    /// Machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "bad_request",
            DomainError::Conflict { .. } => "duplicate_reference",
            DomainError::QuotaExceeded { .. } => "quota_exceeded",
            DomainError::NotReady { .. } => "not_ready",
            DomainError::NotFound(_) => "not_found",
            DomainError::RateLimited { .. } => "rate_limited",
            DomainError::StageFailure { .. } => "stage_failure",
            DomainError::BackendUnavailable(_) => "backend_unavailable",
            DomainError::Internal(_) => "internal",
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
