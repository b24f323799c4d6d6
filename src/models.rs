//! Core data models used throughout ragdock.
//!
//! These types represent the documents, chunks, and pipeline records that flow
//! through the ingestion and question-answering pipeline.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

/// Lifecycle status of a document. Advances forward only:
/// pending → processing → ready | failed. The single sanctioned regression
/// is an explicit reprocess, which re-enters `processing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Ordering rank used to enforce forward-only transitions.
    pub const fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Pending => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::Ready => 2,
            DocumentStatus::Failed => 2,
        }
    }
}

/// Catalog record for one logical uploaded document.
///
/// A document is either an *original* (`is_duplicate_of` is `None`; the
/// pipeline processed its bytes) or a *reference* pointing at the original
/// that shares its `content_hash`. References never trigger extraction or
/// embedding work.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub filename: String,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub page_count: Option<i64>,
    pub storage_ref: Option<String>,
    pub is_duplicate_of: Option<String>,
    /// Bumped on every reprocess; part of the answer-cache key so cached
    /// answers never outlive a content change.
    pub content_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn is_reference(&self) -> bool {
        self.is_duplicate_of.is_some()
    }
}

/// One indexed unit of a document's content (page granularity).
#[derive(Debug, Clone, FromRow)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_number: i64,
    pub raw_text: String,
    /// Header/footer boilerplate stripped; this is what gets embedded.
    pub cleaned_text: String,
    /// Set only after a successful embed+index step. `None` means the chunk
    /// is independently retryable.
    pub vector_id: Option<String>,
    pub word_count: i64,
    pub has_images: bool,
    pub has_tables: bool,
    pub has_equations: bool,
}

/// Pipeline stage for the append-only event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extraction,
    Embedding,
    Completion,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Embedding => "embedding",
            Stage::Completion => "completion",
        }
    }
}

/// Status of a stage within the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Append-only log entry recording pipeline progress for one stage.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StageEvent {
    pub id: i64,
    pub document_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub progress_percent: i64,
    pub message: String,
    pub error: Option<String>,
    pub created_at: i64,
}

/// One retrieved chunk backing an answer, with per-source attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub page: i64,
    pub snippet: String,
    pub score: f64,
}

/// The result of answering a question against a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub tokens_used: i64,
    pub cached: bool,
}

/// Outcome of a rate-limit check for one actor/endpoint-class pair.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Unix seconds at which the current window ends.
    pub reset_at: i64,
    /// Seconds until the window rolls over; only meaningful on denial.
    pub retry_after_secs: i64,
}

/// Upload quota usage for one owner. `limit == i64::MAX` means unlimited.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub current: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percentage: f64,
}

impl QuotaUsage {
    pub fn new(current: i64, limit: i64) -> Self {
        let remaining = limit.saturating_sub(current);
        let percentage = if limit == i64::MAX || limit == 0 {
            0.0
        } else {
            (current as f64 / limit as f64) * 100.0
        };
        Self {
            current,
            limit,
            remaining,
            percentage,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.current >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rank_forward_only() {
        assert!(DocumentStatus::Pending.rank() < DocumentStatus::Processing.rank());
        assert!(DocumentStatus::Processing.rank() < DocumentStatus::Ready.rank());
        assert_eq!(DocumentStatus::Ready.rank(), DocumentStatus::Failed.rank());
    }

    #[test]
    fn test_quota_unlimited_sentinel() {
        let q = QuotaUsage::new(42, i64::MAX);
        assert!(!q.is_exceeded());
        assert_eq!(q.percentage, 0.0);
        assert_eq!(q.remaining, i64::MAX - 42);
    }

    #[test]
    fn test_quota_percentage() {
        let q = QuotaUsage::new(5, 10);
        assert!((q.percentage - 50.0).abs() < 1e-9);
        assert_eq!(q.remaining, 5);
        assert!(!q.is_exceeded());
        assert!(QuotaUsage::new(10, 10).is_exceeded());
    }
}
