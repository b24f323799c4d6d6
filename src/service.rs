//! Orchestration facade tying the catalog, object store, pipeline queue,
//! cache, rate limiter, and query engine together.
//!
//! This is the layer the HTTP server and CLI both call. All cross-cutting
//! ordering lives here: uploads are rate-limited, validated, and quota
//! checked before any bytes are stored; questions are rate-limited before
//! the cache is consulted, and the cache before the query engine.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{AnswerCache, CacheSavings};
use crate::catalog::{Catalog, RegisterOutcome};
use crate::config::Config;
use crate::error::{DomainError, DomainResult};
use crate::index::VectorIndex;
use crate::models::{Answer, Document, QuotaUsage, RateDecision, StageEvent};
use crate::pipeline::PipelineQueue;
use crate::query::{new_conversation_id, AskOptions, QueryEngine};
use crate::rate_limit::RateLimiter;
use crate::storage::ObjectStore;

const SUPPORTED_EXTENSIONS: &[&str] = &[".pdf", ".txt", ".md"];

/// Rough per-page embedding volume, used only for the dedup savings log line.
const EMBEDDING_TOKENS_PER_PAGE: i64 = 500;

/// Wires the full service from configuration: database, object store,
/// providers, pipeline workers, cache, and limiter. Requires a running
/// tokio runtime (workers are spawned here).
pub async fn build(config: &Config) -> anyhow::Result<Arc<AppService>> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::run_migrations(&pool).await?;

    let catalog = Catalog::new(pool.clone());
    let store: Arc<dyn ObjectStore> = Arc::new(crate::storage::FsStore::new(
        config.storage.root.clone(),
    ));
    let extractor: Arc<dyn crate::extract::TextExtractor> =
        Arc::new(crate::extract::DefaultExtractor);
    let embedder: Arc<dyn crate::embedding::EmbeddingService> =
        Arc::from(crate::embedding::create_service(&config.embedding)?);
    let llm: Arc<dyn crate::llm::LlmService> = Arc::from(crate::llm::create_service(&config.llm)?);
    let index: Arc<dyn VectorIndex> = Arc::new(crate::index::SqliteVectorIndex::new(pool.clone()));

    let deps = Arc::new(crate::pipeline::PipelineDeps {
        catalog: catalog.clone(),
        store: store.clone(),
        extractor,
        embedder: embedder.clone(),
        index: index.clone(),
        config: config.pipeline.clone(),
    });
    let queue = crate::pipeline::spawn_workers(deps);

    let cache = AnswerCache::new(pool.clone(), config.cache.clone());
    let limiter = RateLimiter::new(pool.clone(), config.rate_limit.clone());
    spawn_janitor(limiter.clone(), cache.clone());
    let engine = QueryEngine::new(
        pool,
        catalog.clone(),
        embedder,
        index.clone(),
        llm,
        config.retrieval.clone(),
    );

    Ok(Arc::new(AppService::new(
        config.clone(),
        catalog,
        store,
        index,
        queue,
        cache,
        limiter,
        engine,
    )))
}

const JANITOR_INTERVAL_SECS: u64 = 600;

/// Periodically drops ended rate windows and expired cache entries. Both
/// tables only ever gain rows on the request path and would grow without
/// bound in a long-running server.
fn spawn_janitor(limiter: RateLimiter, cache: AnswerCache) {
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(JANITOR_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(err) = limiter.prune(now).await {
                tracing::warn!(%err, "rate window prune failed");
            }
            match cache.sweep_expired(now).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "expired cache entries swept");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "cache sweep failed"),
            }
        }
    });
}

#[derive(Debug)]
pub struct UploadRequest {
    pub owner_id: String,
    pub role: String,
    pub title: Option<String>,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub document: Document,
    /// True when the content was already indexed and this upload became a
    /// reference with no pipeline work.
    pub deduplicated: bool,
}

#[derive(Debug)]
pub struct AskRequest {
    pub document_id: String,
    pub actor_id: String,
    pub role: String,
    pub question: String,
    pub conversation_id: Option<String>,
    pub language: Option<String>,
    pub page_anchor: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: Answer,
    pub conversation_id: String,
    pub rate: RateDecision,
}

#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub document: Document,
    /// Latest event per stage for the document's original.
    pub stages: Vec<StageEvent>,
}

pub struct AppService {
    config: Config,
    catalog: Catalog,
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn VectorIndex>,
    queue: PipelineQueue,
    cache: AnswerCache,
    limiter: RateLimiter,
    engine: QueryEngine,
}

impl AppService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        catalog: Catalog,
        store: Arc<dyn ObjectStore>,
        index: Arc<dyn VectorIndex>,
        queue: PipelineQueue,
        cache: AnswerCache,
        limiter: RateLimiter,
        engine: QueryEngine,
    ) -> Self {
        Self {
            config,
            catalog,
            store,
            index,
            queue,
            cache,
            limiter,
            engine,
        }
    }

    /// Registers an upload. Returns immediately once the document is queued;
    /// deduplicated uploads skip the queue entirely.
    pub async fn upload(&self, req: UploadRequest) -> DomainResult<UploadReceipt> {
        let decision = self
            .limiter
            .check_and_consume(&req.owner_id, "upload", &req.role)
            .await;
        if !decision.allowed {
            return Err(rate_limited(decision));
        }

        validate_upload(&req, self.config.storage.max_upload_bytes)?;

        let usage = self.quota(&req.owner_id, &req.role).await?;
        if usage.is_exceeded() {
            return Err(DomainError::quota(&usage));
        }

        let content_hash = Catalog::content_hash(&req.bytes);
        let storage_ref = self.store.put(&content_hash, &req.bytes).await?;

        let outcome = self
            .catalog
            .register(
                &req.owner_id,
                req.title.as_deref(),
                &req.filename,
                &content_hash,
                &storage_ref,
            )
            .await?;

        match outcome {
            RegisterOutcome::Created(document) => {
                self.queue.enqueue(&document.id)?;
                tracing::info!(document_id = %document.id, "document queued for processing");
                Ok(UploadReceipt {
                    document,
                    deduplicated: false,
                })
            }
            RegisterOutcome::Deduplicated(document) => {
                let pages = document.page_count.unwrap_or(0);
                tracing::info!(
                    document_id = %document.id,
                    original_id = ?document.is_duplicate_of,
                    pages,
                    embedding_tokens_saved = pages * EMBEDDING_TOKENS_PER_PAGE,
                    "upload deduplicated, extraction and embedding skipped"
                );
                Ok(UploadReceipt {
                    document,
                    deduplicated: true,
                })
            }
            RegisterOutcome::OwnerConflict { existing_id } => {
                Err(DomainError::Conflict { existing_id })
            }
        }
    }

    /// Answers a question about a document: rate limit, then cache, then
    /// the query engine. References resolve to their original for both the
    /// cache key and retrieval, so identical content shares one cache.
    pub async fn ask(&self, req: AskRequest) -> DomainResult<AskResponse> {
        let question = req.question.trim();
        if question.is_empty() {
            return Err(DomainError::validation("question must not be empty"));
        }
        let doc = self.get_document(&req.document_id).await?;

        let decision = self
            .limiter
            .check_and_consume(&req.actor_id, "query", &req.role)
            .await;
        if !decision.allowed {
            return Err(rate_limited(decision));
        }

        let original = self.resolve_original(&doc).await?;
        if !matches!(original.status, crate::models::DocumentStatus::Ready) {
            return Err(DomainError::NotReady {
                status: original.status.as_str().to_string(),
            });
        }

        let language = req.language.clone().unwrap_or_else(|| "English".to_string());
        let conversation_id = req
            .conversation_id
            .clone()
            .unwrap_or_else(new_conversation_id);

        let key = AnswerCache::key(&original.id, original.content_version, question, &language);
        let model = self.config.llm.model.as_deref();
        if let Some(answer) = self.cache.get(&key, &original.id, model).await {
            return Ok(AskResponse {
                answer,
                conversation_id,
                rate: decision,
            });
        }

        let opts = AskOptions {
            owner_id: req.actor_id.clone(),
            conversation_id: Some(conversation_id.clone()),
            language,
            page_anchor: req.page_anchor,
        };
        let answer = self.engine.answer(&original.id, question, &opts).await?;

        let ttl = self.cache.ttl_for(question);
        self.cache.put(&key, &original.id, &answer, ttl).await;

        Ok(AskResponse {
            answer,
            conversation_id,
            rate: decision,
        })
    }

    /// Document plus latest per-stage progress. References report their
    /// original's pipeline progress.
    pub async fn document_view(&self, document_id: &str) -> DomainResult<DocumentView> {
        let document = self.get_document(document_id).await?;
        let original_id = document
            .is_duplicate_of
            .clone()
            .unwrap_or_else(|| document.id.clone());
        let stages = self.catalog.latest_stage_events(&original_id).await?;
        Ok(DocumentView { document, stages })
    }

    pub async fn quota(&self, owner_id: &str, role: &str) -> DomainResult<QuotaUsage> {
        let current = self.catalog.count_owner_documents(owner_id).await?;
        let limit = self.config.quota.document_limit(role);
        Ok(QuotaUsage::new(current, limit))
    }

    /// Drops a document's chunks and vectors, bumps its content version and
    /// requeues it. Only originals can be reprocessed.
    pub async fn reprocess(&self, document_id: &str) -> DomainResult<Document> {
        let doc = self.get_document(document_id).await?;
        if doc.is_reference() {
            return Err(DomainError::validation(
                "reference documents cannot be reprocessed; reprocess the original",
            ));
        }
        self.index.delete_document(&doc.id).await?;
        let reset = self.catalog.reset_for_reprocessing(&doc.id).await?;
        self.queue.enqueue(&reset.id)?;
        tracing::info!(document_id = %reset.id, version = reset.content_version, "document requeued");
        Ok(reset)
    }

    /// Read-only rate metadata for the query class. Never consumes a slot;
    /// used to stamp rate information onto non-429 ask outcomes.
    pub async fn query_rate(&self, actor_id: &str, role: &str) -> RateDecision {
        self.limiter.peek(actor_id, "query", role).await
    }

    pub async fn cache_savings(&self) -> DomainResult<CacheSavings> {
        Ok(self.cache.savings().await?)
    }

    async fn get_document(&self, id: &str) -> DomainResult<Document> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("document {id}")))
    }

    async fn resolve_original(&self, doc: &Document) -> DomainResult<Document> {
        match &doc.is_duplicate_of {
            None => Ok(doc.clone()),
            Some(original_id) => self.get_document(original_id).await,
        }
    }
}

fn validate_upload(req: &UploadRequest, max_bytes: usize) -> DomainResult<()> {
    if req.bytes.is_empty() {
        return Err(DomainError::validation("uploaded file is empty"));
    }
    if req.bytes.len() > max_bytes {
        return Err(DomainError::validation(format!(
            "file is {} bytes, limit is {}",
            req.bytes.len(),
            max_bytes
        )));
    }
    let lower = req.filename.to_ascii_lowercase();
    if !SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Err(DomainError::validation(format!(
            "unsupported file type: {} (supported: pdf, txt, md)",
            req.filename
        )));
    }
    Ok(())
}

fn rate_limited(decision: RateDecision) -> DomainError {
    DomainError::RateLimited {
        limit: decision.limit,
        remaining: decision.remaining,
        reset_at: decision.reset_at,
        retry_after_secs: decision.retry_after_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_req(filename: &str, bytes: &[u8]) -> UploadRequest {
        UploadRequest {
            owner_id: "alice".to_string(),
            role: "basic".to_string(),
            title: None,
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_validate_rejects_empty_and_oversized() {
        assert!(matches!(
            validate_upload(&upload_req("a.pdf", b""), 100),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            validate_upload(&upload_req("a.pdf", &[0u8; 101]), 100),
            Err(DomainError::Validation(_))
        ));
        assert!(validate_upload(&upload_req("a.pdf", &[0u8; 100]), 100).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsupported_types() {
        assert!(matches!(
            validate_upload(&upload_req("slides.pptx", b"x"), 100),
            Err(DomainError::Validation(_))
        ));
        for name in ["a.pdf", "b.txt", "c.md", "UPPER.PDF"] {
            assert!(validate_upload(&upload_req(name, b"x"), 100).is_ok(), "{name}");
        }
    }
}
