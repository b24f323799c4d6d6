//! End-to-end tests over the service facade: upload, dedup, background
//! processing, cached question answering, rate limiting, and reprocessing.
//!
//! Providers are replaced with deterministic fakes; everything else (catalog,
//! pipeline workers, vector index, cache, limiter) runs against a shared
//! in-memory SQLite database exactly as in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ragdock::cache::AnswerCache;
use ragdock::catalog::Catalog;
use ragdock::config::{
    CacheConfig, Config, DbConfig, EmbeddingConfig, LlmConfig, PipelineConfig, QuotaConfig,
    RateLimitConfig, RetrievalConfig, ServerConfig, StorageConfig, WindowLimit,
};
use ragdock::db::connect_memory;
use ragdock::embedding::EmbeddingService;
use ragdock::error::DomainError;
use ragdock::index::SqliteVectorIndex;
use ragdock::llm::{ChatMessage, Completion, LlmService};
use ragdock::migrate::run_migrations;
use ragdock::models::DocumentStatus;
use ragdock::pipeline::{spawn_workers, PipelineDeps};
use ragdock::query::QueryEngine;
use ragdock::rate_limit::RateLimiter;
use ragdock::service::{AppService, AskRequest, UploadRequest};
use ragdock::storage::MemoryStore;

struct UnitEmbedder;

#[async_trait]
impl EmbeddingService for UnitEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
    fn model_name(&self) -> &str {
        "unit-embed"
    }
    fn dims(&self) -> usize {
        3
    }
}

struct CountingLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmService for CountingLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(messages.last().unwrap().content.contains("[Page"));
        Ok(Completion {
            text: "Cells are the basic unit of life.".to_string(),
            tokens_used: 200,
        })
    }
    fn model_name(&self) -> &str {
        "counting-llm"
    }
}

fn test_config(query_limit: i64) -> Config {
    let mut classes = HashMap::new();
    let mut query = HashMap::new();
    query.insert(
        "basic".to_string(),
        WindowLimit {
            limit: query_limit,
            window_secs: 900,
        },
    );
    classes.insert("query".to_string(), query);

    Config {
        db: DbConfig {
            path: ":memory:".into(),
        },
        storage: StorageConfig {
            root: "/tmp/unused".into(),
            max_upload_bytes: 1024 * 1024,
        },
        embedding: EmbeddingConfig::default(),
        llm: LlmConfig::default(),
        pipeline: PipelineConfig::default(),
        retrieval: RetrievalConfig::default(),
        cache: CacheConfig::default(),
        rate_limit: RateLimitConfig {
            enabled: true,
            classes,
        },
        quota: QuotaConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn build_service(config: Config) -> (Arc<AppService>, Arc<CountingLlm>) {
    let pool = connect_memory().await.unwrap();
    run_migrations(&pool).await.unwrap();

    let catalog = Catalog::new(pool.clone());
    let store = Arc::new(MemoryStore::default());
    let embedder: Arc<dyn EmbeddingService> = Arc::new(UnitEmbedder);
    let llm = Arc::new(CountingLlm {
        calls: AtomicUsize::new(0),
    });
    let index = Arc::new(SqliteVectorIndex::new(pool.clone()));

    let deps = Arc::new(PipelineDeps {
        catalog: catalog.clone(),
        store: store.clone(),
        extractor: Arc::new(ragdock::extract::DefaultExtractor),
        embedder: embedder.clone(),
        index: index.clone(),
        config: config.pipeline.clone(),
    });
    let queue = spawn_workers(deps);

    let cache = AnswerCache::new(pool.clone(), config.cache.clone());
    let limiter = RateLimiter::new(pool.clone(), config.rate_limit.clone());
    let engine = QueryEngine::new(
        pool,
        catalog.clone(),
        embedder,
        index.clone(),
        llm.clone() as Arc<dyn LlmService>,
        config.retrieval.clone(),
    );

    let service = Arc::new(AppService::new(
        config, catalog, store, index, queue, cache, limiter, engine,
    ));
    (service, llm)
}

fn upload_req(owner: &str, filename: &str, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        owner_id: owner.to_string(),
        role: "basic".to_string(),
        title: None,
        filename: filename.to_string(),
        bytes: bytes.to_vec(),
    }
}

fn ask_req(document_id: &str, actor: &str, question: &str) -> AskRequest {
    AskRequest {
        document_id: document_id.to_string(),
        actor_id: actor.to_string(),
        role: "basic".to_string(),
        question: question.to_string(),
        conversation_id: None,
        language: None,
        page_anchor: None,
    }
}

async fn wait_until_done(service: &AppService, document_id: &str) -> DocumentStatus {
    for _ in 0..100 {
        let view = service.document_view(document_id).await.unwrap();
        match view.document.status {
            DocumentStatus::Ready | DocumentStatus::Failed => return view.document.status,
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("document {document_id} never finished processing");
}

const NOTES: &[u8] = b"Cells are the smallest unit of life.\n\nThey contain organelles.";

#[tokio::test]
async fn test_upload_processes_in_background() {
    let (service, _llm) = build_service(test_config(100)).await;

    let receipt = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    assert!(!receipt.deduplicated);
    assert_eq!(receipt.document.status, DocumentStatus::Pending);

    let status = wait_until_done(&service, &receipt.document.id).await;
    assert_eq!(status, DocumentStatus::Ready);

    let view = service.document_view(&receipt.document.id).await.unwrap();
    assert_eq!(view.document.page_count, Some(1));
    assert_eq!(view.stages.len(), 3);
}

#[tokio::test]
async fn test_same_content_by_another_owner_is_deduplicated() {
    let (service, _llm) = build_service(test_config(100)).await;

    let first = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &first.document.id).await;

    let second = service
        .upload(upload_req("bob", "my-notes.txt", NOTES))
        .await
        .unwrap();
    assert!(second.deduplicated);
    assert_eq!(
        second.document.is_duplicate_of.as_deref(),
        Some(first.document.id.as_str())
    );
    // Reference is immediately ready, no pipeline run
    assert_eq!(second.document.status, DocumentStatus::Ready);
    assert_eq!(second.document.page_count, Some(1));

    // Reference reports the original's stage progress
    let view = service.document_view(&second.document.id).await.unwrap();
    assert_eq!(view.stages.len(), 3);
}

#[tokio::test]
async fn test_same_owner_same_content_is_a_conflict() {
    let (service, _llm) = build_service(test_config(100)).await;

    let first = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &first.document.id).await;

    let err = service
        .upload(upload_req("alice", "renamed.txt", NOTES))
        .await
        .unwrap_err();
    match err {
        DomainError::Conflict { existing_id } => assert_eq!(existing_id, first.document.id),
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_identical_question_is_served_from_cache() {
    let (service, llm) = build_service(test_config(100)).await;

    let receipt = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &receipt.document.id).await;

    let first = service
        .ask(ask_req(&receipt.document.id, "alice", "What are cells?"))
        .await
        .unwrap();
    assert!(!first.answer.cached);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    // Same question, different casing and spacing
    let second = service
        .ask(ask_req(&receipt.document.id, "alice", "  what are CELLS? "))
        .await
        .unwrap();
    assert!(second.answer.cached);
    assert_eq!(second.answer.answer, first.answer.answer);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_references_share_the_original_cache() {
    let (service, llm) = build_service(test_config(100)).await;

    let original = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &original.document.id).await;
    let reference = service
        .upload(upload_req("bob", "copy.txt", NOTES))
        .await
        .unwrap();

    service
        .ask(ask_req(&original.document.id, "alice", "What are cells?"))
        .await
        .unwrap();
    let via_reference = service
        .ask(ask_req(&reference.document.id, "bob", "What are cells?"))
        .await
        .unwrap();

    assert!(via_reference.answer.cached);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_rate_limit_denies_with_retry_after() {
    let (service, _llm) = build_service(test_config(2)).await;

    let receipt = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &receipt.document.id).await;

    // Distinct questions so the cache cannot absorb the traffic
    for i in 0..2 {
        let res = service
            .ask(ask_req(&receipt.document.id, "alice", &format!("q{i}?")))
            .await
            .unwrap();
        assert!(res.rate.allowed);
    }

    let err = service
        .ask(ask_req(&receipt.document.id, "alice", "q3?"))
        .await
        .unwrap_err();
    match err {
        DomainError::RateLimited {
            limit,
            remaining,
            retry_after_secs,
            ..
        } => {
            assert_eq!(limit, 2);
            assert_eq!(remaining, 0);
            assert!(retry_after_secs > 0);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // Another actor still has a full budget
    assert!(service
        .ask(ask_req(&receipt.document.id, "bob", "q1?"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_asking_an_unprocessed_document_is_not_ready() {
    let (service, _llm) = build_service(test_config(100)).await;

    // An empty .pdf body fails extraction, leaving the document failed
    let receipt = service
        .upload(upload_req("alice", "badfile.pdf", b"not a real pdf"))
        .await
        .unwrap();
    let status = wait_until_done(&service, &receipt.document.id).await;
    assert_eq!(status, DocumentStatus::Failed);

    let err = service
        .ask(ask_req(&receipt.document.id, "alice", "anything?"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotReady { .. }));
}

#[tokio::test]
async fn test_upload_validation_and_quota() {
    let (service, _llm) = build_service(test_config(100)).await;

    assert!(matches!(
        service.upload(upload_req("alice", "x.txt", b"")).await,
        Err(DomainError::Validation(_))
    ));
    assert!(matches!(
        service.upload(upload_req("alice", "x.exe", b"data")).await,
        Err(DomainError::Validation(_))
    ));

    // basic role allows 10 documents
    for i in 0..10 {
        let content = format!("document number {i} body");
        let receipt = service
            .upload(upload_req("alice", &format!("d{i}.txt"), content.as_bytes()))
            .await
            .unwrap();
        wait_until_done(&service, &receipt.document.id).await;
    }
    let err = service
        .upload(upload_req("alice", "d11.txt", b"one more"))
        .await
        .unwrap_err();
    match err {
        DomainError::QuotaExceeded { current, limit } => {
            assert_eq!(current, 10);
            assert_eq!(limit, 10);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reprocess_invalidates_cached_answers() {
    let (service, llm) = build_service(test_config(100)).await;

    let receipt = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &receipt.document.id).await;

    service
        .ask(ask_req(&receipt.document.id, "alice", "What are cells?"))
        .await
        .unwrap();
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let reset = service.reprocess(&receipt.document.id).await.unwrap();
    assert_eq!(reset.content_version, 2);
    let status = wait_until_done(&service, &receipt.document.id).await;
    assert_eq!(status, DocumentStatus::Ready);

    // Same question again: the old cache entry is unreachable
    let answer = service
        .ask(ask_req(&receipt.document.id, "alice", "What are cells?"))
        .await
        .unwrap();
    assert!(!answer.answer.cached);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reprocessing_a_reference_is_rejected() {
    let (service, _llm) = build_service(test_config(100)).await;

    let original = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &original.document.id).await;
    let reference = service
        .upload(upload_req("bob", "copy.txt", NOTES))
        .await
        .unwrap();

    let err = service.reprocess(&reference.document.id).await.unwrap_err();
    assert!(matches!(err, DomainError::Validation(_)));
}

#[tokio::test]
async fn test_cache_savings_accumulate() {
    let (service, _llm) = build_service(test_config(100)).await;

    let receipt = service
        .upload(upload_req("alice", "notes.txt", NOTES))
        .await
        .unwrap();
    wait_until_done(&service, &receipt.document.id).await;

    service
        .ask(ask_req(&receipt.document.id, "alice", "What are cells?"))
        .await
        .unwrap();
    service
        .ask(ask_req(&receipt.document.id, "alice", "What are cells?"))
        .await
        .unwrap();

    let savings = service.cache_savings().await.unwrap();
    assert_eq!(savings.hits, 1);
    assert_eq!(savings.misses, 1);
    assert_eq!(savings.tokens_saved, 200);
}
