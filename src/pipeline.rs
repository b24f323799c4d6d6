//! Ingestion pipeline: extract, chunk, embed, index.
//!
//! Upload returns as soon as a job is queued; a bounded worker pool drains
//! the queue and drives each document through the stage machine, recording
//! progress in the append-only stage-event log. A stage failure marks the
//! document failed and stops; nothing retries automatically, reprocessing is
//! an explicit operator action.
//!
//! Embedding runs in batches. One bad batch skips its chunks (their
//! `vector_id` stays NULL) and the run continues, and a chunk whose vector
//! cannot be stored is skipped the same way; only a run where *no* chunk
//! ends up indexed counts as an embedding-stage failure.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::chunk::build_chunks;
use crate::config::PipelineConfig;
use crate::embedding::EmbeddingService;
use crate::error::{DomainError, DomainResult};
use crate::extract::TextExtractor;
use crate::index::{VectorIndex, VectorMetadata};
use crate::models::{Chunk, DocumentStatus, Stage, StageStatus};
use crate::storage::ObjectStore;

/// Everything a worker needs to process one document.
pub struct PipelineDeps {
    pub catalog: Catalog,
    pub store: Arc<dyn ObjectStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub index: Arc<dyn VectorIndex>,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub document_id: String,
}

/// Producer half of the pipeline. Enqueue failures are observable; callers
/// decide whether a full queue fails the upload.
#[derive(Clone)]
pub struct PipelineQueue {
    tx: mpsc::Sender<PipelineJob>,
}

impl PipelineQueue {
    pub fn enqueue(&self, document_id: &str) -> DomainResult<()> {
        let job = PipelineJob {
            document_id: document_id.to_string(),
        };
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                DomainError::BackendUnavailable("pipeline queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                DomainError::BackendUnavailable("pipeline workers are not running".to_string())
            }
        })
    }
}

/// Starts the dispatcher and returns the queue handle. At most
/// `config.workers` documents are in flight at once; the rest wait in the
/// channel up to `config.queue_capacity`.
pub fn spawn_workers(deps: Arc<PipelineDeps>) -> PipelineQueue {
    let (tx, mut rx) = mpsc::channel::<PipelineJob>(deps.config.queue_capacity);
    let permits = Arc::new(Semaphore::new(deps.config.workers));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let deps = deps.clone();
            tokio::spawn(async move {
                if let Err(err) = process_document(&deps, &job.document_id).await {
                    tracing::error!(document_id = %job.document_id, %err, "pipeline run failed");
                }
                drop(permit);
            });
        }
        tracing::info!("pipeline dispatcher stopped");
    });

    PipelineQueue { tx }
}

/// Runs the full stage machine for one document. Any stage error leaves the
/// document failed with a failed event already logged for the stage.
pub async fn process_document(deps: &PipelineDeps, document_id: &str) -> Result<()> {
    let doc = deps
        .catalog
        .get(document_id)
        .await?
        .with_context(|| format!("document not found: {document_id}"))?;
    if doc.is_reference() {
        anyhow::bail!("references are never processed: {document_id}");
    }

    deps.catalog
        .set_status(document_id, DocumentStatus::Processing)
        .await?;

    let result = run_stages(deps, document_id, &doc.filename, doc.storage_ref.as_deref()).await;
    match result {
        Ok(()) => {
            deps.catalog
                .record_stage(
                    document_id,
                    Stage::Completion,
                    StageStatus::Completed,
                    100,
                    "document ready",
                    None,
                )
                .await?;
            deps.catalog
                .set_status(document_id, DocumentStatus::Ready)
                .await?;
            tracing::info!(document_id, "pipeline run completed");
            Ok(())
        }
        Err(err) => {
            deps.catalog
                .set_status(document_id, DocumentStatus::Failed)
                .await?;
            Err(err)
        }
    }
}

async fn run_stages(
    deps: &PipelineDeps,
    document_id: &str,
    filename: &str,
    storage_ref: Option<&str>,
) -> Result<()> {
    let chunks = extraction_stage(deps, document_id, filename, storage_ref).await?;
    embedding_stage(deps, document_id, &chunks).await
}

async fn extraction_stage(
    deps: &PipelineDeps,
    document_id: &str,
    filename: &str,
    storage_ref: Option<&str>,
) -> Result<Vec<Chunk>> {
    let cat = &deps.catalog;
    cat.record_stage(
        document_id,
        Stage::Extraction,
        StageStatus::Started,
        0,
        "fetching content",
        None,
    )
    .await?;

    let result = async {
        let storage_ref = storage_ref.context("original document has no storage reference")?;
        let bytes = deps.store.get(storage_ref).await?;
        let pages = deps.extractor.extract(&bytes, filename).await?;
        let chunks = build_chunks(document_id, &pages, deps.config.boilerplate_threshold);
        cat.insert_chunks(&chunks).await?;
        cat.set_page_count(document_id, pages.len() as i64).await?;
        Ok::<_, anyhow::Error>(chunks)
    }
    .await;

    match result {
        Ok(chunks) => {
            cat.record_stage(
                document_id,
                Stage::Extraction,
                StageStatus::Completed,
                100,
                &format!("{} pages extracted", chunks.len()),
                None,
            )
            .await?;
            Ok(chunks)
        }
        Err(err) => {
            cat.record_stage(
                document_id,
                Stage::Extraction,
                StageStatus::Failed,
                0,
                "extraction failed",
                Some(&err.to_string()),
            )
            .await?;
            Err(err)
        }
    }
}

async fn embedding_stage(deps: &PipelineDeps, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let cat = &deps.catalog;
    cat.record_stage(
        document_id,
        Stage::Embedding,
        StageStatus::Started,
        0,
        &format!("embedding {} chunks", chunks.len()),
        None,
    )
    .await?;

    let batch_size = deps.config.embed_batch_size.max(1);
    let mut indexed = 0usize;
    for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.cleaned_text.clone()).collect();
        let vectors = match deps.embedder.embed(&texts).await {
            Ok(v) => v,
            Err(err) => {
                // Chunks in a failed batch keep vector_id NULL and stay
                // retryable; the run continues with the next batch.
                tracing::warn!(
                    document_id,
                    batch = batch_no,
                    %err,
                    "embedding batch failed, skipping its chunks"
                );
                continue;
            }
        };
        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            let vector_id = Uuid::new_v4().to_string();
            let meta = VectorMetadata {
                document_id: document_id.to_string(),
                page_number: chunk.sequence_number,
                word_count: chunk.word_count,
                has_images: chunk.has_images,
                has_tables: chunk.has_tables,
                has_equations: chunk.has_equations,
                preview: preview_of(&chunk.cleaned_text),
            };
            let stored = match deps.index.upsert(&vector_id, vector, &meta).await {
                Ok(()) => cat.set_chunk_vector(&chunk.id, &vector_id).await,
                Err(err) => Err(err),
            };
            match stored {
                Ok(()) => indexed += 1,
                Err(err) => {
                    // The chunk keeps a NULL vector_id and stays retryable.
                    tracing::warn!(
                        document_id,
                        page = chunk.sequence_number,
                        %err,
                        "chunk indexing failed, skipping"
                    );
                }
            }
        }

        let done = (batch_no + 1) * batch_size;
        let percent = ((done.min(chunks.len()) * 100) / chunks.len().max(1)) as i64;
        cat.record_stage(
            document_id,
            Stage::Embedding,
            StageStatus::InProgress,
            percent,
            &format!("{} of {} chunks indexed", indexed, chunks.len()),
            None,
        )
        .await?;
    }

    if indexed == 0 && !chunks.is_empty() {
        let message = "no chunks could be embedded";
        cat.record_stage(
            document_id,
            Stage::Embedding,
            StageStatus::Failed,
            0,
            message,
            Some(message),
        )
        .await?;
        anyhow::bail!("embedding stage failed for {document_id}: {message}");
    }

    cat.record_stage(
        document_id,
        Stage::Embedding,
        StageStatus::Completed,
        100,
        &format!("{} of {} chunks indexed", indexed, chunks.len()),
        None,
    )
    .await?;
    Ok(())
}

/// Short snippet stored alongside each vector for source attribution.
pub fn preview_of(text: &str) -> String {
    const PREVIEW_CHARS: usize = 200;
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}…", cut.trim_end())
}
