//! Document catalog: the system of record for uploads, dedup, chunk rows,
//! and the append-only stage-event log.
//!
//! Deduplication is hash-based. At most one *original* document exists per
//! content hash (enforced by a partial unique index); every other upload of
//! the same bytes becomes a reference row pointing at the original. The
//! concurrent-upload race therefore resolves inside SQLite: the loser's
//! insert trips the index and is converted into a late reference grant.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Chunk, Document, DocumentStatus, Stage, StageEvent, StageStatus};

/// Outcome of registering an upload in the catalog.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// First sighting of this content: an original row, pipeline work owed.
    Created(Document),
    /// Content already processed: a reference row sharing the original's
    /// status and page count. No pipeline work.
    Deduplicated(Document),
    /// This owner already holds a copy of this content.
    OwnerConflict { existing_id: String },
}

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Canonical content hash for dedup: sha256 over the raw bytes, hex.
    pub fn content_hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch document")?;
        Ok(doc)
    }

    /// The single original (non-reference) document for a content hash.
    pub async fn find_original(&self, content_hash: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE content_hash = ? AND is_duplicate_of IS NULL",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    async fn find_owner_copy(&self, owner_id: &str, content_hash: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE owner_id = ? AND content_hash = ?",
        )
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    /// Registers an upload: owner-conflict check, then dedup against any
    /// existing original, then insert as a fresh original. A unique-violation
    /// on the original-per-hash index means another upload won the race, so
    /// we re-read the winner and join it as a reference.
    pub async fn register(
        &self,
        owner_id: &str,
        title: Option<&str>,
        filename: &str,
        content_hash: &str,
        storage_ref: &str,
    ) -> Result<RegisterOutcome> {
        if let Some(existing) = self.find_owner_copy(owner_id, content_hash).await? {
            return Ok(RegisterOutcome::OwnerConflict {
                existing_id: existing.id,
            });
        }

        if let Some(original) = self.find_original(content_hash).await? {
            let doc = self
                .insert_reference(owner_id, title, filename, &original)
                .await?;
            return Ok(RegisterOutcome::Deduplicated(doc));
        }

        match self
            .insert_original(owner_id, title, filename, content_hash, storage_ref)
            .await
        {
            Ok(doc) => Ok(RegisterOutcome::Created(doc)),
            Err(err) if is_unique_violation(&err, "idx_documents_original_hash") => {
                // Lost the concurrent-upload race. The winner's row is
                // committed by now, so hand out a reference instead.
                let original = self
                    .find_original(content_hash)
                    .await?
                    .context("original vanished after unique violation")?;
                let doc = self
                    .insert_reference(owner_id, title, filename, &original)
                    .await?;
                Ok(RegisterOutcome::Deduplicated(doc))
            }
            Err(err) if is_unique_violation(&err, "documents.owner_id") => {
                let existing = self
                    .find_owner_copy(owner_id, content_hash)
                    .await?
                    .context("owner copy vanished after unique violation")?;
                Ok(RegisterOutcome::OwnerConflict {
                    existing_id: existing.id,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn insert_original(
        &self,
        owner_id: &str,
        title: Option<&str>,
        filename: &str,
        content_hash: &str,
        storage_ref: &str,
    ) -> Result<Document> {
        let now = Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, title, filename, content_hash, status, storage_ref,
                 content_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(owner_id)
        .bind(title)
        .bind(filename)
        .bind(content_hash)
        .bind(DocumentStatus::Pending)
        .bind(storage_ref)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .context("document missing after insert")
    }

    /// A reference row mirrors the original's status, page count, and
    /// storage reference but owns its own title and filename.
    async fn insert_reference(
        &self,
        owner_id: &str,
        title: Option<&str>,
        filename: &str,
        original: &Document,
    ) -> Result<Document> {
        let now = Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, title, filename, content_hash, status, page_count,
                 storage_ref, is_duplicate_of, content_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(owner_id)
        .bind(title)
        .bind(filename)
        .bind(&original.content_hash)
        .bind(original.status)
        .bind(original.page_count)
        .bind(&original.storage_ref)
        .bind(&original.id)
        .bind(original.content_version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .context("reference missing after insert")
    }

    /// Advances a document's status. Transitions are forward only by rank;
    /// an attempted regression is ignored with a warning (reprocessing goes
    /// through [`Catalog::reset_for_reprocessing`] instead). References
    /// sharing the document's hash are kept in step.
    pub async fn set_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        let Some(doc) = self.get(id).await? else {
            anyhow::bail!("document not found: {id}");
        };
        if status.rank() < doc.status.rank() {
            tracing::warn!(
                document_id = id,
                from = doc.status.as_str(),
                to = status.as_str(),
                "ignoring backwards status transition"
            );
            return Ok(());
        }
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE documents SET status = ?, updated_at = ?
             WHERE id = ? OR is_duplicate_of = ?",
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_page_count(&self, id: &str, page_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET page_count = ?, updated_at = ?
             WHERE id = ? OR is_duplicate_of = ?",
        )
        .bind(page_count)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Prepares an original for a fresh pipeline run: chunks are dropped,
    /// status returns to pending and the content version is bumped so every
    /// cached answer built against the old run stops matching.
    pub async fn reset_for_reprocessing(&self, id: &str) -> Result<Document> {
        let Some(doc) = self.get(id).await? else {
            anyhow::bail!("document not found: {id}");
        };
        if doc.is_reference() {
            anyhow::bail!("cannot reprocess a reference document: {id}");
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE documents
             SET status = ?, content_version = content_version + 1,
                 page_count = NULL, updated_at = ?
             WHERE id = ? OR is_duplicate_of = ?",
        )
        .bind(DocumentStatus::Pending)
        .bind(now)
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get(id).await?.context("document missing after reset")
    }

    pub async fn count_owner_documents(&self, owner_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ---- chunks ----

    pub async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, sequence_number, raw_text, cleaned_text,
                     word_count, has_images, has_tables, has_equations)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.sequence_number)
            .bind(&chunk.raw_text)
            .bind(&chunk.cleaned_text)
            .bind(chunk.word_count)
            .bind(chunk.has_images)
            .bind(chunk.has_tables)
            .bind(chunk.has_equations)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn chunks_for(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let chunks = sqlx::query_as::<_, Chunk>(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY sequence_number",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    pub async fn chunk_by_page(&self, document_id: &str, page: i64) -> Result<Option<Chunk>> {
        let chunk = sqlx::query_as::<_, Chunk>(
            "SELECT * FROM chunks WHERE document_id = ? AND sequence_number = ?",
        )
        .bind(document_id)
        .bind(page)
        .fetch_optional(&self.pool)
        .await?;
        Ok(chunk)
    }

    /// Marks a chunk as indexed. `vector_id` staying NULL is how a chunk
    /// advertises that its embed step failed and may be retried.
    pub async fn set_chunk_vector(&self, chunk_id: &str, vector_id: &str) -> Result<()> {
        sqlx::query("UPDATE chunks SET vector_id = ? WHERE id = ?")
            .bind(vector_id)
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- stage events ----

    pub async fn record_stage(
        &self,
        document_id: &str,
        stage: Stage,
        status: StageStatus,
        progress_percent: i64,
        message: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_events
                (document_id, stage, status, progress_percent, message, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(stage)
        .bind(status)
        .bind(progress_percent)
        .bind(message)
        .bind(error)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest event per stage, in pipeline order. This is what status
    /// queries render as progress.
    pub async fn latest_stage_events(&self, document_id: &str) -> Result<Vec<StageEvent>> {
        let events = sqlx::query_as::<_, StageEvent>(
            r#"
            SELECT * FROM stage_events
            WHERE id IN (
                SELECT MAX(id) FROM stage_events WHERE document_id = ? GROUP BY stage
            )
            ORDER BY id
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn stage_history(&self, document_id: &str) -> Result<Vec<StageEvent>> {
        let events = sqlx::query_as::<_, StageEvent>(
            "SELECT * FROM stage_events WHERE document_id = ? ORDER BY id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

fn is_unique_violation(err: &anyhow::Error, marker: &str) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => {
            db.is_unique_violation() && db.message().contains(marker)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;
    use crate::migrate::run_migrations;

    async fn catalog() -> Catalog {
        let pool = connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        Catalog::new(pool)
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        let hash = Catalog::content_hash(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_second_upload_becomes_reference() {
        let cat = catalog().await;
        let hash = Catalog::content_hash(b"notes");

        let first = cat
            .register("alice", Some("Notes"), "notes.pdf", &hash, "sref")
            .await
            .unwrap();
        let original = match first {
            RegisterOutcome::Created(doc) => doc,
            other => panic!("expected Created, got {:?}", other),
        };
        cat.set_status(&original.id, DocumentStatus::Ready).await.unwrap();

        let second = cat
            .register("bob", Some("Bob's copy"), "bob.pdf", &hash, "sref")
            .await
            .unwrap();
        match second {
            RegisterOutcome::Deduplicated(doc) => {
                assert_eq!(doc.is_duplicate_of.as_deref(), Some(original.id.as_str()));
                assert_eq!(doc.status, DocumentStatus::Ready);
                assert_eq!(doc.owner_id, "bob");
            }
            other => panic!("expected Deduplicated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_owner_same_content_conflicts() {
        let cat = catalog().await;
        let hash = Catalog::content_hash(b"dupe");
        let first = cat
            .register("alice", None, "a.pdf", &hash, "sref")
            .await
            .unwrap();
        let RegisterOutcome::Created(doc) = first else {
            panic!("expected Created");
        };

        let again = cat
            .register("alice", None, "a-again.pdf", &hash, "sref")
            .await
            .unwrap();
        match again {
            RegisterOutcome::OwnerConflict { existing_id } => assert_eq!(existing_id, doc.id),
            other => panic!("expected OwnerConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let cat = catalog().await;
        let hash = Catalog::content_hash(b"mono");
        let RegisterOutcome::Created(doc) = cat
            .register("alice", None, "m.pdf", &hash, "sref")
            .await
            .unwrap()
        else {
            panic!("expected Created");
        };

        cat.set_status(&doc.id, DocumentStatus::Processing).await.unwrap();
        cat.set_status(&doc.id, DocumentStatus::Ready).await.unwrap();
        // Regression attempt is ignored
        cat.set_status(&doc.id, DocumentStatus::Pending).await.unwrap();
        let doc = cat.get(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn test_reprocess_bumps_version_and_drops_chunks() {
        let cat = catalog().await;
        let hash = Catalog::content_hash(b"reproc");
        let RegisterOutcome::Created(doc) = cat
            .register("alice", None, "r.pdf", &hash, "sref")
            .await
            .unwrap()
        else {
            panic!("expected Created");
        };
        cat.set_status(&doc.id, DocumentStatus::Ready).await.unwrap();
        cat.insert_chunks(&[Chunk {
            id: "c1".into(),
            document_id: doc.id.clone(),
            sequence_number: 1,
            raw_text: "text".into(),
            cleaned_text: "text".into(),
            vector_id: None,
            word_count: 1,
            has_images: false,
            has_tables: false,
            has_equations: false,
        }])
        .await
        .unwrap();

        let reset = cat.reset_for_reprocessing(&doc.id).await.unwrap();
        assert_eq!(reset.status, DocumentStatus::Pending);
        assert_eq!(reset.content_version, 2);
        assert!(cat.chunks_for(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_status_tracks_original() {
        let cat = catalog().await;
        let hash = Catalog::content_hash(b"track");
        let RegisterOutcome::Created(original) = cat
            .register("alice", None, "t.pdf", &hash, "sref")
            .await
            .unwrap()
        else {
            panic!("expected Created");
        };
        let RegisterOutcome::Deduplicated(reference) = cat
            .register("bob", None, "t.pdf", &hash, "sref")
            .await
            .unwrap()
        else {
            panic!("expected Deduplicated");
        };

        cat.set_status(&original.id, DocumentStatus::Ready).await.unwrap();
        let reference = cat.get(&reference.id).await.unwrap().unwrap();
        assert_eq!(reference.status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn test_latest_stage_events_one_per_stage() {
        let cat = catalog().await;
        cat.record_stage("d1", Stage::Extraction, StageStatus::Started, 0, "", None)
            .await
            .unwrap();
        cat.record_stage("d1", Stage::Extraction, StageStatus::Completed, 100, "", None)
            .await
            .unwrap();
        cat.record_stage("d1", Stage::Embedding, StageStatus::Started, 0, "", None)
            .await
            .unwrap();

        let latest = cat.latest_stage_events("d1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].stage, Stage::Extraction);
        assert_eq!(latest[0].status, StageStatus::Completed);
        assert_eq!(latest[1].stage, Stage::Embedding);
        assert_eq!(latest[1].status, StageStatus::Started);
    }
}
