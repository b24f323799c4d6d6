//! Vector index adapter.
//!
//! Upserts chunk vectors with metadata and answers filtered top-K similarity
//! queries. The SQLite implementation stores little-endian f32 blobs and
//! scores cosine similarity in Rust; the metadata filter on `document_id`
//! keeps retrieval scoped to one document.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

/// Metadata stored alongside each vector.
#[derive(Debug, Clone)]
pub struct VectorMetadata {
    pub document_id: String,
    pub page_number: i64,
    pub word_count: i64,
    pub has_images: bool,
    pub has_tables: bool,
    pub has_equations: bool,
    pub preview: String,
}

/// One ranked match from a similarity query.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub vector_id: String,
    pub page_number: i64,
    pub preview: String,
    pub score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, vector_id: &str, vector: &[f32], meta: &VectorMetadata) -> Result<()>;

    /// Top-K nearest vectors for `document_id`, highest similarity first.
    async fn query(&self, vector: &[f32], document_id: &str, top_k: usize)
        -> Result<Vec<VectorMatch>>;

    /// Drops all vectors belonging to a document (used by reprocessing).
    async fn delete_document(&self, document_id: &str) -> Result<()>;
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, vector_id: &str, vector: &[f32], meta: &VectorMetadata) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors
                (vector_id, document_id, page_number, word_count,
                 has_images, has_tables, has_equations, preview, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(vector_id) DO UPDATE SET
                document_id = excluded.document_id,
                page_number = excluded.page_number,
                word_count = excluded.word_count,
                has_images = excluded.has_images,
                has_tables = excluded.has_tables,
                has_equations = excluded.has_equations,
                preview = excluded.preview,
                embedding = excluded.embedding
            "#,
        )
        .bind(vector_id)
        .bind(&meta.document_id)
        .bind(meta.page_number)
        .bind(meta.word_count)
        .bind(meta.has_images)
        .bind(meta.has_tables)
        .bind(meta.has_equations)
        .bind(&meta.preview)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        document_id: &str,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query(
            "SELECT vector_id, page_number, preview, embedding
             FROM chunk_vectors WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<VectorMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let candidate = blob_to_vec(&blob);
                VectorMatch {
                    vector_id: row.get("vector_id"),
                    page_number: row.get("page_number"),
                    preview: row.get("preview"),
                    score: cosine_similarity(vector, &candidate) as f64,
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    fn meta(doc: &str, page: i64) -> VectorMetadata {
        VectorMetadata {
            document_id: doc.to_string(),
            page_number: page,
            word_count: 10,
            has_images: false,
            has_tables: false,
            has_equations: false,
            preview: format!("page {} preview", page),
        }
    }

    #[tokio::test]
    async fn test_query_filters_by_document_and_ranks() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = SqliteVectorIndex::new(pool);

        index.upsert("v1", &[1.0, 0.0], &meta("d1", 1)).await.unwrap();
        index.upsert("v2", &[0.9, 0.1], &meta("d1", 2)).await.unwrap();
        index.upsert("v3", &[0.0, 1.0], &meta("d1", 3)).await.unwrap();
        index.upsert("v4", &[1.0, 0.0], &meta("d2", 1)).await.unwrap();

        let matches = index.query(&[1.0, 0.0], "d1", 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].vector_id, "v1");
        assert_eq!(matches[1].vector_id, "v2");
        assert!(matches[0].score >= matches[1].score);
        // d2's identical vector must not leak through the filter
        assert!(matches.iter().all(|m| m.vector_id != "v4"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_vector() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = SqliteVectorIndex::new(pool);

        index.upsert("v1", &[1.0, 0.0], &meta("d1", 1)).await.unwrap();
        index.upsert("v1", &[0.0, 1.0], &meta("d1", 1)).await.unwrap();

        let matches = index.query(&[0.0, 1.0], "d1", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_document() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = SqliteVectorIndex::new(pool);

        index.upsert("v1", &[1.0, 0.0], &meta("d1", 1)).await.unwrap();
        index.delete_document("d1").await.unwrap();
        assert!(index.query(&[1.0, 0.0], "d1", 5).await.unwrap().is_empty());
    }
}
