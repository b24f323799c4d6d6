//! Semantic response cache with savings accounting.
//!
//! Keys bind an answer to (document, content version, normalized question,
//! language), so a reprocess invalidates every cached answer for a document
//! without any explicit purge. Every lookup records a hit or miss event;
//! hits also record the tokens and dollars that a fresh LLM call would have
//! cost, priced against the configured model table.
//!
//! The cache is strictly best-effort: a backend failure on either path is
//! logged and treated as a miss, never surfaced to the caller.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::config::CacheConfig;
use crate::models::Answer;

/// Assumed split of a cached call's tokens between prompt and completion,
/// used when pricing input and output tokens separately.
const INPUT_TOKEN_SHARE: f64 = 0.8;

/// Aggregate savings counters, derived from the event log.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSavings {
    pub hits: i64,
    pub misses: i64,
    pub tokens_saved: i64,
    pub cost_saved_usd: f64,
}

#[derive(Clone)]
pub struct AnswerCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl AnswerCache {
    pub fn new(pool: SqlitePool, config: CacheConfig) -> Self {
        Self { pool, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// TTL for an answer, shorter for list-style questions whose ideal
    /// answer drifts as content evolves.
    pub fn ttl_for(&self, question: &str) -> i64 {
        if is_list_question(question) {
            self.config.list_ttl_secs
        } else {
            self.config.answer_ttl_secs
        }
    }

    /// Cache key: sha256 over the identity of the question. The content
    /// version makes stale entries unreachable after a reprocess.
    pub fn key(document_id: &str, content_version: i64, question: &str, language: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(content_version.to_le_bytes());
        hasher.update(b"\x1f");
        hasher.update(normalize_question(question).as_bytes());
        hasher.update(b"\x1f");
        hasher.update(language.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, key: &str, document_id: &str, model: Option<&str>) -> Option<Answer> {
        self.get_at(key, document_id, model, Utc::now().timestamp())
            .await
    }

    /// Lookup with an injected clock. Errors fail open as misses.
    pub async fn get_at(
        &self,
        key: &str,
        document_id: &str,
        model: Option<&str>,
        now: i64,
    ) -> Option<Answer> {
        if !self.config.enabled {
            return None;
        }
        let row: Result<Option<(String, i64)>, sqlx::Error> = sqlx::query_as(
            "SELECT payload, tokens_used FROM answer_cache WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some((payload, tokens_used))) => {
                let mut answer: Answer = match serde_json::from_str(&payload) {
                    Ok(a) => a,
                    Err(err) => {
                        tracing::warn!(%err, key, "discarding undecodable cache entry");
                        let _ = self.record_event("miss", document_id, 0, 0.0, now).await;
                        return None;
                    }
                };
                answer.cached = true;
                let cost = self.estimate_cost(model, tokens_used);
                if let Err(err) = self
                    .record_event("hit", document_id, tokens_used, cost, now)
                    .await
                {
                    tracing::warn!(%err, "failed to record cache hit event");
                }
                Some(answer)
            }
            Ok(None) => {
                if let Err(err) = self.record_event("miss", document_id, 0, 0.0, now).await {
                    tracing::warn!(%err, "failed to record cache miss event");
                }
                None
            }
            Err(err) => {
                tracing::warn!(%err, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, document_id: &str, answer: &Answer, ttl_secs: i64) {
        self.put_at(key, document_id, answer, ttl_secs, Utc::now().timestamp())
            .await
    }

    /// Store with an injected clock. Errors fail open; the answer was
    /// already produced, losing the cache entry only costs a future hit.
    pub async fn put_at(
        &self,
        key: &str,
        document_id: &str,
        answer: &Answer,
        ttl_secs: i64,
        now: i64,
    ) {
        if !self.config.enabled {
            return;
        }
        let payload = match serde_json::to_string(answer) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize answer for cache");
                return;
            }
        };
        let result = sqlx::query(
            r#"
            INSERT INTO answer_cache (key, document_id, payload, tokens_used, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                tokens_used = excluded.tokens_used,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(document_id)
        .bind(&payload)
        .bind(answer.tokens_used)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(%err, "failed to store cache entry");
        }
    }

    /// What a fresh call for this many tokens would have cost, assuming the
    /// usual prompt-heavy split. Zero when the model has no pricing entry.
    fn estimate_cost(&self, model: Option<&str>, tokens: i64) -> f64 {
        let Some(pricing) = model.and_then(|m| self.config.pricing.get(m)) else {
            return 0.0;
        };
        let input_tokens = tokens as f64 * INPUT_TOKEN_SHARE;
        let output_tokens = tokens as f64 * (1.0 - INPUT_TOKEN_SHARE);
        (input_tokens / 1000.0) * pricing.input_per_1k
            + (output_tokens / 1000.0) * pricing.output_per_1k
    }

    async fn record_event(
        &self,
        kind: &str,
        document_id: &str,
        tokens_saved: i64,
        cost_saved_usd: f64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_events (kind, document_id, tokens_saved, cost_saved_usd, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(kind)
        .bind(document_id)
        .bind(tokens_saved)
        .bind(cost_saved_usd)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes expired entries. Reads already filter on `expires_at`; this
    /// keeps the table from growing without bound. Called periodically by
    /// the janitor task.
    pub async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM answer_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn savings(&self) -> Result<CacheSavings> {
        let (hits, tokens_saved, cost_saved_usd): (i64, i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(tokens_saved), 0), COALESCE(SUM(cost_saved_usd), 0)
             FROM cache_events WHERE kind = 'hit'",
        )
        .fetch_one(&self.pool)
        .await?;
        let misses: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_events WHERE kind = 'miss'")
                .fetch_one(&self.pool)
                .await?;
        Ok(CacheSavings {
            hits,
            misses,
            tokens_saved,
            cost_saved_usd,
        })
    }
}

/// Trim, casefold, collapse runs of whitespace. "What is  photosynthesis?"
/// and "what is photosynthesis?" share one cache entry.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_list_question(question: &str) -> bool {
    let q = normalize_question(question);
    ["list", "enumerate", "what are all", "name all", "summarize each"]
        .iter()
        .any(|marker| q.starts_with(marker) || q.contains(&format!(" {marker} ")))
}
