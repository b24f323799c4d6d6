//! Retrieval-augmented question answering.
//!
//! The engine embeds the question, pulls candidates from the vector index,
//! reranks them by similarity minus a page-distance penalty when the reader
//! supplies an anchor page, assembles a bounded context, and asks the chat
//! model. Zero candidates short-circuit to a fixed "nothing relevant" answer
//! with no model call at all.
//!
//! Conversation history is best effort. A missing or unreadable history
//! means the question is answered without it, never an error.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::RetrievalConfig;
use crate::embedding::{embed_one, EmbeddingService};
use crate::index::{VectorIndex, VectorMatch};
use crate::llm::{ChatMessage, LlmService};
use crate::models::{Answer, SourceRef};

/// Turns of history included per conversation, newest last.
const MAX_HISTORY_TURNS: i64 = 10;

/// Answer returned without consulting the model when retrieval comes back
/// empty.
pub const NO_MATCH_ANSWER: &str =
    "I could not find anything in this document relevant to that question.";

const TUTOR_PERSONA: &str = "You are a patient tutor helping a reader understand a document. \
Answer using only the provided document excerpts. When the excerpts do not contain the answer, \
say so instead of guessing. Cite page numbers when you use an excerpt.";

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub owner_id: String,
    pub conversation_id: Option<String>,
    pub language: String,
    pub page_anchor: Option<i64>,
}

pub struct QueryEngine {
    pool: SqlitePool,
    catalog: Catalog,
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndex>,
    llm: Arc<dyn LlmService>,
    config: RetrievalConfig,
}

impl QueryEngine {
    pub fn new(
        pool: SqlitePool,
        catalog: Catalog,
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LlmService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            catalog,
            embedder,
            index,
            llm,
            config,
        }
    }

    /// Answers a question against an indexed document. `document_id` must be
    /// the original that owns the vectors; callers resolve references first.
    pub async fn answer(
        &self,
        document_id: &str,
        question: &str,
        opts: &AskOptions,
    ) -> Result<Answer> {
        let query_vector = embed_one(self.embedder.as_ref(), question).await?;
        let candidates = self
            .index
            .query(&query_vector, document_id, self.config.candidate_k)
            .await?;

        if candidates.is_empty() {
            tracing::debug!(document_id, "no retrieval candidates, skipping model call");
            return Ok(Answer {
                answer: NO_MATCH_ANSWER.to_string(),
                sources: Vec::new(),
                tokens_used: 0,
                cached: false,
            });
        }

        let ranked = rerank(
            candidates,
            opts.page_anchor,
            self.config.proximity_penalty,
            self.config.final_limit,
        );

        let context = self.assemble_context(document_id, &ranked).await;
        let history = self.load_history(opts.conversation_id.as_deref()).await;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(TUTOR_PERSONA));
        messages.extend(history);
        messages.push(ChatMessage::user(format!(
            "Document excerpts:\n{context}\n\nQuestion: {question}\n\nAnswer in {}.",
            opts.language
        )));

        let completion = self.llm.complete(&messages).await?;

        self.persist_turns(opts, document_id, question, &completion.text)
            .await;

        let sources = ranked
            .into_iter()
            .map(|(m, score)| SourceRef {
                page: m.page_number,
                snippet: m.preview,
                score,
            })
            .collect();

        Ok(Answer {
            answer: completion.text,
            sources,
            tokens_used: completion.tokens_used,
            cached: false,
        })
    }

    /// Builds the excerpt block, preferring full cleaned chunk text and
    /// falling back to the stored preview, capped at `max_context_chars`.
    async fn assemble_context(&self, document_id: &str, ranked: &[(VectorMatch, f64)]) -> String {
        let mut context = String::new();
        for (m, _) in ranked {
            let text = match self.catalog.chunk_by_page(document_id, m.page_number).await {
                Ok(Some(chunk)) => chunk.cleaned_text,
                _ => m.preview.clone(),
            };
            let block = format!("[Page {}]\n{}\n\n", m.page_number, text);
            if context.len() + block.len() > self.config.max_context_chars {
                break;
            }
            context.push_str(&block);
        }
        if context.is_empty() {
            // The best single chunk overflowed the budget; keep its preview
            // so the model sees something.
            if let Some((m, _)) = ranked.first() {
                context = format!("[Page {}]\n{}\n", m.page_number, m.preview);
            }
        }
        context
    }

    async fn load_history(&self, conversation_id: Option<&str>) -> Vec<ChatMessage> {
        let Some(conversation_id) = conversation_id else {
            return Vec::new();
        };
        let rows: Result<Vec<(String, String)>, sqlx::Error> = sqlx::query_as(
            "SELECT role, content FROM (
                 SELECT id, role, content FROM conversation_turns
                 WHERE conversation_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id",
        )
        .bind(conversation_id)
        .bind(MAX_HISTORY_TURNS)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|(role, content)| ChatMessage { role, content })
                .collect(),
            Err(err) => {
                tracing::warn!(%err, conversation_id, "failed to load history, continuing without");
                Vec::new()
            }
        }
    }

    async fn persist_turns(
        &self,
        opts: &AskOptions,
        document_id: &str,
        question: &str,
        answer: &str,
    ) {
        let Some(conversation_id) = opts.conversation_id.as_deref() else {
            return;
        };
        if let Err(err) = self
            .try_persist_turns(conversation_id, opts, document_id, question, answer)
            .await
        {
            tracing::warn!(%err, conversation_id, "failed to persist conversation turns");
        }
    }

    async fn try_persist_turns(
        &self,
        conversation_id: &str,
        opts: &AskOptions,
        document_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, document_id, owner_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(document_id)
        .bind(&opts.owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        for (role, content) in [("user", question), ("assistant", answer)] {
            sqlx::query(
                "INSERT INTO conversation_turns (conversation_id, role, content, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(role)
            .bind(content)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Generates a fresh conversation id for first-turn requests.
pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Similarity minus a per-page distance penalty from the anchor, sorted
/// best first and truncated to `limit`. Without an anchor this is a plain
/// similarity sort.
pub fn rerank(
    candidates: Vec<VectorMatch>,
    anchor: Option<i64>,
    proximity_penalty: f64,
    limit: usize,
) -> Vec<(VectorMatch, f64)> {
    let mut scored: Vec<(VectorMatch, f64)> = candidates
        .into_iter()
        .map(|m| {
            let penalty = match anchor {
                Some(page) => proximity_penalty * (m.page_number - page).abs() as f64,
                None => 0.0,
            };
            let score = m.score - penalty;
            (m, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}
