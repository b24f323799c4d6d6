use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the full schema. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Document catalog. References share the content_hash of their original;
    // the partial unique index guarantees at most one *original* per hash,
    // which is what converts the concurrent-upload race into a
    // unique-violation we turn into a late dedup grant.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT,
            filename TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            page_count INTEGER,
            storage_ref TEXT,
            is_duplicate_of TEXT,
            content_version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(owner_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_original_hash
         ON documents(content_hash) WHERE is_duplicate_of IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            raw_text TEXT NOT NULL,
            cleaned_text TEXT NOT NULL,
            vector_id TEXT,
            word_count INTEGER NOT NULL,
            has_images INTEGER NOT NULL DEFAULT 0,
            has_tables INTEGER NOT NULL DEFAULT 0,
            has_equations INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, sequence_number),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    // Append-only pipeline progress log.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            progress_percent INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_events_document ON stage_events(document_id, id)",
    )
    .execute(pool)
    .await?;

    // Vector index backing store: little-endian f32 blobs, cosine scored in Rust.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            vector_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            has_images INTEGER NOT NULL DEFAULT 0,
            has_tables INTEGER NOT NULL DEFAULT 0,
            has_equations INTEGER NOT NULL DEFAULT 0,
            preview TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document ON chunk_vectors(document_id)",
    )
    .execute(pool)
    .await?;

    // Semantic response cache.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS answer_cache (
            key TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            tokens_used INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Hit/miss telemetry with savings accounting.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            document_id TEXT NOT NULL,
            tokens_saved INTEGER NOT NULL DEFAULT 0,
            cost_saved_usd REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Fixed-window rate counters, keyed by (actor, class, window start).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_windows (
            key TEXT PRIMARY KEY,
            count INTEGER NOT NULL DEFAULT 0,
            window_start INTEGER NOT NULL,
            window_secs INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Conversation history for multi-turn questioning.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_turns_conversation ON conversation_turns(conversation_id, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
