//! # ragdock CLI
//!
//! The `ragdock` binary exposes the ingestion and question-answering
//! service for local use and runs the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ragdock --config ./config/ragdock.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragdock init` | Create the SQLite database and run schema migrations |
//! | `ragdock serve` | Start the JSON HTTP server |
//! | `ragdock upload <file>` | Upload a document and wait for processing |
//! | `ragdock ask <id> "<question>"` | Ask a question about a document |
//! | `ragdock status <id>` | Show a document's status and stage progress |
//! | `ragdock reprocess <id>` | Reset and requeue a document |
//! | `ragdock quota <owner>` | Show an owner's upload quota usage |
//! | `ragdock savings` | Show aggregate cache savings |

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ragdock::models::DocumentStatus;
use ragdock::service::{AskRequest, UploadRequest};
use ragdock::{config, db, migrate, server, service};

/// ragdock — content-addressed document ingestion and retrieval-augmented
/// question answering.
#[derive(Parser)]
#[command(
    name = "ragdock",
    about = "Content-addressed document ingestion and question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragdock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Start the JSON HTTP server on `[server].bind`.
    Serve,

    /// Upload a document and wait for the pipeline to finish.
    Upload {
        /// Path to the file (.pdf, .txt, or .md).
        file: PathBuf,

        /// Owner the document is registered under.
        #[arg(long, default_value = "local")]
        owner: String,

        /// Owner role for quota and rate limits.
        #[arg(long, default_value = "administrative")]
        role: String,

        /// Optional display title.
        #[arg(long)]
        title: Option<String>,
    },

    /// Ask a question about an indexed document.
    Ask {
        /// Document UUID.
        id: String,

        /// The question.
        question: String,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long, default_value = "administrative")]
        role: String,

        /// Answer language.
        #[arg(long)]
        language: Option<String>,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Page the reader is currently on; nearby pages rank higher.
        #[arg(long)]
        page: Option<i64>,
    },

    /// Show a document's status and latest stage events.
    Status {
        /// Document UUID.
        id: String,
    },

    /// Reset a document and run the pipeline again.
    Reprocess {
        /// Document UUID (must be an original, not a reference).
        id: String,
    },

    /// Show an owner's upload quota usage.
    Quota {
        owner: String,

        #[arg(long, default_value = "basic")]
        role: String,
    },

    /// Show aggregate cache hit/miss counters and estimated savings.
    Savings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragdock=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let svc = service::build(&cfg).await?;
            server::run_server(&cfg, svc).await?;
        }
        Commands::Upload {
            file,
            owner,
            role,
            title,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file has no usable name")?
                .to_string();

            let svc = service::build(&cfg).await?;
            let receipt = svc
                .upload(UploadRequest {
                    owner_id: owner,
                    role,
                    title,
                    filename,
                    bytes,
                })
                .await?;

            if receipt.deduplicated {
                println!(
                    "Already indexed; created reference {} to original {}",
                    receipt.document.id,
                    receipt.document.is_duplicate_of.as_deref().unwrap_or("?")
                );
                return Ok(());
            }

            println!("Uploaded as {}; processing...", receipt.document.id);
            wait_for_processing(&svc, &receipt.document.id).await?;
        }
        Commands::Ask {
            id,
            question,
            owner,
            role,
            language,
            conversation,
            page,
        } => {
            let svc = service::build(&cfg).await?;
            let response = svc
                .ask(AskRequest {
                    document_id: id,
                    actor_id: owner,
                    role,
                    question,
                    conversation_id: conversation,
                    language,
                    page_anchor: page,
                })
                .await?;

            println!("{}", response.answer.answer);
            if !response.answer.sources.is_empty() {
                println!("\nSources:");
                for s in &response.answer.sources {
                    println!("  p.{:<4} ({:.3})  {}", s.page, s.score, s.snippet);
                }
            }
            println!(
                "\n[{} tokens, cached: {}, conversation: {}]",
                response.answer.tokens_used, response.answer.cached, response.conversation_id
            );
        }
        Commands::Status { id } => {
            let svc = service::build(&cfg).await?;
            let view = svc.document_view(&id).await?;
            let d = &view.document;
            println!("{}  {}", d.id, d.status.as_str());
            println!("  file:    {}", d.filename);
            println!("  hash:    {}", d.content_hash);
            println!("  version: {}", d.content_version);
            if let Some(pages) = d.page_count {
                println!("  pages:   {}", pages);
            }
            if let Some(original) = &d.is_duplicate_of {
                println!("  reference to: {}", original);
            }
            for e in &view.stages {
                let detail = e.error.as_deref().unwrap_or(&e.message);
                println!(
                    "  {:>10}: {:?} {:>3}%  {}",
                    e.stage.as_str(),
                    e.status,
                    e.progress_percent,
                    detail
                );
            }
        }
        Commands::Reprocess { id } => {
            let svc = service::build(&cfg).await?;
            let doc = svc.reprocess(&id).await?;
            println!(
                "Requeued {} (content version {}); processing...",
                doc.id, doc.content_version
            );
            wait_for_processing(&svc, &doc.id).await?;
        }
        Commands::Quota { owner, role } => {
            let svc = service::build(&cfg).await?;
            let usage = svc.quota(&owner, &role).await?;
            if usage.limit == i64::MAX {
                println!("{} documents used (unlimited)", usage.current);
            } else {
                println!(
                    "{} of {} documents used ({:.0}%)",
                    usage.current, usage.limit, usage.percentage
                );
            }
        }
        Commands::Savings => {
            let svc = service::build(&cfg).await?;
            let s = svc.cache_savings().await?;
            println!("Cache hits:   {}", s.hits);
            println!("Cache misses: {}", s.misses);
            println!("Tokens saved: {}", s.tokens_saved);
            println!("Cost saved:   ${:.4}", s.cost_saved_usd);
        }
    }

    Ok(())
}

/// Polls until the background pipeline finishes. The workers run inside
/// this process, so exiting early would abandon the run.
async fn wait_for_processing(svc: &service::AppService, document_id: &str) -> anyhow::Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_millis(500);
    const MAX_WAIT: Duration = Duration::from_secs(600);

    let started = std::time::Instant::now();
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let view = svc.document_view(document_id).await?;
        match view.document.status {
            DocumentStatus::Ready => {
                println!(
                    "Ready: {} pages indexed.",
                    view.document.page_count.unwrap_or(0)
                );
                return Ok(());
            }
            DocumentStatus::Failed => {
                for e in &view.stages {
                    if let Some(err) = &e.error {
                        anyhow::bail!("processing failed in {}: {}", e.stage.as_str(), err);
                    }
                }
                anyhow::bail!("processing failed");
            }
            _ if started.elapsed() > MAX_WAIT => {
                anyhow::bail!("timed out waiting for processing");
            }
            _ => {}
        }
    }
}
