//! # ragdock
//!
//! A content-addressed document ingestion and question-answering service.
//!
//! ragdock accepts document uploads, deduplicates them by content hash, runs
//! an asynchronous extract → chunk → embed → index pipeline, and answers
//! questions about indexed documents with retrieval-augmented generation.
//! Answers are cached semantically with cost accounting, and every surface
//! sits behind a role-aware fixed-window rate limiter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌──────────────────────┐
//! │ Upload  │──▶│  Catalog  │──▶│  Pipeline workers     │
//! │ (dedup) │   │  (SQLite) │   │  extract→chunk→embed  │
//! └─────────┘   └─────┬─────┘   └──────────┬───────────┘
//!                     │                    ▼
//!                     │             ┌──────────────┐
//!                     │             │ Vector index │
//!                     ▼             └──────┬───────┘
//!               ┌───────────┐             │
//!               │   Cache   │◀── ask ◀────┘
//!               │  + limits │
//!               └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain error taxonomy |
//! | [`catalog`] | Document records, dedup, stage-event log |
//! | [`storage`] | Content-addressed object store |
//! | [`extract`] | PDF and plain-text extraction |
//! | [`chunk`] | Page chunking and boilerplate cleanup |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index |
//! | [`llm`] | Chat completion providers |
//! | [`pipeline`] | Worker pool and stage machine |
//! | [`query`] | Retrieval-augmented answering |
//! | [`cache`] | Semantic response cache |
//! | [`rate_limit`] | Fixed-window rate limiter |
//! | [`service`] | Orchestration facade |
//! | [`server`] | JSON HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod storage;
