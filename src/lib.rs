//! # DeepWiki
//!
//! Turns a public repository into a knowledge base: fetch its README and
//! documentation, chunk and embed them into a per-repository vector index,
//! synthesize a navigable wiki, and answer questions grounded in the
//! indexed text.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │  Fetchers   │──▶│   Pipeline   │──▶│   SQLite   │
//! │ GitHub/git  │   │ Chunk+Embed  │   │ generations│
//! └─────────────┘   └──────┬───────┘   └─────┬──────┘
//!                          │ tasks            │
//!                   ┌──────┴───────┐   ┌─────┴──────┐
//!                   │ Orchestrator │   │  Wiki / Q&A │
//!                   │   workers    │   │  (DeepWiki) │
//!                   └──────────────┘   └────────────┘
//! ```
//!
//! Domain types and the storage-agnostic algorithms live in
//! `deepwiki-core`; this crate wires them to SQLite, HTTP providers,
//! and a background task queue.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sources`] | Fetcher selection and document filtering |
//! | [`source_github`] / [`source_git`] | Repository content fetchers |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Answer-model providers |
//! | [`sqlite_store`] | Persistent vector index and catalog |
//! | [`pipeline`] | Fetch, chunk, embed, commit |
//! | [`tasks`] / [`orchestrator`] / [`jobs`] | Background task execution |
//! | [`service`] | The operations callers use |

pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod jobs;
pub mod migrate;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod service;
pub mod source_git;
pub mod source_github;
pub mod sources;
pub mod sqlite_store;
pub mod tasks;
