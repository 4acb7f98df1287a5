//! # DeepWiki Core
//!
//! Shared, runtime-agnostic logic for DeepWiki: data models, the error
//! taxonomy, chunking, the embedder and vector index abstractions,
//! retrieval, grounded answer generation and wiki synthesis.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network
//! dependencies. Concrete content sources, model providers and
//! persistent stores live in the `deepwiki` app crate.

pub mod answer;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod markdown;
pub mod models;
pub mod retrieve;
pub mod store;
pub mod wiki;

pub use error::{Error, ErrorInfo, ErrorKind, Result};
