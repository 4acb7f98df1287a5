//! Storage abstractions for DeepWiki.
//!
//! Two traits split ownership of persisted state:
//!
//! | Trait | Owns |
//! |-------|------|
//! | [`VectorIndex`] | index generations and their entries |
//! | [`Catalog`] | repositories, documents, wiki documents |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! [`memory`] provides in-memory backends; the app crate provides SQLite.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, Document, Generation, IndexEntry, IndexSettings, Repository, ScoredChunk, TocNode,
    WikiDocument, WikiSection,
};

/// Per-repository nearest-neighbour index with copy-on-write generations.
///
/// # Contract
///
/// - [`upsert`](VectorIndex::upsert) builds the new generation completely
///   before atomically making it active; the previous generation is then
///   discarded. Concurrent queries see either the old or the new
///   generation, never a mix.
/// - The first upsert fixes the vector dimensionality for the instance;
///   later mismatching vectors are rejected with `InvalidArgument`.
/// - [`query`](VectorIndex::query) orders hits by descending cosine
///   similarity, ties broken by ascending sequence. `k == 0` or `k`
///   greater than the entry count is `InvalidArgument`; a repository
///   without a generation is `NotIndexed`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace `repository`'s index with `entries` (in sequence order),
    /// recording the `settings` they were produced with.
    async fn upsert(
        &self,
        repository: &str,
        settings: IndexSettings,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<Generation>;

    async fn query(&self, repository: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    async fn active_generation(&self, repository: &str) -> Result<Option<Generation>>;

    /// All entries of the active generation, in sequence order.
    async fn entries(&self, repository: &str) -> Result<Vec<IndexEntry>>;
}

/// Catalog of repositories, their current documents and wiki versions.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Create the repository record if it does not exist; return it.
    async fn register_repository(&self, repo: Repository) -> Result<Repository>;

    async fn get_repository(&self, key: &str) -> Result<Option<Repository>>;

    async fn update_repository(&self, repo: &Repository) -> Result<()>;

    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    /// Record a fetched document set as the repository's current documents.
    ///
    /// Documents are immutable: ids already present are kept as-is, new
    /// ids are inserted, and current documents absent from `docs` are
    /// marked superseded.
    async fn put_documents(&self, repository: &str, docs: &[Document]) -> Result<()>;

    /// Current (non-superseded) documents, ordered by path.
    async fn current_documents(&self, repository: &str) -> Result<Vec<Document>>;

    /// Documents with the given ids, superseded or not, ordered by path.
    /// Unknown ids are skipped.
    async fn documents(&self, repository: &str, ids: &[String]) -> Result<Vec<Document>>;

    /// Store a new wiki version and return it. Versions start at 1.
    async fn save_wiki(
        &self,
        repository: &str,
        generation: Option<u64>,
        toc: Vec<TocNode>,
        sections: Vec<WikiSection>,
    ) -> Result<WikiDocument>;

    /// A specific wiki version, or the latest when `version` is `None`.
    async fn wiki(&self, repository: &str, version: Option<u32>) -> Result<Option<WikiDocument>>;

    async fn wiki_versions(&self, repository: &str) -> Result<Vec<u32>>;
}
