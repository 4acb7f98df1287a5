//! Index pipeline: fetch → chunk → embed → upsert.
//!
//! A run is idempotent. When the fetched documents are exactly the ones
//! the active generation was built from, with the same chunking settings
//! and embedding model, nothing is embedded and the existing generation
//! is reported as unchanged. Otherwise chunk vectors whose content hash
//! already exists in the active generation are reused, as long as that
//! generation was embedded by the same model, and only new chunks go to
//! the embedder.
//!
//! Document rows are written before the index is touched. The index is
//! then written once, at the end, with a complete batch. A failure or
//! cancellation before that point leaves the previous generation active
//! and discards everything computed so far.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use deepwiki_core::chunk::chunk_document;
use deepwiki_core::embedding::Embedder;
use deepwiki_core::fetch::{ContentFetcher, DocumentSet};
use deepwiki_core::models::{
    document_ids_of, Chunk, IndexSettings, RepoRef, Repository, RepositoryStatus,
};
use deepwiki_core::store::{Catalog, VectorIndex};
use deepwiki_core::{Error, ErrorKind, Result};

use crate::config::Config;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::retry::{with_backoff, Backoff};

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub batch_size: usize,
    pub concurrency: usize,
    pub fetch_backoff: Backoff,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.chunking.max_chars(),
            overlap_chars: config.chunking.overlap_chars(),
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            fetch_backoff: Backoff::from_config(&config.retry, config.fetch.max_retries),
        }
    }
}

/// Outcome of a successful run, stored as the index task's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexResult {
    pub repository: String,
    pub revision: Option<String>,
    pub generation: u64,
    pub documents: usize,
    pub chunks: usize,
    /// Chunks sent to the embedder in this run.
    pub embedded: usize,
    /// Chunks whose vectors were taken from the previous generation.
    pub reused: usize,
    /// The fetched content matched the active generation exactly.
    pub unchanged: bool,
    pub warnings: Vec<String>,
}

/// What a run would index, without embedding or writing anything.
#[derive(Debug, Clone, Serialize)]
pub struct IndexPlan {
    pub repository: String,
    pub revision: Option<String>,
    pub documents: Vec<PlannedDocument>,
    pub total_chunks: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedDocument {
    pub path: String,
    pub bytes: usize,
    pub chunks: usize,
}

pub struct IndexPipeline {
    fetcher: Arc<dyn ContentFetcher>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalog: Arc<dyn Catalog>,
    settings: PipelineSettings,
}

impl IndexPipeline {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalog: Arc<dyn Catalog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            index,
            catalog,
            settings,
        }
    }

    /// Index `repo`, tracking the outcome on its catalog record.
    pub async fn run(
        &self,
        repo: &RepoRef,
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let mut record = self
            .catalog
            .register_repository(Repository::new(repo.clone(), Utc::now()))
            .await?;
        // Fetch with the reference as first submitted; keys are lower-cased.
        let repo = record.reference.clone();
        let previous_status = record.status;
        record.status = RepositoryStatus::Indexing;
        record.updated_at = Utc::now();
        self.catalog.update_repository(&record).await?;

        match self.index_repository(&repo, &mut record, reporter, cancel).await {
            Ok(result) => Ok(result),
            Err(err) => {
                record.status = if err.kind() == ErrorKind::Cancelled {
                    previous_status
                } else {
                    RepositoryStatus::Failed
                };
                record.updated_at = Utc::now();
                if let Err(e) = self.catalog.update_repository(&record).await {
                    tracing::warn!(repository = %repo, error = %e, "failed to record index failure");
                }
                tracing::warn!(repository = %repo, error = %err, "indexing failed");
                Err(err)
            }
        }
    }

    /// Fetch and chunk `repo` and report what would be indexed.
    pub async fn plan(&self, repo: &RepoRef) -> Result<IndexPlan> {
        let set = self.fetch(repo, &CancellationToken::new()).await?;
        let mut documents = Vec::with_capacity(set.documents.len());
        let mut total_chunks = 0;
        for doc in &set.documents {
            let chunks = self.chunk_one(doc)?.len();
            total_chunks += chunks;
            documents.push(PlannedDocument {
                path: doc.path.clone(),
                bytes: doc.text.len(),
                chunks,
            });
        }
        Ok(IndexPlan {
            repository: repo.key(),
            revision: set.revision.clone(),
            documents,
            total_chunks,
            warnings: set.warnings.iter().map(ToString::to_string).collect(),
        })
    }

    async fn fetch(&self, repo: &RepoRef, cancel: &CancellationToken) -> Result<DocumentSet> {
        let fetch = with_backoff("fetch", &self.settings.fetch_backoff, || {
            self.fetcher.fetch(repo)
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            set = fetch => set,
        }
    }

    /// Settings recorded on the generations this pipeline commits.
    fn index_settings(&self) -> IndexSettings {
        IndexSettings {
            max_chars: self.settings.max_chars,
            overlap_chars: self.settings.overlap_chars,
            embedding_model: self.embedder.model_name().to_string(),
        }
    }

    fn chunk_one(&self, doc: &deepwiki_core::models::Document) -> Result<Vec<Chunk>> {
        if doc.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        chunk_document(doc, self.settings.max_chars, self.settings.overlap_chars)
    }

    async fn index_repository(
        &self,
        repo: &RepoRef,
        record: &mut Repository,
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let key = repo.key();
        reporter.report(IndexProgressEvent::Fetching {
            repository: key.clone(),
        });
        let set = self.fetch(repo, cancel).await?;
        let warnings: Vec<String> = set.warnings.iter().map(ToString::to_string).collect();
        if set.is_partial() {
            tracing::warn!(
                repository = %repo,
                failed = warnings.len(),
                "partial content: some documents could not be fetched"
            );
        }

        // Document order, then chunk order within each document.
        let mut chunks = Vec::new();
        for doc in &set.documents {
            chunks.extend(self.chunk_one(doc)?);
        }
        if chunks.is_empty() {
            return Err(Error::NotFound(format!("{repo} has no indexable text")));
        }

        let document_ids = document_ids_of(&chunks);
        let settings = self.index_settings();
        let active = self.index.active_generation(&key).await?;

        if let Some(generation) = active.as_ref() {
            if generation.document_ids == document_ids
                && generation.settings == settings
                && !record.stale
            {
                tracing::info!(
                    repository = %repo,
                    generation = generation.number,
                    "content unchanged, keeping active generation"
                );
                self.catalog.put_documents(&key, &set.documents).await?;
                self.mark_indexed(record, &set).await?;
                return Ok(IndexResult {
                    repository: key,
                    revision: set.revision.clone(),
                    generation: generation.number,
                    documents: set.documents.len(),
                    chunks: chunks.len(),
                    embedded: 0,
                    reused: chunks.len(),
                    unchanged: true,
                    warnings,
                });
            }
        }

        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        let same_model = active
            .as_ref()
            .is_some_and(|g| g.settings.embedding_model == settings.embedding_model);
        if same_model {
            let dims = self.embedder.dims();
            for entry in self.index.entries(&key).await? {
                if entry.vector.len() == dims {
                    vectors.entry(entry.chunk.hash).or_insert(entry.vector);
                }
            }
        }

        let mut missing: Vec<(String, String)> = Vec::new();
        for chunk in &chunks {
            if !vectors.contains_key(&chunk.hash) && !missing.iter().any(|(h, _)| *h == chunk.hash) {
                missing.push((chunk.hash.clone(), chunk.text.clone()));
            }
        }
        let reused = chunks.iter().filter(|c| vectors.contains_key(&c.hash)).count();
        let embedded = chunks.len() - reused;

        self.embed_missing(&key, missing, &mut vectors, reporter, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        reporter.report(IndexProgressEvent::Committing {
            repository: key.clone(),
        });

        let chunk_count = chunks.len();
        let mut entries = Vec::with_capacity(chunk_count);
        for chunk in chunks {
            let vector = vectors
                .get(&chunk.hash)
                .cloned()
                .ok_or_else(|| Error::internal(format!("chunk {} has no embedding", chunk.id)))?;
            entries.push((chunk, vector));
        }

        self.catalog.put_documents(&key, &set.documents).await?;
        let generation = self.index.upsert(&key, settings, entries).await?;
        self.mark_indexed(record, &set).await?;

        tracing::info!(
            repository = %repo,
            generation = generation.number,
            documents = set.documents.len(),
            chunks = chunk_count,
            embedded,
            reused,
            "index generation committed"
        );

        Ok(IndexResult {
            repository: key,
            revision: set.revision.clone(),
            generation: generation.number,
            documents: set.documents.len(),
            chunks: chunk_count,
            embedded,
            reused,
            unchanged: false,
            warnings,
        })
    }

    /// Embed `missing` (hash, text) pairs in batches, at most
    /// `concurrency` batches in flight, and add the vectors to `vectors`.
    async fn embed_missing(
        &self,
        key: &str,
        missing: Vec<(String, String)>,
        vectors: &mut HashMap<String, Vec<f32>>,
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = missing.len() as u64;
        reporter.report(IndexProgressEvent::Embedding {
            repository: key.to_string(),
            done: 0,
            total,
        });
        if missing.is_empty() {
            return Ok(());
        }

        let batches: Vec<Vec<(String, String)>> = missing
            .chunks(self.settings.batch_size)
            .map(<[_]>::to_vec)
            .collect();
        let embedder = &self.embedder;

        let mut results = stream::iter(batches)
            .map(|batch| async move {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
                let embedded = embedder.embed(&texts).await?;
                if embedded.len() != batch.len() {
                    return Err(Error::internal(format!(
                        "embedder returned {} vectors for {} texts",
                        embedded.len(),
                        batch.len()
                    )));
                }
                Ok(batch
                    .into_iter()
                    .map(|(hash, _)| hash)
                    .zip(embedded)
                    .collect::<Vec<_>>())
            })
            .buffer_unordered(self.settings.concurrency);

        let mut done = 0u64;
        while let Some(batch) = results.next().await {
            let batch = batch?;
            done += batch.len() as u64;
            tracing::debug!(repository = key, done, total, "embedded batch");
            vectors.extend(batch);
            reporter.report(IndexProgressEvent::Embedding {
                repository: key.to_string(),
                done,
                total,
            });
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    async fn mark_indexed(&self, record: &mut Repository, set: &DocumentSet) -> Result<()> {
        let now = Utc::now();
        record.status = RepositoryStatus::Indexed;
        record.revision = set.revision.clone().or_else(|| record.revision.clone());
        record.default_branch = set
            .default_branch
            .clone()
            .or_else(|| record.default_branch.clone());
        record.last_indexed_at = Some(now);
        record.stale = false;
        record.updated_at = now;
        self.catalog.update_repository(record).await
    }
}
