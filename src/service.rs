//! The `DeepWiki` facade: the operations external collaborators (the
//! CLI, an HTTP layer) call into.
//!
//! | Operation | Returns |
//! |-----------|---------|
//! | [`submit_index`](DeepWiki::submit_index) | the index task (new or already active) |
//! | [`status`](DeepWiki::status) | a task's status, progress, result or error |
//! | [`wiki`](DeepWiki::wiki) | a wiki version, or the pending synthesis task |
//! | [`ask`](DeepWiki::ask) | a grounded answer with its source chunks |
//!
//! Repository references are validated before anything is created, so a
//! malformed reference never produces a task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use deepwiki_core::answer::{AnswerGenerator, AnswerModel, AnswerOutcome, SourceChunk};
use deepwiki_core::embedding::Embedder;
use deepwiki_core::fetch::ContentFetcher;
use deepwiki_core::models::{RepoRef, Repository, WikiDocument};
use deepwiki_core::retrieve::Retriever;
use deepwiki_core::store::{Catalog, VectorIndex};
use deepwiki_core::{Error, ErrorInfo, ErrorKind, Result};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generation::create_answer_model;
use crate::jobs::{IndexJob, JobRunner, WikiJob};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::pipeline::{IndexPipeline, IndexPlan, PipelineSettings};
use crate::progress::IndexProgressReporter;
use crate::sources::create_fetcher;
use crate::sqlite_store::{SqliteCatalog, SqliteVectorIndex};
use crate::tasks::{SqliteTaskStore, Task, TaskKind, TaskStatus, TaskStore};
use crate::{db, migrate};

/// Pluggable collaborators, for wiring other backends (or test doubles)
/// into the facade.
pub struct Components {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub embedder: Arc<dyn Embedder>,
    pub answer_model: Option<Arc<dyn AnswerModel>>,
    pub index: Arc<dyn VectorIndex>,
    pub catalog: Arc<dyn Catalog>,
    pub tasks: Arc<dyn TaskStore>,
    /// Sees every indexing event in addition to the task record.
    pub progress: Arc<dyn IndexProgressReporter>,
}

/// Answer to a question, as returned by the query surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer_text: String,
    pub source_chunks: Vec<SourceChunk>,
    pub outcome: AnswerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WikiResponse {
    Ready { wiki: WikiDocument },
    /// No wiki exists yet; synthesis was submitted as a task.
    Pending { task: Task },
}

pub struct DeepWiki {
    catalog: Arc<dyn Catalog>,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<IndexPipeline>,
    retriever: Retriever,
    generator: AnswerGenerator,
    orchestrator: Arc<Orchestrator>,
}

impl DeepWiki {
    /// Open the SQLite database, apply migrations, and build every
    /// component from `config`. Workers are not started.
    pub async fn open(
        config: &Config,
        progress: Arc<dyn IndexProgressReporter>,
    ) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool)
            .await
            .context("Failed to apply database migrations")?;

        let components = Components {
            fetcher: create_fetcher(config)?,
            embedder: create_embedder(config)?,
            answer_model: create_answer_model(config)?,
            index: Arc::new(SqliteVectorIndex::new(pool.clone())),
            catalog: Arc::new(SqliteCatalog::new(pool.clone())),
            tasks: Arc::new(SqliteTaskStore::new(pool)),
            progress,
        };
        Self::with_components(config, components)
    }

    pub fn with_components(config: &Config, c: Components) -> anyhow::Result<Self> {
        let pipeline = Arc::new(IndexPipeline::new(
            c.fetcher,
            c.embedder.clone(),
            c.index.clone(),
            c.catalog.clone(),
            PipelineSettings::from_config(config),
        ));
        let retriever = Retriever::new(c.embedder, c.index.clone(), config.retrieval.top_k);
        let generator = AnswerGenerator::new(
            config.generation.mode,
            c.answer_model,
            config.retrieval.relevance_threshold,
        )
        .context("Invalid [generation] configuration")?;

        let mut runners: HashMap<TaskKind, Arc<dyn JobRunner>> = HashMap::new();
        runners.insert(
            TaskKind::Index,
            Arc::new(IndexJob::new(pipeline.clone(), c.progress)),
        );
        runners.insert(
            TaskKind::Wiki,
            Arc::new(WikiJob::new(c.catalog.clone(), c.index.clone())),
        );
        let orchestrator = Orchestrator::new(
            c.tasks,
            runners,
            OrchestratorSettings::from_config(&config.tasks),
        );

        Ok(Self {
            catalog: c.catalog,
            index: c.index,
            pipeline,
            retriever,
            generator,
            orchestrator,
        })
    }

    /// Recover persisted tasks and start the worker pool.
    pub async fn start_workers(&self) -> Result<()> {
        self.orchestrator.start().await
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }

    /// Submit `reference` for indexing. Returns the active index task for
    /// the repository if one is already pending or running.
    pub async fn submit_index(&self, reference: &str) -> Result<Task> {
        let repo = RepoRef::parse(reference)?;
        self.catalog
            .register_repository(Repository::new(repo.clone(), Utc::now()))
            .await?;
        self.orchestrator.submit(TaskKind::Index, &repo.key()).await
    }

    /// Fetch and chunk without writing anything.
    pub async fn plan_index(&self, reference: &str) -> Result<IndexPlan> {
        let repo = RepoRef::parse(reference)?;
        self.pipeline.plan(&repo).await
    }

    pub async fn status(&self, id: Uuid) -> Result<Task> {
        self.orchestrator
            .status(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<Task> {
        self.orchestrator.wait(id, timeout).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        self.orchestrator.cancel(id).await
    }

    pub async fn tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.orchestrator.store().list(status, limit).await
    }

    pub async fn prune_tasks(&self) -> Result<u64> {
        self.orchestrator.prune().await
    }

    /// The requested (or latest) wiki version. When the repository has
    /// no wiki yet, synthesis is submitted and the task returned.
    pub async fn wiki(&self, reference: &str, version: Option<u32>) -> Result<WikiResponse> {
        let repo = RepoRef::parse(reference)?;
        let key = repo.key();

        if let Some(version) = version {
            return match self.catalog.wiki(&key, Some(version)).await? {
                Some(wiki) => Ok(WikiResponse::Ready { wiki }),
                None => Err(Error::NotFound(format!("wiki version {version} of {repo}"))),
            };
        }
        if let Some(wiki) = self.catalog.wiki(&key, None).await? {
            return Ok(WikiResponse::Ready { wiki });
        }
        let task = self.regenerate_wiki(reference).await?;
        Ok(WikiResponse::Pending { task })
    }

    /// Submit synthesis of a new wiki version.
    pub async fn regenerate_wiki(&self, reference: &str) -> Result<Task> {
        let repo = RepoRef::parse(reference)?;
        let key = repo.key();
        if self.index.active_generation(&key).await?.is_none() {
            return Err(Error::NotIndexed(key));
        }
        self.orchestrator.submit(TaskKind::Wiki, &key).await
    }

    pub async fn wiki_versions(&self, reference: &str) -> Result<Vec<u32>> {
        let repo = RepoRef::parse(reference)?;
        self.catalog.wiki_versions(&repo.key()).await
    }

    /// Flag the repository so its next index run rebuilds the generation
    /// even when the content is unchanged. The current index stays
    /// queryable.
    pub async fn mark_stale(&self, reference: &str) -> Result<Repository> {
        let repo = RepoRef::parse(reference)?;
        let mut record = self
            .catalog
            .get_repository(&repo.key())
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository {repo}")))?;
        record.stale = true;
        record.updated_at = Utc::now();
        self.catalog.update_repository(&record).await?;
        tracing::info!(repository = %repo, "repository marked stale");
        Ok(record)
    }

    pub async fn repositories(&self) -> Result<Vec<Repository>> {
        self.catalog.list_repositories().await
    }

    /// Answer `question` from the repository's index.
    ///
    /// Failures come back as a user-facing [`ErrorInfo`]; storage and
    /// internal details are logged, not returned.
    pub async fn ask(
        &self,
        reference: &str,
        question: &str,
    ) -> std::result::Result<QueryResponse, ErrorInfo> {
        self.answer(reference, question).await.map_err(|err| {
            match err.kind() {
                ErrorKind::Storage | ErrorKind::Internal => {
                    tracing::error!(repository = reference, error = %err, "query failed")
                }
                _ => tracing::debug!(repository = reference, error = %err, "query rejected"),
            }
            ErrorInfo::user_facing(&err)
        })
    }

    async fn answer(&self, reference: &str, question: &str) -> Result<QueryResponse> {
        let repo = RepoRef::parse(reference)?;
        let retrieved = self.retriever.retrieve(&repo.key(), question).await?;
        let answer = self.generator.generate(question, &retrieved).await?;
        tracing::info!(
            repository = %repo,
            retrieved = retrieved.len(),
            sources = answer.sources.len(),
            outcome = ?answer.outcome,
            "question answered"
        );
        Ok(QueryResponse {
            answer_text: answer.text,
            source_chunks: answer.sources,
            outcome: answer.outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use deepwiki_core::embedding::HashEmbedder;
    use deepwiki_core::store::memory::{InMemoryCatalog, InMemoryVectorIndex};

    use super::*;
    use crate::progress::NoProgress;
    use crate::tasks::MemoryTaskStore;

    struct NoFetch;

    #[async_trait::async_trait]
    impl ContentFetcher for NoFetch {
        fn name(&self) -> &str {
            "none"
        }

        async fn fetch(&self, repo: &RepoRef) -> Result<deepwiki_core::fetch::DocumentSet> {
            Err(Error::NotFound(format!("{repo}")))
        }
    }

    fn service() -> DeepWiki {
        let config = Config::minimal("unused.sqlite");
        DeepWiki::with_components(
            &config,
            Components {
                fetcher: Arc::new(NoFetch),
                embedder: Arc::new(HashEmbedder::new(32)),
                answer_model: None,
                index: Arc::new(InMemoryVectorIndex::new()),
                catalog: Arc::new(InMemoryCatalog::new()),
                tasks: Arc::new(MemoryTaskStore::new()),
                progress: Arc::new(NoProgress),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn invalid_reference_creates_no_task() {
        let dw = service();
        let err = dw.submit_index("not a repo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(dw.tasks(None, 10).await.unwrap().is_empty());
        assert!(dw.repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ask_before_indexing_is_not_indexed() {
        let dw = service();
        let err = dw.ask("acme/widgets", "How do I install it?").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotIndexed);
        assert!(err.message.contains("acme/widgets"));
    }

    #[tokio::test]
    async fn wiki_requires_an_index() {
        let dw = service();
        let err = dw.wiki("acme/widgets", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotIndexed);
    }

    #[tokio::test]
    async fn mark_stale_unknown_repository_is_not_found() {
        let dw = service();
        let err = dw.mark_stale("acme/widgets").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn query_response_uses_camel_case() {
        let response = QueryResponse {
            answer_text: "x".into(),
            source_chunks: vec![],
            outcome: AnswerOutcome::InsufficientContext,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("answerText").is_some());
        assert!(json.get("sourceChunks").is_some());
    }

    #[test]
    fn generative_mode_without_model_is_rejected() {
        let mut config = Config::minimal("unused.sqlite");
        config.generation.mode = deepwiki_core::answer::GenerationMode::Generative;
        let result = DeepWiki::with_components(
            &config,
            Components {
                fetcher: Arc::new(NoFetch),
                embedder: Arc::new(HashEmbedder::new(32)),
                answer_model: None,
                index: Arc::new(InMemoryVectorIndex::new()),
                catalog: Arc::new(InMemoryCatalog::new()),
                tasks: Arc::new(MemoryTaskStore::new()),
                progress: Arc::new(NoProgress),
            },
        );
        assert!(result.is_err());
    }
}
