//! Job runners executed by the orchestrator's workers, one per task kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use deepwiki_core::models::RepoRef;
use deepwiki_core::store::{Catalog, VectorIndex};
use deepwiki_core::wiki::WikiSynthesizer;
use deepwiki_core::{Error, Result};

use crate::pipeline::IndexPipeline;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::tasks::Task;

/// What a finished job leaves on its task record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub result: serde_json::Value,
    pub warnings: Vec<String>,
}

impl JobOutput {
    fn from_serialize(result: &impl Serialize, warnings: Vec<String>) -> Result<Self> {
        Ok(Self {
            result: serde_json::to_value(result)?,
            warnings,
        })
    }
}

/// Progress sink handed to a running job. The worker forwards every
/// change to the task store.
pub struct TaskProgress {
    tx: watch::Sender<u8>,
}

impl TaskProgress {
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    pub fn set(&self, percent: u8) {
        let percent = percent.min(100);
        self.tx.send_if_modified(|current| {
            if *current == percent {
                false
            } else {
                *current = percent;
                true
            }
        });
    }
}

impl IndexProgressReporter for TaskProgress {
    fn report(&self, event: IndexProgressEvent) {
        self.set(event.percent());
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        progress: &TaskProgress,
        cancel: &CancellationToken,
    ) -> Result<JobOutput>;
}

/// Forwards pipeline events to the task record and to an outside observer.
struct Tee<'a> {
    task: &'a TaskProgress,
    observer: &'a dyn IndexProgressReporter,
}

impl IndexProgressReporter for Tee<'_> {
    fn report(&self, event: IndexProgressEvent) {
        self.task.report(event.clone());
        self.observer.report(event);
    }
}

pub struct IndexJob {
    pipeline: Arc<IndexPipeline>,
    observer: Arc<dyn IndexProgressReporter>,
}

impl IndexJob {
    pub fn new(pipeline: Arc<IndexPipeline>, observer: Arc<dyn IndexProgressReporter>) -> Self {
        Self { pipeline, observer }
    }
}

#[async_trait]
impl JobRunner for IndexJob {
    async fn run(
        &self,
        task: &Task,
        progress: &TaskProgress,
        cancel: &CancellationToken,
    ) -> Result<JobOutput> {
        let repo = RepoRef::parse(&task.repository)?;
        let reporter = Tee {
            task: progress,
            observer: self.observer.as_ref(),
        };
        let result = self.pipeline.run(&repo, &reporter, cancel).await?;
        let warnings = result.warnings.clone();
        JobOutput::from_serialize(&result, warnings)
    }
}

#[derive(Debug, Serialize)]
struct WikiResult {
    repository: String,
    version: u32,
    generation: Option<u64>,
    sections: usize,
}

/// Builds a new wiki version from the repository's current documents.
pub struct WikiJob {
    catalog: Arc<dyn Catalog>,
    index: Arc<dyn VectorIndex>,
    synthesizer: WikiSynthesizer,
}

impl WikiJob {
    pub fn new(catalog: Arc<dyn Catalog>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            catalog,
            index,
            synthesizer: WikiSynthesizer::default(),
        }
    }
}

#[async_trait]
impl JobRunner for WikiJob {
    async fn run(
        &self,
        task: &Task,
        progress: &TaskProgress,
        cancel: &CancellationToken,
    ) -> Result<JobOutput> {
        let key = task.repository.as_str();
        let generation = self
            .index
            .active_generation(key)
            .await?
            .ok_or_else(|| Error::NotIndexed(key.to_string()))?;
        // Build from the generation's own documents so the wiki matches the
        // generation number it is stamped with.
        let documents = self
            .catalog
            .documents(key, &generation.document_ids)
            .await?;
        if documents.is_empty() {
            return Err(Error::NotIndexed(key.to_string()));
        }
        progress.set(30);

        let wiki = self.synthesizer.synthesize(&documents)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        progress.set(80);

        let saved = self
            .catalog
            .save_wiki(key, Some(generation.number), wiki.toc, wiki.sections)
            .await?;
        tracing::info!(
            repository = key,
            version = saved.version,
            generation = generation.number,
            sections = saved.sections.len(),
            "wiki version saved"
        );

        JobOutput::from_serialize(
            &WikiResult {
                repository: key.to_string(),
                version: saved.version,
                generation: saved.generation,
                sections: saved.sections.len(),
            },
            Vec::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use deepwiki_core::models::{Chunk, Document, IndexSettings, Metadata};
    use deepwiki_core::store::memory::{InMemoryCatalog, InMemoryVectorIndex};
    use deepwiki_core::ErrorKind;

    use super::*;
    use crate::tasks::TaskKind;

    #[test]
    fn progress_only_signals_changes() {
        let (progress, mut rx) = TaskProgress::channel();
        progress.set(10);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 10);
        progress.set(10);
        assert!(!rx.has_changed().unwrap());
        progress.set(150);
        assert_eq!(*rx.borrow_and_update(), 100);
    }

    #[tokio::test]
    async fn wiki_job_requires_an_index() {
        let job = WikiJob::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(InMemoryVectorIndex::new()),
        );
        let task = Task::new(TaskKind::Wiki, "acme/widgets", Utc::now());
        let (progress, _rx) = TaskProgress::channel();
        let err = job
            .run(&task, &progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotIndexed);
    }

    #[tokio::test]
    async fn wiki_job_saves_a_version_per_run() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let repo = RepoRef::parse("acme/widgets").unwrap();
        let readme = Document::new(
            &repo,
            "README.md",
            "# Widgets\n\nIntro.\n\n## Usage\n\nUse it.\n".into(),
            Metadata::new("README.md"),
            Utc::now(),
        );
        catalog.put_documents("acme/widgets", &[readme.clone()]).await.unwrap();
        let chunk = Chunk {
            id: "c1".into(),
            document_id: readme.id.clone(),
            path: "README.md".into(),
            start: 0,
            end: 5,
            chunk_index: 0,
            text: "Intro".into(),
            hash: "h".into(),
            source_url: None,
        };
        let generation = index
            .upsert("acme/widgets", IndexSettings::default(), vec![(chunk, vec![1.0, 0.0])])
            .await
            .unwrap();

        let job = WikiJob::new(catalog.clone(), index);
        let task = Task::new(TaskKind::Wiki, "acme/widgets", Utc::now());
        let (progress, _rx) = TaskProgress::channel();
        let cancel = CancellationToken::new();
        let first = job.run(&task, &progress, &cancel).await.unwrap();
        let second = job.run(&task, &progress, &cancel).await.unwrap();

        assert_eq!(first.result["version"], 1);
        assert_eq!(second.result["version"], 2);
        assert_eq!(second.result["generation"], generation.number);
        let wiki = catalog.wiki("acme/widgets", None).await.unwrap().unwrap();
        assert!(!wiki.toc.is_empty());
    }

    #[tokio::test]
    async fn wiki_job_reads_the_generation_documents() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let repo = RepoRef::parse("acme/widgets").unwrap();
        let readme = |text: &str| {
            Document::new(&repo, "README.md", text.into(), Metadata::new("README.md"), Utc::now())
        };
        let indexed = readme("# Widgets\n\n## Usage\n\nUse it.\n");
        catalog.put_documents("acme/widgets", &[indexed.clone()]).await.unwrap();
        let chunk = Chunk {
            id: "c1".into(),
            document_id: indexed.id.clone(),
            path: "README.md".into(),
            start: 0,
            end: 9,
            chunk_index: 0,
            text: "# Widgets".into(),
            hash: "h".into(),
            source_url: None,
        };
        let generation = index
            .upsert("acme/widgets", IndexSettings::default(), vec![(chunk, vec![1.0, 0.0])])
            .await
            .unwrap();

        // A newer fetch has landed in the catalog but its generation has
        // not been committed yet.
        catalog
            .put_documents("acme/widgets", &[readme("# Widgets\n\n## Removal\n\nDelete it.\n")])
            .await
            .unwrap();

        let job = WikiJob::new(catalog.clone(), index);
        let task = Task::new(TaskKind::Wiki, "acme/widgets", Utc::now());
        let (progress, _rx) = TaskProgress::channel();
        let output = job.run(&task, &progress, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.result["generation"], generation.number);

        let wiki = catalog.wiki("acme/widgets", None).await.unwrap().unwrap();
        let titles: Vec<&str> = wiki.sections.iter().map(|s| s.title.as_str()).collect();
        assert!(titles.contains(&"Usage"), "sections: {titles:?}");
        assert!(!titles.contains(&"Removal"), "sections: {titles:?}");
    }
}
