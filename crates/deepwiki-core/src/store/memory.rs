//! In-memory [`VectorIndex`] and [`Catalog`] implementations.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Each repository's active
//! generation is an `Arc` snapshot: upserts build the replacement outside
//! the lock and swap the pointer under a short write lock, and queries
//! clone the `Arc` and score outside the lock. Vector search is
//! brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    document_ids_of, Chunk, Document, Generation, IndexEntry, IndexSettings, Repository,
    ScoredChunk, TocNode, WikiDocument, WikiSection,
};

use super::{Catalog, VectorIndex};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| Error::storage("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| Error::storage("in-memory store lock poisoned"))
}

struct GenerationData {
    meta: Generation,
    entries: Vec<IndexEntry>,
}

/// Validate an upsert batch and return its dimensionality.
pub fn batch_dims(entries: &[(Chunk, Vec<f32>)]) -> Result<usize> {
    let Some((_, first)) = entries.first() else {
        return Err(Error::InvalidArgument(
            "cannot create an index generation with no entries".into(),
        ));
    };
    let dims = first.len();
    if dims == 0 {
        return Err(Error::InvalidArgument("embedding vectors must not be empty".into()));
    }
    if let Some((chunk, v)) = entries.iter().find(|(_, v)| v.len() != dims) {
        return Err(Error::InvalidArgument(format!(
            "chunk {} has {} dimensions, expected {dims}",
            chunk.id,
            v.len()
        )));
    }
    Ok(dims)
}

/// Check a query's `k` against the active generation's size.
pub fn check_k(k: usize, entry_count: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::InvalidArgument("k must be at least 1".into()));
    }
    if k > entry_count {
        return Err(Error::InvalidArgument(format!(
            "k ({k}) exceeds the number of indexed entries ({entry_count})"
        )));
    }
    Ok(())
}

/// Sort hits by descending score, then ascending sequence, and keep `k`.
pub fn rank(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    hits.truncate(k);
    hits
}

/// In-memory vector index for tests and single-process use.
pub struct InMemoryVectorIndex {
    partitions: RwLock<HashMap<String, Arc<GenerationData>>>,
    dims: Mutex<Option<usize>>,
    next_generation: AtomicU64,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            dims: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    fn fix_dims(&self, dims: usize) -> Result<()> {
        let mut fixed = self
            .dims
            .lock()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))?;
        match *fixed {
            Some(existing) if existing != dims => Err(Error::InvalidArgument(format!(
                "index holds {existing}-dimensional vectors, got {dims}"
            ))),
            Some(_) => Ok(()),
            None => {
                *fixed = Some(dims);
                Ok(())
            }
        }
    }

    fn snapshot(&self, repository: &str) -> Result<Option<Arc<GenerationData>>> {
        Ok(read(&self.partitions)?.get(repository).cloned())
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        repository: &str,
        settings: IndexSettings,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<Generation> {
        let dims = batch_dims(&entries)?;
        self.fix_dims(dims)?;

        let number = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let meta = Generation {
            repository: repository.to_string(),
            number,
            created_at: Utc::now(),
            entry_count: entries.len(),
            dims,
            document_ids: document_ids_of(entries.iter().map(|(c, _)| c)),
            settings,
        };
        let entries = entries
            .into_iter()
            .enumerate()
            .map(|(i, (chunk, vector))| IndexEntry {
                chunk,
                vector,
                repository: repository.to_string(),
                generation: number,
                sequence: i as u64,
            })
            .collect();
        let data = Arc::new(GenerationData {
            meta: meta.clone(),
            entries,
        });

        write(&self.partitions)?.insert(repository.to_string(), data);
        Ok(meta)
    }

    async fn query(&self, repository: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let data = self
            .snapshot(repository)?
            .ok_or_else(|| Error::NotIndexed(repository.to_string()))?;
        check_k(k, data.entries.len())?;
        if vector.len() != data.meta.dims {
            return Err(Error::InvalidArgument(format!(
                "query vector has {} dimensions, index has {}",
                vector.len(),
                data.meta.dims
            )));
        }

        let hits = data
            .entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                repository: e.repository.clone(),
                generation: e.generation,
                sequence: e.sequence,
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn active_generation(&self, repository: &str) -> Result<Option<Generation>> {
        Ok(self.snapshot(repository)?.map(|d| d.meta.clone()))
    }

    async fn entries(&self, repository: &str) -> Result<Vec<IndexEntry>> {
        Ok(self
            .snapshot(repository)?
            .map(|d| d.entries.clone())
            .unwrap_or_default())
    }
}

struct StoredDoc {
    doc: Document,
    superseded: bool,
}

/// In-memory catalog for tests and single-process use.
pub struct InMemoryCatalog {
    repositories: RwLock<HashMap<String, Repository>>,
    documents: RwLock<HashMap<String, Vec<StoredDoc>>>,
    wikis: RwLock<HashMap<String, Vec<WikiDocument>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            repositories: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            wikis: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn register_repository(&self, repo: Repository) -> Result<Repository> {
        let mut repos = write(&self.repositories)?;
        Ok(repos.entry(repo.key()).or_insert(repo).clone())
    }

    async fn get_repository(&self, key: &str) -> Result<Option<Repository>> {
        Ok(read(&self.repositories)?.get(key).cloned())
    }

    async fn update_repository(&self, repo: &Repository) -> Result<()> {
        let mut repos = write(&self.repositories)?;
        match repos.get_mut(&repo.key()) {
            Some(existing) => {
                *existing = repo.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("repository {}", repo.key()))),
        }
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let mut repos: Vec<Repository> = read(&self.repositories)?.values().cloned().collect();
        repos.sort_by_key(Repository::key);
        Ok(repos)
    }

    async fn put_documents(&self, repository: &str, docs: &[Document]) -> Result<()> {
        let mut all = write(&self.documents)?;
        let stored = all.entry(repository.to_string()).or_default();
        for s in stored.iter_mut() {
            s.superseded = !docs.iter().any(|d| d.id == s.doc.id);
        }
        for doc in docs {
            if !stored.iter().any(|s| s.doc.id == doc.id) {
                stored.push(StoredDoc {
                    doc: doc.clone(),
                    superseded: false,
                });
            }
        }
        Ok(())
    }

    async fn current_documents(&self, repository: &str) -> Result<Vec<Document>> {
        let all = read(&self.documents)?;
        let mut docs: Vec<Document> = all
            .get(repository)
            .map(|v| {
                v.iter()
                    .filter(|s| !s.superseded)
                    .map(|s| s.doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn documents(&self, repository: &str, ids: &[String]) -> Result<Vec<Document>> {
        let all = read(&self.documents)?;
        let mut docs: Vec<Document> = all
            .get(repository)
            .map(|v| {
                v.iter()
                    .filter(|s| ids.contains(&s.doc.id))
                    .map(|s| s.doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn save_wiki(
        &self,
        repository: &str,
        generation: Option<u64>,
        toc: Vec<TocNode>,
        sections: Vec<WikiSection>,
    ) -> Result<WikiDocument> {
        let mut wikis = write(&self.wikis)?;
        let versions = wikis.entry(repository.to_string()).or_default();
        let wiki = WikiDocument {
            repository: repository.to_string(),
            version: versions.last().map(|w| w.version + 1).unwrap_or(1),
            generation,
            toc,
            sections,
            created_at: Utc::now(),
        };
        versions.push(wiki.clone());
        Ok(wiki)
    }

    async fn wiki(&self, repository: &str, version: Option<u32>) -> Result<Option<WikiDocument>> {
        let wikis = read(&self.wikis)?;
        let Some(versions) = wikis.get(repository) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|w| w.version == v).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn wiki_versions(&self, repository: &str) -> Result<Vec<u32>> {
        Ok(read(&self.wikis)?
            .get(repository)
            .map(|v| v.iter().map(|w| w.version).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{Metadata, RepoRef};

    fn chunk(id: &str, doc: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            path: format!("{doc}.md"),
            start: 0,
            end: id.len(),
            chunk_index: 0,
            text: format!("text of {id}"),
            hash: format!("hash-{id}"),
            source_url: None,
        }
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                "acme/widgets",
                IndexSettings::default(),
                vec![
                    (chunk("a", "d1"), vec![1.0, 0.0]),
                    (chunk("b", "d1"), vec![0.9, 0.1]),
                    (chunk("c", "d2"), vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index.query("acme/widgets", &[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].score > hits[1].score && hits[1].score > hits[2].score);

        let err = index.query("acme/widgets", &[1.0, 0.0], 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = index.query("acme/widgets", &[1.0, 0.0], 4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn ties_break_by_sequence() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                "r",
                IndexSettings::default(),
                vec![
                    (chunk("first", "d"), vec![0.5, 0.5]),
                    (chunk("second", "d"), vec![0.5, 0.5]),
                ],
            )
            .await
            .unwrap();
        let hits = index.query("r", &[1.0, 1.0], 2).await.unwrap();
        assert_eq!(hits[0].chunk.id, "first");
        assert_eq!(hits[1].chunk.id, "second");
    }

    #[tokio::test]
    async fn unindexed_repository_is_an_error() {
        let index = InMemoryVectorIndex::new();
        let err = index.query("nobody/nothing", &[1.0], 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotIndexed);
        assert!(index.active_generation("nobody/nothing").await.unwrap().is_none());
        assert!(index.entries("nobody/nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_generation_and_fixes_dims() {
        let index = InMemoryVectorIndex::new();
        let g1 = index
            .upsert("r", IndexSettings::default(), vec![(chunk("a", "d1"), vec![1.0, 0.0])])
            .await
            .unwrap();
        let settings = IndexSettings {
            max_chars: 400,
            overlap_chars: 40,
            embedding_model: "hash-2".into(),
        };
        let g2 = index
            .upsert(
                "r",
                settings.clone(),
                vec![(chunk("b", "d2"), vec![0.0, 1.0]), (chunk("c", "d2"), vec![1.0, 1.0])],
            )
            .await
            .unwrap();
        assert!(g2.number > g1.number);
        assert_eq!(g2.document_ids, vec!["d2"]);
        assert_eq!(g2.settings, settings);

        let entries = index.entries("r").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.generation == g2.number));
        assert_eq!(entries[1].sequence, 1);

        let err = index
            .upsert(
                "other",
                IndexSettings::default(),
                vec![(chunk("x", "d"), vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = index
            .upsert("r", IndexSettings::default(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // Rejected upserts leave the active generation alone.
        assert_eq!(index.active_generation("r").await.unwrap().unwrap(), g2);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let index = InMemoryVectorIndex::new();
        for (repo, id) in [("a/one", "x"), ("b/two", "y")] {
            index
                .upsert(repo, IndexSettings::default(), vec![(chunk(id, "d"), vec![1.0])])
                .await
                .unwrap();
        }
        let hits = index.query("a/one", &[1.0], 1).await.unwrap();
        assert_eq!(hits[0].repository, "a/one");
        assert_eq!(hits[0].chunk.id, "x");
    }

    #[tokio::test]
    async fn catalog_supersedes_absent_documents() {
        let catalog = InMemoryCatalog::new();
        let repo = RepoRef::parse("acme/widgets").unwrap();
        let now = Utc::now();
        let readme = Document::new(&repo, "README.md", "v1".into(), Metadata::new("README.md"), now);
        let guide = Document::new(&repo, "docs/guide.md", "g".into(), Metadata::new("docs/guide.md"), now);
        catalog
            .put_documents("acme/widgets", &[readme.clone(), guide.clone()])
            .await
            .unwrap();

        let readme2 = Document::new(&repo, "README.md", "v2".into(), Metadata::new("README.md"), now);
        catalog
            .put_documents("acme/widgets", &[readme2.clone(), guide.clone()])
            .await
            .unwrap();

        let current = catalog.current_documents("acme/widgets").await.unwrap();
        let ids: Vec<&str> = current.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![readme2.id.as_str(), guide.id.as_str()]);

        // Superseded rows stay readable by id.
        let old = catalog
            .documents("acme/widgets", &[guide.id.clone(), readme.id.clone(), "missing".into()])
            .await
            .unwrap();
        let texts: Vec<&str> = old.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["v1", "g"]);
    }

    #[tokio::test]
    async fn catalog_registers_once_and_versions_wikis() {
        let catalog = InMemoryCatalog::new();
        let repo = RepoRef::parse("acme/widgets").unwrap();
        let first = catalog
            .register_repository(Repository::new(repo.clone(), Utc::now()))
            .await
            .unwrap();
        let mut updated = first.clone();
        updated.stale = true;
        catalog.update_repository(&updated).await.unwrap();
        let again = catalog
            .register_repository(Repository::new(repo, Utc::now()))
            .await
            .unwrap();
        assert!(again.stale);

        let w1 = catalog.save_wiki("acme/widgets", Some(3), vec![], vec![]).await.unwrap();
        let w2 = catalog.save_wiki("acme/widgets", Some(4), vec![], vec![]).await.unwrap();
        assert_eq!((w1.version, w2.version), (1, 2));
        assert_eq!(catalog.wiki("acme/widgets", None).await.unwrap().unwrap().version, 2);
        assert_eq!(
            catalog.wiki("acme/widgets", Some(1)).await.unwrap().unwrap().generation,
            Some(3)
        );
        assert!(catalog.wiki("acme/widgets", Some(9)).await.unwrap().is_none());
        assert_eq!(catalog.wiki_versions("acme/widgets").await.unwrap(), vec![1, 2]);
    }
}
