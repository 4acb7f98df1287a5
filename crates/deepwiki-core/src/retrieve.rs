//! Question → top-K chunks.

use std::sync::Arc;

use crate::embedding::{embed_one, Embedder};
use crate::error::{Error, ErrorKind, Result};
use crate::models::ScoredChunk;
use crate::store::VectorIndex;

/// Default number of chunks returned per question.
pub const DEFAULT_TOP_K: usize = 5;

/// Embeds a question and queries the vector index.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self {
            embedder,
            index,
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Return up to `top_k` chunks of `repository` most similar to
    /// `question`, best first.
    ///
    /// An unindexed repository is `NotIndexed`, never an empty result.
    pub async fn retrieve(&self, repository: &str, question: &str) -> Result<Vec<ScoredChunk>> {
        if question.trim().is_empty() {
            return Err(Error::InvalidArgument("question must not be empty".into()));
        }

        let vector = embed_one(self.embedder.as_ref(), question).await?;

        // A concurrent re-index may shrink the generation between reading
        // its size and querying it; re-read the size once in that case.
        let mut attempt = 0;
        loop {
            let generation = self
                .index
                .active_generation(repository)
                .await?
                .ok_or_else(|| Error::NotIndexed(repository.to_string()))?;
            let k = self.top_k.min(generation.entry_count);
            match self.index.query(repository, &vector, k).await {
                Err(e) if e.kind() == ErrorKind::InvalidArgument && attempt == 0 => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{Chunk, IndexSettings};
    use crate::store::memory::InMemoryVectorIndex;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: "doc".into(),
            path: "README.md".into(),
            start: 0,
            end: text.len(),
            chunk_index: 0,
            text: text.into(),
            hash: id.into(),
            source_url: None,
        }
    }

    async fn indexed(texts: &[&str]) -> (Arc<HashEmbedder>, Arc<InMemoryVectorIndex>) {
        let embedder = Arc::new(HashEmbedder::new(128));
        let index = Arc::new(InMemoryVectorIndex::new());
        let entries = texts
            .iter()
            .enumerate()
            .map(|(i, t)| (chunk(&format!("c{i}"), t), embedder.embed_text(t)))
            .collect();
        index
            .upsert("acme/widgets", IndexSettings::default(), entries)
            .await
            .unwrap();
        (embedder, index)
    }

    #[tokio::test]
    async fn clamps_k_to_entry_count() {
        let (embedder, index) = indexed(&["widgets are blue", "gadgets are red"]).await;
        let retriever = Retriever::new(embedder, index, DEFAULT_TOP_K);
        let hits = retriever.retrieve("acme/widgets", "blue widgets").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "c0");
    }

    #[tokio::test]
    async fn unindexed_repository_is_actionable() {
        let retriever = Retriever::new(
            Arc::new(HashEmbedder::new(16)),
            Arc::new(InMemoryVectorIndex::new()),
            5,
        );
        let err = retriever.retrieve("acme/unknown", "anything").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotIndexed);
        assert!(err.to_string().contains("indexing first"));
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let (embedder, index) = indexed(&["x"]).await;
        let retriever = Retriever::new(embedder, index, 5);
        let err = retriever.retrieve("acme/widgets", "   ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
