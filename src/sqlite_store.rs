//! SQLite-backed [`VectorIndex`] and [`Catalog`].
//!
//! An upsert writes the complete new generation inside one transaction
//! and swaps the `index_heads` pointer before committing, so readers
//! (each query runs in its own read transaction) observe either the old
//! or the new generation. Entries of the replaced generation are deleted
//! in the same transaction; generation metadata rows are kept as history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use deepwiki_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use deepwiki_core::models::{
    document_ids_of, Chunk, Document, Generation, IndexEntry, IndexSettings, Metadata, RepoRef,
    Repository, RepositoryStatus, ScoredChunk, TocNode, WikiDocument, WikiSection,
};
use deepwiki_core::store::memory::{batch_dims, check_k, rank};
use deepwiki_core::store::{Catalog, VectorIndex};
use deepwiki_core::{Error, Result};

fn db(err: sqlx::Error) -> Error {
    Error::storage(err)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn generation_from_row(row: &SqliteRow) -> Result<Generation> {
    let ids: String = row.get("document_ids_json");
    Ok(Generation {
        repository: row.get("repository"),
        number: row.get::<i64, _>("generation") as u64,
        created_at: from_millis(row.get("created_at")),
        entry_count: row.get::<i64, _>("entry_count") as usize,
        dims: row.get::<i64, _>("dims") as usize,
        document_ids: serde_json::from_str(&ids)?,
        settings: IndexSettings {
            max_chars: row.get::<i64, _>("max_chars") as usize,
            overlap_chars: row.get::<i64, _>("overlap_chars") as usize,
            embedding_model: row.get("embedding_model"),
        },
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        path: row.get("path"),
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        source_url: row.get("source_url"),
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let metadata: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        repository: row.get("repository"),
        path: row.get("path"),
        text: row.get("body"),
        content_hash: row.get("content_hash"),
        metadata: Metadata::from_json(&metadata)?,
        fetched_at: from_millis(row.get("fetched_at")),
    })
}

const HEAD_SQL: &str = r#"
    SELECT g.repository, g.generation, g.created_at, g.entry_count, g.dims, g.document_ids_json,
           g.max_chars, g.overlap_chars, g.embedding_model
    FROM index_heads h
    JOIN index_generations g ON g.repository = h.repository AND g.generation = h.generation
    WHERE h.repository = ?
"#;

const ENTRIES_SQL: &str = r#"
    SELECT sequence, chunk_id, document_id, path, start_offset, end_offset,
           chunk_index, text, hash, source_url, vector
    FROM index_entries
    WHERE repository = ? AND generation = ?
    ORDER BY sequence ASC
"#;

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(
        &self,
        repository: &str,
        settings: IndexSettings,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<Generation> {
        let dims = batch_dims(&entries)?;
        let mut tx = self.pool.begin().await.map_err(db)?;

        // Writing first takes the write lock before any read in this
        // transaction, so concurrent upserts queue on busy_timeout.
        sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dims', ?) ON CONFLICT(key) DO NOTHING")
            .bind(dims.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        let fixed: String = sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dims'")
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
        if fixed != dims.to_string() {
            return Err(Error::InvalidArgument(format!(
                "index holds {fixed}-dimensional vectors, got {dims}"
            )));
        }

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM index_heads WHERE repository = ?")
                .bind(repository)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
        let number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(generation), 0) + 1 FROM index_generations WHERE repository = ?",
        )
        .bind(repository)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;

        let meta = Generation {
            repository: repository.to_string(),
            number: number as u64,
            created_at: Utc::now(),
            entry_count: entries.len(),
            dims,
            document_ids: document_ids_of(entries.iter().map(|(c, _)| c)),
            settings,
        };

        for (sequence, (chunk, vector)) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO index_entries (repository, generation, sequence, chunk_id, document_id,
                                           path, start_offset, end_offset, chunk_index, text,
                                           hash, source_url, vector)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(repository)
            .bind(number)
            .bind(sequence as i64)
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.path)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(&chunk.source_url)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_generations (repository, generation, created_at, entry_count, dims,
                                           document_ids_json, max_chars, overlap_chars,
                                           embedding_model)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(repository)
        .bind(number)
        .bind(to_millis(meta.created_at))
        .bind(meta.entry_count as i64)
        .bind(dims as i64)
        .bind(serde_json::to_string(&meta.document_ids)?)
        .bind(meta.settings.max_chars as i64)
        .bind(meta.settings.overlap_chars as i64)
        .bind(&meta.settings.embedding_model)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO index_heads (repository, generation) VALUES (?, ?)
            ON CONFLICT(repository) DO UPDATE SET generation = excluded.generation
            "#,
        )
        .bind(repository)
        .bind(number)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if let Some(previous) = previous {
            sqlx::query("DELETE FROM index_entries WHERE repository = ? AND generation = ?")
                .bind(repository)
                .bind(previous)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        tracing::debug!(repository, generation = number, entries = meta.entry_count, "index generation swapped");
        Ok(meta)
    }

    async fn query(&self, repository: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let head = sqlx::query(HEAD_SQL)
            .bind(repository)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::NotIndexed(repository.to_string()))?;
        let generation = generation_from_row(&head)?;
        check_k(k, generation.entry_count)?;
        if vector.len() != generation.dims {
            return Err(Error::InvalidArgument(format!(
                "query vector has {} dimensions, index has {}",
                vector.len(),
                generation.dims
            )));
        }

        let rows = sqlx::query(ENTRIES_SQL)
            .bind(repository)
            .bind(generation.number as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                ScoredChunk {
                    chunk: chunk_from_row(row),
                    repository: repository.to_string(),
                    generation: generation.number,
                    sequence: row.get::<i64, _>("sequence") as u64,
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn active_generation(&self, repository: &str) -> Result<Option<Generation>> {
        let row = sqlx::query(HEAD_SQL)
            .bind(repository)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(generation_from_row).transpose()
    }

    async fn entries(&self, repository: &str) -> Result<Vec<IndexEntry>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let head: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM index_heads WHERE repository = ?")
                .bind(repository)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
        let Some(number) = head else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(ENTRIES_SQL)
            .bind(repository)
            .bind(number)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                IndexEntry {
                    chunk: chunk_from_row(row),
                    vector: blob_to_vec(&blob),
                    repository: repository.to_string(),
                    generation: number as u64,
                    sequence: row.get::<i64, _>("sequence") as u64,
                }
            })
            .collect())
    }
}

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn repository_from_row(row: &SqliteRow) -> Result<Repository> {
    let reference: String = row.get("reference");
    let status: String = row.get("status");
    Ok(Repository {
        reference: RepoRef::parse(&reference)?,
        default_branch: row.get("default_branch"),
        revision: row.get("revision"),
        status: RepositoryStatus::from_str_status(&status),
        last_indexed_at: row.get::<Option<i64>, _>("last_indexed_at").map(from_millis),
        stale: row.get::<i64, _>("stale") != 0,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn wiki_from_row(row: &SqliteRow) -> Result<WikiDocument> {
    let toc: String = row.get("toc_json");
    let sections: String = row.get("sections_json");
    Ok(WikiDocument {
        repository: row.get("repository"),
        version: row.get::<i64, _>("version") as u32,
        generation: row.get::<Option<i64>, _>("generation").map(|g| g as u64),
        toc: serde_json::from_str(&toc)?,
        sections: serde_json::from_str(&sections)?,
        created_at: from_millis(row.get("created_at")),
    })
}

const REPOSITORY_COLUMNS: &str = "key, reference, default_branch, revision, status, last_indexed_at, stale, created_at, updated_at";

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn register_repository(&self, repo: Repository) -> Result<Repository> {
        sqlx::query(
            r#"
            INSERT INTO repositories (key, reference, default_branch, revision, status,
                                      last_indexed_at, stale, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(repo.key())
        .bind(repo.reference.to_string())
        .bind(&repo.default_branch)
        .bind(&repo.revision)
        .bind(repo.status.as_str())
        .bind(repo.last_indexed_at.map(to_millis))
        .bind(repo.stale as i64)
        .bind(to_millis(repo.created_at))
        .bind(to_millis(repo.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        self.get_repository(&repo.key())
            .await?
            .ok_or_else(|| Error::storage(format!("repository {} vanished after insert", repo.key())))
    }

    async fn get_repository(&self, key: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(&format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE key = ?"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(repository_from_row).transpose()
    }

    async fn update_repository(&self, repo: &Repository) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories
            SET default_branch = ?, revision = ?, status = ?, last_indexed_at = ?,
                stale = ?, updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(&repo.default_branch)
        .bind(&repo.revision)
        .bind(repo.status.as_str())
        .bind(repo.last_indexed_at.map(to_millis))
        .bind(repo.stale as i64)
        .bind(to_millis(repo.updated_at))
        .bind(repo.key())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("repository {}", repo.key())));
        }
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query(&format!("SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY key"))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(repository_from_row).collect()
    }

    async fn put_documents(&self, repository: &str, docs: &[Document]) -> Result<()> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db)?;

        for doc in docs {
            sqlx::query(
                r#"
                INSERT INTO documents (id, repository, path, content_hash, body, metadata_json, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET superseded_at = NULL
                "#,
            )
            .bind(&doc.id)
            .bind(repository)
            .bind(&doc.path)
            .bind(&doc.content_hash)
            .bind(&doc.text)
            .bind(serde_json::to_string(&doc.metadata)?)
            .bind(to_millis(doc.fetched_at))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        let current: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE repository = ? AND superseded_at IS NULL",
        )
        .bind(repository)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        for id in current.iter().filter(|id| !docs.iter().any(|d| &d.id == *id)) {
            sqlx::query("UPDATE documents SET superseded_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn current_documents(&self, repository: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repository, path, content_hash, body, metadata_json, fetched_at
            FROM documents
            WHERE repository = ? AND superseded_at IS NULL
            ORDER BY path ASC
            "#,
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn documents(&self, repository: &str, ids: &[String]) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repository, path, content_hash, body, metadata_json, fetched_at
            FROM documents
            WHERE repository = ? AND id IN (SELECT value FROM json_each(?))
            ORDER BY path ASC
            "#,
        )
        .bind(repository)
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn save_wiki(
        &self,
        repository: &str,
        generation: Option<u64>,
        toc: Vec<TocNode>,
        sections: Vec<WikiSection>,
    ) -> Result<WikiDocument> {
        let created_at = Utc::now();
        // Version assignment and insert in one statement.
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO wiki_documents (repository, version, generation, toc_json, sections_json, created_at)
            SELECT ?, COALESCE(MAX(version), 0) + 1, ?, ?, ?, ?
            FROM wiki_documents WHERE repository = ?
            RETURNING version
            "#,
        )
        .bind(repository)
        .bind(generation.map(|g| g as i64))
        .bind(serde_json::to_string(&toc)?)
        .bind(serde_json::to_string(&sections)?)
        .bind(to_millis(created_at))
        .bind(repository)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        Ok(WikiDocument {
            repository: repository.to_string(),
            version: version as u32,
            generation,
            toc,
            sections,
            created_at: from_millis(to_millis(created_at)),
        })
    }

    async fn wiki(&self, repository: &str, version: Option<u32>) -> Result<Option<WikiDocument>> {
        let row = match version {
            Some(v) => {
                sqlx::query("SELECT * FROM wiki_documents WHERE repository = ? AND version = ?")
                    .bind(repository)
                    .bind(v as i64)
                    .fetch_optional(&self.pool)
                    .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM wiki_documents WHERE repository = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(repository)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db)?;
        row.as_ref().map(wiki_from_row).transpose()
    }

    async fn wiki_versions(&self, repository: &str) -> Result<Vec<u32>> {
        let versions: Vec<i64> = sqlx::query_scalar(
            "SELECT version FROM wiki_documents WHERE repository = ? ORDER BY version ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(versions.into_iter().map(|v| v as u32).collect())
    }
}
