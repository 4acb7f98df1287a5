//! Idempotent schema setup. Timestamps are Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect and create every table, then close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            key TEXT PRIMARY KEY,
            reference TEXT NOT NULL,
            default_branch TEXT,
            revision TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            last_indexed_at INTEGER,
            stale INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Documents are immutable rows; a refetch with new content adds a row
    // and stamps the old one with superseded_at.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            fetched_at INTEGER NOT NULL,
            superseded_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_generations (
            repository TEXT NOT NULL,
            generation INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            entry_count INTEGER NOT NULL,
            dims INTEGER NOT NULL,
            document_ids_json TEXT NOT NULL DEFAULT '[]',
            max_chars INTEGER NOT NULL DEFAULT 0,
            overlap_chars INTEGER NOT NULL DEFAULT 0,
            embedding_model TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (repository, generation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The active-generation pointer; swapped inside the upsert transaction.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_heads (
            repository TEXT PRIMARY KEY,
            generation INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            repository TEXT NOT NULL,
            generation INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            chunk_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            path TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            source_url TEXT,
            vector BLOB NOT NULL,
            PRIMARY KEY (repository, generation, sequence)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            repository TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            result_json TEXT,
            error_kind TEXT,
            error_message TEXT,
            warnings_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wiki_documents (
            repository TEXT NOT NULL,
            version INTEGER NOT NULL,
            generation INTEGER,
            toc_json TEXT NOT NULL,
            sections_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (repository, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_repository ON documents(repository, superseded_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_dedup ON tasks(repository, kind, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, updated_at)")
        .execute(pool)
        .await?;

    Ok(())
}
