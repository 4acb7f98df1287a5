//! Persisted task records and their stores.
//!
//! A task moves `PENDING → RUNNING → {SUCCEEDED, FAILED}` and never
//! leaves a terminal state. Every transition is a conditional update on
//! the current status, so a cancellation that lands first wins over a
//! worker that finishes later, and a worker cannot start a task that was
//! cancelled while queued.
//!
//! [`TaskStore::submit`] is the de-duplication point: it inserts a new
//! task only when no non-terminal task exists for the same
//! (repository, kind), atomically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use deepwiki_core::{Error, ErrorInfo, ErrorKind, Result};

use crate::sqlite_store::{from_millis, to_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Index,
    Wiki,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Wiki => "wiki",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(Self::Index),
            "wiki" => Ok(Self::Wiki),
            other => Err(Error::storage(format!("unknown task kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::InvalidArgument(format!("unknown task status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    /// Canonical repository key (`owner/name`, lower-cased).
    pub repository: String,
    pub status: TaskStatus,
    /// 0-100.
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: TaskKind, repository: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            repository: repository.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            warnings: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded {
        result: serde_json::Value,
        warnings: Vec<String>,
    },
    Failed {
        error: ErrorInfo,
        warnings: Vec<String>,
    },
}

impl TaskOutcome {
    pub fn failed(err: &Error) -> Self {
        Self::Failed {
            error: err.info(),
            warnings: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::Failed {
            error: ErrorInfo::new(ErrorKind::Cancelled, "task was cancelled"),
            warnings: Vec::new(),
        }
    }

    fn apply(self, task: &mut Task, now: DateTime<Utc>) {
        match self {
            Self::Succeeded { result, warnings } => {
                task.status = TaskStatus::Succeeded;
                task.progress = 100;
                task.result = Some(result);
                task.warnings = warnings;
            }
            Self::Failed { error, warnings } => {
                task.status = TaskStatus::Failed;
                task.error = Some(error);
                task.warnings = warnings;
            }
        }
        task.finished_at = Some(now);
        task.updated_at = now;
    }
}

/// Persistence for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `task` unless a non-terminal task exists for its
    /// (repository, kind). Returns the task that is now active and
    /// whether it was newly created.
    async fn submit(&self, task: Task) -> Result<(Task, bool)>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    /// `PENDING → RUNNING` with progress 0. `None` if the task is no
    /// longer pending.
    async fn claim(&self, id: Uuid) -> Result<Option<Task>>;

    /// Update the progress of a running task.
    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<()>;

    /// Move a non-terminal task to its terminal state. Returns `false`
    /// when the task was already terminal.
    async fn finish(&self, id: Uuid, outcome: TaskOutcome) -> Result<bool>;

    /// Most recently created first, optionally filtered by status.
    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>>;

    /// Ids of pending tasks, oldest first.
    async fn pending(&self) -> Result<Vec<Uuid>>;

    /// Reset tasks left `RUNNING` by a previous process to `PENDING`.
    async fn requeue_running(&self) -> Result<u64>;

    /// Delete terminal tasks last updated before `cutoff`, keeping the
    /// latest succeeded index task of every repository.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory task store for tests and single-process use.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Task>>> {
        self.tasks
            .lock()
            .map_err(|_| Error::storage("task store lock poisoned"))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn submit(&self, task: Task) -> Result<(Task, bool)> {
        let mut tasks = self.lock()?;
        if let Some(active) = tasks.values().find(|t| {
            t.repository == task.repository && t.kind == task.kind && !t.status.is_terminal()
        }) {
            return Ok((active.clone(), false));
        }
        tasks.insert(task.id, task.clone());
        Ok((task, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Task>> {
        let mut tasks = self.lock()?;
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.progress = 0;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        if let Some(task) = self.lock()?.get_mut(&id) {
            if task.status == TaskStatus::Running {
                task.progress = progress.min(100);
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finish(&self, id: Uuid, outcome: TaskOutcome) -> Result<bool> {
        let mut tasks = self.lock()?;
        match tasks.get_mut(&id) {
            Some(task) if !task.status.is_terminal() => {
                outcome.apply(task, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .lock()?
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn pending(&self) -> Result<Vec<Uuid>> {
        let mut tasks: Vec<(DateTime<Utc>, Uuid)> = self
            .lock()?
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| (t.created_at, t.id))
            .collect();
        tasks.sort();
        Ok(tasks.into_iter().map(|(_, id)| id).collect())
    }

    async fn requeue_running(&self) -> Result<u64> {
        let mut count = 0;
        for task in self.lock()?.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.progress = 0;
                task.started_at = None;
                task.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.lock()?;
        let mut keep: HashMap<String, (DateTime<Utc>, Uuid)> = HashMap::new();
        for t in tasks.values() {
            if t.kind == TaskKind::Index && t.status == TaskStatus::Succeeded {
                let entry = keep.entry(t.repository.clone()).or_insert((t.updated_at, t.id));
                if t.updated_at > entry.0 {
                    *entry = (t.updated_at, t.id);
                }
            }
        }
        let before = tasks.len();
        tasks.retain(|id, t| {
            !t.status.is_terminal()
                || t.updated_at >= cutoff
                || keep.get(&t.repository).is_some_and(|(_, kept)| kept == id)
        });
        Ok((before - tasks.len()) as u64)
    }
}

/// SQLite task store over the `tasks` table.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db(err: sqlx::Error) -> Error {
    Error::storage(err)
}

const TASK_COLUMNS: &str = "id, kind, repository, status, progress, result_json, error_kind, error_message, warnings_json, created_at, started_at, finished_at, updated_at";

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result_json");
    let error_kind: Option<String> = row.get("error_kind");
    let error_message: Option<String> = row.get("error_message");
    let warnings: String = row.get("warnings_json");

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(Error::storage)?,
        kind: TaskKind::parse(&kind)?,
        repository: row.get("repository"),
        status: TaskStatus::parse(&status)?,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: error_kind.map(|k| {
            ErrorInfo::new(ErrorKind::from_str_kind(&k), error_message.unwrap_or_default())
        }),
        warnings: serde_json::from_str(&warnings)?,
        created_at: from_millis(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(from_millis),
        updated_at: from_millis(row.get("updated_at")),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn submit(&self, task: Task) -> Result<(Task, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, repository, status, progress, warnings_json, created_at, updated_at)
            SELECT ?, ?, ?, 'PENDING', 0, '[]', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks
                WHERE repository = ? AND kind = ? AND status IN ('PENDING', 'RUNNING')
            )
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(&task.repository)
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .bind(&task.repository)
        .bind(task.kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();

        if inserted == 1 {
            return Ok((task, true));
        }

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE repository = ? AND kind = ? AND status IN ('PENDING', 'RUNNING') ORDER BY created_at LIMIT 1"
        ))
        .bind(&task.repository)
        .bind(task.kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        match row {
            Some(row) => Ok((task_from_row(&row)?, false)),
            // The blocking task finished between the two statements.
            None => self.submit(task).await,
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Task>> {
        let now = to_millis(Utc::now());
        let claimed = sqlx::query(
            r#"
            UPDATE tasks SET status = 'RUNNING', progress = 0, started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();

        if claimed == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        sqlx::query("UPDATE tasks SET progress = ?, updated_at = ? WHERE id = ? AND status = 'RUNNING'")
            .bind(progress.min(100) as i64)
            .bind(to_millis(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn finish(&self, id: Uuid, outcome: TaskOutcome) -> Result<bool> {
        let now = to_millis(Utc::now());
        let (status, progress, result, error, warnings) = match outcome {
            TaskOutcome::Succeeded { result, warnings } => {
                (TaskStatus::Succeeded, Some(100i64), Some(result), None, warnings)
            }
            TaskOutcome::Failed { error, warnings } => {
                (TaskStatus::Failed, None, None, Some(error), warnings)
            }
        };

        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = COALESCE(?, progress), result_json = ?,
                error_kind = ?, error_message = ?, warnings_json = ?,
                finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(result.map(|r| r.to_string()))
        .bind(error.as_ref().map(|e| e.kind.as_str()))
        .bind(error.as_ref().map(|e| e.message.clone()))
        .bind(serde_json::to_string(&warnings)?)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn pending(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM tasks WHERE status = 'PENDING' ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
        ids.iter()
            .map(|id| Uuid::parse_str(id).map_err(Error::storage))
            .collect()
    }

    async fn requeue_running(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'PENDING', progress = 0, started_at = NULL, updated_at = ? WHERE status = 'RUNNING'",
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('SUCCEEDED', 'FAILED')
              AND updated_at < ?
              AND id NOT IN (
                  SELECT t.id FROM tasks t
                  WHERE t.kind = 'index' AND t.status = 'SUCCEEDED'
                    AND t.updated_at = (
                        SELECT MAX(t2.updated_at) FROM tasks t2
                        WHERE t2.repository = t.repository
                          AND t2.kind = 'index' AND t2.status = 'SUCCEEDED'
                    )
              )
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }
}
