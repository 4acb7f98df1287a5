//! Asynchronous task execution.
//!
//! A fixed pool of tokio workers pulls task ids from an in-process queue.
//! The persisted task table is the source of truth: on start, tasks left
//! `RUNNING` by a crashed process are reset to `PENDING` and every
//! pending id is enqueued, and a poller re-enqueues pending ids so tasks
//! submitted by other processes sharing the database are picked up.
//! Duplicate ids in the queue are harmless; only one worker can claim a
//! pending task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use deepwiki_core::{Error, Result};

use crate::config::TasksConfig;
use crate::jobs::{JobRunner, TaskProgress};
use crate::tasks::{Task, TaskKind, TaskOutcome, TaskStore};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub retention: chrono::Duration,
    /// How often to look for pending tasks submitted elsewhere. Zero
    /// disables the poller.
    pub poll_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(tasks: &TasksConfig) -> Self {
        Self {
            workers: tasks.workers.max(1),
            retention: chrono::Duration::hours(tasks.retention_hours as i64),
            poll_interval: Duration::from_millis(tasks.poll_interval_ms),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    runners: HashMap<TaskKind, Arc<dyn JobRunner>>,
    settings: OrchestratorSettings,
    queue: mpsc::UnboundedSender<Uuid>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runners: HashMap<TaskKind, Arc<dyn JobRunner>>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let (queue, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            runners,
            settings,
            queue,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Recover persisted work and spawn the worker pool.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let requeued = self.store.requeue_running().await?;
        if requeued > 0 {
            tracing::warn!(requeued, "reset tasks interrupted by a previous shutdown");
        }
        self.enqueue_pending().await?;

        let mut handles = self
            .handles
            .lock()
            .map_err(|_| Error::internal("orchestrator lock poisoned"))?;
        for worker in 0..self.settings.workers {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.worker_loop(worker).await }));
        }
        if !self.settings.poll_interval.is_zero() {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.poll_loop().await }));
        }
        tracing::info!(workers = self.settings.workers, "task workers started");
        Ok(())
    }

    /// Create a task, or return the active one for the same
    /// (repository, kind).
    pub async fn submit(&self, kind: TaskKind, repository: &str) -> Result<Task> {
        let (task, created) = self
            .store
            .submit(Task::new(kind, repository, Utc::now()))
            .await?;
        if created {
            tracing::info!(task = %task.id, kind = kind.as_str(), repository, "task submitted");
            // A closed queue means the workers are gone; the task stays
            // pending in the store for the next start.
            let _ = self.queue.send(task.id);
        } else {
            tracing::debug!(task = %task.id, kind = kind.as_str(), repository, "joined active task");
        }
        Ok(task)
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<Task>> {
        self.store.get(id).await
    }

    /// Fail a non-terminal task with kind `cancelled` and stop its job.
    /// Returns `false` if the task was already terminal.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let changed = self.store.finish(id, TaskOutcome::cancelled()).await?;
        if let Some(token) = self
            .running
            .lock()
            .map_err(|_| Error::internal("orchestrator lock poisoned"))?
            .get(&id)
        {
            token.cancel();
        }
        if changed {
            tracing::info!(task = %id, "task cancelled");
        }
        Ok(changed)
    }

    /// Poll until the task is terminal or `timeout` elapses.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<Task> {
        let poll = async {
            loop {
                match self.store.get(id).await? {
                    Some(task) if task.status.is_terminal() => return Ok(task),
                    Some(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                    None => return Err(Error::NotFound(format!("task {id}"))),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::internal(format!("timed out waiting for task {id}")))?
    }

    /// Delete terminal tasks older than the retention window.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.settings.retention;
        let pruned = self.store.prune(cutoff).await?;
        tracing::info!(pruned, "pruned finished tasks");
        Ok(pruned)
    }

    /// Stop taking new work and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn enqueue_pending(&self) -> Result<()> {
        for id in self.store.pending().await? {
            let _ = self.queue.send(id);
        }
        Ok(())
    }

    async fn poll_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
            if let Err(e) = self.enqueue_pending().await {
                tracing::warn!(error = %e, "failed to poll pending tasks");
            }
        }
    }

    async fn worker_loop(&self, worker: usize) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                id = async { self.receiver.lock().await.recv().await } => id,
            };
            let Some(id) = next else { break };
            if let Err(e) = self.execute(id).await {
                tracing::error!(worker, task = %id, error = %e, "task bookkeeping failed");
            }
        }
        tracing::debug!(worker, "worker stopped");
    }

    async fn execute(&self, id: Uuid) -> Result<()> {
        let Some(task) = self.store.claim(id).await? else {
            return Ok(());
        };
        let Some(runner) = self.runners.get(&task.kind).cloned() else {
            let err = Error::internal(format!("no runner for {} tasks", task.kind.as_str()));
            self.store.finish(id, TaskOutcome::failed(&err)).await?;
            return Ok(());
        };

        let token = CancellationToken::new();
        self.running
            .lock()
            .map_err(|_| Error::internal("orchestrator lock poisoned"))?
            .insert(id, token.clone());

        let (progress, mut rx) = TaskProgress::channel();
        let store = Arc::clone(&self.store);
        let forwarder = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let percent = *rx.borrow_and_update();
                if let Err(e) = store.set_progress(id, percent).await {
                    tracing::warn!(task = %id, error = %e, "failed to record progress");
                }
            }
        });

        tracing::info!(task = %id, kind = task.kind.as_str(), repository = %task.repository, "task started");
        let result = runner.run(&task, &progress, &token).await;
        drop(progress);
        let _ = forwarder.await;

        if let Ok(mut running) = self.running.lock() {
            running.remove(&id);
        }

        let outcome = match result {
            Ok(output) => TaskOutcome::Succeeded {
                result: output.result,
                warnings: output.warnings,
            },
            Err(err) => {
                tracing::warn!(task = %id, kind = task.kind.as_str(), error = %err, "task failed");
                TaskOutcome::failed(&err)
            }
        };
        let succeeded = matches!(outcome, TaskOutcome::Succeeded { .. });
        if self.store.finish(id, outcome).await? {
            tracing::info!(task = %id, succeeded, "task finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use deepwiki_core::ErrorKind;

    use super::*;
    use crate::jobs::JobOutput;
    use crate::tasks::{MemoryTaskStore, TaskStatus};

    /// Blocks until released or cancelled.
    struct GatedJob {
        release: tokio::sync::Notify,
        runs: AtomicUsize,
        fail_with: Option<ErrorKind>,
    }

    impl GatedJob {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: tokio::sync::Notify::new(),
                runs: AtomicUsize::new(0),
                fail_with: None,
            })
        }
    }

    #[async_trait]
    impl JobRunner for GatedJob {
        async fn run(
            &self,
            task: &Task,
            progress: &TaskProgress,
            cancel: &CancellationToken,
        ) -> deepwiki_core::Result<JobOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            progress.set(50);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.release.notified() => {}
            }
            if let Some(ErrorKind::RateLimited) = self.fail_with {
                return Err(Error::RateLimited("slow down".into()));
            }
            Ok(JobOutput {
                result: serde_json::json!({ "repository": task.repository }),
                warnings: vec![],
            })
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            workers: 2,
            retention: chrono::Duration::hours(1),
            poll_interval: Duration::ZERO,
        }
    }

    fn orchestrator(store: Arc<dyn TaskStore>, job: Arc<GatedJob>) -> Arc<Orchestrator> {
        let mut runners: HashMap<TaskKind, Arc<dyn JobRunner>> = HashMap::new();
        runners.insert(TaskKind::Index, job);
        Orchestrator::new(store, runners, settings())
    }

    async fn wait_for_status(o: &Orchestrator, id: Uuid, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = o.status(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn runs_submitted_task_to_success() {
        let job = GatedJob::new();
        let o = orchestrator(Arc::new(MemoryTaskStore::new()), job.clone());
        o.start().await.unwrap();

        let task = o.submit(TaskKind::Index, "acme/widgets").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let running = wait_for_status(&o, task.id, TaskStatus::Running).await;
        assert!(running.started_at.is_some());

        // A duplicate submission while running joins the same task.
        let dup = o.submit(TaskKind::Index, "acme/widgets").await.unwrap();
        assert_eq!(dup.id, task.id);

        job.release.notify_one();
        let done = o.wait(task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result.unwrap()["repository"], "acme/widgets");
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        o.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_fails_running_task_with_cancelled() {
        let job = GatedJob::new();
        let o = orchestrator(Arc::new(MemoryTaskStore::new()), job.clone());
        o.start().await.unwrap();

        let task = o.submit(TaskKind::Index, "acme/widgets").await.unwrap();
        wait_for_status(&o, task.id, TaskStatus::Running).await;
        assert!(o.cancel(task.id).await.unwrap());

        let done = o.wait(task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(!o.cancel(task.id).await.unwrap());
        o.shutdown().await;
    }

    #[tokio::test]
    async fn failure_is_recorded_with_kind() {
        let job = Arc::new(GatedJob {
            release: tokio::sync::Notify::new(),
            runs: AtomicUsize::new(0),
            fail_with: Some(ErrorKind::RateLimited),
        });
        let o = orchestrator(Arc::new(MemoryTaskStore::new()), job.clone());
        o.start().await.unwrap();

        let task = o.submit(TaskKind::Index, "acme/widgets").await.unwrap();
        wait_for_status(&o, task.id, TaskStatus::Running).await;
        job.release.notify_one();
        let done = o.wait(task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        let error = done.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RateLimited);
        assert!(!error.message.is_empty());
        o.shutdown().await;
    }

    #[tokio::test]
    async fn start_recovers_interrupted_tasks() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let (task, _) = store
            .submit(Task::new(TaskKind::Index, "acme/widgets", Utc::now()))
            .await
            .unwrap();
        store.claim(task.id).await.unwrap();

        let job = GatedJob::new();
        let o = orchestrator(store.clone(), job.clone());
        o.start().await.unwrap();
        wait_for_status(&o, task.id, TaskStatus::Running).await;
        job.release.notify_one();
        let done = o.wait(task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        o.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_kind_fails_task() {
        let o = orchestrator(Arc::new(MemoryTaskStore::new()), GatedJob::new());
        o.start().await.unwrap();
        let task = o.submit(TaskKind::Wiki, "acme/widgets").await.unwrap();
        let done = o.wait(task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::Internal);
        o.shutdown().await;
    }
}
