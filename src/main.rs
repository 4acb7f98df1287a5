//! # DeepWiki CLI (`dwiki`)
//!
//! Indexes repositories, serves their wikis, and answers questions about
//! them from the command line.
//!
//! ## Usage
//!
//! ```bash
//! dwiki --config ./config/deepwiki.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dwiki init` | Create the SQLite database and run schema migrations |
//! | `dwiki index <owner/name>` | Submit an index task and wait for it |
//! | `dwiki status <task-id>` | Show a task's status, progress and result |
//! | `dwiki cancel <task-id>` | Cancel a pending or running task |
//! | `dwiki tasks list` | List recent tasks |
//! | `dwiki wiki <owner/name>` | Print the repository wiki as Markdown |
//! | `dwiki ask <owner/name> "<question>"` | Answer a question from the index |
//! | `dwiki stale <owner/name>` | Force a rebuild on the next index run |
//! | `dwiki repos` | List known repositories |
//! | `dwiki worker` | Run background workers until interrupted |
//!
//! ## Examples
//!
//! ```bash
//! dwiki init
//! dwiki index acme/widgets
//! dwiki wiki acme/widgets > widgets.md
//! dwiki ask acme/widgets "How do I install it?" --json
//! ```
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use deepwiki_core::models::WikiDocument;

use deepwiki::config::{self, Config};
use deepwiki::migrate;
use deepwiki::progress::{NoProgress, ProgressMode};
use deepwiki::service::{DeepWiki, WikiResponse};
use deepwiki::tasks::{Task, TaskStatus};

/// DeepWiki CLI: repository knowledge bases, wikis and grounded Q&A.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/deepwiki.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dwiki",
    about = "DeepWiki: turn a repository into a wiki and a Q&A surface",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/deepwiki.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index a repository (`owner/name` or a GitHub URL).
    ///
    /// Submits an index task, runs it on in-process workers and waits for
    /// it to finish. A second submission while one is active joins it.
    Index {
        repository: String,

        /// Fetch and chunk only; print the plan without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Submit and print the task id without running it here.
        /// A `dwiki worker` process picks it up.
        #[arg(long)]
        no_wait: bool,

        /// Give up waiting after this many seconds (the task keeps running).
        #[arg(long, default_value_t = 1800)]
        timeout: u64,

        /// Print the final task as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a task's status, progress, result or error.
    Status {
        task_id: Uuid,

        #[arg(long)]
        json: bool,
    },

    /// Cancel a pending or running task.
    Cancel { task_id: Uuid },

    /// Inspect or prune the task queue.
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Print a repository's wiki as Markdown.
    ///
    /// When no wiki exists yet, synthesis is run and awaited first.
    Wiki {
        repository: String,

        /// Print a specific version instead of the latest.
        #[arg(long)]
        version: Option<u32>,

        /// Synthesize a new version before printing.
        #[arg(long)]
        regenerate: bool,

        /// List available versions instead of printing.
        #[arg(long, conflicts_with_all = ["version", "regenerate"])]
        versions: bool,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question from a repository's index.
    Ask {
        repository: String,
        question: String,

        #[arg(long)]
        json: bool,
    },

    /// Mark a repository stale so the next index run rebuilds it.
    Stale { repository: String },

    /// List known repositories and their index state.
    Repos {
        #[arg(long)]
        json: bool,
    },

    /// Run background workers until Ctrl-C.
    Worker,
}

#[derive(Subcommand)]
enum TasksAction {
    /// List recent tasks, newest first.
    List {
        /// Only tasks in this status (pending, running, succeeded, failed).
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
    /// Delete finished tasks older than `[tasks].retention_hours`.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            repository,
            dry_run,
            no_wait,
            timeout,
            json,
        } => {
            run_index(&cfg, &repository, dry_run, no_wait, timeout, json).await?;
        }
        Commands::Status { task_id, json } => {
            let dw = open(&cfg).await?;
            let task = dw.status(task_id).await?;
            print_task(&task, json)?;
        }
        Commands::Cancel { task_id } => {
            let dw = open(&cfg).await?;
            if dw.cancel(task_id).await? {
                println!("Cancelled task {}.", task_id);
            } else {
                println!("Task {} had already finished.", task_id);
            }
        }
        Commands::Tasks { action } => {
            let dw = open(&cfg).await?;
            match action {
                TasksAction::List {
                    status,
                    limit,
                    json,
                } => {
                    let status = status.as_deref().map(TaskStatus::parse).transpose()?;
                    let tasks = dw.tasks(status, limit).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&tasks)?);
                    } else if tasks.is_empty() {
                        println!("No tasks.");
                    } else {
                        for task in &tasks {
                            println!(
                                "{}  {:<5}  {:<9}  {:>3}%  {}",
                                task.id,
                                task.kind.as_str(),
                                task.status.as_str(),
                                task.progress,
                                task.repository
                            );
                        }
                    }
                }
                TasksAction::Prune => {
                    let pruned = dw.prune_tasks().await?;
                    println!("Pruned {} task(s).", pruned);
                }
            }
        }
        Commands::Wiki {
            repository,
            version,
            regenerate,
            versions,
            json,
        } => {
            run_wiki(&cfg, &repository, version, regenerate, versions, json).await?;
        }
        Commands::Ask {
            repository,
            question,
            json,
        } => {
            let dw = open(&cfg).await?;
            match dw.ask(&repository, &question).await {
                Ok(response) if json => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                Ok(response) => {
                    println!("{}", response.answer_text);
                    if !response.source_chunks.is_empty() {
                        println!("\nSources:");
                        for (i, source) in response.source_chunks.iter().enumerate() {
                            let p = &source.provenance;
                            println!(
                                "  [{}] {}:{}-{} (score {:.3}){}",
                                i + 1,
                                p.path,
                                p.start,
                                p.end,
                                source.score,
                                p.url.as_deref().map(|u| format!("  {}", u)).unwrap_or_default()
                            );
                        }
                    }
                }
                Err(info) if json => {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                    std::process::exit(1);
                }
                Err(info) => bail!("{}: {}", info.kind, info.message),
            }
        }
        Commands::Stale { repository } => {
            let dw = open(&cfg).await?;
            let record = dw.mark_stale(&repository).await?;
            println!(
                "Marked {} stale; the next index run rebuilds it.",
                record.reference
            );
        }
        Commands::Repos { json } => {
            let dw = open(&cfg).await?;
            let repos = dw.repositories().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&repos)?);
            } else if repos.is_empty() {
                println!("No repositories.");
            } else {
                for repo in &repos {
                    println!(
                        "{:<40}  {:<9}  {}{}",
                        repo.reference.to_string(),
                        repo.status.as_str(),
                        repo.last_indexed_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "never".to_string()),
                        if repo.stale { "  (stale)" } else { "" }
                    );
                }
            }
        }
        Commands::Worker => {
            let dw = open(&cfg).await?;
            dw.start_workers().await?;
            tracing::info!(workers = cfg.tasks.workers, "workers started");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("shutting down; waiting for in-flight tasks");
            dw.shutdown().await;
        }
    }

    Ok(())
}

async fn open(cfg: &Config) -> anyhow::Result<DeepWiki> {
    DeepWiki::open(cfg, Arc::new(NoProgress)).await
}

async fn run_index(
    cfg: &Config,
    repository: &str,
    dry_run: bool,
    no_wait: bool,
    timeout: u64,
    json: bool,
) -> anyhow::Result<()> {
    if dry_run {
        let dw = open(cfg).await?;
        let plan = dw.plan_index(repository).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(());
        }
        println!(
            "Index plan for {} @ {}",
            plan.repository,
            plan.revision.as_deref().unwrap_or("unknown")
        );
        for doc in &plan.documents {
            println!("  {:<50}  {:>8} bytes  {:>4} chunks", doc.path, doc.bytes, doc.chunks);
        }
        println!(
            "{} document(s), {} chunk(s)",
            plan.documents.len(),
            plan.total_chunks
        );
        for warning in &plan.warnings {
            println!("  warning: {}", warning);
        }
        return Ok(());
    }

    let mode = if json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    let dw = DeepWiki::open(cfg, Arc::from(mode.reporter())).await?;
    if no_wait {
        let task = dw.submit_index(repository).await?;
        print_task(&task, json)?;
        return Ok(());
    }

    dw.start_workers().await?;
    let task = dw.submit_index(repository).await?;
    tracing::debug!(task = %task.id, "index task submitted");

    let finished = tokio::select! {
        result = dw.wait(task.id, Duration::from_secs(timeout)) => result,
        _ = tokio::signal::ctrl_c() => {
            dw.cancel(task.id).await?;
            dw.shutdown().await;
            bail!("Interrupted; task {} cancelled", task.id);
        }
    };
    dw.shutdown().await;
    let finished = finished?;
    print_task(&finished, json)?;
    if finished.status == TaskStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_wiki(
    cfg: &Config,
    repository: &str,
    version: Option<u32>,
    regenerate: bool,
    versions: bool,
    json: bool,
) -> anyhow::Result<()> {
    let dw = open(cfg).await?;
    if versions {
        let versions = dw.wiki_versions(repository).await?;
        if json {
            println!("{}", serde_json::to_string(&versions)?);
        } else {
            for v in versions {
                println!("{}", v);
            }
        }
        return Ok(());
    }

    let pending = if regenerate {
        Some(dw.regenerate_wiki(repository).await?)
    } else {
        match dw.wiki(repository, version).await? {
            WikiResponse::Ready { wiki } => {
                print_wiki(&wiki, json)?;
                return Ok(());
            }
            WikiResponse::Pending { task } => Some(task),
        }
    };

    if let Some(task) = pending {
        dw.start_workers().await?;
        let finished = dw.wait(task.id, Duration::from_secs(600)).await;
        dw.shutdown().await;
        let finished = finished?;
        if let Some(err) = finished.error {
            bail!("Wiki synthesis failed: {}: {}", err.kind, err.message);
        }
    }
    match dw.wiki(repository, None).await? {
        WikiResponse::Ready { wiki } => print_wiki(&wiki, json),
        WikiResponse::Pending { task } => bail!("Wiki is still being built (task {})", task.id),
    }
}

fn print_wiki(wiki: &WikiDocument, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(wiki)?);
    } else {
        print!("{}", wiki.render_markdown());
    }
    Ok(())
}

fn print_task(task: &Task, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
        return Ok(());
    }
    println!("Task:       {}", task.id);
    println!("Kind:       {}", task.kind.as_str());
    println!("Repository: {}", task.repository);
    println!("Status:     {} ({}%)", task.status, task.progress);
    if let Some(result) = &task.result {
        println!("Result:     {}", result);
    }
    if let Some(err) = &task.error {
        println!("Error:      {}: {}", err.kind, err.message);
    }
    for warning in &task.warnings {
        println!("Warning:    {}", warning);
    }
    Ok(())
}
