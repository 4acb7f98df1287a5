//! Shallow-clone content source.
//!
//! Workflow:
//! 1. Determine a cache directory for the clone (`fetch.cache_dir`, or
//!    `.git-cache` next to the database).
//! 2. Clone `{web_url}/{owner}/{name}.git` (shallow if configured), or
//!    fetch and hard-reset an existing clone.
//! 3. List the README, top-level files and doc-directory children with
//!    `walkdir` (depth 1) and run the shared [`DocSelector`].
//! 4. Read the selected files as UTF-8.
//!
//! The `git` commands and file reads are blocking and run on
//! `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use chrono::Utc;
use deepwiki_core::fetch::{ContentFetcher, DocumentSet, FetchWarning};
use deepwiki_core::models::{Document, Metadata, RepoRef};
use deepwiki_core::{Error, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::Config;
use crate::sources::{Candidate, DocSelector};

pub struct GitFetcher {
    inner: std::sync::Arc<GitCache>,
}

struct GitCache {
    cache_root: PathBuf,
    web_url: String,
    shallow: bool,
    selector: DocSelector,
}

impl GitFetcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cache_root = match &config.fetch.cache_dir {
            Some(dir) => dir.clone(),
            None => config
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(".git-cache"),
        };
        Ok(Self {
            inner: std::sync::Arc::new(GitCache {
                cache_root,
                web_url: config.fetch.web_url.trim_end_matches('/').to_string(),
                shallow: config.fetch.shallow,
                selector: DocSelector::from_config(&config.fetch)?,
            }),
        })
    }
}

#[async_trait]
impl ContentFetcher for GitFetcher {
    fn name(&self) -> &str {
        "git"
    }

    async fn fetch(&self, repo: &RepoRef) -> Result<DocumentSet> {
        let cache = self.inner.clone();
        let repo = repo.clone();
        tokio::task::spawn_blocking(move || cache.fetch_blocking(&repo))
            .await
            .map_err(|e| Error::internal(format!("git fetch task failed: {e}")))?
    }
}

impl GitCache {
    fn fetch_blocking(&self, repo: &RepoRef) -> Result<DocumentSet> {
        let remote = format!("{}/{}/{}.git", self.web_url, repo.owner(), repo.name());
        let dir = self.cache_root.join(short_hash(&repo.key()));

        if dir.join(".git").exists() {
            self.update(&dir)?;
        } else {
            self.clone_into(&remote, &dir)?;
        }

        let revision = git(&dir, &["rev-parse", "HEAD"])?;
        let default_branch = git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"]).ok();

        let (readme, top_level, doc_children) = self.list(&dir);
        let selection = self.selector.select(readme, top_level, doc_children);
        let mut warnings = selection.warnings;

        let mut documents = Vec::with_capacity(selection.picked.len());
        for candidate in selection.picked {
            let full = dir.join(&candidate.path);
            let text = std::fs::read(&full)
                .map_err(|e| e.to_string())
                .and_then(|bytes| String::from_utf8(bytes).map_err(|_| "not valid UTF-8 text".into()));
            match text {
                Ok(text) => {
                    let metadata = Metadata::new(&candidate.path)
                        .with("url", repo.blob_url(&self.web_url, &revision, &candidate.path))
                        .with("revision", revision.as_str())
                        .with("size", candidate.size as i64);
                    documents.push(Document::new(repo, &candidate.path, text, metadata, Utc::now()));
                }
                Err(message) => {
                    tracing::warn!(repository = %repo, path = %candidate.path, %message, "read failed");
                    warnings.push(FetchWarning {
                        path: candidate.path,
                        message,
                    });
                }
            }
        }

        if documents.is_empty() {
            return Err(Error::NotFound(format!("no selectable documents in {repo}")));
        }

        tracing::info!(
            repository = %repo,
            revision = %revision,
            documents = documents.len(),
            "read documents from git clone"
        );

        Ok(DocumentSet {
            repository: repo.clone(),
            default_branch,
            revision: Some(revision),
            documents,
            warnings,
        })
    }

    fn clone_into(&self, remote: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.cache_root).map_err(|e| {
            Error::internal(format!(
                "Failed to create cache directory {}: {e}",
                self.cache_root.display()
            ))
        })?;

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--single-branch"]);
        if self.shallow {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg(remote).arg(dest);
        run(cmd, "git clone")
    }

    fn update(&self, dir: &Path) -> Result<()> {
        let mut fetch = Command::new("git");
        fetch.arg("fetch").current_dir(dir);
        if self.shallow {
            fetch.args(["--depth", "1"]);
        }
        fetch.args(["origin", "HEAD"]);
        run(fetch, "git fetch")?;

        let mut reset = Command::new("git");
        reset.args(["reset", "--hard", "FETCH_HEAD"]).current_dir(dir);
        run(reset, "git reset")
    }

    /// README, top-level files, and direct children of doc directories.
    fn list(&self, dir: &Path) -> (Option<Candidate>, Vec<Candidate>, Vec<Candidate>) {
        let mut readme = None;
        let mut top_level = Vec::new();
        let mut doc_children = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".git" {
                continue;
            }
            if entry.file_type().is_dir() {
                if self.selector.is_doc_dir(&name) {
                    doc_children.extend(files_in(entry.path(), &name));
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let candidate = Candidate::new(name.clone(), file_size(entry.path()));
            if readme.is_none() && DocSelector::is_readme(&name) {
                readme = Some(candidate);
            } else {
                top_level.push(candidate);
            }
        }

        (readme, top_level, doc_children)
    }
}

fn files_in(dir: &Path, prefix: &str) -> Vec<Candidate> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            Candidate::new(
                format!("{prefix}/{}", e.file_name().to_string_lossy()),
                file_size(e.path()),
            )
        })
        .collect()
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn run(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .output()
        .map_err(|e| Error::internal(format!("Failed to execute '{what}'. Is git installed? {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lower = stderr.to_lowercase();
    let missing = ["not found", "does not exist", "does not appear to be a git repository", "could not read username"];
    if missing.iter().any(|m| lower.contains(m)) {
        Err(Error::NotFound(format!("{what} failed: {stderr}")))
    } else {
        Err(Error::SourceUnavailable(format!("{what} failed: {stderr}")))
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::internal(format!("Failed to execute git: {e}")))?;
    if !output.status.success() {
        return Err(Error::internal(format!("git {} failed", args.join(" "))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn sh(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[tokio::test]
    async fn clones_and_selects_documents() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let origin = tmp.path().join("remotes/acme/widgets");
        std::fs::create_dir_all(origin.join("docs/nested")).unwrap();
        std::fs::write(origin.join("README.md"), "# Widgets\n\nHello.\n").unwrap();
        std::fs::write(origin.join("main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(origin.join("docs/guide.md"), "# Guide\n").unwrap();
        std::fs::write(origin.join("docs/nested/deep.md"), "# Deep\n").unwrap();
        sh(&origin, &["init", "-q"]);
        sh(&origin, &["add", "."]);
        sh(&origin, &["commit", "-q", "-m", "init"]);
        // Serve it as "{web_url}/acme/widgets.git".
        std::fs::rename(&origin, tmp.path().join("remotes/acme/widgets.git")).unwrap();

        let mut config = Config::minimal(tmp.path().join("db/dw.sqlite"));
        config.fetch.source = "git".into();
        config.fetch.web_url = format!("file://{}", tmp.path().join("remotes").display());
        config.fetch.cache_dir = Some(tmp.path().join("cache"));
        let fetcher = GitFetcher::new(&config).unwrap();

        let repo = RepoRef::parse("acme/widgets").unwrap();
        let set = fetcher.fetch(&repo).await.unwrap();
        let paths: Vec<&str> = set.documents.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "docs/guide.md"]);
        assert_eq!(set.revision.as_ref().map(|r| r.len()), Some(40));
        assert!(set.documents[0].url().unwrap().contains("/blob/"));

        // Second fetch reuses the clone.
        let again = fetcher.fetch(&repo).await.unwrap();
        assert_eq!(again.documents[0].id, set.documents[0].id);
    }

    #[tokio::test]
    async fn missing_remote_is_not_found() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path().join("dw.sqlite"));
        config.fetch.web_url = format!("file://{}", tmp.path().join("nowhere").display());
        config.fetch.cache_dir = Some(tmp.path().join("cache"));
        let fetcher = GitFetcher::new(&config).unwrap();
        let err = fetcher
            .fetch(&RepoRef::parse("acme/missing").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), deepwiki_core::ErrorKind::NotFound);
    }
}
