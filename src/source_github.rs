//! GitHub REST API content source.
//!
//! Workflow for one repository:
//! 1. `GET /repos/{owner}/{name}` for the default branch.
//! 2. `GET /repos/{owner}/{name}/branches/{branch}` for the head commit.
//! 3. `GET /repos/{owner}/{name}/readme?ref={sha}` for the README.
//! 4. `GET /repos/{owner}/{name}/contents?ref={sha}` for top-level files
//!    and doc directories, then one listing per doc directory.
//! 5. `GET /repos/{owner}/{name}/contents/{path}?ref={sha}` per selected
//!    file (base64 body).
//!
//! A missing, undecodable or oversized file or doc directory becomes a
//! warning. Rate limiting and server errors abort the whole fetch with a
//! transient error so the caller's backoff retries it; a partial set is
//! never built from throttled responses. `GITHUB_TOKEN`, when set, is
//! sent as a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use deepwiki_core::fetch::{ContentFetcher, DocumentSet, FetchWarning};
use deepwiki_core::models::{Document, Metadata, RepoRef};
use deepwiki_core::{Error, Result};
use serde_json::Value;

use crate::config::Config;
use crate::sources::{Candidate, DocSelector};

pub struct GithubFetcher {
    client: reqwest::Client,
    api_url: String,
    web_url: String,
    token: Option<String>,
    selector: DocSelector,
}

impl GithubFetcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch.timeout_secs))
            .user_agent(concat!("deepwiki/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: config.fetch.api_url.trim_end_matches('/').to_string(),
            web_url: config.fetch.web_url.trim_end_matches('/').to_string(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            selector: DocSelector::from_config(&config.fetch)?,
        })
    }

    async fn get_json(&self, path: &str, what: &str) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("GitHub request for {what} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                Error::SourceUnavailable(format!("GitHub returned an unreadable body for {what}: {e}"))
            });
        }

        let rate_limited = status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || (status == reqwest::StatusCode::FORBIDDEN
                && response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    == Some("0"));
        let body = response.text().await.unwrap_or_default();

        Err(if rate_limited {
            Error::RateLimited(format!("GitHub API rate limit hit while fetching {what}"))
        } else if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Error::NotFound(format!("{what} ({status})"))
        } else if status.is_server_error() {
            Error::SourceUnavailable(format!("GitHub API error {status} for {what}"))
        } else {
            Error::Internal(format!("GitHub API error {status} for {what}: {}", body.trim()))
        })
    }

    fn list_files(listing: &Value) -> Vec<Candidate> {
        entries(listing)
            .filter(|e| e.get("type").and_then(Value::as_str) == Some("file"))
            .filter_map(|e| {
                let path = e.get("path").and_then(Value::as_str)?;
                let size = e.get("size").and_then(Value::as_u64).unwrap_or(0);
                Some(Candidate::new(path, size))
            })
            .collect()
    }

    fn document(&self, repo: &RepoRef, revision: &str, path: &str, text: String, size: u64) -> Document {
        let metadata = Metadata::new(path)
            .with("url", repo.blob_url(&self.web_url, revision, path))
            .with("revision", revision)
            .with("size", size as i64);
        Document::new(repo, path, text, metadata, Utc::now())
    }
}

/// Keep a failed file or listing as a warning, or give the error back
/// when it is transient.
fn tolerate(
    repo: &RepoRef,
    path: &str,
    err: Error,
    warnings: &mut Vec<FetchWarning>,
) -> Result<()> {
    if err.is_transient() {
        tracing::warn!(repository = %repo, path, error = %err, "transient fetch failure");
        return Err(err);
    }
    tracing::warn!(repository = %repo, path, error = %err, "skipping document");
    warnings.push(FetchWarning {
        path: path.to_string(),
        message: err.to_string(),
    });
    Ok(())
}

fn entries(listing: &Value) -> impl Iterator<Item = &Value> {
    listing.as_array().into_iter().flatten()
}

/// Decode a contents-API body (base64 with embedded newlines).
fn decode_content(json: &Value, path: &str) -> Result<String> {
    let encoded = json
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Internal(format!("GitHub response for {path} has no content")))?;
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(cleaned)
        .map_err(|e| Error::Internal(format!("{path}: invalid base64 content: {e}")))?;
    String::from_utf8(bytes).map_err(|_| Error::Internal(format!("{path}: not valid UTF-8 text")))
}

#[async_trait]
impl ContentFetcher for GithubFetcher {
    fn name(&self) -> &str {
        "github"
    }

    async fn fetch(&self, repo: &RepoRef) -> Result<DocumentSet> {
        let base = format!("/repos/{}/{}", repo.owner(), repo.name());

        let meta = self.get_json(&base, &format!("repository {repo}")).await?;
        let default_branch = meta
            .get("default_branch")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string();
        let branch = self
            .get_json(
                &format!("{base}/branches/{default_branch}"),
                &format!("branch {default_branch}"),
            )
            .await?;
        let revision = branch
            .pointer("/commit/sha")
            .and_then(Value::as_str)
            .unwrap_or(&default_branch)
            .to_string();

        let mut warnings = Vec::new();

        // README, fetched whole; its body comes back with the metadata.
        let mut readme: Option<(Candidate, String)> = None;
        match self
            .get_json(&format!("{base}/readme?ref={revision}"), "README")
            .await
        {
            Ok(json) => {
                let path = json
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or("README.md")
                    .to_string();
                let size = json.get("size").and_then(Value::as_u64).unwrap_or(0);
                match decode_content(&json, &path) {
                    Ok(text) => readme = Some((Candidate::new(path, size), text)),
                    Err(e) => tolerate(repo, &path, e, &mut warnings)?,
                }
            }
            Err(e) if e.kind() == deepwiki_core::ErrorKind::NotFound => {
                tracing::debug!(repository = %repo, "repository has no README");
            }
            Err(e) => tolerate(repo, "README", e, &mut warnings)?,
        }

        let root = match self
            .get_json(&format!("{base}/contents?ref={revision}"), "root listing")
            .await
        {
            Ok(json) => json,
            Err(e) => {
                tolerate(repo, "/", e, &mut warnings)?;
                Value::Array(Vec::new())
            }
        };
        let top_level = Self::list_files(&root);

        let mut doc_children = Vec::new();
        let doc_dirs: Vec<String> = entries(&root)
            .filter(|e| e.get("type").and_then(Value::as_str) == Some("dir"))
            .filter_map(|e| e.get("path").and_then(Value::as_str))
            .filter(|p| self.selector.is_doc_dir(p))
            .map(str::to_string)
            .collect();
        for dir in doc_dirs {
            match self
                .get_json(&format!("{base}/contents/{dir}?ref={revision}"), &dir)
                .await
            {
                Ok(listing) => doc_children.extend(Self::list_files(&listing)),
                Err(e) => tolerate(repo, &dir, e, &mut warnings)?,
            }
        }

        let selection = self.selector.select(
            readme.as_ref().map(|(c, _)| c.clone()),
            top_level,
            doc_children,
        );
        warnings.extend(selection.warnings);

        let mut documents = Vec::with_capacity(selection.picked.len());
        for candidate in selection.picked {
            if let Some((readme_candidate, text)) = &readme {
                if readme_candidate.path == candidate.path {
                    documents.push(self.document(repo, &revision, &candidate.path, text.clone(), candidate.size));
                    continue;
                }
            }
            let fetched = self
                .get_json(
                    &format!("{base}/contents/{}?ref={revision}", candidate.path),
                    &candidate.path,
                )
                .await
                .and_then(|json| decode_content(&json, &candidate.path));
            match fetched {
                Ok(text) => documents.push(self.document(repo, &revision, &candidate.path, text, candidate.size)),
                Err(e) => tolerate(repo, &candidate.path, e, &mut warnings)?,
            }
        }

        if documents.is_empty() {
            return Err(Error::NotFound(format!("no selectable documents in {repo}")));
        }

        tracing::info!(
            repository = %repo,
            revision = %revision,
            documents = documents.len(),
            warnings = warnings.len(),
            "fetched documents from GitHub"
        );

        Ok(DocumentSet {
            repository: repo.clone(),
            default_branch: Some(default_branch),
            revision: Some(revision),
            documents,
            warnings,
        })
    }
}
