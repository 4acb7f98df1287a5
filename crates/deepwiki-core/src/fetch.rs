//! Content fetcher abstraction.
//!
//! A [`ContentFetcher`] turns a [`RepoRef`] into a normalized
//! [`DocumentSet`]: the README plus a bounded selection of documentation
//! files. Implementations live in the app crate (GitHub REST API, shallow
//! git clone).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Document, RepoRef};

/// A file that could not be fetched. Its presence means the set is
/// partial content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWarning {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FetchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Everything fetched for one repository at one revision.
#[derive(Debug, Clone)]
pub struct DocumentSet {
    pub repository: RepoRef,
    pub default_branch: Option<String>,
    pub revision: Option<String>,
    /// README first, then the remaining selection in fetch order.
    pub documents: Vec<Document>,
    pub warnings: Vec<FetchWarning>,
}

impl DocumentSet {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Retrieves raw textual artifacts for a repository.
///
/// Errors: `NotFound` when the reference does not resolve or nothing is
/// selectable, `RateLimited`/`SourceUnavailable` for transient upstream
/// failures. Per-file failures are reported as [`FetchWarning`]s.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, repo: &RepoRef) -> Result<DocumentSet>;
}
