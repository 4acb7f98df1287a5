//! Bounded document selection and fetcher construction.
//!
//! Both content sources list the same candidates (the README, top-level
//! files, and the direct children of the configured doc directories) and
//! hand them to a [`DocSelector`], which applies the include globs and
//! the `max_documents` / `max_file_bytes` caps identically for both.

use std::sync::Arc;

use anyhow::{bail, Result};
use deepwiki_core::fetch::{ContentFetcher, FetchWarning};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::{Config, FetchConfig};
use crate::source_git::GitFetcher;
use crate::source_github::GithubFetcher;

/// A file the source could fetch, as seen in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub size: u64,
}

impl Candidate {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Default)]
pub struct Selection {
    /// README first, then top-level files, then doc-directory files.
    pub picked: Vec<Candidate>,
    /// Files skipped for exceeding `max_file_bytes`.
    pub warnings: Vec<FetchWarning>,
}

pub struct DocSelector {
    include: GlobSet,
    doc_dirs: Vec<String>,
    max_documents: usize,
    max_file_bytes: u64,
}

impl DocSelector {
    pub fn from_config(fetch: &FetchConfig) -> Result<Self> {
        Ok(Self {
            include: build_globset(&fetch.include_globs)?,
            doc_dirs: fetch.doc_dirs.iter().map(|d| d.to_lowercase()).collect(),
            max_documents: fetch.max_documents,
            max_file_bytes: fetch.max_file_bytes,
        })
    }

    /// `README`, `README.md`, `readme.rst`, ...
    pub fn is_readme(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        lower == "readme" || lower.starts_with("readme.")
    }

    pub fn is_doc_dir(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.doc_dirs.iter().any(|d| *d == lower)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.include.is_match(file_name)
    }

    pub fn select(
        &self,
        readme: Option<Candidate>,
        mut top_level: Vec<Candidate>,
        mut doc_children: Vec<Candidate>,
    ) -> Selection {
        let mut selection = Selection::default();
        top_level.sort_by(|a, b| a.path.cmp(&b.path));
        doc_children.sort_by(|a, b| a.path.cmp(&b.path));

        let ordered = readme.into_iter().chain(
            top_level
                .into_iter()
                .filter(|c| !Self::is_readme(c.file_name()) && self.matches(c.file_name()))
                .chain(
                    doc_children
                        .into_iter()
                        .filter(|c| self.matches(c.file_name())),
                ),
        );

        for candidate in ordered {
            if selection.picked.iter().any(|p| p.path == candidate.path) {
                continue;
            }
            if candidate.size > self.max_file_bytes {
                selection.warnings.push(FetchWarning {
                    message: format!(
                        "skipped: {} bytes exceeds the {} byte limit",
                        candidate.size, self.max_file_bytes
                    ),
                    path: candidate.path,
                });
                continue;
            }
            selection.picked.push(candidate);
        }

        if selection.picked.len() > self.max_documents {
            tracing::debug!(
                found = selection.picked.len(),
                max = self.max_documents,
                "truncating document selection"
            );
            selection.picked.truncate(self.max_documents);
        }
        selection
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Instantiate the configured content source.
pub fn create_fetcher(config: &Config) -> Result<Arc<dyn ContentFetcher>> {
    let fetcher: Arc<dyn ContentFetcher> = match config.fetch.source.as_str() {
        "github" => Arc::new(GithubFetcher::new(config)?),
        "git" => Arc::new(GitFetcher::new(config)?),
        other => bail!("Unknown fetch source: {}", other),
    };
    Ok(fetcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(max_documents: usize, max_file_bytes: u64) -> DocSelector {
        let fetch = FetchConfig {
            max_documents,
            max_file_bytes,
            ..FetchConfig::default()
        };
        DocSelector::from_config(&fetch).unwrap()
    }

    #[test]
    fn readme_comes_first_then_top_level_then_docs() {
        let s = selector(10, 1000);
        let sel = s.select(
            Some(Candidate::new("README.md", 10)),
            vec![
                Candidate::new("main.rs", 10),
                Candidate::new("CHANGELOG.md", 10),
                Candidate::new("README.md", 10),
                Candidate::new("AUTHORS.txt", 10),
            ],
            vec![Candidate::new("docs/b.md", 1), Candidate::new("docs/a.rst", 1)],
        );
        let paths: Vec<&str> = sel.picked.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["README.md", "AUTHORS.txt", "CHANGELOG.md", "docs/a.rst", "docs/b.md"]
        );
        assert!(sel.warnings.is_empty());
    }

    #[test]
    fn oversized_files_are_skipped_with_warning() {
        let s = selector(10, 100);
        let sel = s.select(None, vec![Candidate::new("BIG.md", 101)], vec![]);
        assert!(sel.picked.is_empty());
        assert_eq!(sel.warnings.len(), 1);
        assert_eq!(sel.warnings[0].path, "BIG.md");
    }

    #[test]
    fn selection_is_capped() {
        let s = selector(2, 1000);
        let sel = s.select(
            Some(Candidate::new("README", 1)),
            vec![Candidate::new("a.md", 1), Candidate::new("b.md", 1)],
            vec![],
        );
        assert_eq!(sel.picked.len(), 2);
        assert_eq!(sel.picked[0].path, "README");
    }

    #[test]
    fn doc_dirs_match_case_insensitively() {
        let s = selector(10, 1000);
        assert!(s.is_doc_dir("Docs"));
        assert!(!s.is_doc_dir("src"));
        assert!(DocSelector::is_readme("readme.rst"));
        assert!(!DocSelector::is_readme("READMEFIRST.md"));
    }
}
