//! Core data models used throughout DeepWiki.
//!
//! These types represent the repositories, documents, chunks, index
//! entries and wiki documents that flow through the indexing and
//! retrieval pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

static OWNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,37}[A-Za-z0-9])?$").expect("valid owner regex")
});

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,100}$").expect("valid name regex"));

/// Canonical reference to a public repository on the content host.
///
/// Parsed from `owner/name`, a web URL (`https://github.com/owner/name`,
/// optionally with `.git`, a trailing slash, or a `/tree/...` or
/// `/blob/...` suffix) or an SSH remote (`git@github.com:owner/name.git`).
/// The original casing is kept for API calls; [`RepoRef::key`] is the
/// lower-cased identity used everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoRef {
    owner: String,
    name: String,
}

impl RepoRef {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(Error::Validation("repository reference is empty".into()));
        }

        let (path, from_url) = if let Some(rest) = raw.strip_prefix("git@github.com:") {
            (rest, true)
        } else if let Some((scheme, rest)) = raw.split_once("://") {
            if !matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https") {
                return Err(Error::Validation(format!("unsupported URL scheme in '{raw}'")));
            }
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            let host = host.to_ascii_lowercase();
            if host != "github.com" && host != "www.github.com" {
                return Err(Error::Validation(format!(
                    "'{raw}' is not a github.com repository URL"
                )));
            }
            (path, true)
        } else if let Some(rest) = raw.strip_prefix("github.com/") {
            (rest, true)
        } else {
            (raw, false)
        };

        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();

        let (owner, name) = match segments.as_slice() {
            [owner, name] => (*owner, *name),
            [owner, name, marker, ..] if from_url && matches!(*marker, "tree" | "blob") => {
                (*owner, *name)
            }
            _ => {
                return Err(Error::Validation(format!(
                    "expected 'owner/name' but got '{raw}'"
                )))
            }
        };
        let name = name.strip_suffix(".git").unwrap_or(name);

        Self::new(owner, name)
    }

    /// Build a reference from already-split parts, validating both.
    pub fn new(owner: &str, name: &str) -> Result<Self> {
        if !OWNER_RE.is_match(owner) {
            return Err(Error::Validation(format!(
                "invalid owner '{owner}': use letters, digits and inner hyphens (max 39)"
            )));
        }
        if !NAME_RE.is_match(name) || name.contains("..") || name.starts_with('-') {
            return Err(Error::Validation(format!(
                "invalid repository name '{name}'"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased `owner/name`; the repository's identity.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name).to_lowercase()
    }

    pub fn web_url(&self, web_base: &str) -> String {
        format!(
            "{}/{}/{}",
            web_base.trim_end_matches('/'),
            self.owner,
            self.name
        )
    }

    /// Web link to a file at a given revision.
    pub fn blob_url(&self, web_base: &str, revision: &str, path: &str) -> String {
        format!("{}/blob/{}/{}", self.web_url(web_base), revision, path)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl TryFrom<String> for RepoRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RepoRef> for String {
    fn from(value: RepoRef) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    New,
    Indexing,
    Indexed,
    Failed,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Indexing => "indexing",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_status(s: &str) -> Self {
        match s {
            "indexing" => Self::Indexing,
            "indexed" => Self::Indexed,
            "failed" => Self::Failed,
            _ => Self::New,
        }
    }
}

/// A repository known to the catalog. Never deleted, only marked stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub reference: RepoRef,
    pub default_branch: Option<String>,
    pub revision: Option<String>,
    pub status: RepositoryStatus,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(reference: RepoRef, now: DateTime<Utc>) -> Self {
        Self {
            reference,
            default_branch: None,
            revision: None,
            status: RepositoryStatus::New,
            last_indexed_at: None,
            stale: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        self.reference.key()
    }
}

/// A primitive metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Typed string-to-primitive map attached to every document.
///
/// `path` is always present. Well-known optional keys are `url`,
/// `revision` and `size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new(path: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert("path".to_string(), MetaValue::from(path));
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a key. Overwriting `path` is allowed; removing it is not.
    pub fn insert(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn path(&self) -> &str {
        self.get("path").and_then(MetaValue::as_str).unwrap_or_default()
    }

    pub fn url(&self) -> Option<&str> {
        self.get("url").and_then(MetaValue::as_str)
    }

    /// Parse metadata from stored JSON, rejecting maps without `path`.
    pub fn from_json(json: &str) -> Result<Self> {
        let meta: Self = serde_json::from_str(json)?;
        if meta.get("path").and_then(MetaValue::as_str).is_none() {
            return Err(Error::Internal("document metadata is missing 'path'".into()));
        }
        Ok(meta)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }
}

/// One fetched artifact. Immutable: a refetch with a different hash
/// produces a new document that supersedes this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub repository: String,
    pub path: String,
    pub text: String,
    pub content_hash: String,
    pub metadata: Metadata,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    /// Build a document for `repo`, deriving its hash and id from content.
    pub fn new(
        repo: &RepoRef,
        path: &str,
        text: String,
        metadata: Metadata,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = sha256_hex(text.as_bytes());
        let repository = repo.key();
        let id = short_id(&[&repository, path, &content_hash]);
        let mut metadata = metadata;
        metadata.insert("path", path);
        Self {
            id,
            repository,
            path: path.to_string(),
            text,
            content_hash,
            metadata,
            fetched_at,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.metadata.url()
    }
}

/// A bounded slice `[start, end)` (bytes) of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub path: String,
    pub start: usize,
    pub end: usize,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    pub source_url: Option<String>,
}

/// One row of the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub repository: String,
    pub generation: u64,
    pub sequence: u64,
}

/// A query hit: an index entry minus its vector, plus the similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub repository: String,
    pub generation: u64,
    pub sequence: u64,
    pub score: f32,
}

impl ScoredChunk {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            repository: self.repository.clone(),
            path: self.chunk.path.clone(),
            start: self.chunk.start,
            end: self.chunk.end,
            url: self.chunk.source_url.clone(),
        }
    }
}

/// Where a piece of retrieved text came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub repository: String,
    pub path: String,
    pub start: usize,
    pub end: usize,
    pub url: Option<String>,
}

/// An immutable snapshot of a repository's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub repository: String,
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
    pub dims: usize,
    /// Sorted, de-duplicated ids of the documents the generation was built
    /// from. Document ids are content-derived, so equality here means the
    /// fetched content is unchanged.
    pub document_ids: Vec<String>,
    pub settings: IndexSettings,
}

/// Chunking and embedding parameters a generation was built with. A run
/// whose settings differ must rebuild even when the documents match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub embedding_model: String,
}

/// Sorted unique document ids referenced by `chunks`.
pub fn document_ids_of<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Vec<String> {
    let mut ids: Vec<String> = chunks.into_iter().map(|c| c.document_id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocNode {
    pub id: String,
    pub title: String,
    pub level: u8,
    pub children: Vec<TocNode>,
}

impl TocNode {
    /// Depth-first count of this node and its descendants.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TocNode::count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiSection {
    pub id: String,
    pub title: String,
    pub level: u8,
    pub path: String,
    pub markdown: String,
}

/// A versioned, generated wiki for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiDocument {
    pub repository: String,
    pub version: u32,
    pub generation: Option<u64>,
    pub toc: Vec<TocNode>,
    pub sections: Vec<WikiSection>,
    pub created_at: DateTime<Utc>,
}

impl WikiDocument {
    /// Render the whole wiki as a single Markdown document.
    pub fn render_markdown(&self) -> String {
        let mut out = format!("# {} wiki (v{})\n\n## Contents\n\n", self.repository, self.version);
        fn walk(out: &mut String, nodes: &[TocNode], depth: usize) {
            for node in nodes {
                out.push_str(&format!(
                    "{}- [{}](#{})\n",
                    "  ".repeat(depth),
                    node.title,
                    node.id
                ));
                walk(out, &node.children, depth + 1);
            }
        }
        walk(&mut out, &self.toc, 0);
        for section in &self.sections {
            out.push('\n');
            out.push_str(&section.markdown);
            if !section.markdown.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 32-hex-char id derived from the given parts.
pub(crate) fn short_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_reference() {
        let r = RepoRef::parse("acme/widgets").unwrap();
        assert_eq!(r.owner(), "acme");
        assert_eq!(r.name(), "widgets");
        assert_eq!(r.key(), "acme/widgets");
    }

    #[test]
    fn parses_url_forms() {
        for input in [
            "https://github.com/Acme/Widgets",
            "https://github.com/Acme/Widgets/",
            "https://github.com/Acme/Widgets.git",
            "http://www.github.com/Acme/Widgets/tree/main/docs",
            "https://github.com/Acme/Widgets/blob/main/README.md",
            "git@github.com:Acme/Widgets.git",
            "github.com/Acme/Widgets",
        ] {
            let r = RepoRef::parse(input).unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(r.key(), "acme/widgets", "{input}");
            assert_eq!(r.to_string(), "Acme/Widgets");
        }
    }

    #[test]
    fn rejects_malformed_references() {
        for input in [
            "",
            "   ",
            "acme",
            "acme/widgets/extra",
            "-acme/widgets",
            "acme-/widgets",
            "acme/..",
            "acme/-widgets",
            "acme/wid gets",
            "https://gitlab.com/acme/widgets",
            "ftp://github.com/acme/widgets",
            "https://github.com/acme",
        ] {
            let err = RepoRef::parse(input).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Validation, "{input}");
        }
    }

    #[test]
    fn owner_length_limit() {
        let ok = "a".repeat(39);
        assert!(RepoRef::new(&ok, "x").is_ok());
        let too_long = "a".repeat(40);
        assert!(RepoRef::new(&too_long, "x").is_err());
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let r = RepoRef::parse("acme/widgets").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"acme/widgets\"");
        let back: RepoRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(serde_json::from_str::<RepoRef>("\"nope\"").is_err());
    }

    #[test]
    fn blob_url_points_at_revision() {
        let r = RepoRef::parse("acme/widgets").unwrap();
        assert_eq!(
            r.blob_url("https://github.com/", "abc123", "docs/intro.md"),
            "https://github.com/acme/widgets/blob/abc123/docs/intro.md"
        );
    }

    #[test]
    fn document_id_depends_on_content() {
        let r = RepoRef::parse("acme/widgets").unwrap();
        let now = Utc::now();
        let a = Document::new(&r, "README.md", "hello".into(), Metadata::new("README.md"), now);
        let b = Document::new(&r, "README.md", "hello".into(), Metadata::new("README.md"), now);
        let c = Document::new(&r, "README.md", "hello!".into(), Metadata::new("README.md"), now);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.content_hash.len(), 64);
        assert_eq!(a.metadata.path(), "README.md");
    }

    #[test]
    fn metadata_json_requires_path() {
        let meta = Metadata::new("docs/a.md").with("size", 12i64).with("url", "https://x");
        let json = serde_json::to_string(&meta).unwrap();
        let back = Metadata::from_json(&json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.get("size"), Some(&MetaValue::Int(12)));
        assert!(Metadata::from_json(r#"{"size": 3}"#).is_err());
    }

    #[test]
    fn document_ids_are_sorted_and_unique() {
        let mk = |doc: &str| Chunk {
            id: String::new(),
            document_id: doc.into(),
            path: String::new(),
            start: 0,
            end: 0,
            chunk_index: 0,
            text: String::new(),
            hash: String::new(),
            source_url: None,
        };
        let chunks = [mk("b"), mk("a"), mk("b")];
        assert_eq!(document_ids_of(&chunks), vec!["a", "b"]);
    }
}
