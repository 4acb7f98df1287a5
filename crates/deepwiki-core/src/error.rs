//! Error taxonomy shared by every pipeline stage.
//!
//! Each [`Error`] maps to an [`ErrorKind`], which is what task records and
//! user-facing surfaces carry. Transient kinds are retried with backoff by
//! the caller; structural kinds never are.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Repository or content absent. Terminal.
    NotFound,
    /// The content source throttled the request. Transient.
    RateLimited,
    /// The content source could not be reached. Transient.
    SourceUnavailable,
    /// The embedding or generation model could not be reached. Transient.
    ModelUnavailable,
    /// Query against a repository that has no index generation.
    NotIndexed,
    /// Some documents failed to fetch. Non-fatal, reported as a warning.
    PartialContent,
    /// Malformed repository reference.
    Validation,
    /// A caller passed an argument outside an operation's contract.
    InvalidArgument,
    /// The task was cancelled before it could commit.
    Cancelled,
    /// The persistence layer failed.
    Storage,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::SourceUnavailable => "source_unavailable",
            Self::ModelUnavailable => "model_unavailable",
            Self::NotIndexed => "not_indexed",
            Self::PartialContent => "partial_content",
            Self::Validation => "validation",
            Self::InvalidArgument => "invalid_argument",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }

    pub fn from_str_kind(s: &str) -> Self {
        match s {
            "not_found" => Self::NotFound,
            "rate_limited" => Self::RateLimited,
            "source_unavailable" => Self::SourceUnavailable,
            "model_unavailable" => Self::ModelUnavailable,
            "not_indexed" => Self::NotIndexed,
            "partial_content" => Self::PartialContent,
            "validation" => Self::Validation,
            "invalid_argument" => Self::InvalidArgument,
            "cancelled" => Self::Cancelled,
            "storage" => Self::Storage,
            _ => Self::Internal,
        }
    }

    /// Whether a failure of this kind is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::SourceUnavailable | Self::ModelUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the DeepWiki core and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("content source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("repository {0} has not been indexed yet; submit it for indexing first")]
    NotIndexed(String),

    #[error("partial content: {0}")]
    PartialContent(String),

    #[error("invalid repository reference: {0}")]
    Validation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::NotIndexed(_) => ErrorKind::NotIndexed,
            Self::PartialContent(_) => ErrorKind::PartialContent,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Wrap a persistence-layer failure.
    pub fn storage(err: impl fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Serializable `{kind, message}` pair for task records.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

/// Error kind plus a human-readable message, as stored on failed tasks
/// and returned by the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Like [`Error::info`], but hides the details of storage and internal
    /// failures behind a generic message.
    pub fn user_facing(err: &Error) -> Self {
        match err.kind() {
            ErrorKind::Storage | ErrorKind::Internal => Self::new(
                err.kind(),
                "an internal error occurred while handling the request",
            ),
            _ => err.info(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::RateLimited,
            ErrorKind::SourceUnavailable,
            ErrorKind::ModelUnavailable,
            ErrorKind::NotIndexed,
            ErrorKind::PartialContent,
            ErrorKind::Validation,
            ErrorKind::InvalidArgument,
            ErrorKind::Cancelled,
            ErrorKind::Storage,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_str_kind(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::from_str_kind("garbage"), ErrorKind::Internal);
    }

    #[test]
    fn only_upstream_failures_are_transient() {
        assert!(Error::RateLimited("x".into()).is_transient());
        assert!(Error::ModelUnavailable("x".into()).is_transient());
        assert!(Error::SourceUnavailable("x".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Validation("x".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn not_indexed_message_is_actionable() {
        let msg = Error::NotIndexed("acme/widgets".into()).to_string();
        assert!(msg.contains("acme/widgets"));
        assert!(msg.contains("indexing first"));
    }

    #[test]
    fn user_facing_hides_internal_details() {
        let info = ErrorInfo::user_facing(&Error::storage("disk I/O error at page 42"));
        assert_eq!(info.kind, ErrorKind::Storage);
        assert!(!info.message.contains("page 42"));

        let info = ErrorInfo::user_facing(&Error::NotIndexed("a/b".into()));
        assert_eq!(info.kind, ErrorKind::NotIndexed);
        assert!(info.message.contains("a/b"));
    }

    #[test]
    fn info_serializes_snake_case_kind() {
        let json = serde_json::to_value(Error::ModelUnavailable("down".into()).info()).unwrap();
        assert_eq!(json["kind"], "model_unavailable");
    }
}
