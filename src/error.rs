//! Error types for reference parsing, registry access and image sync.

use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidReference,
    InvalidPattern,
    SourceDigestRequired,
    FetchFailed,
    PushFailed,
    DigestMismatch,
    DigestComputeFailed,
    NoSupportedPlatforms,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    /// The reference string does not follow the `[domain/]path[:tag][@digest]` grammar.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A familiar-name match pattern could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Syncing by mutable tag is refused; the source must be pinned by digest.
    #[error("source image '{reference}' must be pinned by digest")]
    SourceDigestRequired { reference: String },

    #[error("failed to fetch {reference}: {message}")]
    FetchFailed {
        reference: String,
        status: Option<u16>,
        message: String,
    },

    #[error("failed to push {reference}: {message}")]
    PushFailed {
        reference: String,
        status: Option<u16>,
        message: String,
    },

    /// Content received from a registry does not hash to the digest it was requested by.
    #[error("digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    /// Content already held in memory could not be hashed. Indicates a bug.
    #[error("failed to compute digest: {0}")]
    DigestComputeFailed(String),

    #[error("no supported platforms in {reference} (available: {available})")]
    NoSupportedPlatforms { reference: String, available: String },

    #[error("operation cancelled")]
    Cancelled,

    /// Another error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Operation {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(
        reference: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::FetchFailed {
            reference: reference.into(),
            status,
            message: message.into(),
        }
    }

    pub fn push_failed(
        reference: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::PushFailed {
            reference: reference.into(),
            status,
            message: message.into(),
        }
    }

    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Operation {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference { .. } => ErrorKind::InvalidReference,
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::SourceDigestRequired { .. } => ErrorKind::SourceDigestRequired,
            Self::FetchFailed { .. } => ErrorKind::FetchFailed,
            Self::PushFailed { .. } => ErrorKind::PushFailed,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::DigestComputeFailed(_) => ErrorKind::DigestComputeFailed,
            Self::NoSupportedPlatforms { .. } => ErrorKind::NoSupportedPlatforms,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// HTTP status of the failed registry call, if the failure came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::FetchFailed { status, .. } | Self::PushFailed { status, .. } => *status,
            Self::Operation { source, .. } => source.status(),
            _ => None,
        }
    }
}
