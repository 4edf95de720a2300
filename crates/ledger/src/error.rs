//! Error types for snapshot and journal operations.
//!
//! Integrity failures are kept separate from replay failures so that callers
//! can tell a structurally broken snapshot apart from a journal that could not
//! be folded.

use crate::snapshot::Snapshot;
use crate::urn::Urn;
use std::path::PathBuf;
use thiserror::Error;

/// Categories of ledger errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Snapshot violates a structural invariant
    Integrity,
    /// Journal entries could not be folded onto the base
    Replay,
    /// Persisted data could not be read or decoded
    Decode,
    /// Persistence sink rejected an entry
    Persist,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Integrity => "Snapshot integrity violation",
            Self::Replay => "Journal replay failure",
            Self::Decode => "Unreadable state file",
            Self::Persist => "Journal persistence failure",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Integrity => "The snapshot must be repaired by hand; it is never fixed automatically",
            Self::Replay => "Inspect the partial snapshot and the journal around the failing entry",
            Self::Decode => "Check that the file is a snapshot or journal written by this tool",
            Self::Persist => "Check the journal destination is writable",
        }
    }
}

/// A violated snapshot invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// Manifest magic does not match its version
    #[error("manifest magic cookie does not match version {version}")]
    MagicMismatch { version: String },

    /// Two live records share a URN
    #[error("duplicate resource {urn} (not marked for deletion)")]
    DuplicateUrn { urn: Urn },

    /// Parent appears later in the list
    #[error("resource {urn}'s parent {parent} comes after it")]
    ParentAfterChild { urn: Urn, parent: Urn },

    /// Parent is absent
    #[error("resource {urn}'s parent {parent} is missing from the snapshot")]
    MissingParent { urn: Urn, parent: Urn },

    /// Provider reference cannot be parsed or is absent
    #[error("resource {urn} refers to unknown provider {provider}")]
    MissingProvider { urn: Urn, provider: String },

    /// Provider reference points at a later record
    #[error("resource {urn}'s provider {provider} comes after it")]
    ProviderAfterConsumer { urn: Urn, provider: String },

    /// Provider reference points at something that is not a provider
    #[error("resource {urn} refers to {provider}, which is not a provider")]
    NotAProvider { urn: Urn, provider: String },

    /// Dependency appears later in the list
    #[error("resource {urn}'s dependency {dependency} comes after it")]
    DependencyAfterDependent { urn: Urn, dependency: Urn },

    /// Dependency is absent
    #[error("resource {urn}'s dependency {dependency} is missing from the snapshot")]
    MissingDependency { urn: Urn, dependency: Urn },

    /// View owner is absent
    #[error("view {urn}'s owner {owner} is missing from the snapshot")]
    MissingViewOwner { urn: Urn, owner: Urn },

    /// View owner is itself a view
    #[error("view {urn}'s owner {owner} is itself a view")]
    ViewOfView { urn: Urn, owner: Urn },
}

/// Errors that can occur while folding, verifying or persisting state.
#[derive(Debug, Error)]
pub enum Error {
    /// Snapshot failed verification
    #[error("snapshot integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    /// A step references a record that is not in the working state
    #[error("{op} step for {urn} (id {id:?}) references a resource that is not in the snapshot")]
    UnknownResource {
        /// Step operation that failed to resolve its target
        op: String,
        /// URN the step was looking for
        urn: Urn,
        /// ID the step was looking for
        id: String,
    },

    /// Two entries share a sequence number
    #[error("journal contains sequence number {seq} more than once")]
    DuplicateSequence { seq: u64 },

    /// Sequence numbers are not contiguous
    #[error("journal sequence jumps from {previous} to {next}")]
    SequenceGap { previous: u64, next: u64 },

    /// End entry with no Begin
    #[error("entry {seq} ends operation {begun}, which never began")]
    UnmatchedEnd { seq: u64, begun: u64 },

    /// Invalid URN text
    #[error("invalid URN: {0}")]
    InvalidUrn(String),

    /// Invalid provider reference text
    #[error("invalid provider reference: {0}")]
    InvalidProviderRef(String),

    /// Persistence sink failure
    #[error("failed to persist journal entry {seq}: {message}")]
    Persist { seq: u64, message: String },

    /// File could not be read or written
    #[error("failed to access {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON line could not be decoded
    #[error("malformed journal line {line}: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Integrity(_) => ErrorCategory::Integrity,
            Error::UnknownResource { .. }
            | Error::DuplicateSequence { .. }
            | Error::SequenceGap { .. }
            | Error::UnmatchedEnd { .. } => ErrorCategory::Replay,
            Error::Persist { .. } => ErrorCategory::Persist,
            Error::InvalidUrn(_)
            | Error::InvalidProviderRef(_)
            | Error::File { .. }
            | Error::MalformedLine { .. }
            | Error::Io(_)
            | Error::Json(_) => ErrorCategory::Decode,
        }
    }
}

/// A replay that could not complete.
///
/// `partial` holds whatever was materialized before the failure, or `None`
/// when nothing could be decoded at all.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ReplayError {
    /// Snapshot folded up to the failing entry
    pub partial: Option<Box<Snapshot>>,
    /// What went wrong
    #[source]
    pub source: Error,
}

impl ReplayError {
    pub(crate) fn with_partial(source: Error, partial: Snapshot) -> Self {
        Self {
            partial: Some(Box::new(partial)),
            source,
        }
    }

    pub(crate) fn undecodable(source: Error) -> Self {
        Self {
            partial: None,
            source,
        }
    }
}

impl From<Error> for ReplayError {
    fn from(source: Error) -> Self {
        Self::undecodable(source)
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::DuplicateSequence { seq: 3 };
        assert_eq!(err.category(), ErrorCategory::Replay);

        let err = Error::InvalidUrn("nope".to_string());
        assert_eq!(err.category(), ErrorCategory::Decode);

        let err = Error::from(IntegrityError::MagicMismatch {
            version: "1".to_string(),
        });
        assert_eq!(err.category(), ErrorCategory::Integrity);
    }

    #[test]
    fn test_replay_error_from_decode_has_no_partial() {
        let err = ReplayError::from(Error::InvalidUrn("x".to_string()));
        assert!(err.partial.is_none());
        assert!(err.to_string().contains("invalid URN"));
    }
}
