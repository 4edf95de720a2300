//! Error types for deployments.
//!
//! Failures come in three strengths:
//! - [`Diagnostic`]: attached to one resource, reported, and the run goes on
//! - [`RegistrationError`]: returned to the program for one registration call
//! - [`Error`]: fatal to the whole run, which bails and keeps its journal

use ledger::{StepOp, Urn};
use std::fmt;
use thiserror::Error;

/// Categories of fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A provider call failed or reported an unusable status
    Provider,
    /// Recorded state is structurally broken
    Integrity,
    /// The program itself failed
    Program,
    /// The engine could not be set up
    Engine,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Provider => "Provider failure",
            Self::Integrity => "State integrity failure",
            Self::Program => "Program failure",
            Self::Engine => "Engine failure",
        }
    }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider call returned an error
    #[error("{op} of {urn} failed: {source:#}")]
    Provider {
        /// Resource the call was made for
        urn: Urn,
        /// Provider operation, e.g. "create" or "diff"
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Provider finished with a status that leaves state unknown
    #[error("{op} of {urn} returned status {status}: {message}")]
    ProviderStatus {
        urn: Urn,
        op: &'static str,
        status: &'static str,
        message: String,
    },

    /// Provider reference does not name a loaded or recorded provider
    #[error("resource {urn} refers to unknown provider {reference}")]
    UnknownProvider { urn: Urn, reference: String },

    /// No provider could be loaded for a package
    #[error("failed to load provider for package {package}: {source:#}")]
    ProviderLoad {
        package: String,
        #[source]
        source: anyhow::Error,
    },

    /// Journal or snapshot failure
    #[error(transparent)]
    Ledger(#[from] ledger::Error),

    /// Program closure returned an error
    #[error("program failed: {0:#}")]
    Program(#[source] anyhow::Error),

    /// Program thread panicked
    #[error("program panicked")]
    ProgramPanicked,

    /// Thread pool could not be created
    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Provider { .. }
            | Error::ProviderStatus { .. }
            | Error::UnknownProvider { .. }
            | Error::ProviderLoad { .. } => ErrorCategory::Provider,
            Error::Ledger(_) => ErrorCategory::Integrity,
            Error::Program(_) | Error::ProgramPanicked => ErrorCategory::Program,
            Error::ThreadPool(_) => ErrorCategory::Engine,
        }
    }

    pub(crate) fn provider(urn: &Urn, op: &'static str, source: anyhow::Error) -> Self {
        Error::Provider {
            urn: urn.clone(),
            op,
            source,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Diagnostics
// ============================================================================

/// Kind of per-resource problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Delete or replace of a protected resource
    ProtectViolation,
    /// Imported state does not match the registration's inputs
    ImportMismatch,
    /// Import settings changed in a way that cannot be expressed as a step
    InvalidImportReplace,
    /// Option not valid for this kind of resource
    InvalidOption,
    /// URN registered twice in one run
    DuplicateUrn,
    /// Prior state left an operation unfinished
    PendingOperation,
    /// View published during a failed owner step
    DiscardedView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A problem attached to one resource that does not stop the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub urn: Urn,
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(urn: &Urn, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            urn: urn.clone(),
            kind,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(urn: &Urn, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            urn: urn.clone(),
            kind,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub(crate) fn protected(urn: &Urn) -> Self {
        Self::error(
            urn,
            DiagnosticKind::ProtectViolation,
            "protected resource cannot be deleted; set `protect: false` and run again first",
        )
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.urn, self.message)
    }
}

// ============================================================================
// Registration Errors
// ============================================================================

/// Why a registration call did not produce a resource.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// Step generation reported a per-resource problem
    #[error("{0}")]
    Diagnostic(Diagnostic),

    /// The resource kind cannot be imported
    #[error("resource {urn} cannot be imported: {reason}")]
    Unimportable { urn: Urn, reason: String },

    /// Registration is malformed
    #[error("invalid registration of {name}: {message}")]
    Invalid { name: String, message: String },

    /// One of the resource's steps failed
    #[error("{op} of {urn} failed: {message}")]
    Failed { urn: Urn, op: StepOp, message: String },

    /// A predecessor failed so the steps never ran
    #[error("{urn} was skipped because a dependency failed")]
    Skipped { urn: Urn },

    /// The run was cancelled before the steps started
    #[error("deployment was cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let urn = Urn::new("s", "p", None, "pkg:m:T", "a");
        let err = Error::provider(&urn, "create", anyhow::anyhow!("boom"));
        assert_eq!(err.category(), ErrorCategory::Provider);
        assert!(err.to_string().contains("create of"));
        assert!(err.to_string().contains("boom"));

        let err = Error::Program(anyhow::anyhow!("bad"));
        assert_eq!(err.category(), ErrorCategory::Program);
    }

    #[test]
    fn test_diagnostic_display() {
        let urn = Urn::new("s", "p", None, "pkg:m:T", "a");
        let diag = Diagnostic::protected(&urn);
        assert!(diag.is_error());
        assert_eq!(diag.kind, DiagnosticKind::ProtectViolation);
        assert!(diag.to_string().contains("protected resource cannot be deleted"));
        let err = RegistrationError::Diagnostic(diag);
        assert!(err.to_string().starts_with("urn:converge:"));
    }
}
