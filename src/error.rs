// src/error.rs

use crate::transaction::TxState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error types for cmam
#[derive(Error, Debug)]
pub enum Error {
    /// Network failure after retries were exhausted (or a non-retryable HTTP status)
    #[error("Network error: {0}")]
    Network(String),

    /// Downloaded or staged bytes do not hash to the expected digest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Digest string could not be parsed
    #[error("Invalid digest format: {0}")]
    InvalidDigestFormat(String),

    /// Registry metadata describes an artifact we refuse to handle
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// Package name is empty or contains characters that are not allowed
    #[error("Invalid package name: {0}")]
    InvalidName(String),

    /// Registry has no such package
    #[error("Package '{0}' not found in registry")]
    PackageNotFound(String),

    /// Registry has the package but not the requested version
    #[error("Version '{version}' of package '{name}' not found")]
    VersionNotFound { name: String, version: String },

    /// Operation requires an installed package
    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    /// Restore requested but no backup is retained
    #[error("No backup available for package '{0}'")]
    NoBackup(String),

    /// Two packages want the same file in the install root
    #[error("{path} is already owned by package '{owner}'")]
    PathConflict { path: PathBuf, owner: String },

    /// A file cmam did not install sits where a package would go
    #[error("{path} exists but was not installed by cmam; use --force to replace it")]
    UntrackedFile { path: PathBuf },

    /// Manifest failed to parse and reconciliation could not verify everything
    #[error("Manifest {path} is corrupt; reconciliation left {} unresolved discrepancies", .unresolved.len())]
    ManifestCorruption {
        path: PathBuf,
        unresolved: Vec<String>,
    },

    /// Manifest was written by a newer cmam
    #[error("Manifest schema version {found} is newer than the supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// Another invocation holds the manifest lock
    #[error("Manifest is locked by another cmam process (waited {waited:?}{})", .holder.as_deref().map(|h| format!(", holder: {}", h)).unwrap_or_default())]
    ManifestLocked {
        waited: Duration,
        holder: Option<String>,
    },

    /// The OS rejected a filesystem or PATH write
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Recovery found an interrupted transaction it could not resolve
    #[error("Partial swap detected: {0}")]
    PartialSwapDetected(String),

    /// A failure after staging; the prior state was restored
    #[error("Transaction rolled back after failure in state {state}: {cause}")]
    RolledBack {
        state: TxState,
        #[source]
        cause: Box<Error>,
    },

    /// Cancelled through a `CancelFlag`
    #[error("Operation cancelled")]
    Cancelled,

    /// Failure injected through a `FaultPlan`
    #[doc(hidden)]
    #[error("Injected fault at state {0}")]
    InjectedFault(TxState),

    /// Simulated process death injected through a `FaultPlan`
    #[doc(hidden)]
    #[error("Simulated crash at state {0}")]
    SimulatedCrash(TxState),

    /// Settings file is unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry metadata could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// History database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Wrap an I/O error with context, keeping permission failures distinguishable
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(format!("{}: {}", context, err))
        } else {
            Error::IoError(format!("{}: {}", context, err))
        }
    }

    /// Stable, machine-distinguishable outcome for this error
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::PackageNotFound(_)
            | Error::VersionNotFound { .. }
            | Error::NotInstalled(_)
            | Error::NoBackup(_) => Outcome::NotFound,
            Error::ChecksumMismatch { .. } | Error::InvalidDigestFormat(_) => {
                Outcome::ChecksumMismatch
            }
            Error::ManifestLocked { .. } => Outcome::Locked,
            Error::RolledBack { .. } => Outcome::RolledBack,
            Error::PermissionDenied(_) => Outcome::PermissionDenied,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Outcome::PermissionDenied
            }
            _ => Outcome::Failure,
        }
    }
}

/// Outcome codes surfaced as process exit codes
///
/// The numeric values are part of the public contract and only change with
/// a major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    NotFound,
    ChecksumMismatch,
    Locked,
    RolledBack,
    PermissionDenied,
}

impl Outcome {
    pub fn code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::NotFound => 2,
            Outcome::ChecksumMismatch => 3,
            Outcome::Locked => 4,
            Outcome::RolledBack => 5,
            Outcome::PermissionDenied => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::NotFound => "not-found",
            Outcome::ChecksumMismatch => "checksum-mismatch",
            Outcome::Locked => "locked",
            Outcome::RolledBack => "rolled-back",
            Outcome::PermissionDenied => "permission-denied",
        }
    }
}

/// Result type alias using cmam's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes_are_stable() {
        assert_eq!(Outcome::Success.code(), 0);
        assert_eq!(Outcome::Failure.code(), 1);
        assert_eq!(Outcome::NotFound.code(), 2);
        assert_eq!(Outcome::ChecksumMismatch.code(), 3);
        assert_eq!(Outcome::Locked.code(), 4);
        assert_eq!(Outcome::RolledBack.code(), 5);
        assert_eq!(Outcome::PermissionDenied.code(), 6);
    }

    #[test]
    fn test_permission_denied_io_maps_to_outcome() {
        let err = Error::io(
            "writing /etc/profile",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(err.outcome(), Outcome::PermissionDenied);

        let raw = Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(raw.outcome(), Outcome::PermissionDenied);
    }

    #[test]
    fn test_rolled_back_keeps_cause() {
        let err = Error::RolledBack {
            state: TxState::Swapped,
            cause: Box::new(Error::IoError("disk full".to_string())),
        };
        assert_eq!(err.outcome(), Outcome::RolledBack);
        assert!(err.to_string().contains("disk full"));
        assert!(err.to_string().contains("swapped"));
    }
}
