//! Error types for opticon-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use opticon_core::{
    CatalogError, ChangeKind, EnvironmentName, SettingsError, SnapshotError,
};

use crate::replay::ChangeState;

/// Failures talking to the metadata source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials rejected or endpoint unreachable. Never retried.
    #[error("cannot connect to metadata source: {0}")]
    Connection(String),

    /// Listing a single metadata type failed.
    #[error("listing {object_type} failed: {message}")]
    Listing {
        object_type: String,
        message: String,
    },

    #[error("retrieve failed: {0}")]
    Retrieve(String),

    #[error("metadata source timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed listing at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    /// Transient failures that a later attempt may not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Timeout(_) | SourceError::Retrieve(_))
    }
}

/// All errors that can arise from reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A snapshot violated its invariants (e.g. duplicate file_name).
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("metadata source error: {0}")]
    Source(#[from] SourceError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A version-control command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Vcs { command: String, stderr: String },

    /// JSON serialization/deserialization error (journal).
    #[error("journal JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A package document could not be written.
    #[error("XML write error: {0}")]
    Xml(String),

    /// Staged content for an addition or modification was not retrieved.
    #[error("staged content missing at {path}")]
    MissingContent { path: PathBuf },

    /// A path that would resolve outside the working tree.
    #[error("'{file_name}' is not a path inside the working tree")]
    PathOutsideTree { file_name: String },

    #[error(
        "environment '{environment}' is locked by {lock}; delete it if no run is in progress"
    )]
    EnvironmentLocked {
        environment: EnvironmentName,
        lock: PathBuf,
    },

    /// The working tree no longer holds what a pending journal entry committed.
    #[error(
        "journal for '{environment}' expects {file_name} at digest {expected}, tree has {actual}"
    )]
    JournalMismatch {
        environment: EnvironmentName,
        file_name: String,
        expected: String,
        actual: String,
    },

    /// A change failed mid-replay; later changes were not attempted.
    #[error("replay of change #{index} ({kind}) in '{environment}' stopped after {state}: {source}")]
    Replay {
        environment: EnvironmentName,
        index: usize,
        kind: ChangeKind,
        state: ChangeState,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Only source-side transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Source(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`SourceError::Io`].
pub(crate) fn source_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.into(),
        source,
    }
}
