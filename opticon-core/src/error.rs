//! Error types for opticon-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EnvironmentName, RecordId};

/// A snapshot invariant was violated while building it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    /// Two live records claim the same working-tree path.
    #[error("duplicate file_name '{file_name}' in snapshot of '{environment}'")]
    DuplicateFileName {
        environment: EnvironmentName,
        file_name: String,
    },

    /// A `file_name` that would resolve outside the working tree.
    #[error("file_name '{file_name}' in snapshot of '{environment}' is not a tree-relative path")]
    InvalidFileName {
        environment: EnvironmentName,
        file_name: String,
    },

    /// Two records share an identity key.
    #[error("duplicate id '{id}' in snapshot of '{environment}'")]
    DuplicateId {
        environment: EnvironmentName,
        id: RecordId,
    },
}

/// All errors that can arise from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse catalog at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("catalog has no record with id '{id}'")]
    NotFound { id: RecordId },

    #[error("catalog already has a record with id '{id}'")]
    AlreadyExists { id: RecordId },

    /// Persisted rows no longer form a valid snapshot.
    #[error("catalog is inconsistent: {0}")]
    Snapshot(#[from] SnapshotError),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors from loading [`crate::settings::Settings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("environment '{0}' is not configured")]
    UnknownEnvironment(EnvironmentName),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
