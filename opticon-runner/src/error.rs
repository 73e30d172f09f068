use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use opticon_core::EnvironmentName;

/// Error surface for the multi-environment runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync error: {0}")]
    Sync(#[from] opticon_sync::SyncError),

    #[error("catalog error: {0}")]
    Catalog(#[from] opticon_core::CatalogError),

    #[error("settings error: {0}")]
    Settings(#[from] opticon_core::SettingsError),

    #[error("environment '{environment}' has no source_path configured")]
    MissingSource { environment: EnvironmentName },

    #[error("retrieval for '{environment}' timed out after {after:?}")]
    Timeout {
        environment: EnvironmentName,
        after: Duration,
    },

    #[error("{task} task join failure: {message}")]
    Join { task: String, message: String },
}

impl RunnerError {
    /// Worth another plan/retrieve attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Timeout { .. } => true,
            RunnerError::Sync(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RunnerError {
    RunnerError::Io {
        path: path.into(),
        source,
    }
}
