//! Write-ahead journal bridging the commit → catalog gap.
//!
//! Persists a `JournalEntry` JSON document at
//! `<home>/.opticon/journal/<environment>.json` after a change is committed
//! and before its catalog mutation. The entry is removed once the catalog
//! write succeeds, so a file left behind means the previous run stopped in
//! between. Writes use the `.tmp` + rename pattern.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use opticon_core::{paths, CatalogError, CatalogStore, Change, EnvironmentName};

use crate::error::{io_err, SyncError};

/// A committed change whose catalog mutation is not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub environment: EnvironmentName,
    pub index: usize,
    pub change: Change,
    pub commit: String,
    /// SHA-256 of the committed primary file; `None` for deletions.
    pub digest: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.opticon/journal/<environment>.json`
    pub fn at(home: &Path, environment: &EnvironmentName) -> Self {
        Self::new(paths::journal_path(home, environment))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pending entry, if any.
    pub fn load(&self) -> Result<Option<JournalEntry>, SyncError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.path, e)),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn record(&self, entry: &JournalEntry) -> Result<(), SyncError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid journal path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_string_pretty(entry)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.path, e)),
        }
    }
}

/// Hex SHA-256 of a file, or `None` if it does not exist.
pub fn digest_file(path: &Path) -> Result<Option<String>, SyncError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    let mut h = Sha256::new();
    h.update(&bytes);
    Ok(Some(hex::encode(h.finalize())))
}

/// Finish a change left pending by an interrupted run.
///
/// Verifies the working tree still holds what was committed, applies the
/// catalog mutation idempotently, and clears the journal. Returns the entry
/// that was recovered.
pub fn recover(
    journal: &Journal,
    tree_root: &Path,
    catalog: &mut dyn CatalogStore,
) -> Result<Option<JournalEntry>, SyncError> {
    let Some(entry) = journal.load()? else {
        return Ok(None);
    };
    tracing::warn!(
        "recovering change #{} ({}) for '{}' from {}",
        entry.index,
        entry.change.kind(),
        entry.environment,
        journal.path().display()
    );

    let file_name = &entry.change.record().file_name;
    let actual = digest_file(&tree_root.join(file_name))?;
    let consistent = match (&entry.change, &entry.digest) {
        (Change::Deletion(_), _) => actual.is_none(),
        (_, expected) => actual.is_some() && &actual == expected,
    };
    if !consistent {
        return Err(SyncError::JournalMismatch {
            environment: entry.environment.clone(),
            file_name: file_name.clone(),
            expected: entry.digest.clone().unwrap_or_else(|| "absent".to_string()),
            actual: actual.unwrap_or_else(|| "absent".to_string()),
        });
    }

    apply_idempotent(&entry.change, catalog)?;
    journal.clear()?;
    tracing::info!("recovered change #{} for '{}'", entry.index, entry.environment);
    Ok(Some(entry))
}

/// Catalog mutation for `change`, tolerating a prior partial application.
fn apply_idempotent(change: &Change, catalog: &mut dyn CatalogStore) -> Result<(), SyncError> {
    let record = change.record();
    match change {
        Change::Deletion(_) => match catalog.delete(&record.id) {
            Ok(()) | Err(CatalogError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        },
        Change::Addition(_) => match catalog.create(record.clone()) {
            Ok(()) => Ok(()),
            Err(CatalogError::AlreadyExists { .. }) => {
                catalog.update(&record.id, record.clone())?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Change::Modification(_) | Change::Rename { .. } => {
            match catalog.update(&record.id, record.clone()) {
                Ok(()) => Ok(()),
                Err(CatalogError::NotFound { .. }) => {
                    catalog.create(record.clone())?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}
