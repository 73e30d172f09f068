//! Change-set replay into a working tree and catalog.
//!
//! ## Per-change protocol
//!
//! 1. Apply the file operation (plus `-meta.xml` sidecar, if one exists).
//! 2. Stage everything.
//! 3. Commit, authored by the record's `last_modified_by`.
//! 4. Journal the committed change (when a journal is configured).
//! 5. Mutate the catalog.
//! 6. Clear the journal.
//!
//! Any failure stops the replay; later changes are not attempted. After the
//! last change the tree is pushed and the staging directory discarded.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use opticon_core::{
    CatalogStore, Change, ChangeKind, ChangeSet, EnvironmentName, EnvironmentSettings,
    MetadataRecord, Settings,
};

use crate::error::{io_err, SyncError};
use crate::journal::{digest_file, Journal, JournalEntry};
use crate::vcs::{CommitAuthor, VersionControlAdapter};

// ---------------------------------------------------------------------------
// Change state
// ---------------------------------------------------------------------------

/// Progress of a single change through the replay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Pending,
    Staged,
    Committed,
    CatalogUpdated,
    Done,
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeState::Pending => write!(f, "pending"),
            ChangeState::Staged => write!(f, "staged"),
            ChangeState::Committed => write!(f, "committed"),
            ChangeState::CatalogUpdated => write!(f, "catalog-updated"),
            ChangeState::Done => write!(f, "done"),
        }
    }
}

// ---------------------------------------------------------------------------
// Options / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub environment: EnvironmentName,
    pub author_email_domain: String,
    pub push: bool,
    pub journal: Option<Journal>,
    pub cancel: Option<Arc<AtomicBool>>,
    pub discard_staging: bool,
}

impl ReplayOptions {
    pub fn new(environment: impl Into<EnvironmentName>) -> Self {
        Self {
            environment: environment.into(),
            author_email_domain: Settings::default().author_email_domain,
            push: true,
            journal: None,
            cancel: None,
            discard_staging: true,
        }
    }

    pub fn from_settings(settings: &Settings, environment: &EnvironmentSettings) -> Self {
        Self {
            author_email_domain: settings.author_email_domain.clone(),
            push: environment.push,
            ..Self::new(environment.name.clone())
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// One change that reached [`ChangeState::Done`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedChange {
    pub index: usize,
    pub kind: ChangeKind,
    pub full_name: String,
    pub file_name: String,
    pub commit: String,
}

/// Audit record of a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub environment: EnvironmentName,
    /// The full change set that was handed to the replayer.
    pub changes: ChangeSet,
    pub applied: Vec<AppliedChange>,
    pub pushed: bool,
    /// Stopped early by the cancel flag; `applied` is a prefix of `changes`.
    pub cancelled: bool,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.applied.len() == self.changes.len()
    }
}

// ---------------------------------------------------------------------------
// Commit message
// ---------------------------------------------------------------------------

/// `"<Kind> - <full_name>\n\n"` then the deleted path, or one
/// `Field: value` line per record field.
pub fn commit_message(change: &Change) -> String {
    let record = change.record();
    let mut message = format!("{} - {}\n\n", change.kind(), record.full_name);
    match change {
        Change::Deletion(r) => message.push_str(&r.file_name),
        _ => {
            let lines: Vec<String> = record
                .field_lines()
                .into_iter()
                .map(|(label, value)| format!("{label}: {value}"))
                .collect();
            message.push_str(&lines.join("\n"));
            if let Some(previous) = change.previous_file_name() {
                message.push_str(&format!("\nPrevious File Name: {previous}"));
            }
        }
    }
    message
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

/// Apply `changes` in order, one commit per change.
///
/// `staged` holds retrieved bodies laid out by `file_name`; only additions
/// and modifications read from it.
pub fn replay(
    changes: ChangeSet,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
    catalog: &mut dyn CatalogStore,
    options: &ReplayOptions,
) -> Result<ReplayReport, SyncError> {
    let mut applied = Vec::with_capacity(changes.len());
    let mut cancelled = false;

    for (index, change) in changes.iter().enumerate() {
        if options.cancelled() {
            tracing::info!(
                "replay of '{}' cancelled before change #{index} of {}",
                options.environment,
                changes.len()
            );
            cancelled = true;
            break;
        }

        let mut state = ChangeState::Pending;
        let commit = replay_one(index, change, staged, vcs, catalog, options, &mut state).map_err(
            |source| SyncError::Replay {
                environment: options.environment.clone(),
                index,
                kind: change.kind(),
                state,
                source: Box::new(source),
            },
        )?;

        let record = change.record();
        applied.push(AppliedChange {
            index,
            kind: change.kind(),
            full_name: record.full_name.clone(),
            file_name: record.file_name.clone(),
            commit,
        });
    }

    let mut pushed = false;
    if options.push && !applied.is_empty() {
        vcs.push()?;
        pushed = true;
    }

    if options.discard_staging {
        discard_staging(staged)?;
    }

    tracing::info!(
        "replayed {}/{} change(s) for '{}'",
        applied.len(),
        changes.len(),
        options.environment
    );
    Ok(ReplayReport {
        environment: options.environment.clone(),
        changes,
        applied,
        pushed,
        cancelled,
    })
}

fn replay_one(
    index: usize,
    change: &Change,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
    catalog: &mut dyn CatalogStore,
    options: &ReplayOptions,
    state: &mut ChangeState,
) -> Result<String, SyncError> {
    apply_files(change, staged, vcs)?;
    vcs.stage_all()?;
    *state = ChangeState::Staged;

    let record = change.record();
    let author = CommitAuthor::for_record(record, &options.author_email_domain);
    let commit = vcs.commit(&commit_message(change), &author)?;
    *state = ChangeState::Committed;

    if let Some(journal) = &options.journal {
        let digest = match change {
            Change::Deletion(_) => None,
            _ => digest_file(&vcs.tree_path(&record.file_name)?)?,
        };
        journal.record(&JournalEntry {
            environment: options.environment.clone(),
            index,
            change: change.clone(),
            commit: commit.clone(),
            digest,
            recorded_at: Utc::now(),
        })?;
    }

    match change {
        Change::Deletion(r) => catalog.delete(&r.id)?,
        Change::Addition(r) => catalog.create(r.clone())?,
        Change::Modification(r) | Change::Rename { current: r, .. } => {
            catalog.update(&r.id, r.clone())?
        }
    }
    *state = ChangeState::CatalogUpdated;

    if let Some(journal) = &options.journal {
        journal.clear()?;
    }
    *state = ChangeState::Done;
    Ok(commit)
}

/// File operations for one change, sidecar included.
///
/// The sidecar is looked up in `staged` for additions and modifications and
/// in the working tree for deletions and renames. When absent nothing is
/// done for it. A rename whose body changed is refreshed from `staged` after
/// the move.
fn apply_files(
    change: &Change,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
) -> Result<(), SyncError> {
    vcs.tree_path(&change.record().file_name)?;
    if let Some(previous) = change.previous_file_name() {
        vcs.tree_path(previous)?;
    }

    match change {
        Change::Deletion(r) => {
            if vcs.exists(&r.file_name) {
                vcs.delete_file(&r.file_name)?;
            } else {
                tracing::warn!("{} already absent from the tree", r.file_name);
            }
            let sidecar = r.sidecar_file_name();
            if vcs.exists(&sidecar) {
                vcs.delete_file(&sidecar)?;
            }
        }
        Change::Rename { previous, current } => {
            vcs.rename_file(&previous.file_name, &current.file_name)?;
            let old_sidecar = previous.sidecar_file_name();
            if vcs.exists(&old_sidecar) {
                vcs.rename_file(&old_sidecar, &current.sidecar_file_name())?;
            }
            if change.needs_content() {
                refresh_from_staged(current, staged, vcs)?;
            }
        }
        Change::Addition(r) | Change::Modification(r) => {
            let src = staged_body(r, staged)?;
            if matches!(change, Change::Addition(_)) && !vcs.exists(&r.file_name) {
                vcs.add_file(&src, &r.file_name)?;
            } else {
                if matches!(change, Change::Addition(_)) {
                    tracing::warn!("{} already in the tree, overwriting", r.file_name);
                }
                vcs.overwrite_file(&src, &r.file_name)?;
            }
            overwrite_staged_sidecar(r, staged, vcs)?;
        }
    }
    Ok(())
}

fn staged_body(record: &MetadataRecord, staged: &Path) -> Result<PathBuf, SyncError> {
    let src = staged.join(&record.file_name);
    if !src.is_file() {
        return Err(SyncError::MissingContent { path: src });
    }
    Ok(src)
}

fn refresh_from_staged(
    record: &MetadataRecord,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
) -> Result<(), SyncError> {
    let src = staged_body(record, staged)?;
    vcs.overwrite_file(&src, &record.file_name)?;
    overwrite_staged_sidecar(record, staged, vcs)
}

fn overwrite_staged_sidecar(
    record: &MetadataRecord,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
) -> Result<(), SyncError> {
    let sidecar = record.sidecar_file_name();
    let staged_sidecar = staged.join(&sidecar);
    if staged_sidecar.is_file() {
        vcs.overwrite_file(&staged_sidecar, &sidecar)?;
    }
    Ok(())
}

fn discard_staging(staged: &Path) -> Result<(), SyncError> {
    match std::fs::remove_dir_all(staged) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(staged, e)),
    }
}
