//! Reconciliation pipeline for one environment.
//!
//! [`reconcile`] runs every phase in order under the environment lock:
//!
//! 1. lock → 2. connection check → 3. journal recovery → 4. [`plan`]
//!    (catalog snapshot, source snapshot, diff, manifest) → 5. [`stage`]
//!    (retrieve bodies) → 6. [`apply`] (replay).
//!
//! The phases are public so a caller can put a timeout and retries around
//! [`plan`] + [`stage`] alone; nothing before [`apply`] touches the tree or
//! the catalog except journal recovery, which is idempotent.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use opticon_core::{
    paths, CatalogStore, Change, ChangeKind, ChangeSet, EnvironmentName, EnvironmentSettings,
    Settings, Snapshot,
};

use crate::differ::SnapshotDiffer;
use crate::error::{io_err, SyncError};
use crate::journal::{self, Journal, JournalEntry};
use crate::lock::EnvironmentLock;
use crate::manifest::{write_destructive_package, Manifest};
use crate::preview::{preview_changes, FileDiff};
use crate::replay::{replay, ReplayOptions, ReplayReport};
use crate::source::{gather_snapshot, MetadataSource};
use crate::vcs::{CommitAuthor, VersionControlAdapter};

pub const BOOTSTRAP_MESSAGE: &str = "Initial push of production code";
const BOOTSTRAP_AUTHOR: &str = "opticon";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a pipeline run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub home: PathBuf,
    pub settings: Settings,
    pub environment: EnvironmentSettings,
    pub staging_root: PathBuf,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ReconcileContext {
    /// Context for a configured environment.
    pub fn new(
        home: impl Into<PathBuf>,
        settings: Settings,
        environment: &EnvironmentName,
    ) -> Result<Self, SyncError> {
        let home = home.into();
        let environment = settings.environment(environment)?.clone();
        Ok(Self {
            staging_root: paths::staging_dir(&home, &environment.name),
            home,
            settings,
            environment,
            cancel: None,
        })
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn name(&self) -> &EnvironmentName {
        &self.environment.name
    }

    pub fn journal(&self) -> Journal {
        Journal::at(&self.home, self.name())
    }

    pub fn working_tree_path(&self) -> PathBuf {
        self.settings.working_tree_path(&self.home, self.name())
    }

    /// Per-attempt staging directory, so an abandoned attempt never races a
    /// fresh one.
    pub fn staging_dir(&self, attempt: u32) -> PathBuf {
        self.staging_root.join(format!("attempt-{attempt}"))
    }

    pub fn destructive_dir(&self) -> PathBuf {
        self.staging_root.join("destructive")
    }

    pub fn replay_options(&self) -> ReplayOptions {
        let options =
            ReplayOptions::from_settings(&self.settings, &self.environment).with_journal(self.journal());
        match &self.cancel {
            Some(cancel) => options.with_cancel(Arc::clone(cancel)),
            None => options,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// What a reconcile would do. Computing it has no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub environment: EnvironmentName,
    pub previous_len: usize,
    pub current_len: usize,
    pub changes: ChangeSet,
    /// Bodies that must be retrieved before replay.
    pub manifest: Manifest,
}

impl Plan {
    pub fn is_no_drift(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn deletions(&self) -> Vec<Change> {
        self.changes.of_kind(ChangeKind::Deletion).cloned().collect()
    }
}

/// Dry run: diff the catalog against the source and build the manifest.
pub fn plan(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    catalog: &dyn CatalogStore,
) -> Result<Plan, SyncError> {
    let previous = catalog.list_by_environment()?;
    let current = gather_snapshot(source, ctx.name(), &ctx.settings.metadata_types)?;
    let changes = SnapshotDiffer::from_settings(&ctx.settings).diff(&previous, &current);
    let manifest = Manifest::from_records(changes.records_needing_content());

    tracing::info!(
        "'{}': {} catalogued, {} listed, {} change(s), {} to retrieve",
        ctx.name(),
        previous.len(),
        current.len(),
        changes.len(),
        manifest.len()
    );
    Ok(Plan {
        environment: ctx.name().clone(),
        previous_len: previous.len(),
        current_len: current.len(),
        changes,
        manifest,
    })
}

/// Same as [`plan`]; named for callers that only want the preview.
pub fn dry_run(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    catalog: &dyn CatalogStore,
) -> Result<Plan, SyncError> {
    source.check_connection()?;
    plan(ctx, source, catalog)
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Finish any change a previous run committed but did not catalogue.
pub fn recover_pending(
    ctx: &ReconcileContext,
    tree_root: &Path,
    catalog: &mut dyn CatalogStore,
) -> Result<Option<JournalEntry>, SyncError> {
    journal::recover(&ctx.journal(), tree_root, catalog)
}

/// Retrieve the plan's manifest into a fresh staging directory.
///
/// When the plan has deletions a destructive-changes package is written
/// beside the staging directories.
pub fn stage(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    plan: &Plan,
    attempt: u32,
) -> Result<PathBuf, SyncError> {
    let dir = ctx.staging_dir(attempt);
    fresh_dir(&dir)?;

    if !plan.manifest.is_empty() {
        tracing::info!(
            "'{}': retrieving {} member(s) (attempt {attempt})",
            ctx.name(),
            plan.manifest.len()
        );
        source.retrieve(&plan.manifest, &dir)?;
    }

    let deletions = plan.deletions();
    if !deletions.is_empty() {
        write_destructive_package(&ctx.destructive_dir(), &deletions, &ctx.settings.api_version)?;
    }
    Ok(dir)
}

/// Replay the plan's changes from `staged`.
pub fn apply(
    ctx: &ReconcileContext,
    plan: Plan,
    staged: &Path,
    vcs: &mut dyn VersionControlAdapter,
    catalog: &mut dyn CatalogStore,
) -> Result<ReplayReport, SyncError> {
    replay(plan.changes, staged, vcs, catalog, &ctx.replay_options())
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

/// Outcome of one reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub environment: EnvironmentName,
    pub counts: BTreeMap<ChangeKind, usize>,
    pub applied: usize,
    pub pushed: bool,
    pub cancelled: bool,
    /// A journal entry from an interrupted run was completed first.
    pub recovered: bool,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub replay: Option<ReplayReport>,
}

impl ReconcileReport {
    pub fn no_drift(environment: EnvironmentName, recovered: bool, started: Instant) -> Self {
        Self {
            environment,
            counts: BTreeMap::new(),
            applied: 0,
            pushed: false,
            cancelled: false,
            recovered,
            elapsed_ms: elapsed_ms(started),
            replay: None,
        }
    }

    pub fn from_replay(replay: ReplayReport, recovered: bool, started: Instant) -> Self {
        let counts = ChangeKind::all()
            .iter()
            .map(|k| (*k, replay.changes.count(*k)))
            .filter(|(_, n)| *n > 0)
            .collect();
        Self {
            environment: replay.environment.clone(),
            counts,
            applied: replay.applied.len(),
            pushed: replay.pushed,
            cancelled: replay.cancelled,
            recovered,
            elapsed_ms: elapsed_ms(started),
            replay: Some(replay),
        }
    }

    pub fn is_no_drift(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Run every phase for one environment.
pub fn reconcile(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    vcs: &mut dyn VersionControlAdapter,
    catalog: &mut dyn CatalogStore,
) -> Result<ReconcileReport, SyncError> {
    let started = Instant::now();
    let _lock = EnvironmentLock::acquire(&ctx.home, ctx.name())?;

    source.check_connection()?;
    let tree_root = vcs.working_tree_path().to_path_buf();
    let recovered = recover_pending(ctx, &tree_root, catalog)?.is_some();

    let plan = plan(ctx, source, catalog)?;
    if plan.is_no_drift() {
        tracing::info!("'{}': no drift", ctx.name());
        return Ok(ReconcileReport::no_drift(ctx.name().clone(), recovered, started));
    }

    let staged = stage(ctx, source, &plan, 1)?;
    let replay = apply(ctx, plan, &staged, vcs, catalog)?;
    Ok(ReconcileReport::from_replay(replay, recovered, started))
}

// ---------------------------------------------------------------------------
// bootstrap / remove / preview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub environment: EnvironmentName,
    pub records: usize,
    pub commit: String,
    pub pushed: bool,
}

/// Seed an empty tree and catalog from a full snapshot.
///
/// Everything listed is retrieved straight into the working tree and
/// recorded as a single commit; the catalog is then replaced wholesale.
pub fn bootstrap(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    vcs: &mut dyn VersionControlAdapter,
    catalog: &mut dyn CatalogStore,
) -> Result<BootstrapReport, SyncError> {
    let _lock = EnvironmentLock::acquire(&ctx.home, ctx.name())?;
    source.check_connection()?;

    let snapshot = gather_snapshot(source, ctx.name(), &ctx.settings.metadata_types)?;
    let manifest = Manifest::from_records(snapshot.iter());
    let tree_root = vcs.working_tree_path().to_path_buf();
    if !manifest.is_empty() {
        source.retrieve(&manifest, &tree_root)?;
    }

    vcs.stage_all()?;
    let author = CommitAuthor::new(
        BOOTSTRAP_AUTHOR,
        format!("{BOOTSTRAP_AUTHOR}@{}", ctx.settings.author_email_domain),
    );
    let commit = vcs.commit(BOOTSTRAP_MESSAGE, &author)?;
    let pushed = if ctx.environment.push {
        vcs.push()?;
        true
    } else {
        false
    };

    let records = snapshot.len();
    catalog.replace_all(snapshot)?;
    tracing::info!("'{}': bootstrapped {records} record(s) at {commit}", ctx.name());
    Ok(BootstrapReport {
        environment: ctx.name().clone(),
        records,
        commit,
        pushed,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub environment: EnvironmentName,
    /// Catalog rows dropped.
    pub records: usize,
    /// False when the working tree was already gone.
    pub tree_removed: bool,
}

/// Forget an environment: drop its catalog rows, pending journal entry,
/// staging area, and local working tree.
///
/// A working tree that is already missing is not an error. The remote
/// repository is left alone.
pub fn remove(
    ctx: &ReconcileContext,
    catalog: &mut dyn CatalogStore,
) -> Result<RemoveReport, SyncError> {
    let _lock = EnvironmentLock::acquire(&ctx.home, ctx.name())?;

    let records = catalog.list_by_environment()?.len();
    catalog.replace_all(Snapshot::new(ctx.name().clone()))?;
    ctx.journal().clear()?;
    remove_dir_if_present(&ctx.staging_root)?;

    let tree = ctx.working_tree_path();
    let tree_removed = remove_dir_if_present(&tree)?;
    if !tree_removed {
        tracing::warn!("'{}': working tree {} already gone", ctx.name(), tree.display());
    }

    tracing::info!("'{}': removed {records} catalog row(s)", ctx.name());
    Ok(RemoveReport {
        environment: ctx.name().clone(),
        records,
        tree_removed,
    })
}

fn remove_dir_if_present(dir: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(dir, e)),
    }
}

/// Plan, retrieve into a scratch directory, and diff against the tree.
///
/// The scratch directory is removed afterwards; the tree and catalog are
/// not touched.
pub fn preview(
    ctx: &ReconcileContext,
    source: &dyn MetadataSource,
    catalog: &dyn CatalogStore,
    tree_root: &Path,
) -> Result<(Plan, Vec<FileDiff>), SyncError> {
    let plan = dry_run(ctx, source, catalog)?;
    let scratch = ctx.staging_root.join("preview");
    fresh_dir(&scratch)?;
    let diffs = retrieve_and_diff(source, &plan, &scratch, tree_root);
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::warn!("failed to remove {}: {e}", scratch.display());
    }
    Ok((plan, diffs?))
}

fn retrieve_and_diff(
    source: &dyn MetadataSource,
    plan: &Plan,
    scratch: &Path,
    tree_root: &Path,
) -> Result<Vec<FileDiff>, SyncError> {
    if !plan.manifest.is_empty() {
        source.retrieve(&plan.manifest, scratch)?;
    }
    preview_changes(&plan.changes, scratch, tree_root)
}

/// Empty `dir`, creating it if needed.
fn fresh_dir(dir: &Path) -> Result<(), SyncError> {
    remove_dir_if_present(dir)?;
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))
}
