//! # opticon-sync
//!
//! Snapshot diffing and change-set replay.
//!
//! Call [`pipeline::reconcile`] to bring one environment's working tree and
//! catalog in line with its metadata source, or [`pipeline::plan`] to see
//! what that would do.

pub mod differ;
pub mod error;
pub mod journal;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod preview;
pub mod replay;
pub mod source;
pub mod vcs;

pub use differ::{diff, SnapshotDiffer};
pub use error::{SourceError, SyncError};
pub use journal::{Journal, JournalEntry};
pub use lock::EnvironmentLock;
pub use manifest::{write_destructive_package, Manifest};
pub use pipeline::{
    bootstrap, dry_run, plan, reconcile, remove, BootstrapReport, Plan, ReconcileContext,
    ReconcileReport, RemoveReport,
};
pub use replay::{commit_message, replay, AppliedChange, ChangeState, ReplayOptions, ReplayReport};
pub use source::{gather_metadata, gather_snapshot, DirectorySource, MetadataSource, RawRecord};
pub use vcs::{CommitAuthor, GitCli, VersionControlAdapter};
