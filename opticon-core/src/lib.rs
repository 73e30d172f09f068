//! Opticon core library: metadata record model, catalog persistence,
//! settings, errors.
//!
//! - [`types`]: records, snapshots, changes
//! - [`catalog`]: [`CatalogStore`] and its YAML / in-memory implementations
//! - [`settings`]: explicit configuration passed to the engine
//! - [`paths`]: `~/.opticon` layout
//! - [`error`]: [`CatalogError`], [`SnapshotError`], [`SettingsError`]

pub mod catalog;
pub mod error;
pub mod paths;
pub mod settings;
pub mod types;

pub use catalog::{CatalogStore, MemoryCatalog, YamlCatalog};
pub use error::{CatalogError, SettingsError, SnapshotError};
pub use settings::{EnvironmentSettings, Settings};
pub use types::{
    is_tree_relative, Change, ChangeKind, ChangeSet, EnvironmentName, MetadataRecord, RecordId,
    Snapshot, SIDECAR_SUFFIX,
};
