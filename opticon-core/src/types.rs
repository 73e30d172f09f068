//! Domain types for metadata reconciliation.
//!
//! A [`MetadataRecord`] is one object definition as last observed on the
//! platform. A [`Snapshot`] is every record of one environment at one
//! instant. The differ turns two snapshots into a [`ChangeSet`].
//!
//! `file_name` is kept as a `String`: it is a logical, `/`-separated path
//! assigned by the metadata source, joined onto a root only at I/O time.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier assigned by the metadata source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Name of a managed platform environment (e.g. `production`, `uat`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentName(pub String);

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EnvironmentName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EnvironmentName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// MetadataRecord
// ---------------------------------------------------------------------------

/// Suffix of the companion file that travels with some primary files.
pub const SIDECAR_SUFFIX: &str = "-meta.xml";

/// Whether `file_name` is a non-empty relative path of plain components.
///
/// Absolute paths, `..`, and drive prefixes are rejected since they would
/// resolve outside the working tree.
pub fn is_tree_relative(file_name: &str) -> bool {
    !file_name.is_empty()
        && Path::new(file_name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// One metadata object definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: RecordId,
    pub full_name: String,
    /// Path within the working tree, relative to its root.
    pub file_name: String,
    pub object_type: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by_id: Option<String>,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manageable_state: Option<String>,
}

impl MetadataRecord {
    /// `<file_name>-meta.xml`
    pub fn sidecar_file_name(&self) -> String {
        format!("{}{SIDECAR_SUFFIX}", self.file_name)
    }

    /// Human-readable `(label, value)` pairs for every field, in a fixed order.
    ///
    /// Optional fields that are unset render as an empty value so the line
    /// set is the same for every record.
    pub fn field_lines(&self) -> Vec<(&'static str, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            ("Id", self.id.0.clone()),
            ("Full Name", self.full_name.clone()),
            ("File Name", self.file_name.clone()),
            ("Object Type", self.object_type.clone()),
            ("Created By", self.created_by.clone()),
            ("Created By Id", opt(&self.created_by_id)),
            ("Created At", self.created_at.to_rfc3339()),
            ("Last Modified By", self.last_modified_by.clone()),
            ("Last Modified By Id", opt(&self.last_modified_by_id)),
            ("Last Modified At", self.last_modified_at.to_rfc3339()),
            ("Namespace Prefix", opt(&self.namespace_prefix)),
            ("Manageable State", opt(&self.manageable_state)),
        ]
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Every known record of one environment at one instant.
///
/// Keyed by `id`, independently indexable by `file_name`. Encounter order is
/// preserved so anything derived from a snapshot is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    environment: EnvironmentName,
    records: Vec<MetadataRecord>,
    by_id: HashMap<RecordId, usize>,
    by_file_name: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new(environment: EnvironmentName) -> Self {
        Self {
            environment,
            records: Vec::new(),
            by_id: HashMap::new(),
            by_file_name: HashMap::new(),
        }
    }

    /// Build a snapshot, rejecting duplicate ids and duplicate file names.
    pub fn from_records(
        environment: EnvironmentName,
        records: impl IntoIterator<Item = MetadataRecord>,
    ) -> Result<Self, SnapshotError> {
        let mut snapshot = Self::new(environment);
        for record in records {
            snapshot.insert(record)?;
        }
        Ok(snapshot)
    }

    fn insert(&mut self, record: MetadataRecord) -> Result<(), SnapshotError> {
        if !is_tree_relative(&record.file_name) {
            return Err(SnapshotError::InvalidFileName {
                environment: self.environment.clone(),
                file_name: record.file_name,
            });
        }
        if self.by_id.contains_key(&record.id) {
            return Err(SnapshotError::DuplicateId {
                environment: self.environment.clone(),
                id: record.id,
            });
        }
        if self.by_file_name.contains_key(&record.file_name) {
            return Err(SnapshotError::DuplicateFileName {
                environment: self.environment.clone(),
                file_name: record.file_name,
            });
        }
        let idx = self.records.len();
        self.by_id.insert(record.id.clone(), idx);
        self.by_file_name.insert(record.file_name.clone(), idx);
        self.records.push(record);
        Ok(())
    }

    pub fn environment(&self) -> &EnvironmentName {
        &self.environment
    }

    pub fn get(&self, id: &RecordId) -> Option<&MetadataRecord> {
        self.by_id.get(id).map(|&i| &self.records[i])
    }

    pub fn get_by_file_name(&self, file_name: &str) -> Option<&MetadataRecord> {
        self.by_file_name.get(file_name).map(|&i| &self.records[i])
    }

    pub fn contains_file_name(&self, file_name: &str) -> bool {
        self.by_file_name.contains_key(file_name)
    }

    /// Records in encounter order.
    pub fn iter(&self) -> impl Iterator<Item = &MetadataRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<MetadataRecord> {
        self.records
    }
}

// ---------------------------------------------------------------------------
// Change / ChangeSet
// ---------------------------------------------------------------------------

/// Classification of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Deletion,
    Rename,
    Addition,
    Modification,
}

impl ChangeKind {
    /// Replay order of change groups.
    pub fn all() -> &'static [ChangeKind] {
        &[
            ChangeKind::Deletion,
            ChangeKind::Rename,
            ChangeKind::Addition,
            ChangeKind::Modification,
        ]
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Deletion => write!(f, "Deletion"),
            ChangeKind::Rename => write!(f, "Rename"),
            ChangeKind::Addition => write!(f, "Addition"),
            ChangeKind::Modification => write!(f, "Modification"),
        }
    }
}

/// A classified difference between two snapshots.
///
/// Every variant carries the newest known record; for a deletion that is the
/// record as it was last catalogued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    Addition(MetadataRecord),
    Deletion(MetadataRecord),
    Modification(MetadataRecord),
    Rename {
        previous: MetadataRecord,
        current: MetadataRecord,
    },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Addition(_) => ChangeKind::Addition,
            Change::Deletion(_) => ChangeKind::Deletion,
            Change::Modification(_) => ChangeKind::Modification,
            Change::Rename { .. } => ChangeKind::Rename,
        }
    }

    pub fn record(&self) -> &MetadataRecord {
        match self {
            Change::Addition(r) | Change::Deletion(r) | Change::Modification(r) => r,
            Change::Rename { current, .. } => current,
        }
    }

    /// Whether replay needs the retrieved body of this change.
    ///
    /// True for additions and modifications, and for a rename whose
    /// timestamp also moved, since its body may have changed with the path.
    pub fn needs_content(&self) -> bool {
        match self {
            Change::Addition(_) | Change::Modification(_) => true,
            Change::Deletion(_) => false,
            Change::Rename { previous, current } => {
                previous.last_modified_at != current.last_modified_at
            }
        }
    }

    /// The vacated path of a rename.
    pub fn previous_file_name(&self) -> Option<&str> {
        match self {
            Change::Rename { previous, .. } => Some(previous.file_name.as_str()),
            _ => None,
        }
    }
}

/// Ordered changes: deletions, renames, additions, then modifications.
///
/// The only constructor is [`ChangeSet::from_groups`], so the group order
/// cannot be violated after the fact. It serializes as a plain list but is
/// never read back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Assemble a change set from per-kind groups, each already in encounter order.
    pub fn from_groups(
        deletions: Vec<Change>,
        renames: Vec<Change>,
        additions: Vec<Change>,
        modifications: Vec<Change>,
    ) -> Self {
        let mut changes =
            Vec::with_capacity(deletions.len() + renames.len() + additions.len() + modifications.len());
        changes.extend(deletions);
        changes.extend(renames);
        changes.extend(additions);
        changes.extend(modifications);
        Self { changes }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn as_slice(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.kind() == kind)
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.of_kind(kind).count()
    }

    /// Records whose bodies must be fetched before replay.
    pub fn records_needing_content(&self) -> Vec<&MetadataRecord> {
        self.changes
            .iter()
            .filter(|c| c.needs_content())
            .map(Change::record)
            .collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
