//! Snapshot diffing.
//!
//! ## Classification
//!
//! 1. Index both snapshots by `file_name`. A path held by a record in
//!    `previous` but not by the *same id* in `current` is a deletion
//!    candidate; the mirror image is an addition candidate.
//! 2. Candidates sharing an `id` across the two sides pair up as a rename.
//! 3. Unpaired candidates become deletions / additions.
//! 4. Same path, same id: a modification when `last_modified_at` moved or
//!    the type is force-modified.
//! 5. Groups are emitted deletions → renames → additions → modifications,
//!    each in encounter order (deletions by `previous`, the rest by `current`).
//!
//! `id` is authoritative for identity; names are never compared.

use std::collections::{BTreeSet, HashMap, HashSet};

use opticon_core::{Change, ChangeSet, MetadataRecord, RecordId, Settings, Snapshot};

/// Diffs snapshots with a fixed set of force-modified types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiffer {
    force_modify_types: BTreeSet<String>,
}

impl SnapshotDiffer {
    pub fn new(force_modify_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            force_modify_types: force_modify_types.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            force_modify_types: settings.force_modify_types(),
        }
    }

    pub fn force_modify_types(&self) -> &BTreeSet<String> {
        &self.force_modify_types
    }

    pub fn diff(&self, previous: &Snapshot, current: &Snapshot) -> ChangeSet {
        diff(previous, current, &self.force_modify_types)
    }
}

/// Classify every difference between `previous` and `current`.
///
/// Both snapshots are assumed to satisfy their invariants (unique ids, unique
/// file names), which [`Snapshot::from_records`] enforces.
pub fn diff(
    previous: &Snapshot,
    current: &Snapshot,
    force_modify_types: &BTreeSet<String>,
) -> ChangeSet {
    if previous.environment() != current.environment() {
        tracing::warn!(
            "diffing snapshots of different environments: '{}' vs '{}'",
            previous.environment(),
            current.environment()
        );
    }

    let deletion_candidates: Vec<&MetadataRecord> = previous
        .iter()
        .filter(|r| !same_identity_at_path(current, r))
        .collect();
    let addition_candidates: Vec<&MetadataRecord> = current
        .iter()
        .filter(|r| !same_identity_at_path(previous, r))
        .collect();

    let deleted_by_id: HashMap<&RecordId, &MetadataRecord> =
        deletion_candidates.iter().map(|r| (&r.id, *r)).collect();

    let mut paired: HashSet<&RecordId> = HashSet::new();
    let mut renames = Vec::new();
    for added in &addition_candidates {
        if let Some(prev) = deleted_by_id.get(&added.id) {
            tracing::info!(
                "Rename detected: {} ({} -> {})",
                added.full_name,
                prev.file_name,
                added.file_name
            );
            paired.insert(&added.id);
            renames.push(Change::Rename {
                previous: (*prev).clone(),
                current: (*added).clone(),
            });
        }
    }

    let deletions: Vec<Change> = deletion_candidates
        .iter()
        .filter(|r| !paired.contains(&r.id))
        .map(|r| {
            tracing::info!("Deletion detected: {}", r.full_name);
            Change::Deletion((*r).clone())
        })
        .collect();

    let additions: Vec<Change> = addition_candidates
        .iter()
        .filter(|r| !paired.contains(&r.id))
        .map(|r| {
            tracing::info!("Addition detected: {}", r.full_name);
            Change::Addition((*r).clone())
        })
        .collect();

    let mut modifications = Vec::new();
    for cur in current.iter() {
        let Some(prev) = previous.get_by_file_name(&cur.file_name) else {
            continue;
        };
        if prev.id != cur.id {
            continue;
        }
        let forced = force_modify_types.contains(&cur.object_type);
        if prev.last_modified_at != cur.last_modified_at || forced {
            tracing::info!("Modification detected: {}", cur.full_name);
            modifications.push(Change::Modification(cur.clone()));
        }
    }

    ChangeSet::from_groups(deletions, renames, additions, modifications)
}

/// Whether `other` holds a record with this record's id at this record's path.
fn same_identity_at_path(other: &Snapshot, record: &MetadataRecord) -> bool {
    other
        .get_by_file_name(&record.file_name)
        .map(|o| o.id == record.id)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
