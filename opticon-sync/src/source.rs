//! Metadata source boundary.
//!
//! [`MetadataSource`] is what the reconciler needs from the platform: a
//! connection check, per-type listings, and retrieval of bodies for a
//! manifest. [`DirectorySource`] implements it over a mirror directory:
//!
//! ```text
//! <root>/listings/<Type>.json   array of listing rows
//! <root>/src/<file_name>        object bodies (and their -meta.xml sidecars)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opticon_core::{EnvironmentName, MetadataRecord, RecordId, Snapshot, SIDECAR_SUFFIX};

use crate::error::{source_io_err, SourceError, SyncError};
use crate::manifest::Manifest;

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// One listing row as returned by the platform. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: Option<String>,
    pub full_name: Option<String>,
    pub file_name: Option<String>,
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub created_by_id: Option<String>,
    pub created_by_name: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
    pub last_modified_by_id: Option<String>,
    pub last_modified_by_name: Option<String>,
    pub last_modified_date: Option<DateTime<Utc>>,
    pub namespace_prefix: Option<String>,
    pub manageable_state: Option<String>,
}

impl RawRecord {
    /// Convert to a [`MetadataRecord`], or `None` if the row is unusable.
    ///
    /// Rows without `fullName` or `lastModifiedDate` are dropped, as are rows
    /// without an `id` or `fileName` since they cannot be tracked.
    pub fn into_record(self, fallback_type: &str) -> Option<MetadataRecord> {
        let full_name = self.full_name?;
        let last_modified_at = self.last_modified_date?;
        let id = self.id?;
        let file_name = self.file_name?;
        Some(MetadataRecord {
            id: RecordId(id),
            full_name,
            file_name,
            object_type: self
                .object_type
                .unwrap_or_else(|| fallback_type.to_string()),
            created_by: self.created_by_name.unwrap_or_default(),
            created_by_id: self.created_by_id,
            created_at: self.created_date.unwrap_or(last_modified_at),
            last_modified_by: self.last_modified_by_name.unwrap_or_default(),
            last_modified_by_id: self.last_modified_by_id,
            last_modified_at,
            namespace_prefix: self.namespace_prefix,
            manageable_state: self.manageable_state,
        })
    }
}

// ---------------------------------------------------------------------------
// MetadataSource
// ---------------------------------------------------------------------------

pub trait MetadataSource {
    /// Fails fast on bad credentials or an unreachable endpoint.
    fn check_connection(&self) -> Result<(), SourceError>;

    fn list_type(&self, object_type: &str) -> Result<Vec<RawRecord>, SourceError>;

    /// Fetch the bodies named by `manifest` into `extract_to`, laid out by
    /// `file_name`.
    fn retrieve(&self, manifest: &Manifest, extract_to: &Path) -> Result<(), SourceError>;
}

/// List every configured type.
///
/// A failing type is logged and skipped. A connection failure aborts, since
/// every remaining type would fail the same way.
pub fn gather_metadata(
    source: &dyn MetadataSource,
    types: &[String],
) -> Result<Vec<MetadataRecord>, SourceError> {
    let mut records = Vec::new();
    for object_type in types {
        tracing::info!("Gathering {object_type}");
        match source.list_type(object_type) {
            Ok(rows) => {
                let total = rows.len();
                let before = records.len();
                records.extend(rows.into_iter().filter_map(|r| r.into_record(object_type)));
                let kept = records.len() - before;
                if kept < total {
                    tracing::debug!(
                        "{object_type}: dropped {} row(s) missing required fields",
                        total - kept
                    );
                }
            }
            Err(err @ SourceError::Connection(_)) => return Err(err),
            Err(err) => {
                tracing::warn!("{object_type} failed to gather: {err}");
                continue;
            }
        }
        tracing::info!("{object_type} complete.");
    }
    Ok(records)
}

/// [`gather_metadata`] folded into a snapshot. A duplicate `file_name` is fatal.
pub fn gather_snapshot(
    source: &dyn MetadataSource,
    environment: &EnvironmentName,
    types: &[String],
) -> Result<Snapshot, SyncError> {
    let records = gather_metadata(source, types)?;
    Ok(Snapshot::from_records(environment.clone(), records)?)
}

// ---------------------------------------------------------------------------
// DirectorySource
// ---------------------------------------------------------------------------

/// A metadata source backed by a mirror directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn listing_path(&self, object_type: &str) -> PathBuf {
        self.root.join("listings").join(format!("{object_type}.json"))
    }

    pub fn content_root(&self) -> PathBuf {
        self.root.join("src")
    }
}

impl MetadataSource for DirectorySource {
    fn check_connection(&self) -> Result<(), SourceError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(SourceError::Connection(format!(
                "mirror root {} is not a directory",
                self.root.display()
            )))
        }
    }

    fn list_type(&self, object_type: &str) -> Result<Vec<RawRecord>, SourceError> {
        let path = self.listing_path(object_type);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| source_io_err(&path, e))?;
        serde_json::from_str(&contents).map_err(|source| SourceError::Json { path, source })
    }

    fn retrieve(&self, manifest: &Manifest, extract_to: &Path) -> Result<(), SourceError> {
        std::fs::create_dir_all(extract_to).map_err(|e| source_io_err(extract_to, e))?;
        let content_root = self.content_root();

        for object_type in manifest.types() {
            let wanted: HashSet<&str> = manifest
                .members(object_type)
                .iter()
                .map(String::as_str)
                .collect();
            let rows = self.list_type(object_type)?;
            for record in rows.into_iter().filter_map(|r| r.into_record(object_type)) {
                if !wanted.contains(record.full_name.as_str()) {
                    continue;
                }
                let primary = content_root.join(&record.file_name);
                if !primary.exists() {
                    tracing::warn!(
                        "{} {} has no body at {}",
                        object_type,
                        record.full_name,
                        primary.display()
                    );
                    continue;
                }
                copy_into(&primary, &extract_to.join(&record.file_name))?;

                let sidecar = content_root.join(format!("{}{SIDECAR_SUFFIX}", record.file_name));
                if sidecar.exists() {
                    copy_into(&sidecar, &extract_to.join(record.sidecar_file_name()))?;
                }
            }
        }
        tracing::debug!(
            "retrieved {} member(s) into {}",
            manifest.len(),
            extract_to.display()
        );
        Ok(())
    }
}

fn copy_into(from: &Path, to: &Path) -> Result<(), SourceError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| source_io_err(parent, e))?;
    }
    std::fs::copy(from, to).map_err(|e| source_io_err(to, e))?;
    Ok(())
}
