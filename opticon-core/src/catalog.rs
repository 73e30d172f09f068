//! Persistent catalog of known metadata records.
//!
//! # Storage layout
//!
//! ```text
//! ~/.opticon/
//!   catalog/
//!     <environment>.yaml   (one partition per environment, mode 0600)
//! ```
//!
//! The replayer only sees the [`CatalogStore`] trait. [`YamlCatalog`] is the
//! on-disk implementation; [`MemoryCatalog`] backs tests and dry runs.
//!
//! Each `CatalogStore` value is one environment's partition: ids are unique
//! within it, and `list_by_environment` returns exactly its rows.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::paths;
use crate::types::{EnvironmentName, MetadataRecord, RecordId, Snapshot};

/// Keyed store of [`MetadataRecord`] rows for one environment.
pub trait CatalogStore {
    fn environment(&self) -> &EnvironmentName;

    fn find(&self, id: &RecordId) -> Result<Option<MetadataRecord>, CatalogError>;

    /// Insert a new row. Fails with [`CatalogError::AlreadyExists`] on an id clash.
    fn create(&mut self, record: MetadataRecord) -> Result<(), CatalogError>;

    /// Replace the row identified by `id`. Fails with [`CatalogError::NotFound`].
    fn update(&mut self, id: &RecordId, record: MetadataRecord) -> Result<(), CatalogError>;

    /// Remove the row identified by `id`. Fails with [`CatalogError::NotFound`].
    fn delete(&mut self, id: &RecordId) -> Result<(), CatalogError>;

    /// Every row of this partition as a snapshot.
    fn list_by_environment(&self) -> Result<Snapshot, CatalogError>;

    /// Drop every row and store `snapshot` in its place.
    fn replace_all(&mut self, snapshot: Snapshot) -> Result<(), CatalogError>;
}

// ---------------------------------------------------------------------------
// Row bookkeeping shared by both stores
// ---------------------------------------------------------------------------

fn position(rows: &[MetadataRecord], id: &RecordId) -> Option<usize> {
    rows.iter().position(|r| &r.id == id)
}

fn create_row(rows: &mut Vec<MetadataRecord>, record: MetadataRecord) -> Result<(), CatalogError> {
    if position(rows, &record.id).is_some() {
        return Err(CatalogError::AlreadyExists { id: record.id });
    }
    rows.push(record);
    Ok(())
}

fn update_row(
    rows: &mut [MetadataRecord],
    id: &RecordId,
    record: MetadataRecord,
) -> Result<(), CatalogError> {
    let idx = position(rows, id).ok_or_else(|| CatalogError::NotFound { id: id.clone() })?;
    rows[idx] = record;
    Ok(())
}

fn delete_row(rows: &mut Vec<MetadataRecord>, id: &RecordId) -> Result<(), CatalogError> {
    let idx = position(rows, id).ok_or_else(|| CatalogError::NotFound { id: id.clone() })?;
    rows.remove(idx);
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryCatalog
// ---------------------------------------------------------------------------

/// Volatile catalog partition.
#[derive(Debug, Clone)]
pub struct MemoryCatalog {
    environment: EnvironmentName,
    rows: Vec<MetadataRecord>,
}

impl MemoryCatalog {
    pub fn new(environment: impl Into<EnvironmentName>) -> Self {
        Self {
            environment: environment.into(),
            rows: Vec::new(),
        }
    }

    pub fn with_records(
        environment: impl Into<EnvironmentName>,
        records: impl IntoIterator<Item = MetadataRecord>,
    ) -> Self {
        Self {
            environment: environment.into(),
            rows: records.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl CatalogStore for MemoryCatalog {
    fn environment(&self) -> &EnvironmentName {
        &self.environment
    }

    fn find(&self, id: &RecordId) -> Result<Option<MetadataRecord>, CatalogError> {
        Ok(self.rows.iter().find(|r| &r.id == id).cloned())
    }

    fn create(&mut self, record: MetadataRecord) -> Result<(), CatalogError> {
        create_row(&mut self.rows, record)
    }

    fn update(&mut self, id: &RecordId, record: MetadataRecord) -> Result<(), CatalogError> {
        update_row(&mut self.rows, id, record)
    }

    fn delete(&mut self, id: &RecordId) -> Result<(), CatalogError> {
        delete_row(&mut self.rows, id)
    }

    fn list_by_environment(&self) -> Result<Snapshot, CatalogError> {
        Ok(Snapshot::from_records(
            self.environment.clone(),
            self.rows.iter().cloned(),
        )?)
    }

    fn replace_all(&mut self, snapshot: Snapshot) -> Result<(), CatalogError> {
        self.rows = snapshot.into_records();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// YamlCatalog
// ---------------------------------------------------------------------------

/// On-disk catalog payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    environment: EnvironmentName,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    records: Vec<MetadataRecord>,
}

/// Catalog partition persisted to `<home>/.opticon/catalog/<env>.yaml`.
///
/// Rows are held in memory and the whole file is rewritten atomically after
/// every mutation, so a mutation that returned `Ok` is durable.
#[derive(Debug)]
pub struct YamlCatalog {
    path: PathBuf,
    environment: EnvironmentName,
    rows: Vec<MetadataRecord>,
}

impl YamlCatalog {
    /// Open the partition for `environment` under `home`, empty if absent.
    pub fn open_at(home: &Path, environment: EnvironmentName) -> Result<Self, CatalogError> {
        let path = paths::catalog_path(home, &environment);
        if !path.exists() {
            return Ok(Self {
                path,
                environment,
                rows: Vec::new(),
            });
        }
        let contents = std::fs::read_to_string(&path)?;
        let file: CatalogFile = serde_yaml::from_str(&contents)
            .map_err(|source| CatalogError::Parse { path: path.clone(), source })?;
        if file.environment != environment {
            tracing::warn!(
                "catalog at {} names environment '{}', expected '{}'",
                path.display(),
                file.environment,
                environment
            );
        }
        Ok(Self {
            path,
            environment,
            rows: file.records,
        })
    }

    /// `open_at` convenience wrapper.
    pub fn open(environment: EnvironmentName) -> Result<Self, CatalogError> {
        let home = dirs::home_dir().ok_or(CatalogError::HomeNotFound)?;
        Self::open_at(&home, environment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
    fn save(&self) -> Result<(), CatalogError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = CatalogFile {
            environment: self.environment.clone(),
            updated_at: Utc::now(),
            records: self.rows.clone(),
        };
        let yaml = serde_yaml::to_string(&file)?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml)?;
        set_file_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Apply `mutate` to the rows and persist; on failure the in-memory rows
    /// are restored so memory and disk never diverge.
    fn mutate<F>(&mut self, mutate: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut Vec<MetadataRecord>) -> Result<(), CatalogError>,
    {
        let before = self.rows.clone();
        mutate(&mut self.rows)?;
        if let Err(err) = self.save() {
            self.rows = before;
            return Err(err);
        }
        Ok(())
    }
}

impl CatalogStore for YamlCatalog {
    fn environment(&self) -> &EnvironmentName {
        &self.environment
    }

    fn find(&self, id: &RecordId) -> Result<Option<MetadataRecord>, CatalogError> {
        Ok(self.rows.iter().find(|r| &r.id == id).cloned())
    }

    fn create(&mut self, record: MetadataRecord) -> Result<(), CatalogError> {
        self.mutate(|rows| create_row(rows, record))
    }

    fn update(&mut self, id: &RecordId, record: MetadataRecord) -> Result<(), CatalogError> {
        self.mutate(|rows| update_row(rows, id, record))
    }

    fn delete(&mut self, id: &RecordId) -> Result<(), CatalogError> {
        self.mutate(|rows| delete_row(rows, id))
    }

    fn list_by_environment(&self) -> Result<Snapshot, CatalogError> {
        Ok(Snapshot::from_records(
            self.environment.clone(),
            self.rows.iter().cloned(),
        )?)
    }

    fn replace_all(&mut self, snapshot: Snapshot) -> Result<(), CatalogError> {
        self.mutate(|rows| {
            *rows = snapshot.into_records();
            Ok(())
        })
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CatalogError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CatalogError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
