//! Shared fixtures: a recording VCS double, a catalog that fails on demand,
//! and record builders.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use opticon_core::{
    CatalogError, CatalogStore, EnvironmentName, MemoryCatalog, MetadataRecord, RecordId, Snapshot,
};
use opticon_sync::{CommitAuthor, SyncError, VersionControlAdapter};

pub fn env() -> EnvironmentName {
    EnvironmentName::from("production")
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2013, 12, 4, 23, 31, 9).unwrap()
}

pub fn t1() -> DateTime<Utc> {
    t0() + Duration::hours(1)
}

pub fn record(id: &str, full_name: &str, file: &str, modified: DateTime<Utc>) -> MetadataRecord {
    MetadataRecord {
        id: RecordId::from(id),
        full_name: full_name.to_string(),
        file_name: file.to_string(),
        object_type: "ApexClass".to_string(),
        created_by: "Integration User".to_string(),
        created_by_id: None,
        created_at: t0(),
        last_modified_by: "Grace Hopper".to_string(),
        last_modified_by_id: None,
        last_modified_at: modified,
        namespace_prefix: None,
        manageable_state: None,
    }
}

pub fn snapshot(records: Vec<MetadataRecord>) -> Snapshot {
    Snapshot::from_records(env(), records).expect("valid snapshot")
}

pub fn write(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, body).expect("write");
}

/// Every file under `root`, as sorted `/`-separated relative paths.
pub fn tree_files(root: &Path) -> BTreeSet<String> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.insert(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(root, root, &mut out);
    out
}

// ---------------------------------------------------------------------------
// RecordingVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub id: String,
    pub message: String,
    pub author: CommitAuthor,
    /// Tree contents at commit time.
    pub files: BTreeSet<String>,
}

/// A working tree on disk whose commits are recorded in memory.
#[derive(Debug)]
pub struct RecordingVcs {
    pub root: PathBuf,
    pub commits: Vec<RecordedCommit>,
    pub pushes: usize,
    pub stage_calls: usize,
    pub fail_commit_at: Option<usize>,
}

impl RecordingVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            commits: Vec::new(),
            pushes: 0,
            stage_calls: 0,
            fail_commit_at: None,
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.commits
            .iter()
            .map(|c| c.message.lines().next().unwrap_or_default().to_string())
            .collect()
    }
}

impl VersionControlAdapter for RecordingVcs {
    fn working_tree_path(&self) -> &Path {
        &self.root
    }

    fn stage_all(&mut self) -> Result<(), SyncError> {
        self.stage_calls += 1;
        Ok(())
    }

    fn commit(&mut self, message: &str, author: &CommitAuthor) -> Result<String, SyncError> {
        if self.fail_commit_at == Some(self.commits.len()) {
            return Err(SyncError::Vcs {
                command: "git commit".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        let id = format!("c{:03}", self.commits.len());
        self.commits.push(RecordedCommit {
            id: id.clone(),
            message: message.to_string(),
            author: author.clone(),
            files: tree_files(&self.root),
        });
        Ok(id)
    }

    fn push(&mut self) -> Result<(), SyncError> {
        self.pushes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlakyCatalog
// ---------------------------------------------------------------------------

/// A [`MemoryCatalog`] whose mutations can be made to fail.
#[derive(Debug)]
pub struct FlakyCatalog {
    pub inner: MemoryCatalog,
    pub fail_mutations: bool,
}

impl FlakyCatalog {
    pub fn new(inner: MemoryCatalog) -> Self {
        Self {
            inner,
            fail_mutations: false,
        }
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.fail_mutations {
            Err(CatalogError::Io(std::io::Error::other("simulated catalog outage")))
        } else {
            Ok(())
        }
    }
}

impl CatalogStore for FlakyCatalog {
    fn environment(&self) -> &EnvironmentName {
        self.inner.environment()
    }

    fn find(&self, id: &RecordId) -> Result<Option<MetadataRecord>, CatalogError> {
        self.inner.find(id)
    }

    fn create(&mut self, record: MetadataRecord) -> Result<(), CatalogError> {
        self.check()?;
        self.inner.create(record)
    }

    fn update(&mut self, id: &RecordId, record: MetadataRecord) -> Result<(), CatalogError> {
        self.check()?;
        self.inner.update(id, record)
    }

    fn delete(&mut self, id: &RecordId) -> Result<(), CatalogError> {
        self.check()?;
        self.inner.delete(id)
    }

    fn list_by_environment(&self) -> Result<Snapshot, CatalogError> {
        self.inner.list_by_environment()
    }

    fn replace_all(&mut self, snapshot: Snapshot) -> Result<(), CatalogError> {
        self.check()?;
        self.inner.replace_all(snapshot)
    }
}
