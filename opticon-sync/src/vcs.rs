//! Version-control adapter.
//!
//! The file operations are provided methods over tree-relative paths; an
//! implementation only has to supply staging, commit, and push. Copies into
//! the tree go through `<dst>.opticon.tmp` + rename so a crash never leaves a
//! half-written file at a tracked path.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use opticon_core::{is_tree_relative, MetadataRecord};

use crate::error::{io_err, SyncError};

const FALLBACK_AUTHOR: &str = "opticon";

/// Identity recorded on a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Author taken from `last_modified_by`, with an address under `domain`.
    pub fn for_record(record: &MetadataRecord, domain: &str) -> Self {
        let name = record.last_modified_by.trim();
        let name = if name.is_empty() { FALLBACK_AUTHOR } else { name };
        let local: String = name
            .chars()
            .filter_map(|c| {
                if c.is_ascii_alphanumeric() {
                    Some(c.to_ascii_lowercase())
                } else if c.is_whitespace() || c == '.' || c == '-' || c == '_' {
                    Some('.')
                } else {
                    None
                }
            })
            .collect();
        let local = local.trim_matches('.');
        let local = if local.is_empty() { FALLBACK_AUTHOR } else { local };
        Self::new(name, format!("{local}@{domain}"))
    }
}

impl fmt::Display for CommitAuthor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

pub trait VersionControlAdapter {
    fn working_tree_path(&self) -> &Path;

    fn stage_all(&mut self) -> Result<(), SyncError>;

    /// Commit whatever is staged (possibly nothing) and return the commit id.
    fn commit(&mut self, message: &str, author: &CommitAuthor) -> Result<String, SyncError>;

    fn push(&mut self) -> Result<(), SyncError>;

    /// `relative` joined onto the working tree. Paths that could escape it
    /// are refused.
    fn tree_path(&self, relative: &str) -> Result<PathBuf, SyncError> {
        if !is_tree_relative(relative) {
            return Err(SyncError::PathOutsideTree {
                file_name: relative.to_string(),
            });
        }
        Ok(self.working_tree_path().join(relative))
    }

    /// False for paths outside the tree as well as missing files.
    fn exists(&self, relative: &str) -> bool {
        self.tree_path(relative)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Copy `src` to a path that must not exist yet.
    fn add_file(&mut self, src: &Path, dst: &str) -> Result<(), SyncError> {
        let target = self.tree_path(dst)?;
        if target.exists() {
            return Err(io_err(
                target,
                std::io::Error::new(ErrorKind::AlreadyExists, "add target already exists"),
            ));
        }
        copy_atomic(src, &target)?;
        tracing::debug!("added: {dst}");
        Ok(())
    }

    /// Replace the file at `dst` with `src`, creating it if needed.
    fn overwrite_file(&mut self, src: &Path, dst: &str) -> Result<(), SyncError> {
        copy_atomic(src, &self.tree_path(dst)?)?;
        tracing::debug!("overwrote: {dst}");
        Ok(())
    }

    fn delete_file(&mut self, relative: &str) -> Result<(), SyncError> {
        let target = self.tree_path(relative)?;
        std::fs::remove_file(&target).map_err(|e| io_err(&target, e))?;
        tracing::debug!("deleted: {relative}");
        Ok(())
    }

    /// Move `old` to `new`. Never overwrites an existing destination.
    fn rename_file(&mut self, old: &str, new: &str) -> Result<(), SyncError> {
        let from = self.tree_path(old)?;
        let to = self.tree_path(new)?;
        if to.exists() {
            return Err(io_err(
                to,
                std::io::Error::new(ErrorKind::AlreadyExists, "rename target already exists"),
            ));
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        std::fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
        tracing::debug!("renamed: {old} -> {new}");
        Ok(())
    }
}

/// Copy `src` to `dst` via a sibling temp file and rename.
pub(crate) fn copy_atomic(src: &Path, dst: &Path) -> Result<(), SyncError> {
    let bytes = std::fs::read(src).map_err(|e| io_err(src, e))?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.opticon.tmp", dst.display()));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, dst) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(dst, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// Drives a working tree through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    remote: String,
}

impl GitCli {
    /// Open an existing repository.
    pub fn open(root: impl Into<PathBuf>, remote: impl Into<String>) -> Result<Self, SyncError> {
        let root = root.into();
        if !root.join(".git").exists() {
            return Err(SyncError::Vcs {
                command: "git open".to_string(),
                stderr: format!("{} is not a git working tree", root.display()),
            });
        }
        Ok(Self {
            root,
            remote: remote.into(),
        })
    }

    /// Create the directory and run `git init` if it is not a repository yet.
    pub fn init(root: impl Into<PathBuf>, remote: impl Into<String>) -> Result<Self, SyncError> {
        let git = Self {
            root: root.into(),
            remote: remote.into(),
        };
        if !git.root.join(".git").exists() {
            std::fs::create_dir_all(&git.root).map_err(|e| io_err(&git.root, e))?;
            git.run(&["init", "--quiet"])?;
            tracing::info!("initialised repository at {}", git.root.display());
        }
        Ok(git)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn run(&self, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(|e| io_err(&self.root, e))?;
        if !output.status.success() {
            return Err(SyncError::Vcs {
                command: format!("git {}", redact_identity(args)),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionControlAdapter for GitCli {
    fn working_tree_path(&self) -> &Path {
        &self.root
    }

    fn stage_all(&mut self) -> Result<(), SyncError> {
        self.run(&["add", "-A"])?;
        Ok(())
    }

    fn commit(&mut self, message: &str, author: &CommitAuthor) -> Result<String, SyncError> {
        let user_name = format!("user.name={}", author.name);
        let user_email = format!("user.email={}", author.email);
        let author_arg = author.to_string();
        self.run(&[
            "-c",
            &user_name,
            "-c",
            &user_email,
            "commit",
            "--quiet",
            "--allow-empty",
            "--author",
            &author_arg,
            "-m",
            message,
        ])?;
        let id = self.run(&["rev-parse", "HEAD"])?;
        tracing::info!("committed {id}: {}", message.lines().next().unwrap_or_default());
        Ok(id)
    }

    fn push(&mut self) -> Result<(), SyncError> {
        self.run(&["push", "--quiet", &self.remote, "HEAD"])?;
        tracing::info!("pushed to {}", self.remote);
        Ok(())
    }
}

/// Shorten a git invocation for error messages: keep the subcommand, drop
/// `-c` pairs and the commit message body.
fn redact_identity(args: &[&str]) -> String {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "-c" | "-m" => {
                iter.next();
            }
            other => out.push(other),
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use opticon_core::RecordId;
    use tempfile::TempDir;

    struct TreeOnly {
        root: PathBuf,
    }

    impl VersionControlAdapter for TreeOnly {
        fn working_tree_path(&self) -> &Path {
            &self.root
        }
        fn stage_all(&mut self) -> Result<(), SyncError> {
            Ok(())
        }
        fn commit(&mut self, _: &str, _: &CommitAuthor) -> Result<String, SyncError> {
            Ok("0".to_string())
        }
        fn push(&mut self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn record(by: &str) -> MetadataRecord {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        MetadataRecord {
            id: RecordId::from("1"),
            full_name: "A".to_string(),
            file_name: "classes/A.cls".to_string(),
            object_type: "ApexClass".to_string(),
            created_by: by.to_string(),
            created_by_id: None,
            created_at: t,
            last_modified_by: by.to_string(),
            last_modified_by_id: None,
            last_modified_at: t,
            namespace_prefix: None,
            manageable_state: None,
        }
    }

    #[test]
    fn author_is_derived_from_last_modified_by() {
        let author = CommitAuthor::for_record(&record("Ada Lovelace"), "example.org");
        assert_eq!(author.name, "Ada Lovelace");
        assert_eq!(author.email, "ada.lovelace@example.org");
        assert_eq!(author.to_string(), "Ada Lovelace <ada.lovelace@example.org>");
    }

    #[test]
    fn blank_author_falls_back() {
        let author = CommitAuthor::for_record(&record("  "), "example.org");
        assert_eq!(author.email, "opticon@example.org");
    }

    #[test]
    fn file_operations_work_on_tree_relative_paths() {
        let tree = TempDir::new().unwrap();
        let staged = TempDir::new().unwrap();
        let src = staged.path().join("A.cls");
        std::fs::write(&src, "v1").unwrap();

        let mut vcs = TreeOnly {
            root: tree.path().to_path_buf(),
        };
        vcs.add_file(&src, "classes/A.cls").unwrap();
        assert!(vcs.exists("classes/A.cls"));
        assert!(vcs.add_file(&src, "classes/A.cls").is_err());

        std::fs::write(&src, "v2").unwrap();
        vcs.overwrite_file(&src, "classes/A.cls").unwrap();
        assert_eq!(
            std::fs::read_to_string(tree.path().join("classes/A.cls")).unwrap(),
            "v2"
        );
        assert!(!tree.path().join("classes/A.cls.opticon.tmp").exists());

        vcs.rename_file("classes/A.cls", "classes/B.cls").unwrap();
        assert!(!vcs.exists("classes/A.cls"));
        assert!(vcs.exists("classes/B.cls"));

        vcs.delete_file("classes/B.cls").unwrap();
        assert!(!vcs.exists("classes/B.cls"));
        assert!(vcs.delete_file("classes/B.cls").is_err());
    }

    #[test]
    fn rename_refuses_to_overwrite() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("a"), "a").unwrap();
        std::fs::write(tree.path().join("b"), "b").unwrap();
        let mut vcs = TreeOnly {
            root: tree.path().to_path_buf(),
        };
        let err = vcs.rename_file("a", "b").unwrap_err();
        match err {
            SyncError::Io { source, .. } => assert_eq!(source.kind(), ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_to_string(tree.path().join("b")).unwrap(), "b");
    }

    #[test]
    fn escaping_paths_are_refused_before_touching_disk() {
        let outer = TempDir::new().unwrap();
        let tree = outer.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let victim = outer.path().join("victim.txt");
        std::fs::write(&victim, "keep").unwrap();
        let mut vcs = TreeOnly { root: tree };

        assert!(!vcs.exists("../victim.txt"));
        assert!(matches!(
            vcs.delete_file("../victim.txt"),
            Err(SyncError::PathOutsideTree { .. })
        ));
        assert!(matches!(
            vcs.overwrite_file(&victim, "/tmp/elsewhere"),
            Err(SyncError::PathOutsideTree { .. })
        ));
        assert!(matches!(
            vcs.rename_file("../victim.txt", "inside.txt"),
            Err(SyncError::PathOutsideTree { .. })
        ));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "keep");
    }

    #[test]
    fn redacted_command_drops_identity_and_message() {
        let shown = redact_identity(&["-c", "user.name=x", "commit", "-m", "secret body"]);
        assert_eq!(shown, "commit");
    }

    #[test]
    fn open_rejects_plain_directory() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GitCli::open(dir.path(), "origin"),
            Err(SyncError::Vcs { .. })
        ));
    }
}
