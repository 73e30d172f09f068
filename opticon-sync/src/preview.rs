//! Unified diffs of what a replay would do to the working tree.
//!
//! Reads the tree and the staged content; writes nothing.

use std::io::ErrorKind;
use std::path::Path;

use similar::TextDiff;

use opticon_core::{Change, ChangeKind, ChangeSet};

use crate::error::{io_err, SyncError};

/// Diff for a single change's primary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub file_name: String,
    pub kind: ChangeKind,
    pub unified_diff: String,
}

/// Compare the tree against the staged content for every change.
///
/// Changes that would leave the primary file byte-identical are omitted,
/// except renames, which always produce a `rename` line.
pub fn preview_changes(
    changes: &ChangeSet,
    staged: &Path,
    tree_root: &Path,
) -> Result<Vec<FileDiff>, SyncError> {
    let mut diffs = Vec::new();
    for change in changes {
        let record = change.record();
        let (old_name, old, new) = match change {
            Change::Deletion(r) => (
                r.file_name.as_str(),
                read_or_empty(&tree_root.join(&r.file_name))?,
                String::new(),
            ),
            Change::Rename { previous, current } => {
                let mut unified = format!("rename {} => {}\n", previous.file_name, current.file_name);
                if change.needs_content() {
                    let old = read_or_empty(&tree_root.join(&previous.file_name))?;
                    let new = read_or_empty(&staged.join(&current.file_name))?;
                    if old != new {
                        let old_header = format!("a/{}", previous.file_name);
                        let new_header = format!("b/{}", current.file_name);
                        unified.push_str(
                            &TextDiff::from_lines(&old, &new)
                                .unified_diff()
                                .header(&old_header, &new_header)
                                .context_radius(3)
                                .to_string(),
                        );
                    }
                }
                diffs.push(FileDiff {
                    file_name: current.file_name.clone(),
                    kind: ChangeKind::Rename,
                    unified_diff: unified,
                });
                continue;
            }
            Change::Addition(r) | Change::Modification(r) => (
                r.file_name.as_str(),
                read_or_empty(&tree_root.join(&r.file_name))?,
                read_or_empty(&staged.join(&r.file_name))?,
            ),
        };
        if old == new {
            continue;
        }

        let old_header = format!("a/{old_name}");
        let new_header = format!("b/{}", record.file_name);
        let unified = TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();
        diffs.push(FileDiff {
            file_name: record.file_name.clone(),
            kind: change.kind(),
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

fn read_or_empty(path: &Path) -> Result<String, SyncError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).replace("\r\n", "\n")),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(io_err(path, err)),
    }
}
