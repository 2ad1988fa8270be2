use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{Result, UpgradeError};
use crate::integrity;

/// Per-file classification produced by the tree diff. `Unknown` exists only
/// while a pair is being classified and never reaches the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Deleted,
    Modified,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Change {
    pub path: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// When false, files with a well-known binary extension are dropped.
    pub include_binary: bool,
}

/// Extensions excluded from the diff unless `include_binary` is set.
pub const BINARY_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "pdf", "zip", "exe"];

pub fn has_binary_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.as_str()))
}

/// Enumerate added, deleted, and modified regular files between two
/// snapshot roots. Output is sorted by path and deduplicated; equality of
/// same-path pairs is decided by deep content comparison, never by metadata.
pub fn diff_trees(
    base_root: &Path,
    target_root: &Path,
    opts: DiffOptions,
    cancel: &CancelToken,
) -> Result<Vec<Change>> {
    let base_files = collect_files(base_root)?;
    let target_files = collect_files(target_root)?;

    let mut statuses: BTreeMap<String, DiffStatus> = BTreeMap::new();
    let mut record = |path: &str, status: DiffStatus| -> Result<()> {
        if let Some(prev) = statuses.insert(path.to_string(), status) {
            if prev != status {
                return Err(UpgradeError::AmbiguousChange(path.to_string()));
            }
        }
        Ok(())
    };

    for path in target_files.keys() {
        if !base_files.contains_key(path) {
            record(path, DiffStatus::Added)?;
        }
    }
    for path in base_files.keys() {
        if !target_files.contains_key(path) {
            record(path, DiffStatus::Deleted)?;
        }
    }
    for (path, base_abs) in &base_files {
        let Some(target_abs) = target_files.get(path) else {
            continue;
        };
        cancel.checkpoint()?;
        let mut status = DiffStatus::Unknown;
        if !integrity::files_equal(base_abs, target_abs)? {
            status = DiffStatus::Modified;
        }
        // Unchanged pairs stay Unknown and are dropped here.
        if status != DiffStatus::Unknown {
            record(path, status)?;
        }
    }

    Ok(statuses
        .into_iter()
        .filter(|(path, _)| opts.include_binary || !has_binary_extension(path))
        .map(|(path, status)| Change { path, status })
        .collect())
}

/// Walk a snapshot root and map relative forward-slash paths to absolute
/// paths, regular files only. Unreadable entries surface as errors rather
/// than being skipped.
pub(crate) fn collect_files(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let root = root
        .canonicalize()
        .map_err(|e| UpgradeError::io(root, e))?;

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"));
            UpgradeError::Io { path, source }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(&root)
            .map_err(|_| UpgradeError::UnsafePath(entry.path().to_path_buf()))?;
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(UpgradeError::UnsafePath(entry.path().to_path_buf()));
        }

        let rel_str = relative
            .to_str()
            .ok_or_else(|| UpgradeError::UnsafePath(entry.path().to_path_buf()))?
            .replace('\\', "/");
        files.insert(rel_str, entry.path().to_path_buf());
    }
    Ok(files)
}
