use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpgradeError};

pub const PACKAGE_MANIFEST: &str = "package.json";
pub const PACKAGE_FILES_DIR: &str = "files";
pub const PACKAGE_README: &str = "README.md";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The `package.json` document: one entry per file-level change between the
/// base and target snapshots. Consumers treat `files` as a set keyed by path;
/// the on-disk order is whatever the generator's workers produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub version: String,
    pub description: String,
    pub timestamp: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the deployment root, forward-slash separated.
    pub path: String,
    /// Advisory mime-like category inferred from the extension.
    #[serde(rename = "type")]
    pub kind: String,
    pub status: FileStatus,
    /// Byte count of the target-side file; absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// MD5 of the target-side file; absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Present exactly when `status` is `modified`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchRecord>,
}

/// Location and integrity of one patch blob inside the package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub path: String,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Added => write!(f, "added"),
            FileStatus::Modified => write!(f, "modified"),
            FileStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl UpdatePackage {
    pub fn new(version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            files: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: FileEntry) {
        self.files.push(entry);
    }

    /// Pretty JSON with 4-space indentation, as written to `package.json`.
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        self.serialize(&mut ser)
            .map_err(|e| UpgradeError::ManifestInvalid(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| UpgradeError::ManifestInvalid(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| UpgradeError::io(path, e))
    }

    /// Parse without validating. Unknown fields are tolerated; missing
    /// required fields are not.
    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| UpgradeError::io(path, e))?;
        serde_json::from_str(&data).map_err(|e| UpgradeError::ManifestInvalid(e.to_string()))
    }

    /// Parse and validate, as the applier does.
    pub fn load(path: &Path) -> Result<Self> {
        let pkg = Self::read_from(path)?;
        pkg.validate()?;
        Ok(pkg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(UpgradeError::ManifestInvalid("empty version".into()));
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(self.files.len());
        for entry in &self.files {
            if !is_safe_relative(&entry.path) {
                return Err(UpgradeError::ManifestInvalid(format!(
                    "unsafe entry path: {:?}",
                    entry.path
                )));
            }
            if !seen.insert(entry.path.as_str()) {
                return Err(UpgradeError::ManifestInvalid(format!(
                    "duplicate entry path: {:?}",
                    entry.path
                )));
            }
            entry.validate()?;
        }
        Ok(())
    }

    /// Paths of every listed entry, for the applier's copy-over step.
    pub fn listed_paths(&self) -> HashSet<String> {
        self.files.iter().map(|e| e.path.clone()).collect()
    }
}

impl FileEntry {
    pub fn added(path: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        let path = normalize_slashes(path.into());
        Self {
            kind: kind_of(&path),
            path,
            status: FileStatus::Added,
            size: Some(size),
            hash: Some(hash.into()),
            patch: None,
        }
    }

    pub fn modified(
        path: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        patch: PatchRecord,
    ) -> Self {
        let path = normalize_slashes(path.into());
        Self {
            kind: kind_of(&path),
            path,
            status: FileStatus::Modified,
            size: Some(size),
            hash: Some(hash.into()),
            patch: Some(patch),
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        let path = normalize_slashes(path.into());
        Self {
            kind: kind_of(&path),
            path,
            status: FileStatus::Deleted,
            size: None,
            hash: None,
            patch: None,
        }
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(UpgradeError::ManifestInvalid(msg));
        match self.status {
            FileStatus::Added | FileStatus::Modified => {
                if self.size.is_none() {
                    return fail(format!("{}: missing size", self.path));
                }
                if self.hash.as_deref().map_or(true, str::is_empty) {
                    return fail(format!("{}: missing hash", self.path));
                }
                match (self.status, &self.patch) {
                    (FileStatus::Added, Some(_)) => {
                        fail(format!("{}: added entry carries a patch record", self.path))
                    }
                    (FileStatus::Modified, None) => {
                        fail(format!("{}: modified entry lacks a patch record", self.path))
                    }
                    (FileStatus::Modified, Some(patch)) => {
                        if patch.path.is_empty() || !is_safe_relative(&patch.path) {
                            return fail(format!("{}: unsafe patch path", self.path));
                        }
                        if patch.hash.is_empty() {
                            return fail(format!("{}: empty patch hash", self.path));
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            FileStatus::Deleted => {
                if self.size.is_some() || self.hash.is_some() || self.patch.is_some() {
                    return fail(format!("{}: deleted entry carries payload fields", self.path));
                }
                Ok(())
            }
        }
    }
}

fn normalize_slashes(path: String) -> String {
    if path.contains('\\') {
        path.replace('\\', "/")
    } else {
        path
    }
}

/// True when the string is a relative path that stays inside its root after
/// normalization: non-empty, no drive/root prefix, no `..` segment.
pub(crate) fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    if path.split('/').any(|seg| seg == ".." || seg.contains(':')) {
        return false;
    }
    true
}

/// Advisory mime-like category from the file extension.
pub fn kind_of(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let kind = match ext.as_deref() {
        Some("txt" | "log" | "md" | "cfg" | "ini" | "toml" | "yaml" | "yml") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html" | "htm") => "text/html",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz" | "tgz") => "application/gzip",
        _ => "application/octet-stream",
    };
    kind.to_string()
}
