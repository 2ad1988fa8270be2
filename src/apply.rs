use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archive;
use crate::cancel::{CancelToken, Deadline};
use crate::delta::{self, DeltaLimits};
use crate::diff;
use crate::error::{Result, UpgradeError};
use crate::integrity::{self, HashAlgo};
use crate::manifest::{
    FileEntry, FileStatus, UpdatePackage, PACKAGE_FILES_DIR, PACKAGE_MANIFEST,
};
use crate::pool::{Task, WorkerPool, DEFAULT_WORKERS};

/// Everything the applier needs. The deployment root is read-only input
/// until the final swap.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    pub deployment_root: PathBuf,
    pub archive: PathBuf,
    /// Defaults to `<archive>.md5`.
    pub digest_file: Option<PathBuf>,
    /// Defaults to the deployment root (in-place upgrade).
    pub output_root: Option<PathBuf>,
    pub workers: usize,
    pub limits: DeltaLimits,
    pub cancel: CancelToken,
}

impl ApplyConfig {
    pub fn new(deployment_root: impl Into<PathBuf>, archive: impl Into<PathBuf>) -> Self {
        Self {
            deployment_root: deployment_root.into(),
            archive: archive.into(),
            digest_file: None,
            output_root: None,
            workers: DEFAULT_WORKERS,
            limits: DeltaLimits::default(),
            cancel: CancelToken::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(UpgradeError::TaskFailed(
                "worker count must be at least 1".into(),
            ));
        }
        if !self.deployment_root.is_dir() {
            return Err(UpgradeError::io(
                &self.deployment_root,
                io::Error::new(io::ErrorKind::NotFound, "deployment root is not a directory"),
            ));
        }
        if !self.archive.is_file() {
            return Err(UpgradeError::io(
                &self.archive,
                io::Error::new(io::ErrorKind::NotFound, "archive not found"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ApplySummary {
    pub version: String,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub carried_over: usize,
    pub output_root: PathBuf,
}

/// Rebuild the target deployment from the base deployment plus an update
/// archive, verifying integrity at every step, then atomically swap the
/// reconstructed tree into place. The live deployment is never touched
/// before the swap; a failure during the swap itself keeps the staging tree
/// on disk for operator recovery.
pub async fn apply(cfg: ApplyConfig) -> Result<ApplySummary> {
    cfg.validate()?;
    let digest_file = cfg
        .digest_file
        .clone()
        .unwrap_or_else(|| archive::digest_path_for(&cfg.archive));
    let output_root = cfg
        .output_root
        .clone()
        .unwrap_or_else(|| cfg.deployment_root.clone());

    archive::verify_archive(&cfg.archive, &digest_file)?;
    debug!(archive = %cfg.archive.display(), "archive verified");

    let patch_tmp = staging_dir("patch_tmp", &output_root)?;
    let new_tmp = staging_dir("new_tmp", &output_root)?;

    archive::extract_tar_gz(&cfg.archive, patch_tmp.path(), &cfg.cancel)?;
    debug!("archive extracted");

    let package_root = locate_package_root(patch_tmp.path())?;
    let package = UpdatePackage::load(&package_root.join(PACKAGE_MANIFEST))?;
    info!(
        version = %package.version,
        entries = package.files.len(),
        workers = cfg.workers,
        "manifest loaded"
    );

    let mut added = 0usize;
    let mut modified = 0usize;
    let mut deleted = 0usize;
    let mut tasks: Vec<Task<()>> = Vec::with_capacity(package.files.len());
    for entry in &package.files {
        match entry.status {
            FileStatus::Added => added += 1,
            FileStatus::Modified => modified += 1,
            // Deleted paths simply never appear in the reconstructed tree.
            FileStatus::Deleted => {
                deleted += 1;
                continue;
            }
        }
        let ctx = EntryContext {
            entry: entry.clone(),
            deployment_root: cfg.deployment_root.clone(),
            package_root: package_root.clone(),
            new_root: new_tmp.path().to_path_buf(),
            decode_budget: cfg.limits.decode_budget,
            cancel: cfg.cancel.clone(),
        };
        tasks.push(Box::new(move || ctx.run()));
    }

    let pool = WorkerPool::new(cfg.workers)?;
    pool.run(tasks, &cfg.cancel).await?;
    debug!("all entries reconstructed");

    let carried_over = copy_over_unlisted(&cfg, &package, new_tmp.path())?;
    debug!(carried_over, "unlisted base files carried over");

    // Past this point the staging tree is complete; detach it from
    // auto-cleanup so a failed swap leaves it for the operator.
    let staged = new_tmp.keep();
    swap_into_place(&staged, &output_root)?;
    info!(output = %output_root.display(), "deployment swapped");

    Ok(ApplySummary {
        version: package.version,
        added,
        modified,
        deleted,
        carried_over,
        output_root,
    })
}

/// Staging directories live next to the output root when possible, so the
/// final swap can be a plain rename; the system temp dir is the fallback.
fn staging_dir(prefix: &str, near: &Path) -> Result<TempDir> {
    let near_parent = near.parent().filter(|p| p.is_dir());
    let attempt = match near_parent {
        Some(parent) => tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempdir_in(parent),
        None => tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempdir(),
    };
    match attempt {
        Ok(dir) => Ok(dir),
        Err(_) => tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempdir()
            .map_err(|e| UpgradeError::io(near, e)),
    }
}

/// `package.json` is expected at the archive root; archives that wrap the
/// package in a single top-level directory are accepted too.
fn locate_package_root(extracted: &Path) -> Result<PathBuf> {
    if extracted.join(PACKAGE_MANIFEST).is_file() {
        return Ok(extracted.to_path_buf());
    }
    let mut dirs = Vec::new();
    let entries =
        std::fs::read_dir(extracted).map_err(|e| UpgradeError::io(extracted, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| UpgradeError::io(extracted, e))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    if let [single] = dirs.as_slice() {
        if single.join(PACKAGE_MANIFEST).is_file() {
            return Ok(single.clone());
        }
    }
    Err(UpgradeError::ManifestInvalid(format!(
        "{PACKAGE_MANIFEST} not found in extracted archive"
    )))
}

/// Per-entry reconstruction work, run on the pool.
struct EntryContext {
    entry: FileEntry,
    deployment_root: PathBuf,
    package_root: PathBuf,
    new_root: PathBuf,
    decode_budget: Duration,
    cancel: CancelToken,
}

impl EntryContext {
    fn run(self) -> Result<()> {
        self.cancel.checkpoint()?;
        match self.entry.status {
            FileStatus::Added => self.run_added(),
            FileStatus::Modified => self.run_modified(),
            FileStatus::Deleted => Ok(()),
        }
    }

    fn destination(&self) -> Result<PathBuf> {
        let dst = self.new_root.join(&self.entry.path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UpgradeError::io(parent, e))?;
        }
        Ok(dst)
    }

    fn verify_reconstructed(&self, path: &Path) -> Result<()> {
        // Manifest validation guarantees size and hash are present here.
        if let Some(size) = self.entry.size {
            integrity::verify_size(path, size)?;
        }
        if let Some(hash) = self.entry.hash.as_deref() {
            integrity::verify_hash(path, hash, HashAlgo::Md5)?;
        }
        Ok(())
    }

    fn run_added(self) -> Result<()> {
        let src = self
            .package_root
            .join(PACKAGE_FILES_DIR)
            .join(&self.entry.path);
        let dst = self.destination()?;
        std::fs::copy(&src, &dst).map_err(|e| UpgradeError::io(&src, e))?;
        self.verify_reconstructed(&dst)?;
        debug!(path = %self.entry.path, "added file placed");
        Ok(())
    }

    fn run_modified(self) -> Result<()> {
        let patch = self
            .entry
            .patch
            .clone()
            .ok_or_else(|| {
                UpgradeError::ManifestInvalid(format!(
                    "{}: modified entry lacks a patch record",
                    self.entry.path
                ))
            })?;

        let patch_path = self.package_root.join(&patch.path);
        integrity::verify_size(&patch_path, patch.size)?;
        integrity::verify_hash(&patch_path, &patch.hash, HashAlgo::Md5)?;

        let old_path = self.deployment_root.join(&self.entry.path);
        if !integrity::file_exists(&old_path) {
            return Err(UpgradeError::io(
                &old_path,
                io::Error::new(io::ErrorKind::NotFound, "base file missing for patch"),
            ));
        }
        let dst = self.destination()?;

        // A deployment already at the target version short-circuits: the
        // base file is the reconstructed file.
        if self.base_matches_target(&old_path) {
            std::fs::copy(&old_path, &dst).map_err(|e| UpgradeError::io(&old_path, e))?;
            debug!(path = %self.entry.path, "already at target, carried unchanged");
            return self.verify_reconstructed(&dst);
        }

        let old = integrity::file_bytes(&old_path)?;
        let patch_bytes = integrity::file_bytes(&patch_path)?;
        let deadline = Deadline::after(self.decode_budget);
        let rebuilt = delta::decode(&old, &patch_bytes, &deadline, &self.cancel)?;
        std::fs::write(&dst, &rebuilt).map_err(|e| UpgradeError::io(&dst, e))?;

        self.verify_reconstructed(&dst)?;
        debug!(path = %self.entry.path, bytes = rebuilt.len(), "modified file rebuilt");
        Ok(())
    }

    fn base_matches_target(&self, old_path: &Path) -> bool {
        let size_ok = self
            .entry
            .size
            .map(|s| integrity::verify_size(old_path, s).is_ok())
            .unwrap_or(false);
        size_ok
            && self
                .entry
                .hash
                .as_deref()
                .map(|h| integrity::verify_hash(old_path, h, HashAlgo::Md5).is_ok())
                .unwrap_or(false)
    }
}

/// Every regular base file not listed in the manifest survives the upgrade
/// verbatim. This is what makes the applier order-independent: entries only
/// describe changes, the copy-over carries the rest.
fn copy_over_unlisted(
    cfg: &ApplyConfig,
    package: &UpdatePackage,
    new_root: &Path,
) -> Result<usize> {
    let listed = package.listed_paths();
    let base_files = diff::collect_files(&cfg.deployment_root)?;

    let mut carried = 0usize;
    for (rel, abs) in base_files {
        cfg.cancel.checkpoint()?;
        if listed.contains(&rel) {
            continue;
        }
        let dst = new_root.join(&rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UpgradeError::io(parent, e))?;
        }
        std::fs::copy(&abs, &dst).map_err(|e| UpgradeError::io(&abs, e))?;
        carried += 1;
    }
    Ok(carried)
}

/// Replace the output root with the staged tree. A rename is preferred;
/// when the staging directory lives on another filesystem the tree is
/// copied instead. Any failure here surfaces as `SwapFailed` and leaves the
/// staged tree in place as the sole recovery point.
fn swap_into_place(staged: &Path, output_root: &Path) -> Result<()> {
    let swap_err = |source: io::Error| UpgradeError::SwapFailed {
        staging: staged.to_path_buf(),
        source,
    };

    if output_root.exists() {
        std::fs::remove_dir_all(output_root).map_err(swap_err)?;
    }
    match std::fs::rename(staged, output_root) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(error = %rename_err, "rename failed, copying staged tree");
            copy_tree(staged, output_root).map_err(swap_err)?;
            if let Err(e) = std::fs::remove_dir_all(staged) {
                warn!(staging = %staged.display(), error = %e, "staging cleanup failed");
            }
            Ok(())
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
