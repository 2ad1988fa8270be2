use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::delta::{self, DeltaLimits};
use crate::diff::{self, DiffOptions, DiffStatus};
use crate::error::{Result, UpgradeError};
use crate::integrity::{self, HashAlgo};
use crate::manifest::{
    FileEntry, PatchRecord, UpdatePackage, PACKAGE_FILES_DIR, PACKAGE_MANIFEST, PACKAGE_README,
};
use crate::pool::{Task, WorkerPool, DEFAULT_WORKERS};

/// Everything the generator needs, validated up front.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub base_root: PathBuf,
    pub target_root: PathBuf,
    pub output_dir: PathBuf,
    pub version: String,
    pub description: String,
    pub workers: usize,
    pub include_binary: bool,
    pub limits: DeltaLimits,
    pub cancel: CancelToken,
}

impl GenerateConfig {
    pub fn new(
        base_root: impl Into<PathBuf>,
        target_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            base_root: base_root.into(),
            target_root: target_root.into(),
            output_dir: output_dir.into(),
            version: version.into(),
            description: String::new(),
            workers: DEFAULT_WORKERS,
            include_binary: false,
            limits: DeltaLimits::default(),
            cancel: CancelToken::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(UpgradeError::ManifestInvalid("empty version".into()));
        }
        if self.workers == 0 {
            return Err(UpgradeError::TaskFailed(
                "worker count must be at least 1".into(),
            ));
        }
        for root in [&self.base_root, &self.target_root] {
            if !root.is_dir() {
                return Err(UpgradeError::io(
                    root,
                    io::Error::new(io::ErrorKind::NotFound, "snapshot root is not a directory"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GenerateSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub manifest_path: PathBuf,
}

/// Build an update package under `output_dir` from the diff between the base
/// and target snapshots. Per-file work runs on a bounded pool; manifest
/// appends are serialized behind one mutex and the file order is whatever
/// completion order produced.
pub async fn generate(cfg: GenerateConfig) -> Result<GenerateSummary> {
    cfg.validate()?;

    let readme_path = cfg.output_dir.join(PACKAGE_README);
    if readme_path.exists() {
        return Err(UpgradeError::io(
            &readme_path,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "output directory already holds an update package",
            ),
        ));
    }
    let files_dir = cfg.output_dir.join(PACKAGE_FILES_DIR);
    std::fs::create_dir_all(&files_dir).map_err(|e| UpgradeError::io(&files_dir, e))?;

    let changes = diff::diff_trees(
        &cfg.base_root,
        &cfg.target_root,
        DiffOptions {
            include_binary: cfg.include_binary,
        },
        &cfg.cancel,
    )?;
    if changes.is_empty() {
        return Err(UpgradeError::NoChanges);
    }
    info!(
        version = %cfg.version,
        changes = changes.len(),
        workers = cfg.workers,
        "generating update package"
    );

    let package = UpdatePackage::new(cfg.version.clone(), cfg.description.clone());
    write_readme(&readme_path, &package)?;
    let manifest = Arc::new(Mutex::new(package));

    let mut added = 0usize;
    let mut modified = 0usize;
    let mut deleted = 0usize;
    let mut tasks: Vec<Task<()>> = Vec::with_capacity(changes.len());

    for change in changes {
        let task: Task<()> = match change.status {
            DiffStatus::Added => {
                added += 1;
                let ctx = TaskContext::for_change(&cfg, &manifest, change.path);
                Box::new(move || ctx.run_added())
            }
            DiffStatus::Modified => {
                modified += 1;
                let ctx = TaskContext::for_change(&cfg, &manifest, change.path);
                Box::new(move || ctx.run_modified())
            }
            DiffStatus::Deleted => {
                deleted += 1;
                let ctx = TaskContext::for_change(&cfg, &manifest, change.path);
                Box::new(move || ctx.run_deleted())
            }
            // The diff engine never emits Unknown; treat it as a bug.
            DiffStatus::Unknown => {
                return Err(UpgradeError::AmbiguousChange(change.path));
            }
        };
        tasks.push(task);
    }

    let pool = WorkerPool::new(cfg.workers)?;
    pool.run(tasks, &cfg.cancel).await?;

    let package = Arc::try_unwrap(manifest)
        .map_err(|_| UpgradeError::TaskFailed("manifest still shared after drain".into()))?
        .into_inner()
        .map_err(|e| UpgradeError::TaskFailed(e.to_string()))?;
    package.validate()?;

    let manifest_path = cfg.output_dir.join(PACKAGE_MANIFEST);
    package.write_to(&manifest_path)?;
    info!(added, modified, deleted, "update package written");

    Ok(GenerateSummary {
        added,
        modified,
        deleted,
        manifest_path,
    })
}

/// Owned per-task state: one changed path plus the handles the task needs.
struct TaskContext {
    path: String,
    base_root: PathBuf,
    target_root: PathBuf,
    output_dir: PathBuf,
    limits: DeltaLimits,
    cancel: CancelToken,
    manifest: Arc<Mutex<UpdatePackage>>,
}

impl TaskContext {
    fn for_change(cfg: &GenerateConfig, manifest: &Arc<Mutex<UpdatePackage>>, path: String) -> Self {
        Self {
            path,
            base_root: cfg.base_root.clone(),
            target_root: cfg.target_root.clone(),
            output_dir: cfg.output_dir.clone(),
            limits: cfg.limits,
            cancel: cfg.cancel.clone(),
            manifest: manifest.clone(),
        }
    }

    fn append(&self, entry: FileEntry) -> Result<()> {
        self.manifest
            .lock()
            .map_err(|e| UpgradeError::TaskFailed(e.to_string()))?
            .push(entry);
        Ok(())
    }

    fn payload_path(&self, suffix: &str) -> Result<PathBuf> {
        let dst = self
            .output_dir
            .join(PACKAGE_FILES_DIR)
            .join(format!("{}{}", self.path, suffix));
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UpgradeError::io(parent, e))?;
        }
        Ok(dst)
    }

    /// Added: the payload carried by the package is the new file, verbatim.
    fn run_added(self) -> Result<()> {
        self.cancel.checkpoint()?;
        let src = self.target_root.join(&self.path);
        let dst = self.payload_path("")?;
        std::fs::copy(&src, &dst).map_err(|e| UpgradeError::io(&src, e))?;

        let size = integrity::file_size(&dst)?;
        let hash = integrity::hash_file(&dst, HashAlgo::Md5)?;
        debug!(path = %self.path, size, "added file staged");
        let entry = FileEntry::added(self.path.clone(), size, hash);
        self.append(entry)
    }

    /// Modified: search for the patch-size-minimizing block size, stage the
    /// patch blob, and record target-side metrics in the file record.
    fn run_modified(self) -> Result<()> {
        self.cancel.checkpoint()?;
        let base_file = self.base_root.join(&self.path);
        let target_file = self.target_root.join(&self.path);

        let old = integrity::file_bytes(&base_file)?;
        let new = integrity::file_bytes(&target_file)?;
        let (block_kib, patch) =
            delta::search_best_block(&old, &new, &self.limits, &self.cancel)?;

        let patch_dst = self.payload_path(".patch")?;
        std::fs::write(&patch_dst, &patch).map_err(|e| UpgradeError::io(&patch_dst, e))?;
        verify_patch_blob(&patch_dst)?;

        let target_size = new.len() as u64;
        let target_hash = integrity::hash_file(&target_file, HashAlgo::Md5)?;
        let patch_size = integrity::file_size(&patch_dst)?;
        let patch_hash = integrity::hash_file(&patch_dst, HashAlgo::Md5)?;
        debug!(
            path = %self.path,
            block_kib,
            patch_size,
            target_size,
            "patch blob staged"
        );

        let entry = FileEntry::modified(
            self.path.clone(),
            target_size,
            target_hash,
            PatchRecord {
                path: format!("{PACKAGE_FILES_DIR}/{}.patch", self.path),
                size: patch_size,
                hash: patch_hash,
            },
        );
        self.append(entry)
    }

    /// Deleted: an entry with no payload.
    fn run_deleted(self) -> Result<()> {
        self.cancel.checkpoint()?;
        self.append(FileEntry::deleted(self.path.clone()))
    }
}

/// Staged patch blobs are re-opened and sanity-checked before the manifest
/// records them.
fn verify_patch_blob(path: &Path) -> Result<()> {
    let size = integrity::file_size(path)?;
    if size == 0 {
        return Err(UpgradeError::DeltaEncode(format!(
            "{}: empty patch blob",
            path.display()
        )));
    }
    let bytes = integrity::file_bytes(path)?;
    delta::embedded_block_kib(&bytes)?;
    Ok(())
}

fn write_readme(path: &Path, package: &UpdatePackage) -> Result<()> {
    let body = format!(
        "# Update package\n\n\
         - Version: {}\n\
         - Generated: {}\n\n\
         {}\n\n\
         Apply with `upgrader upgrade` against the matching base deployment.\n",
        package.version,
        package.timestamp,
        if package.description.is_empty() {
            "Incremental update produced by the upgrader toolkit."
        } else {
            package.description.as_str()
        }
    );
    std::fs::write(path, body).map_err(|e| UpgradeError::io(path, e))
}
