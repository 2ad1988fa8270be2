use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpgradeError>;

/// Error taxonomy shared by the diff/patch core.
///
/// Workers report errors through the pool; the first one is propagated and
/// any later ones are chained onto it as `WorkerErrors`. Nothing is retried.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path escapes its root: {}", .0.display())]
    UnsafePath(PathBuf),

    #[error("archive member would be written outside the extraction root: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("hash mismatch for {}: expected {expected}, got {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("delta encode failed: {0}")]
    DeltaEncode(String),

    #[error("delta decode failed: {0}")]
    DeltaDecode(String),

    #[error("delta operation exceeded its {limit_secs}s budget")]
    DeltaTimeout { limit_secs: u64 },

    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("conflicting change statuses reported for {0}")]
    AmbiguousChange(String),

    #[error("no changes between base and target snapshots")]
    NoChanges,

    #[error("operation cancelled")]
    Cancelled,

    #[error("swap failed, reconstructed tree kept at {}: {source}", staging.display())]
    SwapFailed {
        staging: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker task aborted: {0}")]
    TaskFailed(String),

    #[error("{first}; {} further task error(s): [{}]", rest.len(), rest.join("; "))]
    WorkerErrors {
        first: Box<UpgradeError>,
        rest: Vec<String>,
    },
}

impl UpgradeError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        UpgradeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Collapse a batch of task errors into one propagated error.
    /// The first error is authoritative; later ones are kept for diagnostics.
    pub fn collate(mut errors: Vec<UpgradeError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let first = errors.remove(0);
        if errors.is_empty() {
            return Some(first);
        }
        Some(UpgradeError::WorkerErrors {
            first: Box::new(first),
            rest: errors.iter().map(|e| e.to_string()).collect(),
        })
    }
}
