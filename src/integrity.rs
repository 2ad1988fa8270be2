use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{Result, UpgradeError};

/// Digest algorithms used across the toolkit: MD5 for manifest and archive
/// digests, SHA-256 for deep file comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha256,
}

const READ_BUF: usize = 32 * 1024;

/// Stream a file through the chosen hash and return the lowercase hex digest.
pub fn hash_file(path: &Path, algo: HashAlgo) -> Result<String> {
    let file = File::open(path).map_err(|e| UpgradeError::io(path, e))?;
    match algo {
        HashAlgo::Md5 => stream_digest::<Md5>(path, file),
        HashAlgo::Sha256 => stream_digest::<Sha256>(path, file),
    }
}

fn stream_digest<D: Digest>(path: &Path, mut file: File) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| UpgradeError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute and compare, case-insensitively, against an expected hex digest.
pub fn verify_hash(path: &Path, expected: &str, algo: HashAlgo) -> Result<()> {
    let actual = hash_file(path, algo)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(UpgradeError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        })
    }
}

pub fn file_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| UpgradeError::io(path, e))?;
    Ok(meta.len())
}

/// Verify a file's on-disk size against the manifest's declared size.
pub fn verify_size(path: &Path, expected: u64) -> Result<()> {
    let actual = file_size(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(UpgradeError::SizeMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        })
    }
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Authoritative file equality, as used by the tree-diff. Size fast paths and
/// the same-inode check apply; metadata (mtime/mode) is never trusted and the
/// deep SHA-256 comparison always runs for distinct same-sized files.
pub fn files_equal(a: &Path, b: &Path) -> Result<bool> {
    files_equal_inner(a, b, false)
}

/// Like [`files_equal`] but accepts equal mtime + mode as an equality hint.
/// Unsafe for upgrade decisions; suitable for advisory scans only.
pub fn files_equal_fast(a: &Path, b: &Path) -> Result<bool> {
    files_equal_inner(a, b, true)
}

fn files_equal_inner(a: &Path, b: &Path, trust_metadata: bool) -> Result<bool> {
    let meta_a = std::fs::metadata(a).map_err(|e| UpgradeError::io(a, e))?;
    let meta_b = std::fs::metadata(b).map_err(|e| UpgradeError::io(b, e))?;

    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    if meta_a.len() == 0 && meta_a.is_file() && meta_b.is_file() {
        return Ok(true);
    }
    if same_identity(&meta_a, &meta_b) {
        return Ok(true);
    }
    if trust_metadata && metadata_hint_equal(&meta_a, &meta_b) {
        return Ok(true);
    }

    deep_equal(a, b, meta_a.len())
}

#[cfg(unix)]
fn same_identity(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_identity(_a: &std::fs::Metadata, _b: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn metadata_hint_equal(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (a.modified(), b.modified()) {
        (Ok(ma), Ok(mb)) => ma == mb && a.mode() == b.mode(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn metadata_hint_equal(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    match (a.modified(), b.modified()) {
        (Ok(ma), Ok(mb)) => ma == mb,
        _ => false,
    }
}

/// Read-chunk size chosen by file size, so small files are hashed in one
/// gulp and large files keep a bounded working set.
fn chunk_size_for(len: u64) -> usize {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    match len {
        0..=4096 => len.max(1) as usize,
        l if l <= 64 * KIB => 4 * KIB as usize,
        l if l <= MIB => 16 * KIB as usize,
        l if l <= 10 * MIB => 64 * KIB as usize,
        _ => MIB as usize,
    }
}

fn deep_equal(a: &Path, b: &Path, len: u64) -> Result<bool> {
    let chunk = chunk_size_for(len);
    let (ha, hb) = rayon::join(
        || sha256_chunked(a, chunk),
        || sha256_chunked(b, chunk),
    );
    Ok(ha? == hb?)
}

/// Read-only view of a file's bytes, memory-mapped when the platform
/// allows it (zero-length files cannot be mapped and are read instead).
pub enum FileBytes {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Owned(vec) => vec,
        }
    }
}

/// Map a file for reading. The underlying file must not be truncated or
/// replaced while the view is live.
pub fn file_bytes(path: &Path) -> Result<FileBytes> {
    let file = File::open(path).map_err(|e| UpgradeError::io(path, e))?;
    let meta = file.metadata().map_err(|e| UpgradeError::io(path, e))?;
    if meta.len() == 0 {
        return Ok(FileBytes::Owned(Vec::new()));
    }
    // SAFETY: the mapping is read-only and codec inputs stay untouched for
    // the duration of an encode/decode.
    match unsafe { memmap2::Mmap::map(&file) } {
        Ok(map) => Ok(FileBytes::Mapped(map)),
        Err(_) => {
            let data = std::fs::read(path).map_err(|e| UpgradeError::io(path, e))?;
            Ok(FileBytes::Owned(data))
        }
    }
}

fn sha256_chunked(path: &Path, chunk: usize) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| UpgradeError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| UpgradeError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
