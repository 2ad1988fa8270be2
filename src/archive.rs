use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::cancel::CancelToken;
use crate::error::{Result, UpgradeError};
use crate::integrity::{self, HashAlgo};

/// Sidecar digest file for an archive: `<archive>.md5`, lowercase hex,
/// no trailing newline required.
pub fn digest_path_for(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".md5");
    PathBuf::from(name)
}

/// Pack files and directories into a gzip tar at best compression.
/// Directory sources are archived under their base name; file sources under
/// their file name.
pub fn create_tar_gz(sources: &[PathBuf], output: &Path) -> Result<()> {
    let file = File::create(output).map_err(|e| UpgradeError::io(output, e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
    let mut builder = Builder::new(encoder);

    for source in sources {
        let meta = std::fs::metadata(source).map_err(|e| UpgradeError::io(source, e))?;
        let name = source
            .file_name()
            .ok_or_else(|| UpgradeError::UnsafePath(source.clone()))?;
        if meta.is_dir() {
            builder
                .append_dir_all(name, source)
                .map_err(|e| UpgradeError::io(source, e))?;
        } else {
            builder
                .append_path_with_name(source, name)
                .map_err(|e| UpgradeError::io(source, e))?;
        }
    }

    finish(builder, output)
}

/// Pack a directory's contents at the archive root, so `package.json` lands
/// at the top level on extraction.
pub fn pack_dir_contents(dir: &Path, output: &Path) -> Result<()> {
    let file = File::create(output).map_err(|e| UpgradeError::io(output, e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
    let mut builder = Builder::new(encoder);
    builder
        .append_dir_all("", dir)
        .map_err(|e| UpgradeError::io(dir, e))?;
    finish(builder, output)
}

fn finish(builder: Builder<GzEncoder<BufWriter<File>>>, output: &Path) -> Result<()> {
    use std::io::Write;

    let encoder = builder
        .into_inner()
        .map_err(|e| UpgradeError::io(output, e))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| UpgradeError::io(output, e))?;
    writer.flush().map_err(|e| UpgradeError::io(output, e))?;
    Ok(())
}

/// Write the archive's MD5 sidecar and return its path.
pub fn write_digest_file(archive: &Path) -> Result<PathBuf> {
    let digest = integrity::hash_file(archive, HashAlgo::Md5)?;
    let path = digest_path_for(archive);
    std::fs::write(&path, digest).map_err(|e| UpgradeError::io(&path, e))?;
    Ok(path)
}

/// Compare the archive's MD5 against its digest file.
pub fn verify_archive(archive: &Path, digest_file: &Path) -> Result<()> {
    let expected = std::fs::read_to_string(digest_file)
        .map_err(|e| UpgradeError::io(digest_file, e))?;
    let expected = expected.trim();
    if expected.len() != 32 || !expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(UpgradeError::ArchiveCorrupt(format!(
            "digest file {} does not contain an MD5 digest",
            digest_file.display()
        )));
    }
    let actual = integrity::hash_file(archive, HashAlgo::Md5)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(UpgradeError::ArchiveCorrupt(format!(
            "{}: digest {actual} does not match expected {expected}",
            archive.display()
        )))
    }
}

/// Extract a gzip tar into `dest`. Any member whose path would land outside
/// `dest` is rejected before a single byte of it is written.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| UpgradeError::io(archive_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive
        .entries()
        .map_err(|e| UpgradeError::ArchiveCorrupt(e.to_string()))?;
    for entry in entries {
        cancel.checkpoint()?;
        let mut entry = entry.map_err(|e| UpgradeError::ArchiveCorrupt(e.to_string()))?;
        let member = entry
            .path()
            .map_err(|e| UpgradeError::ArchiveCorrupt(e.to_string()))?
            .into_owned();

        let relative = sanitize_member(&member)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&relative);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UpgradeError::io(parent, e))?;
        }
        entry
            .unpack(&out)
            .map_err(|e| UpgradeError::io(&out, e))?;
    }
    Ok(())
}

/// Reject absolute or parent-escaping member paths; strip `./` segments.
fn sanitize_member(member: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in member.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UpgradeError::PathTraversal(member.to_path_buf()))
            }
        }
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = root.join(rel);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&full, content).unwrap();
        }
    }

    #[test]
    fn pack_and_extract_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pkg");
        make_tree(
            &src,
            &[
                ("package.json", b"{}"),
                ("files/a.txt", b"alpha"),
                ("files/nested/b.bin", &[0u8; 2048]),
            ],
        );

        let archive = dir.path().join("update.tar.gz");
        pack_dir_contents(&src, &archive).unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        extract_tar_gz(&archive, &out, &CancelToken::new()).unwrap();

        assert_eq!(fs::read(out.join("package.json")).unwrap(), b"{}");
        assert_eq!(fs::read(out.join("files/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(out.join("files/nested/b.bin")).unwrap(),
            vec![0u8; 2048]
        );
    }

    #[test]
    fn digest_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.tar.gz");
        fs::write(&archive, b"archive bytes").unwrap();

        let digest_file = write_digest_file(&archive).unwrap();
        assert_eq!(digest_file, dir.path().join("update.tar.gz.md5"));
        verify_archive(&archive, &digest_file).unwrap();

        let written = fs::read_to_string(&digest_file).unwrap();
        assert_eq!(written.len(), 32, "hex digest, no trailing newline");
    }

    #[test]
    fn corrupted_archive_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.tar.gz");
        fs::write(&archive, b"archive bytes").unwrap();
        let digest_file = write_digest_file(&archive).unwrap();

        let mut bytes = fs::read(&archive).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&archive, &bytes).unwrap();

        assert!(matches!(
            verify_archive(&archive, &digest_file),
            Err(UpgradeError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn malformed_digest_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.tar.gz");
        fs::write(&archive, b"archive bytes").unwrap();
        let digest_file = dir.path().join("update.tar.gz.md5");
        fs::write(&digest_file, "not a digest").unwrap();
        assert!(matches!(
            verify_archive(&archive, &digest_file),
            Err(UpgradeError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn traversal_member_is_rejected_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");

        let file = File::create(&archive).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);
        let payload = b"pwned".to_vec();
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, payload.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let err = extract_tar_gz(&archive, &out, &CancelToken::new());
        assert!(matches!(err, Err(UpgradeError::PathTraversal(_))));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn compress_multiple_sources() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree, &[("inner/x.txt", b"x")]);
        let single = dir.path().join("single.txt");
        fs::write(&single, b"alone").unwrap();

        let archive = dir.path().join("bundle.tar.gz");
        create_tar_gz(&[tree.clone(), single.clone()], &archive).unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        extract_tar_gz(&archive, &out, &CancelToken::new()).unwrap();
        assert_eq!(fs::read(out.join("tree/inner/x.txt")).unwrap(), b"x");
        assert_eq!(fs::read(out.join("single.txt")).unwrap(), b"alone");
    }
}
