use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn upgrader() -> Command {
    Command::cargo_bin("upgrader").unwrap()
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap()
            .to_str()
            .unwrap()
            .replace('\\', "/");

        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((rel, content));
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            fs::copy(&src_path, &dst_path).unwrap();
        }
    }
}

#[test]
fn end_to_end_full_upgrade_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let deployed = temp.path().join("deployed");
    let pkg_dir = temp.path().join("pkg");
    let archive = temp.path().join("update.tar.gz");

    create_dir_tree(
        &old_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &vec![0xAA; 8192]),
            ("data/old_file.txt", b"This file will be deleted"),
            ("obsolete/remove_me.txt", b"Going away"),
        ],
    );

    let mut modified_bin = vec![0xAA; 4096];
    modified_bin.extend_from_slice(&vec![0xBB; 4096]);
    create_dir_tree(
        &new_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            (
                "config/settings.json",
                b"{\"version\": 2, \"debug\": true, \"newField\": 42}",
            ),
            ("data/records.bin", &modified_bin),
            ("data/new_file.txt", b"Brand new file in version 2"),
            ("extras/bonus.dat", &vec![0xFF; 1024]),
        ],
    );

    copy_dir_recursive(&old_dir, &deployed);

    // Step 1: generate the update package
    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            pkg_dir.to_str().unwrap(),
            "--version",
            "2.0.0",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Files modified: 3"))
        .stdout(predicate::str::contains("Files added: 2"))
        .stdout(predicate::str::contains("Files deleted: 2"));

    assert!(pkg_dir.join("package.json").exists());
    assert!(pkg_dir.join("README.md").exists());

    // Step 2: pack it for transport
    upgrader()
        .args([
            "compress",
            archive.to_str().unwrap(),
            pkg_dir.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert!(archive.exists());
    assert!(temp.path().join("update.tar.gz.md5").exists());

    // Step 3: apply to the deployed copy of version 1
    upgrader()
        .args([
            "upgrade",
            "--input",
            archive.to_str().unwrap(),
            "--output",
            deployed.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 2.0.0"));

    // Step 4: the deployment now equals the target snapshot
    let expected = collect_dir_tree(&new_dir);
    let actual = collect_dir_tree(&deployed);
    assert_eq!(
        expected.len(),
        actual.len(),
        "file count mismatch: {:?} vs {:?}",
        expected.iter().map(|(p, _)| p).collect::<Vec<_>>(),
        actual.iter().map(|(p, _)| p).collect::<Vec<_>>()
    );
    for ((exp_path, exp_data), (act_path, act_data)) in expected.iter().zip(actual.iter()) {
        assert_eq!(exp_path, act_path);
        assert_eq!(exp_data, act_data, "content mismatch for {exp_path}");
    }

    assert!(!deployed.join("data/old_file.txt").exists());
    assert!(!deployed.join("obsolete/remove_me.txt").exists());
    assert!(deployed.join("data/new_file.txt").exists());
    assert!(deployed.join("extras/bonus.dat").exists());
}

#[test]
fn pure_addition_manifest_entry() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let pkg_dir = temp.path().join("pkg");

    create_dir_tree(&old_dir, &[("a.txt", b"hello\n")]);
    create_dir_tree(&new_dir, &[("a.txt", b"hello\n"), ("b.txt", b"world\n")]);

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            pkg_dir.to_str().unwrap(),
            "--version",
            "1.1.0",
        ])
        .assert()
        .success();

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(pkg_dir.join("package.json")).unwrap()).unwrap();
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "b.txt");
    assert_eq!(files[0]["status"], "added");
    assert_eq!(files[0]["size"], 6);
    assert_eq!(files[0]["hash"], "591785b794601e212b260e25925636fd");
    assert!(files[0].get("patch").is_none());
    assert_eq!(fs::read(pkg_dir.join("files/b.txt")).unwrap(), b"world\n");
}

#[test]
fn pure_deletion_manifest_entry() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let pkg_dir = temp.path().join("pkg");

    create_dir_tree(&old_dir, &[("a.txt", b"x"), ("c.log", b"y")]);
    create_dir_tree(&new_dir, &[("a.txt", b"x")]);

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            pkg_dir.to_str().unwrap(),
            "--version",
            "1.0.1",
        ])
        .assert()
        .success();

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(pkg_dir.join("package.json")).unwrap()).unwrap();
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "c.log");
    assert_eq!(files[0]["status"], "deleted");
    assert!(files[0].get("size").is_none());
    assert!(files[0].get("hash").is_none());
}

#[test]
fn no_changes_fails_generation() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");

    let files: &[(&str, &[u8])] = &[("a.txt", b"same"), ("sub/b.txt", b"also same")];
    create_dir_tree(&old_dir, files);
    create_dir_tree(&new_dir, files);

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            temp.path().join("pkg").to_str().unwrap(),
            "--version",
            "1.0.0",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no changes"));
}

#[test]
fn binary_only_changes_are_filtered_without_flag() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");

    create_dir_tree(&old_dir, &[("img.png", b"png version 1")]);
    create_dir_tree(&new_dir, &[("img.png", b"png version 2, different")]);

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            temp.path().join("pkg").to_str().unwrap(),
            "--version",
            "1.0.0",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no changes"));

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            temp.path().join("pkg2").to_str().unwrap(),
            "--version",
            "1.0.0",
            "--include-binary",
        ])
        .assert()
        .success();
}

#[test]
fn corrupted_archive_refuses_to_apply() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let deployed = temp.path().join("deployed");
    let pkg_dir = temp.path().join("pkg");
    let archive = temp.path().join("update.tar.gz");

    create_dir_tree(&old_dir, &[("app.bin", &vec![1u8; 4096])]);
    create_dir_tree(&new_dir, &[("app.bin", &vec![2u8; 4096])]);
    copy_dir_recursive(&old_dir, &deployed);

    upgrader()
        .args([
            "generate",
            "--base",
            old_dir.to_str().unwrap(),
            "--target",
            new_dir.to_str().unwrap(),
            "--output",
            pkg_dir.to_str().unwrap(),
            "--version",
            "1.0.0",
        ])
        .assert()
        .success();
    upgrader()
        .args([
            "compress",
            archive.to_str().unwrap(),
            pkg_dir.to_str().unwrap(),
        ])
        .assert()
        .success();

    // Flip a byte in the archive body.
    let mut bytes = fs::read(&archive).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&archive, &bytes).unwrap();

    upgrader()
        .args([
            "upgrade",
            "--input",
            archive.to_str().unwrap(),
            "--output",
            deployed.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("archive corrupt"));

    // The deployment is untouched.
    assert_eq!(fs::read(deployed.join("app.bin")).unwrap(), vec![1u8; 4096]);
}

#[test]
fn create_and_apply_patch_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("app.v1");
    let new = temp.path().join("app.v2");
    let patch = temp.path().join("app.patch");
    let rebuilt = temp.path().join("app.rebuilt");

    let mut old_data = vec![0x42u8; 32768];
    fs::write(&old, &old_data).unwrap();
    old_data[5000..5100].fill(0x99);
    fs::write(&new, &old_data).unwrap();

    upgrader()
        .args([
            "create-patch",
            old.to_str().unwrap(),
            new.to_str().unwrap(),
            patch.to_str().unwrap(),
            "--block-size",
            "4",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Patch file created"));

    upgrader()
        .args([
            "apply-patch",
            old.to_str().unwrap(),
            patch.to_str().unwrap(),
            rebuilt.to_str().unwrap(),
        ])
        .assert()
        .success();

    assert_eq!(fs::read(&rebuilt).unwrap(), fs::read(&new).unwrap());
}

#[test]
fn apply_patch_rejects_wrong_block_size_and_existing_output() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("a");
    let new = temp.path().join("b");
    let patch = temp.path().join("p");

    fs::write(&old, b"the original contents of the file").unwrap();
    fs::write(&new, b"the updated contents of the file!").unwrap();

    upgrader()
        .args([
            "create-patch",
            old.to_str().unwrap(),
            new.to_str().unwrap(),
            patch.to_str().unwrap(),
            "--block-size",
            "8",
        ])
        .assert()
        .success();

    // Wrong block size is rejected against the recorded one.
    upgrader()
        .args([
            "apply-patch",
            old.to_str().unwrap(),
            patch.to_str().unwrap(),
            temp.path().join("out").to_str().unwrap(),
            "--block-size",
            "16",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("8 KiB blocks"));

    // Existing outputs are never overwritten.
    let existing = temp.path().join("existing");
    fs::write(&existing, b"precious").unwrap();
    upgrader()
        .args([
            "apply-patch",
            old.to_str().unwrap(),
            patch.to_str().unwrap(),
            existing.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(fs::read(&existing).unwrap(), b"precious");
}

#[test]
fn create_patch_rejects_out_of_range_block_size() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("a");
    let new = temp.path().join("b");
    fs::write(&old, b"one").unwrap();
    fs::write(&new, b"two").unwrap();

    upgrader()
        .args([
            "create-patch",
            old.to_str().unwrap(),
            new.to_str().unwrap(),
            temp.path().join("p").to_str().unwrap(),
            "--block-size",
            "32768",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("block size"));
}

#[test]
fn compress_and_decompress_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let src = temp.path().join("tree");
    create_dir_tree(
        &src,
        &[("top.txt", b"top"), ("nested/deep/file.bin", &[7u8; 512])],
    );

    let archive = temp.path().join("bundle.tar.gz");
    upgrader()
        .args([
            "compress",
            archive.to_str().unwrap(),
            src.to_str().unwrap(),
        ])
        .assert()
        .success();

    let out = temp.path().join("out");
    upgrader()
        .args([
            "decompress",
            archive.to_str().unwrap(),
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    assert_eq!(fs::read(out.join("tree/top.txt")).unwrap(), b"top");
    assert_eq!(
        fs::read(out.join("tree/nested/deep/file.bin")).unwrap(),
        vec![7u8; 512]
    );
}
