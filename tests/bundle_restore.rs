//! Restore fidelity: permissions, symlinks, empty directories, pruning,
//! incremental reuse, and the no-partial-restore guarantee.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use libernet::bundle::{self, Bundle, BundleOptions};
use libernet::store::DiskStore;
use libernet::url;

use tempfile::tempdir;

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) {
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// The fixture from the restore contract: plain, readonly, executable,
/// linked, nested, and empty entries all at once.
fn build_fixture(source: &Path) {
    fs::create_dir(source.join("dir1")).unwrap();
    fs::write(source.join("file1.txt"), b"plain contents").unwrap();
    write_with_mode(&source.join("file2.txt"), b"readonly contents", 0o444);
    write_with_mode(&source.join("file3.txt"), b"executable contents", 0o777);
    std::os::unix::fs::symlink("file1.txt", source.join("link1.txt")).unwrap();
    fs::create_dir_all(source.join("dir3/dir4")).unwrap();
    write_with_mode(&source.join("dir3/dir4/file4.txt"), b"both flags", 0o555);
}

fn comparable(bundle: &Bundle) -> Vec<(String, u64, Vec<String>, Option<bool>, Option<bool>, Option<String>)> {
    bundle
        .files
        .iter()
        .map(|(path, entry)| {
            (
                path.clone(),
                entry.size,
                entry.contents.iter().map(|c| c.url.clone()).collect(),
                entry.readonly,
                entry.executable,
                entry.link.clone(),
            )
        })
        .collect()
}

#[test]
fn restore_preserves_modes_links_and_structure() {
    // 1. Setup
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    build_fixture(source.path());

    // 2. Create, then restore into a fresh directory
    let options = BundleOptions::default();
    let bundle_url = bundle::create(source.path(), &store, None, None, &options).unwrap();
    let original = bundle::inflate(&bundle_url, &store).unwrap().unwrap();

    let restored = tempdir().unwrap();
    let missing = bundle::restore(&bundle_url, restored.path(), &store, None).unwrap();
    assert!(missing.is_none(), "unexpected missing blocks: {missing:?}");

    // 3. Contents and stat bits survive
    assert_eq!(
        fs::read(restored.path().join("file1.txt")).unwrap(),
        b"plain contents"
    );

    let mode2 = fs::metadata(restored.path().join("file2.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode2 & 0o200, 0, "file2 should have lost user write");

    let mode3 = fs::metadata(restored.path().join("file3.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode3 & 0o100, 0, "file3 should be user executable");

    let mode4 = fs::metadata(restored.path().join("dir3/dir4/file4.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode4 & 0o200, 0);
    assert_ne!(mode4 & 0o100, 0);

    let link = fs::read_link(restored.path().join("link1.txt")).unwrap();
    assert_eq!(link.to_string_lossy(), "file1.txt");

    assert!(restored.path().join("dir1").is_dir());

    // 4. A snapshot of the restored tree is equivalent to the original
    let second_url = bundle::create(restored.path(), &store, None, None, &options).unwrap();
    let second = bundle::inflate(&second_url, &store).unwrap().unwrap();
    assert_eq!(comparable(&original), comparable(&second));
    assert_eq!(original.directories, second.directories);
}

#[test]
fn unchanged_files_reuse_previous_blocks() {
    // 1. First snapshot
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("stable.txt"), b"stays the same").unwrap();
    fs::write(source.path().join("volatile.txt"), b"version one").unwrap();

    let options = BundleOptions::default();
    let first_url = bundle::create(source.path(), &store, None, None, &options).unwrap();
    let first = bundle::inflate(&first_url, &store).unwrap().unwrap();

    // 2. Change one file, then snapshot against the previous bundle
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(source.path().join("volatile.txt"), b"version two!").unwrap();

    let second_url = bundle::create(source.path(), &store, Some(&first), None, &options).unwrap();
    let second = bundle::inflate(&second_url, &store).unwrap().unwrap();

    // 3. The untouched file keeps the same block URLs, the changed one
    //    does not
    assert_eq!(
        first.files["stable.txt"].contents,
        second.files["stable.txt"].contents
    );
    assert_ne!(
        first.files["volatile.txt"].contents,
        second.files["volatile.txt"].contents
    );
}

#[test]
fn restore_refuses_to_run_with_missing_blocks() {
    // 1. Snapshot a source
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("keep.txt"), b"x".repeat(100)).unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();

    // 2. Delete the content block out from under it
    let content_url = &bundle.files["keep.txt"].contents[0].url;
    let address = url::parse(content_url).unwrap().address.to_hex();
    fs::remove_file(
        storage
            .path()
            .join("data")
            .join(&address[..3])
            .join(&address[3..]),
    )
    .unwrap();

    // 3. Restore reports the loss and leaves the target alone
    let target = tempdir().unwrap();
    fs::write(target.path().join("innocent.txt"), b"bystander").unwrap();

    let missing = bundle::restore(&bundle_url, target.path(), &store, None)
        .unwrap()
        .expect("restore should report missing blocks");
    assert_eq!(missing.len(), 1);
    assert!(missing[0].contains(&address));

    // nothing was deleted, nothing was created
    assert_eq!(
        fs::read(target.path().join("innocent.txt")).unwrap(),
        b"bystander"
    );
    assert!(!target.path().join("keep.txt").exists());
}

#[test]
fn restore_prunes_entries_outside_the_bundle() {
    // 1. Snapshot a small tree
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("wanted.txt"), b"wanted").unwrap();
    fs::create_dir(source.path().join("kept_dir")).unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();

    // 2. Restore over a target holding strangers
    let target = tempdir().unwrap();
    fs::write(target.path().join("stray.txt"), b"stray").unwrap();
    fs::create_dir_all(target.path().join("stray_dir/deeper")).unwrap();
    fs::write(target.path().join("stray_dir/deeper/junk.txt"), b"junk").unwrap();

    let missing = bundle::restore(&bundle_url, target.path(), &store, None).unwrap();
    assert!(missing.is_none());

    // 3. Only the bundle's entries remain
    assert!(target.path().join("wanted.txt").is_file());
    assert!(target.path().join("kept_dir").is_dir());
    assert!(!target.path().join("stray.txt").exists());
    assert!(!target.path().join("stray_dir").exists());
}

#[test]
fn valid_files_are_left_in_place() {
    // 1. Snapshot, restore once
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("data.txt"), b"stable data").unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let target = tempdir().unwrap();
    bundle::restore(&bundle_url, target.path(), &store, None).unwrap();

    let first_restore = fs::metadata(target.path().join("data.txt")).unwrap();

    // 2. Restoring again finds the file valid by (size, modified) and
    //    does not rewrite it
    std::thread::sleep(std::time::Duration::from_millis(20));
    bundle::restore(&bundle_url, target.path(), &store, None).unwrap();
    let second_restore = fs::metadata(target.path().join("data.txt")).unwrap();

    assert_eq!(
        first_restore.modified().unwrap(),
        second_restore.modified().unwrap()
    );
    assert_eq!(
        fs::read(target.path().join("data.txt")).unwrap(),
        b"stable data"
    );
}

#[test]
fn large_files_split_and_concatenate_back() {
    use libernet::block::CodecConfig;

    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());

    // patterned payload so every block carries distinct bytes
    let mut payload = vec![0u8; 10_000];
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte = (index * 7 % 251) as u8;
    }
    fs::write(source.path().join("big.bin"), &payload).unwrap();

    let options = BundleOptions {
        codec: CodecConfig {
            max_block_size: 4096,
        },
        max_bundle_size: 4096,
        ..BundleOptions::default()
    };

    let bundle_url = bundle::create(source.path(), &store, None, None, &options).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();
    let entry = &bundle.files["big.bin"];
    assert!(entry.contents.len() >= 3, "{} blocks", entry.contents.len());
    assert_eq!(
        entry.contents.iter().map(|c| c.size).sum::<u64>(),
        payload.len() as u64
    );

    let target = tempdir().unwrap();
    let missing = bundle::restore(&bundle_url, target.path(), &store, None).unwrap();
    assert!(missing.is_none());
    assert_eq!(fs::read(target.path().join("big.bin")).unwrap(), payload);
}

#[test]
fn broken_symlinks_survive_the_round_trip() {
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    std::os::unix::fs::symlink("does/not/exist", source.path().join("dangling")).unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();
    assert_eq!(
        bundle.files["dangling"].link.as_deref(),
        Some("does/not/exist")
    );

    let target = tempdir().unwrap();
    bundle::restore(&bundle_url, target.path(), &store, None).unwrap();
    let link = fs::read_link(target.path().join("dangling")).unwrap();
    assert_eq!(link.to_string_lossy(), "does/not/exist");
}

#[test]
fn empty_directory_trees_round_trip() {
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());

    for deep in ["1/2/3", "1/2/4", "1/5/6", "7/8", "9", "A/B/C"] {
        fs::create_dir_all(source.path().join(deep)).unwrap();
    }

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let target = tempdir().unwrap();
    let missing = bundle::restore(&bundle_url, target.path(), &store, None).unwrap();
    assert!(missing.is_none());

    for deep in ["1/2/3", "1/2/4", "1/5/6", "7/8", "9", "A/B/C"] {
        assert!(target.path().join(deep).is_dir(), "missing {deep}");
    }
}

#[test]
fn single_paths_restore_without_their_siblings() {
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("wanted.txt"), b"the one").unwrap();
    fs::write(source.path().join("ignored.txt"), b"the other").unwrap();
    fs::create_dir(source.path().join("empty")).unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();

    let target = tempdir().unwrap();
    let missing =
        bundle::restore_path(&bundle, "wanted.txt", target.path(), &store, None).unwrap();
    assert!(missing.is_none());
    assert_eq!(fs::read(target.path().join("wanted.txt")).unwrap(), b"the one");
    assert!(!target.path().join("ignored.txt").exists());

    // directories restore by path too
    bundle::restore_path(&bundle, "empty", target.path(), &store, None).unwrap();
    assert!(target.path().join("empty").is_dir());

    // unknown paths are an error, not silence
    assert!(bundle::restore_path(&bundle, "nope.txt", target.path(), &store, None).is_err());
}

#[test]
fn empty_path_resolves_through_the_index() {
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());
    fs::write(source.path().join("index.html"), b"<html>home</html>").unwrap();

    let options = BundleOptions {
        index: Some("index.html".to_string()),
        ..BundleOptions::default()
    };
    let bundle_url = bundle::create(source.path(), &store, None, None, &options).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();

    let target = tempdir().unwrap();
    let missing = bundle::restore_path(&bundle, "", target.path(), &store, None).unwrap();
    assert!(missing.is_none());
    assert_eq!(
        fs::read(target.path().join("index.html")).unwrap(),
        b"<html>home</html>"
    );

    // a bundle without an index refuses the empty path
    let plain = bundle::create(
        source.path(),
        &store,
        None,
        None,
        &BundleOptions::default(),
    )
    .unwrap();
    let plain = bundle::inflate(&plain, &store).unwrap().unwrap();
    assert!(bundle::restore_path(&plain, "", target.path(), &store, None).is_err());
}

#[test]
fn directory_symlinks_round_trip() {
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    let store = DiskStore::open(storage.path());

    fs::create_dir(source.path().join("inner")).unwrap();
    fs::write(source.path().join("inner/copy.txt"), b"inside").unwrap();
    std::os::unix::fs::symlink("inner", source.path().join("inner_link")).unwrap();

    let bundle_url =
        bundle::create(source.path(), &store, None, None, &BundleOptions::default()).unwrap();
    let bundle = bundle::inflate(&bundle_url, &store).unwrap().unwrap();
    assert_eq!(
        bundle.directories.get("inner_link"),
        Some(&Some("inner".to_string()))
    );

    let target = tempdir().unwrap();
    bundle::restore(&bundle_url, target.path(), &store, None).unwrap();

    let link = fs::read_link(target.path().join("inner_link")).unwrap();
    assert_eq!(link.to_string_lossy(), "inner");
    assert_eq!(
        fs::read(target.path().join("inner_link/copy.txt")).unwrap(),
        b"inside"
    );
}
