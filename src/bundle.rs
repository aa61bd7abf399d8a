//! Directory snapshots as bundles.
//!
//! A bundle is a compact JSON document describing a directory tree: file
//! entries pointing at encrypted content blocks, empty or symlinked
//! directories, and overflow sub-bundles when the description itself will
//! not fit in one block. Bundles are immutable; a new snapshot is a new
//! bundle that reuses the content blocks of unchanged files.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::block::{self, CodecConfig, Encryption, DEFAULT_MATCH, MAX_BLOCK_SIZE};
use crate::error::{LibernetError, Result};
use crate::message::{Center, Progress};
use crate::store::BlockStore;
use crate::timestamp;
use crate::url;

/// Bundles must serialize to at most this many bytes.
pub const MAX_BUNDLE_SIZE: usize = MAX_BLOCK_SIZE;

/// Two modification times within this many seconds are the same file
/// version.
pub const MODIFIED_TOLERANCE: f64 = 0.0001;

/// AES-CBC pads ciphertext up to one cipher block past the plaintext, so
/// content chunks are read this much short of the block limit.
const CIPHER_PADDING_HEADROOM: usize = 16;

/// One stored block of a file's contents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContentBlock {
    pub url: String,
    pub size: u64,
}

/// A single file in a bundle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    /// Blocks whose concatenation is the file body. Empty for symlinks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<bool>,
    /// Symlink target; present for links, which carry no contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// 2001-epoch seconds.
    pub modified: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    pub size: u64,
}

/// A directory snapshot.
///
/// Unknown fields ride along untouched in `extra` so foreign bundles
/// survive a rewrite.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Bundle {
    /// URLs of sub-bundles holding overflow `files` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<String>,
    /// Empty or symlinked directories: `None` is a plain empty directory,
    /// `Some(target)` a directory symlink.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub directories: BTreeMap<String, Option<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileEntry>,
    /// Root file served when the bundle is addressed without a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// 2001-epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Knobs for bundle creation.
#[derive(Clone, Debug)]
pub struct BundleOptions {
    pub codec: CodecConfig,
    pub max_bundle_size: usize,
    /// How the bundle JSON blocks themselves are stored. Content blocks
    /// are always content-key encrypted.
    pub encrypt: Encryption,
    pub workers: usize,
    pub index: Option<String>,
    /// Caller fields merged into the bundle (passed through on inflate).
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        BundleOptions {
            codec: CodecConfig::default(),
            max_bundle_size: MAX_BUNDLE_SIZE,
            encrypt: Encryption::ContentKey,
            workers: 2,
            index: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Compact, sorted-key serialization. This exact form is what gets stored
/// and measured against the size limit.
pub fn serialize_bundle(bundle: &Bundle) -> Result<String> {
    // through a Value so every map, flattened or not, lands sorted
    let value = serde_json::to_value(bundle)?;
    Ok(serde_json::to_string(&value)?)
}

fn relative_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|part| match part {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

#[cfg(unix)]
fn mode_flags(metadata: &fs::Metadata) -> (Option<bool>, Option<bool>) {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode();
    let readonly = (mode & 0o200) == 0;
    let executable = (mode & 0o100) != 0;
    (readonly.then_some(true), executable.then_some(true))
}

#[cfg(not(unix))]
fn mode_flags(metadata: &fs::Metadata) -> (Option<bool>, Option<bool>) {
    let readonly = metadata.permissions().readonly();
    (readonly.then_some(true), None)
}

struct WalkResult {
    files: Vec<String>,
    directories: BTreeMap<String, Option<String>>,
}

/// Find every file (including file symlinks) and every empty-or-link
/// directory beneath `source`.
fn walk_source(source: &Path) -> Result<WalkResult> {
    let mut files = Vec::new();
    let mut all_dirs = Vec::new();
    let mut dir_links = BTreeMap::new();

    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            LibernetError::io(
                e.io_error()
                    .map(|io| std::io::Error::new(io.kind(), io.to_string()))
                    .unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "walk failure")
                    }),
                source,
            )
        })?;
        let relative = relative_string(
            entry
                .path()
                .strip_prefix(source)
                .unwrap_or_else(|_| entry.path()),
        );

        if entry.file_type().is_dir() {
            all_dirs.push(relative);
        } else if entry.file_type().is_symlink() {
            // a symlink to a directory is recorded as a linked directory;
            // anything else (file target or broken) is a file entry
            let target_is_dir = fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);

            if target_is_dir {
                let target = fs::read_link(entry.path())
                    .map_err(|e| LibernetError::io(e, entry.path()))?;
                dir_links.insert(relative, Some(target.to_string_lossy().into_owned()));
            } else {
                files.push(relative);
            }
        } else {
            files.push(relative);
        }
    }

    let mut directories = dir_links;

    for dir in all_dirs {
        let prefix = format!("{dir}/");
        let has_entries = files.iter().any(|f| f.starts_with(&prefix))
            || directories.keys().any(|d| d.starts_with(&prefix));

        if !has_entries {
            directories.entry(dir).or_insert(None);
        }
    }

    files.sort();
    Ok(WalkResult { files, directories })
}

/// Build the entry for one file, storing its content blocks unless the
/// previous bundle already has a matching version.
fn process_file(
    source: &Path,
    relative: &str,
    previous: Option<&BTreeMap<String, FileEntry>>,
    store: &dyn BlockStore,
    options: &BundleOptions,
    messages: Option<&Center<Progress>>,
) -> Result<FileEntry> {
    let full = source.join(relative);
    let symlink_metadata =
        fs::symlink_metadata(&full).map_err(|e| LibernetError::io(e, &full))?;
    let is_link = symlink_metadata.file_type().is_symlink();

    let stat = if is_link {
        fs::metadata(&full).unwrap_or_else(|_| symlink_metadata.clone())
    } else {
        symlink_metadata.clone()
    };
    let size = stat.len();
    let modified = stat
        .modified()
        .map(timestamp::from_system_time)
        .map_err(|e| LibernetError::io(e, &full))?;

    if let Some(previous_entry) = previous.and_then(|files| files.get(relative)) {
        let same_size = previous_entry.size == size;
        let same_time = (previous_entry.modified - modified).abs() < MODIFIED_TOLERANCE;

        if same_size && same_time {
            return Ok(previous_entry.clone());
        }
    }

    if is_link {
        let target = fs::read_link(&full).map_err(|e| LibernetError::io(e, &full))?;
        return Ok(FileEntry {
            contents: Vec::new(),
            executable: None,
            link: Some(target.to_string_lossy().into_owned()),
            modified,
            readonly: None,
            size,
        });
    }

    let (readonly, executable) = mode_flags(&symlink_metadata);

    if let Some(center) = messages {
        let _ = center.send(Progress::File(relative.to_string()));
    }

    let chunk_size = options
        .codec
        .max_block_size
        .saturating_sub(CIPHER_PADDING_HEADROOM)
        .max(1);
    let mut contents = Vec::new();
    let mut file = fs::File::open(&full).map_err(|e| LibernetError::io(e, &full))?;
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let mut filled = 0;

        while filled < chunk_size {
            let count = file
                .read(&mut chunk[filled..])
                .map_err(|e| LibernetError::io(e, &full))?;

            if count == 0 {
                break;
            }

            filled += count;
        }

        if filled == 0 {
            break;
        }

        let (block_url, _) = block::store_with(
            &options.codec,
            &chunk[..filled],
            store,
            &Encryption::ContentKey,
            None,
            DEFAULT_MATCH,
        )?;
        contents.push(ContentBlock {
            url: block_url,
            size: filled as u64,
        });

        if let Some(center) = messages {
            let _ = center.send(Progress::Data(filled as u64));
        }

        if filled < chunk_size {
            break;
        }
    }

    Ok(FileEntry {
        contents,
        executable,
        link: None,
        modified,
        readonly,
        size,
    })
}

/// Store every file's blocks through a small worker pool and collect the
/// resulting entries. Completion order does not matter; entries key on
/// their relative path.
fn store_all_files(
    source: &Path,
    files: &[String],
    previous: Option<&BTreeMap<String, FileEntry>>,
    store: &dyn BlockStore,
    options: &BundleOptions,
    messages: Option<&Center<Progress>>,
) -> Result<BTreeMap<String, FileEntry>> {
    let workers = options.workers.max(1);
    let (task_sender, task_receiver) = crossbeam_channel::unbounded::<String>();
    let (entry_sender, entry_receiver) =
        crossbeam_channel::unbounded::<Result<(String, FileEntry)>>();

    for relative in files {
        let _ = task_sender.send(relative.clone());
    }
    drop(task_sender);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let task_receiver = task_receiver.clone();
            let entry_sender = entry_sender.clone();

            scope.spawn(move || {
                while let Ok(relative) = task_receiver.recv() {
                    let entry = process_file(source, &relative, previous, store, options, messages)
                        .map(|entry| (relative, entry));
                    let _ = entry_sender.send(entry);
                }
            });
        }

        drop(entry_sender);
        let mut entries = BTreeMap::new();

        for result in entry_receiver {
            let (relative, entry) = result?;
            entries.insert(relative, entry);
        }

        Ok(entries)
    })
}

fn entry_cost(relative: &str, entry: &FileEntry) -> Result<usize> {
    let mut lone = BTreeMap::new();
    lone.insert(relative.to_string(), entry.clone());
    // the entry's share of a files map: its serialization plus a comma
    Ok(serde_json::to_string(&serde_json::to_value(&lone)?)?.len() - 2 + 1)
}

/// Split an oversized bundle into a main bundle plus sub-bundles, every
/// one of which serializes within the limit.
///
/// Files are assigned by descending block count so the entries most worth
/// keeping close to the root land in the main bundle, then the remainder
/// packs greedily into sub-bundles.
fn split_bundle(
    mut bundle: Bundle,
    store: &dyn BlockStore,
    options: &BundleOptions,
) -> Result<String> {
    let quoted_url_length = match &options.encrypt {
        Encryption::None => "/sha256/".len() + 64,
        Encryption::ContentKey => "/sha256/".len() + 64 + "/aes256/".len() + 64,
        Encryption::Passphrase(_) => "/sha256/".len() + 64 + "/passphrase/".len() + 64,
    } + 3;

    let mut ordered: Vec<(String, FileEntry)> = std::mem::take(&mut bundle.files)
        .into_iter()
        .collect();
    ordered.sort_by(|a, b| {
        b.1.contents
            .len()
            .cmp(&a.1.contents.len())
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut costs = Vec::with_capacity(ordered.len());
    let mut total_cost = 0usize;

    for (relative, entry) in &ordered {
        let cost = entry_cost(relative, entry)?;
        costs.push(cost);
        total_cost += cost;
    }

    let sub_overhead = r#"{"files":{}}"#.len();
    let sub_capacity = options.max_bundle_size.saturating_sub(sub_overhead).max(1);
    let expected_subs = total_cost.div_ceil(sub_capacity);
    let skeleton_size = serialize_bundle(&bundle)?.len();
    let budget = options
        .max_bundle_size
        .saturating_sub(skeleton_size + expected_subs * quoted_url_length);

    // fill the main bundle until the next entry would overflow the budget
    let mut remainder = VecDeque::new();
    let mut used = 0usize;
    let mut filling = true;

    for ((relative, entry), cost) in ordered.into_iter().zip(costs) {
        if filling && used + cost <= budget {
            used += cost;
            bundle.files.insert(relative, entry);
        } else {
            filling = false;
            remainder.push_back((relative, entry, cost));
        }
    }

    // pack the remainder greedily into sub-bundles of the same ordering
    while !remainder.is_empty() {
        let mut sub = Bundle::default();
        let mut sub_used = 0usize;

        while let Some((_, _, cost)) = remainder.front() {
            if !sub.files.is_empty() && sub_used + cost > sub_capacity {
                break;
            }

            sub_used += cost;
            let (relative, entry, _) = remainder.pop_front().expect("front was present");
            sub.files.insert(relative, entry);
        }

        // trim in the unlikely case the estimate undershot
        let mut serialized = serialize_bundle(&sub)?;

        while serialized.len() > options.max_bundle_size {
            let Some((relative, entry)) = sub.files.pop_last() else {
                return Err(LibernetError::Invariant(
                    "file entry too large for any bundle".to_string(),
                ));
            };
            let cost = entry_cost(&relative, &entry)?;
            remainder.push_front((relative, entry, cost));
            serialized = serialize_bundle(&sub)?;
        }

        let (sub_url, _) = block::store_with(
            &options.codec,
            serialized.as_bytes(),
            store,
            &options.encrypt,
            None,
            DEFAULT_MATCH,
        )?;
        bundle.bundles.push(sub_url);
    }

    // the main bundle must fit alongside its sub-bundle list; spill
    // entries into one more sub-bundle until it does
    loop {
        let serialized = serialize_bundle(&bundle)?;

        if serialized.len() <= options.max_bundle_size {
            let (main_url, _) = block::store_with(
                &options.codec,
                serialized.as_bytes(),
                store,
                &options.encrypt,
                None,
                DEFAULT_MATCH,
            )?;
            return Ok(main_url);
        }

        let mut spill = Bundle::default();
        let mut spilled = 0usize;

        while spilled < sub_capacity / 2 {
            let Some((relative, entry)) = bundle.files.pop_last() else {
                break;
            };
            spilled += entry_cost(&relative, &entry)?;
            spill.files.insert(relative, entry);
        }

        if spill.files.is_empty() {
            return Err(LibernetError::Invariant(
                "bundle cannot be reduced below the size limit".to_string(),
            ));
        }

        let spill_serialized = serialize_bundle(&spill)?;
        let (spill_url, _) = block::store_with(
            &options.codec,
            spill_serialized.as_bytes(),
            store,
            &options.encrypt,
            None,
            DEFAULT_MATCH,
        )?;
        bundle.bundles.push(spill_url);
    }
}

/// Create a bundle from the contents of a directory and return its URL.
///
/// `previous` speeds up encoding: files whose size and modification time
/// match the previous bundle reuse its content blocks without rereading.
pub fn create(
    source: &Path,
    store: &dyn BlockStore,
    previous: Option<&Bundle>,
    messages: Option<&Center<Progress>>,
    options: &BundleOptions,
) -> Result<String> {
    let walked = walk_source(source)?;
    let previous_files = previous.map(|bundle| &bundle.files);
    let files = store_all_files(
        source,
        &walked.files,
        previous_files,
        store,
        options,
        messages,
    )?;

    if let Some(index) = &options.index {
        if index.contains('/') {
            return Err(LibernetError::Invariant(format!(
                "index must be a file in the root: {index}"
            )));
        }

        if !files.contains_key(index) {
            return Err(LibernetError::Invariant(format!(
                "requested index '{index}' is not in the bundle"
            )));
        }
    }

    let extra: BTreeMap<String, serde_json::Value> = options
        .extra
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let bundle = Bundle {
        bundles: Vec::new(),
        directories: walked.directories,
        files,
        index: options.index.clone(),
        timestamp: Some(timestamp::now()),
        extra,
    };

    let serialized = serialize_bundle(&bundle)?;

    if serialized.len() <= options.max_bundle_size {
        let (bundle_url, _) = block::store_with(
            &options.codec,
            serialized.as_bytes(),
            store,
            &options.encrypt,
            None,
            DEFAULT_MATCH,
        )?;
        return Ok(bundle_url);
    }

    split_bundle(bundle, store, options)
}

/// Fetch a bundle and merge in every reachable sub-bundle.
///
/// Sub-bundles that cannot be fetched stay listed in `bundles`, so a
/// partial result still names what it is missing. A missing root block
/// yields `None`.
pub fn inflate(bundle_url: &str, store: &dyn BlockStore) -> Result<Option<Bundle>> {
    let Some(raw) = block::fetch(bundle_url, store, false, None)? else {
        return Ok(None);
    };

    let mut bundle: Bundle = serde_json::from_slice(&raw)?;
    let mut queue: VecDeque<String> = std::mem::take(&mut bundle.bundles).into();
    let mut unreachable = Vec::new();

    while let Some(sub_url) = queue.pop_front() {
        match block::fetch(&sub_url, store, false, None)? {
            Some(raw) => {
                let sub: Bundle = serde_json::from_slice(&raw)?;
                bundle.files.extend(sub.files);
                queue.extend(sub.bundles);
            }
            None => unreachable.push(sub_url),
        }
    }

    bundle.bundles = unreachable;
    Ok(Some(bundle))
}

/// Addresses of every block still needed to fully materialize `bundle`.
pub fn missing_blocks(bundle: &Bundle, store: &dyn BlockStore) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    let mut seen = BTreeSet::new();

    for sub_url in &bundle.bundles {
        let address = url::address_of(sub_url)?;

        if seen.insert(address.clone()) {
            missing.push(address);
        }
    }

    for entry in bundle.files.values() {
        for content in &entry.contents {
            let address = url::address_of(&content.url)?;

            if seen.contains(&address) {
                continue;
            }

            if !store.contains(&content.url)? {
                seen.insert(address.clone());
                missing.push(address);
            }
        }
    }

    Ok(missing)
}

/// Directories implied by the bundle: every listed directory plus every
/// ancestor of a file or directory entry.
fn expected_directories(bundle: &Bundle) -> BTreeSet<String> {
    let mut expected = BTreeSet::new();

    for path in bundle.files.keys().chain(bundle.directories.keys()) {
        let mut ancestor = String::new();

        for part in path.split('/') {
            if !ancestor.is_empty() {
                expected.insert(ancestor.clone());
                ancestor.push('/');
            }

            ancestor.push_str(part);
        }
    }

    expected.extend(bundle.directories.keys().cloned());
    expected
}

/// Delete everything under `target` that the bundle does not describe.
/// Deepest entries go first so emptied directories can be removed.
fn prune_target(bundle: &Bundle, target: &Path) -> Result<()> {
    let expected_dirs = expected_directories(bundle);
    let mut entries: Vec<(String, bool)> = Vec::new();

    for entry in WalkDir::new(target).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let relative = relative_string(
            entry
                .path()
                .strip_prefix(target)
                .unwrap_or_else(|_| entry.path()),
        );
        let is_dir = entry.file_type().is_dir();
        entries.push((relative, is_dir));
    }

    entries.sort_by(|a, b| {
        let depth_a = a.0.matches('/').count();
        let depth_b = b.0.matches('/').count();
        depth_b.cmp(&depth_a).then_with(|| b.0.cmp(&a.0))
    });

    for (relative, is_dir) in entries {
        let path = target.join(&relative);

        if is_dir {
            if !expected_dirs.contains(&relative) {
                fs::remove_dir_all(&path).map_err(|e| LibernetError::io(e, &path))?;
            }
        } else {
            // files and symlinks; directory symlinks count as directories
            let keep =
                bundle.files.contains_key(&relative) || bundle.directories.contains_key(&relative);

            if !keep && path.symlink_metadata().is_ok() {
                fs::remove_file(&path).map_err(|e| LibernetError::io(e, &path))?;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn make_symlink(link_target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link_target, path)
}

#[cfg(windows)]
fn make_symlink(link_target: &str, path: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link_target, path)
}

fn existing_link_matches(path: &Path, link_target: &str) -> bool {
    fs::read_link(path)
        .map(|current| current.to_string_lossy() == link_target)
        .unwrap_or(false)
}

fn restore_file(
    relative: &str,
    entry: &FileEntry,
    target: &Path,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
) -> Result<()> {
    let destination = target.join(relative);

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| LibernetError::io(e, parent))?;
    }

    if let Some(link_target) = &entry.link {
        if existing_link_matches(&destination, link_target) {
            return Ok(());
        }

        if destination.symlink_metadata().is_ok() {
            fs::remove_file(&destination).map_err(|e| LibernetError::io(e, &destination))?;
        }

        make_symlink(link_target, &destination).map_err(|e| LibernetError::io(e, &destination))?;
        return Ok(());
    }

    if let Ok(metadata) = destination.symlink_metadata() {
        let unchanged = metadata.is_file()
            && metadata.len() == entry.size
            && metadata
                .modified()
                .map(|time| {
                    (timestamp::from_system_time(time) - entry.modified).abs()
                        < MODIFIED_TOLERANCE
                })
                .unwrap_or(false);

        if unchanged {
            return Ok(());
        }

        if metadata.is_dir() {
            fs::remove_dir_all(&destination).map_err(|e| LibernetError::io(e, &destination))?;
        } else {
            fs::remove_file(&destination).map_err(|e| LibernetError::io(e, &destination))?;
        }
    }

    if let Some(center) = messages {
        let _ = center.send(Progress::File(relative.to_string()));
    }

    let mut output = fs::File::create(&destination).map_err(|e| LibernetError::io(e, &destination))?;

    for content in &entry.contents {
        let data = block::fetch(&content.url, store, false, None)?.ok_or_else(|| {
            LibernetError::Invariant(format!("block vanished during restore: {}", content.url))
        })?;

        if data.len() as u64 != content.size {
            return Err(LibernetError::Invariant(format!(
                "block is not the correct size {} != {} for {}",
                data.len(),
                content.size,
                content.url
            )));
        }

        output
            .write_all(&data)
            .map_err(|e| LibernetError::io(e, &destination))?;

        if let Some(center) = messages {
            let _ = center.send(Progress::Data(data.len() as u64));
        }
    }

    drop(output);

    let mtime = filetime::FileTime::from_system_time(timestamp::to_system_time(entry.modified));
    filetime::set_file_mtime(&destination, mtime)
        .map_err(|e| LibernetError::io(e, &destination))?;

    #[cfg(unix)]
    if entry.readonly.unwrap_or(false) || entry.executable.unwrap_or(false) {
        use std::os::unix::fs::PermissionsExt;
        let metadata =
            fs::metadata(&destination).map_err(|e| LibernetError::io(e, &destination))?;
        let mut mode = metadata.permissions().mode();

        if entry.readonly.unwrap_or(false) {
            mode &= !0o200;
        }

        if entry.executable.unwrap_or(false) {
            mode |= 0o100;
        }

        fs::set_permissions(&destination, fs::Permissions::from_mode(mode))
            .map_err(|e| LibernetError::io(e, &destination))?;
    }

    Ok(())
}

fn restore_directory(relative: &str, link: &Option<String>, target: &Path) -> Result<()> {
    let destination = target.join(relative);

    match link {
        None => fs::create_dir_all(&destination).map_err(|e| LibernetError::io(e, &destination)),
        Some(link_target) => {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| LibernetError::io(e, parent))?;
            }

            if existing_link_matches(&destination, link_target) {
                return Ok(());
            }

            if let Ok(metadata) = destination.symlink_metadata() {
                if metadata.is_dir() {
                    fs::remove_dir_all(&destination)
                        .map_err(|e| LibernetError::io(e, &destination))?;
                } else {
                    fs::remove_file(&destination)
                        .map_err(|e| LibernetError::io(e, &destination))?;
                }
            }

            make_symlink(link_target, &destination)
                .map_err(|e| LibernetError::io(e, &destination))
        }
    }
}

/// Materialize an already-inflated bundle into `target`.
///
/// Returns `Some(missing)` without touching the target when any referenced
/// block is unavailable, `None` on success.
pub fn restore_bundle(
    bundle: &Bundle,
    target: &Path,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
) -> Result<Option<Vec<String>>> {
    let missing = missing_blocks(bundle, store)?;

    if !missing.is_empty() {
        return Ok(Some(missing));
    }

    fs::create_dir_all(target).map_err(|e| LibernetError::io(e, target))?;
    prune_target(bundle, target)?;

    for (relative, entry) in &bundle.files {
        restore_file(relative, entry, target, store, messages)?;
    }

    for (relative, link) in &bundle.directories {
        restore_directory(relative, link, target)?;
    }

    Ok(None)
}

/// Fetch, inflate, and materialize a bundle URL into `target`.
pub fn restore(
    bundle_url: &str,
    target: &Path,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
) -> Result<Option<Vec<String>>> {
    match inflate(bundle_url, store)? {
        None => Ok(Some(vec![url::address_of(bundle_url)?])),
        Some(bundle) => restore_bundle(&bundle, target, store, messages),
    }
}

/// Materialize a single entry of an inflated bundle under `target`.
///
/// An empty `relative` resolves through the bundle's `index`. A path that
/// cannot be found while sub-bundles are unreachable reports those
/// sub-bundles as missing rather than declaring the path absent.
pub fn restore_path(
    bundle: &Bundle,
    relative: &str,
    target: &Path,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
) -> Result<Option<Vec<String>>> {
    let relative = if relative.is_empty() {
        bundle.index.as_deref().ok_or_else(|| {
            LibernetError::Invariant("this bundle has no index, but one was requested".to_string())
        })?
    } else {
        relative
    };

    if let Some(entry) = bundle.files.get(relative) {
        let mut missing = Vec::new();

        for content in &entry.contents {
            if !store.contains(&content.url)? {
                missing.push(url::address_of(&content.url)?);
            }
        }

        if !missing.is_empty() {
            return Ok(Some(missing));
        }

        restore_file(relative, entry, target, store, messages)?;
        return Ok(None);
    }

    if let Some(link) = bundle.directories.get(relative) {
        restore_directory(relative, link, target)?;
        return Ok(None);
    }

    if !bundle.bundles.is_empty() {
        // the entry may live in a sub-bundle we could not reach
        let mut unreachable = Vec::new();

        for sub_url in &bundle.bundles {
            unreachable.push(url::address_of(sub_url)?);
        }

        return Ok(Some(unreachable));
    }

    Err(LibernetError::Invariant(format!(
        "'{relative}' is not in the bundle"
    )))
}
