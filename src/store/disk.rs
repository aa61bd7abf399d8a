//! On-disk block storage.
//!
//! Blocks live at `{root}/data/{addr[:3]}/{addr[3:]}` so each 3-nibble
//! shard stays a manageable directory. Every write goes through a
//! tempfile in the destination directory followed by an atomic rename, so
//! readers see a whole block or nothing. A per-store mutex serializes the
//! tempfile-and-rename step; reads do not take it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{LibernetError, Result};
use crate::hash::{match_score, Identifier, IDENTIFIER_SIZE};
use crate::store::{writable_address, BlockStore, MAX_LIKE};
use crate::url;

/// Hex characters of the address used as the shard directory name.
const GROUP_NIBBLES: usize = 3;

/// Suffix of the per-target neighbor cache files in each shard.
const LIKE_EXTENSION: &str = ".like.json";

#[derive(Clone, Debug)]
pub struct DiskConfig {
    pub root: PathBuf,
    pub max_like: usize,
}

impl DiskConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskConfig {
            root: root.into(),
            max_like: MAX_LIKE,
        }
    }
}

/// Block storage rooted at a local directory.
pub struct DiskStore {
    data_dir: PathBuf,
    max_like: usize,
    write_lock: Mutex<()>,
}

impl DiskStore {
    pub fn new(config: DiskConfig) -> Self {
        DiskStore {
            data_dir: config.root.join("data"),
            max_like: config.max_like,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open(root: impl Into<PathBuf>) -> Self {
        DiskStore::new(DiskConfig::new(root))
    }

    fn shard_dir(&self, identifier: &Identifier) -> PathBuf {
        let hex = identifier.to_hex();
        self.data_dir.join(&hex[..GROUP_NIBBLES])
    }

    fn block_path(&self, identifier: &Identifier) -> PathBuf {
        let hex = identifier.to_hex();
        self.shard_dir(identifier).join(&hex[GROUP_NIBBLES..])
    }

    fn like_path(&self, identifier: &Identifier) -> PathBuf {
        let hex = identifier.to_hex();
        self.shard_dir(identifier)
            .join(format!("{}{}", &hex[GROUP_NIBBLES..], LIKE_EXTENSION))
    }

    /// Write bytes to `path` through a sibling tempfile and atomic rename.
    fn safe_save(&self, path: &Path, data: &[u8]) -> Result<()> {
        let directory = path
            .parent()
            .ok_or_else(|| LibernetError::Invariant(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(directory).map_err(|e| LibernetError::io(e, directory))?;

        let _guard = self.write_lock.lock().expect("disk store lock poisoned");
        let mut temp =
            NamedTempFile::new_in(directory).map_err(|e| LibernetError::io(e, directory))?;
        temp.write_all(data)
            .map_err(|e| LibernetError::io(e, temp.path()))?;
        temp.persist(path)
            .map_err(|e| LibernetError::io(e.error, path))?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(LibernetError::io(error, path)),
        }
    }

    fn load_like_cache(&self, identifier: &Identifier) -> BTreeMap<String, u64> {
        let Ok(Some(raw)) = Self::read_file(&self.like_path(identifier)) else {
            return BTreeMap::new();
        };

        serde_json::from_slice(&raw).unwrap_or_default()
    }

    /// Every block in the target's shard directory, as `url -> size`.
    fn scan_shard(&self, identifier: &Identifier) -> BTreeMap<String, u64> {
        let shard = self.shard_dir(identifier);
        let prefix = &identifier.to_hex()[..GROUP_NIBBLES];
        let Ok(entries) = fs::read_dir(&shard) else {
            return BTreeMap::new();
        };

        let mut found = BTreeMap::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.len() != IDENTIFIER_SIZE - GROUP_NIBBLES {
                continue;
            }

            let Ok(candidate) = format!("{prefix}{name}").parse::<Identifier>() else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            found.insert(url::for_data_block(&candidate, false), metadata.len());
        }

        found
    }

    /// `like` with extra seed entries merged in before ranking.
    pub fn like_with_seed(
        &self,
        block_url: &str,
        initial: &BTreeMap<String, u64>,
    ) -> Result<BTreeMap<String, u64>> {
        let target = url::parse(block_url)?.address;

        let mut merged = initial.clone();
        merged.extend(self.load_like_cache(&target));
        merged.extend(self.scan_shard(&target));

        let mut ranked: Vec<(String, u64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| {
            let score_a = url::parse(&a.0).map(|p| match_score(&p.address, &target));
            let score_b = url::parse(&b.0).map(|p| match_score(&p.address, &target));
            score_b
                .unwrap_or(0)
                .cmp(&score_a.unwrap_or(0))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(self.max_like);

        let kept: BTreeMap<String, u64> = ranked.into_iter().collect();
        self.safe_save(&self.like_path(&target), &serde_json::to_vec(&kept)?)?;
        Ok(kept)
    }
}

impl BlockStore for DiskStore {
    fn put(&self, block_url: &str, data: &[u8]) -> Result<()> {
        let address = writable_address(block_url)?;
        let identifier = url::parse(&address)?.address;
        // always overwrite: a previous copy may be corrupt
        self.safe_save(&self.block_path(&identifier), data)
    }

    fn get(&self, block_url: &str) -> Result<Option<Vec<u8>>> {
        let identifier = url::parse(block_url)?.address;
        Self::read_file(&self.block_path(&identifier))
    }

    fn contains(&self, block_url: &str) -> Result<bool> {
        let identifier = url::parse(block_url)?.address;
        Ok(self.block_path(&identifier).is_file())
    }

    fn like(&self, block_url: &str) -> Result<BTreeMap<String, u64>> {
        self.like_with_seed(block_url, &BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Identifier;

    fn data_url(payload: &[u8]) -> String {
        url::for_data_block(&Identifier::of(payload), false)
    }

    #[test]
    fn put_get_contains_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let store = DiskStore::open(root.path());
        let address = data_url(b"block bytes");

        assert!(!store.contains(&address).unwrap());
        assert!(store.get(&address).unwrap().is_none());

        store.put(&address, b"block bytes").unwrap();
        assert!(store.contains(&address).unwrap());
        assert_eq!(
            store.get(&address).unwrap().as_deref(),
            Some(&b"block bytes"[..])
        );

        // idempotent overwrite
        store.put(&address, b"block bytes").unwrap();
        assert_eq!(
            store.get(&address).unwrap().as_deref(),
            Some(&b"block bytes"[..])
        );
    }

    #[test]
    fn blocks_land_in_three_nibble_shards() {
        let root = tempfile::tempdir().unwrap();
        let store = DiskStore::open(root.path());
        let identifier = Identifier::of(b"sharded");
        store
            .put(&url::for_data_block(&identifier, false), b"sharded")
            .unwrap();

        let hex = identifier.to_hex();
        let expected = root.path().join("data").join(&hex[..3]).join(&hex[3..]);
        assert!(expected.is_file());
    }

    #[test]
    fn like_returns_shard_neighbors_and_persists_cache() {
        let root = tempfile::tempdir().unwrap();
        let store = DiskStore::open(root.path());
        let target = Identifier::of(b"like target");

        // a neighbor in the same shard: forge one by reusing the prefix
        let mut neighbor_bytes = *target.as_bytes();
        neighbor_bytes[31] ^= 0x01;
        let neighbor = Identifier::from_bytes(neighbor_bytes);
        store
            .put(&url::for_data_block(&neighbor, false), b"neighbor")
            .unwrap();

        let likes = store
            .like(&url::for_data_block(&target, true))
            .unwrap();
        let neighbor_url = url::for_data_block(&neighbor, false);
        assert_eq!(likes.get(&neighbor_url), Some(&(b"neighbor".len() as u64)));

        // cache sidecar written next to the shard
        let hex = target.to_hex();
        let sidecar = root
            .path()
            .join("data")
            .join(&hex[..3])
            .join(format!("{}.like.json", &hex[3..]));
        assert!(sidecar.is_file());

        // seeds merge in and survive ranking
        let mut seed = BTreeMap::new();
        seed.insert(url::for_data_block(&target, false), 17u64);
        let likes = store
            .like_with_seed(&url::for_data_block(&target, true), &seed)
            .unwrap();
        assert_eq!(likes.get(&url::for_data_block(&target, false)), Some(&17));
        assert!(likes.contains_key(&neighbor_url));
    }

    #[test]
    fn like_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let store = DiskStore::new(DiskConfig {
            root: root.path().to_path_buf(),
            max_like: 5,
        });
        let target = Identifier::of(b"bounded");

        for index in 0u8..20 {
            let mut bytes = *target.as_bytes();
            bytes[30] = index; // same shard, diverging tails
            let forged = Identifier::from_bytes(bytes);
            store
                .put(&url::for_data_block(&forged, false), b"x")
                .unwrap();
        }

        let likes = store.like(&url::for_data_block(&target, true)).unwrap();
        assert!(likes.len() <= 5, "{} entries", likes.len());
    }

    #[test]
    fn like_urls_cannot_be_written() {
        let root = tempfile::tempdir().unwrap();
        let store = DiskStore::open(root.path());
        let like = url::for_data_block(&Identifier::of(b"x"), true);
        assert!(store.put(&like, b"x").is_err());
    }
}
