//! Block storage backends.
//!
//! Everything that can hold blocks implements [`BlockStore`]: the local
//! disk tree, the HTTP proxy to a peer, and an in-memory map for tests.
//! Stores key strictly on the block address; any key suffix on a URL is
//! codec metadata they ignore.

pub mod disk;
pub mod proxy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{LibernetError, Result};
use crate::hash::match_score;
use crate::url::{self, UrlKind};

pub use disk::{DiskConfig, DiskStore};
pub use proxy::ProxyStore;

/// Most entries a `like` query will return.
pub const MAX_LIKE: usize = 100;

/// Capability interface over a block store.
pub trait BlockStore: Send + Sync {
    /// Store bytes under the address named by `block_url`. Like-kind URLs
    /// are rejected. Overwrites are permitted: an existing copy may be
    /// corrupt.
    fn put(&self, block_url: &str, data: &[u8]) -> Result<()>;

    /// Fetch raw bytes, `None` when absent. No decoding happens here.
    fn get(&self, block_url: &str) -> Result<Option<Vec<u8>>>;

    fn contains(&self, block_url: &str) -> Result<bool>;

    /// Identifiers known to this store that best share a digest prefix
    /// with the target named by `block_url` (data- or like-kind). Returns
    /// a map of data URLs to stored sizes, at most [`MAX_LIKE`] entries.
    fn like(&self, block_url: &str) -> Result<BTreeMap<String, u64>>;

    /// Stop accepting writes. Idempotent; may return before queued writes
    /// have flushed.
    fn shutdown(&self) {}

    /// Block until all queued writes are flushed and workers have exited.
    fn join(&self) {}
}

/// Reject writes through like-kind URLs and reduce to the address form.
pub(crate) fn writable_address(block_url: &str) -> Result<String> {
    let parsed = url::parse(block_url)?;

    if parsed.kind == UrlKind::Like {
        return Err(LibernetError::InvalidUrl(block_url.to_string()));
    }

    Ok(url::for_data_block(&parsed.address, false))
}

/// In-memory store for tests and scratch work.
#[derive(Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.blocks.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every block into another store. Used to merge histories.
    pub fn copy_into(&self, other: &dyn BlockStore) -> Result<()> {
        let blocks = self.blocks.lock().expect("memory store poisoned").clone();

        for (address, data) in blocks {
            other.put(&address, &data)?;
        }

        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn put(&self, block_url: &str, data: &[u8]) -> Result<()> {
        let address = writable_address(block_url)?;
        self.blocks
            .lock()
            .expect("memory store poisoned")
            .insert(address, data.to_vec());
        Ok(())
    }

    fn get(&self, block_url: &str) -> Result<Option<Vec<u8>>> {
        let address = url::address_of(block_url)?;
        Ok(self
            .blocks
            .lock()
            .expect("memory store poisoned")
            .get(&address)
            .cloned())
    }

    fn contains(&self, block_url: &str) -> Result<bool> {
        let address = url::address_of(block_url)?;
        Ok(self
            .blocks
            .lock()
            .expect("memory store poisoned")
            .contains_key(&address))
    }

    fn like(&self, block_url: &str) -> Result<BTreeMap<String, u64>> {
        let target = url::parse(block_url)?.address;
        let blocks = self.blocks.lock().expect("memory store poisoned");
        let mut scored: Vec<(u32, String, u64)> = blocks
            .iter()
            .filter_map(|(address, data)| {
                let parsed = url::parse(address).ok()?;
                Some((
                    match_score(&parsed.address, &target),
                    address.clone(),
                    data.len() as u64,
                ))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(MAX_LIKE)
            .map(|(_, address, size)| (address, size))
            .collect())
    }
}
