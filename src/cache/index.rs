use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;

use super::entry::CacheEntry;

/// A resident entry plus the byte cost currently charged for it. Entries
/// are charged a provisional 1 byte until their stat resolves the true size.
#[derive(Debug)]
struct Resident {
    entry: Arc<CacheEntry>,
    charged: u64,
}

/// Recency-ordered table of cache entries with aggregate byte-cost
/// accounting. Purely in-memory bookkeeping; the caller owns locking.
#[derive(Debug)]
pub(super) struct CacheIndex {
    lru: LruCache<PathBuf, Resident>,
    bytes_in_use: u64,
    max_bytes: u64,
}

impl CacheIndex {
    pub(super) fn new(capacity: NonZeroUsize, max_bytes: u64) -> Self {
        Self {
            lru: LruCache::new(capacity),
            bytes_in_use: 0,
            max_bytes,
        }
    }

    /// Lookup that refreshes recency.
    pub(super) fn get(&mut self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.lru.get(path).map(|resident| resident.entry.clone())
    }

    /// Inserts a new entry at the given charged cost and returns everything
    /// evicted to restore the byte bound.
    pub(super) fn insert(
        &mut self,
        path: PathBuf,
        entry: Arc<CacheEntry>,
        charged: u64,
    ) -> Vec<Arc<CacheEntry>> {
        let mut evicted = Vec::new();
        self.bytes_in_use = self.bytes_in_use.saturating_add(charged);

        if let Some((_path, removed)) = self.lru.push(path, Resident { entry, charged }) {
            self.bytes_in_use = self.bytes_in_use.saturating_sub(removed.charged);
            evicted.push(removed.entry);
        }

        self.evict_to_fit(&mut evicted);
        evicted
    }

    /// Replaces an entry's provisional cost with its true size once known,
    /// evicting least-recently-used residents if the bound is now exceeded.
    pub(super) fn reprice(&mut self, path: &Path, charged: u64) -> Vec<Arc<CacheEntry>> {
        let mut evicted = Vec::new();
        if let Some(resident) = self.lru.get_mut(path) {
            self.bytes_in_use = self
                .bytes_in_use
                .saturating_sub(resident.charged)
                .saturating_add(charged);
            resident.charged = charged;
        }
        self.evict_to_fit(&mut evicted);
        evicted
    }

    pub(super) fn remove(&mut self, path: &Path) -> Option<Arc<CacheEntry>> {
        let removed = self.lru.pop(path)?;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(removed.charged);
        Some(removed.entry)
    }

    /// Removes the resident entry for `path` only if it is the given
    /// instance; a replacement registered after an eviction is left alone.
    pub(super) fn remove_if_same(&mut self, path: &Path, entry: &Arc<CacheEntry>) {
        let same = self
            .lru
            .peek(path)
            .map(|resident| Arc::ptr_eq(&resident.entry, entry))
            .unwrap_or(false);
        if same {
            self.remove(path);
        }
    }

    fn evict_to_fit(&mut self, evicted: &mut Vec<Arc<CacheEntry>>) {
        while self.bytes_in_use > self.max_bytes {
            match self.lru.pop_lru() {
                Some((_path, removed)) => {
                    self.bytes_in_use = self.bytes_in_use.saturating_sub(removed.charged);
                    evicted.push(removed.entry);
                }
                None => break,
            }
        }
    }

    pub(super) fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }

    #[cfg(test)]
    pub(super) fn contains(&self, path: &Path) -> bool {
        self.lru.contains(path)
    }
}
