use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::{fs as async_fs, task};
use tracing::{debug, trace, warn};

mod consumer;
mod entry;
mod index;

pub use consumer::{ByteRange, PacingConfig, StreamConsumer, StreamError};
pub use entry::{CacheEntry, FileMeta, FillPhase, FillProgress};

use crate::error::ServeError;
use index::CacheIndex;

/// Cost charged for an entry whose stat has not completed yet. Keeps the
/// eviction accounting sane without blocking insertion on the stat.
const PROVISIONAL_COST: u64 = 1;

/// Chunk size of the producer's sequential disk read.
const FILL_CHUNK_SIZE: usize = 64 * 1024;

/// Bounded in-memory table of file buffers, keyed by path.
///
/// A miss registers its entry before the stat completes, so concurrent
/// misses for the same path collapse onto a single disk read. Eviction only
/// drops the table's reference; consumers already holding an entry keep
/// streaming from it.
#[derive(Clone)]
pub struct AssetCache {
    state: Arc<CacheState>,
}

struct CacheState {
    index: Mutex<CacheIndex>,
}

impl AssetCache {
    pub fn new(max_entries: usize, capacity_bytes: u64) -> Result<Self> {
        let max_entries = NonZeroUsize::new(max_entries)
            .ok_or_else(|| anyhow!("cache max_entries must be greater than zero"))?;
        let index = CacheIndex::new(max_entries, capacity_bytes);
        Ok(Self {
            state: Arc::new(CacheState {
                index: Mutex::new(index),
            }),
        })
    }

    /// Returns the resident entry for `path`, creating and starting to fill
    /// a new one on miss. Hits may return an entry in any fill phase.
    pub fn get_or_create(&self, path: &Path) -> Arc<CacheEntry> {
        let entry = {
            let mut index = self.state.index.lock();
            if let Some(entry) = index.get(path) {
                crate::metrics::record_cache_lookup(true);
                return entry;
            }
            let entry = CacheEntry::new(path.to_path_buf());
            let evicted = index.insert(path.to_path_buf(), entry.clone(), PROVISIONAL_COST);
            crate::metrics::set_resident_bytes(index.bytes_in_use());
            crate::metrics::record_evictions(evicted.len());
            entry
        };
        crate::metrics::record_cache_lookup(false);
        trace!(path = %path.display(), "cache miss, starting fill");
        task::spawn(fill_entry(self.state.clone(), entry.clone()));
        entry
    }

    /// Lookup without creation.
    pub fn get(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.state.index.lock().get(path)
    }

    /// Aggregate charged cost of resident entries.
    pub fn resident_bytes(&self) -> u64 {
        self.state.index.lock().bytes_in_use()
    }
}

impl CacheState {
    /// Replaces an entry's provisional cost with its stat'ed size.
    fn reprice(&self, path: &Path, size: u64) {
        let mut index = self.index.lock();
        let evicted = index.reprice(path, size.max(PROVISIONAL_COST));
        crate::metrics::set_resident_bytes(index.bytes_in_use());
        crate::metrics::record_evictions(evicted.len());
    }

    /// Drops a failed entry so the next request for the path starts fresh.
    /// Only removes the given instance; a replacement registered in the
    /// meantime stays resident.
    fn forget(&self, path: &Path, entry: &Arc<CacheEntry>) {
        let mut index = self.index.lock();
        index.remove_if_same(path, entry);
        crate::metrics::set_resident_bytes(index.bytes_in_use());
    }
}

/// The single producer for one entry: stat, classify, then stream the file
/// into the buffer, publishing progress after every chunk.
async fn fill_entry(state: Arc<CacheState>, entry: Arc<CacheEntry>) {
    let path = entry.path().to_path_buf();

    let meta = match stat_and_classify(&path).await {
        Ok(meta) => meta,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cache open failed");
            entry.fail(err);
            state.forget(&path, &entry);
            return;
        }
    };
    entry.begin_fill(meta);
    // Swap the provisional cost for the real one before the read starts.
    state.reprice(&path, meta.size);

    if let Err(err) = read_into(&entry, &path, meta.size).await {
        debug!(path = %path.display(), error = %err, "cache fill failed");
        entry.fail(err);
        state.forget(&path, &entry);
        return;
    }
    entry.complete();
    trace!(path = %path.display(), size = meta.size, "cache fill complete");
}

async fn stat_and_classify(path: &Path) -> Result<FileMeta, ServeError> {
    let stat = async_fs::metadata(path)
        .await
        .map_err(|_| ServeError::NotFound)?;
    if stat.is_dir() {
        return Err(ServeError::IsDirectory);
    }
    if !stat.is_file() {
        return Err(ServeError::NotAFile);
    }
    Ok(FileMeta {
        size: stat.len(),
        mtime: stat.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    })
}

async fn read_into(entry: &Arc<CacheEntry>, path: &Path, size: u64) -> Result<(), ServeError> {
    let mut file = async_fs::File::open(path)
        .await
        .map_err(|err| ServeError::ReadFailed(err.to_string()))?;
    let mut scratch = vec![0u8; FILL_CHUNK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let got = file
            .read(&mut scratch[..want])
            .await
            .map_err(|err| ServeError::ReadFailed(err.to_string()))?;
        if got == 0 {
            warn!(path = %path.display(), remaining, "file truncated under us");
            return Err(ServeError::ReadFailed("unexpected end of file".into()));
        }
        entry.append(&scratch[..got]);
        remaining -= got as u64;
    }
    Ok(())
}
