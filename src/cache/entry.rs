use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use crate::error::ServeError;

/// Size and modification time captured when the backing file is stat'ed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: SystemTime,
}

/// Producer-side lifecycle of an entry's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillPhase {
    /// Stat not yet complete; size and mtime unknown.
    Opening,
    /// Buffer allocated, disk read in progress.
    Filling,
    /// Every byte of the file is resident.
    Complete,
    /// Terminal fault; the entry will never hold more data.
    Failed(ServeError),
}

/// Snapshot published to consumers after every producer step.
///
/// `written` only ever grows, and bytes below it are immutable once
/// published, so a consumer may copy any prefix range it has observed
/// without further coordination.
#[derive(Debug, Clone)]
pub struct FillProgress {
    pub meta: Option<FileMeta>,
    pub written: u64,
    pub phase: FillPhase,
}

impl FillProgress {
    pub fn writable(&self) -> bool {
        matches!(self.phase, FillPhase::Opening | FillPhase::Filling)
    }
}

/// One file's in-memory bytes, filled once by a single producer task while
/// any number of consumers read the committed prefix.
#[derive(Debug)]
pub struct CacheEntry {
    path: PathBuf,
    buf: RwLock<Vec<u8>>,
    progress: watch::Sender<FillProgress>,
}

impl CacheEntry {
    pub(super) fn new(path: PathBuf) -> Arc<Self> {
        let (progress, _) = watch::channel(FillProgress {
            meta: None,
            written: 0,
            phase: FillPhase::Opening,
        });
        Arc::new(Self {
            path,
            buf: RwLock::new(Vec::new()),
            progress,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> FillProgress {
        self.progress.borrow().clone()
    }

    /// Single-shot data/terminal notification source. Dropping the receiver
    /// is the unsubscribe; an aborted consumer leaves nothing behind.
    pub fn subscribe(&self) -> watch::Receiver<FillProgress> {
        self.progress.subscribe()
    }

    /// Waits until size and mtime are known, or the open failed.
    pub async fn wait_readable(&self) -> Result<FileMeta, ServeError> {
        let mut rx = self.subscribe();
        loop {
            {
                let progress = rx.borrow_and_update();
                if let Some(meta) = progress.meta {
                    return Ok(meta);
                }
                if let FillPhase::Failed(err) = &progress.phase {
                    return Err(err.clone());
                }
            }
            if rx.changed().await.is_err() {
                // Producer dropped without a terminal transition.
                return Err(ServeError::Internal);
            }
        }
    }

    /// Copies `[start, end]` (inclusive) out of the committed prefix.
    /// Callers must have observed `written > end` in a progress snapshot.
    pub fn copy_range(&self, start: u64, end: u64) -> Vec<u8> {
        let buf = self.buf.read();
        debug_assert!(end < buf.len() as u64);
        buf[start as usize..=end as usize].to_vec()
    }

    /// Producer only: records the stat result and reserves the full buffer.
    pub(super) fn begin_fill(&self, meta: FileMeta) {
        self.buf.write().reserve_exact(meta.size as usize);
        self.progress.send_modify(|progress| {
            progress.meta = Some(meta);
            progress.phase = FillPhase::Filling;
        });
    }

    /// Producer only: appends one chunk and publishes the new write offset.
    /// Rejected once the entry is no longer writable.
    pub(super) fn append(&self, chunk: &[u8]) {
        if !self.progress.borrow().writable() {
            trace!(path = %self.path.display(), "append after terminal state dropped");
            return;
        }
        let written = {
            let mut buf = self.buf.write();
            buf.extend_from_slice(chunk);
            buf.len() as u64
        };
        self.progress.send_modify(|progress| progress.written = written);
    }

    /// Producer only: exactly-once successful terminal transition.
    pub(super) fn complete(&self) {
        self.progress.send_modify(|progress| {
            if progress.writable() {
                progress.phase = FillPhase::Complete;
            }
        });
    }

    /// Producer only: exactly-once failed terminal transition. The error is
    /// delivered to every current and future subscriber.
    pub(super) fn fail(&self, err: ServeError) {
        self.progress.send_modify(|progress| {
            if progress.writable() {
                progress.phase = FillPhase::Failed(err);
            }
        });
    }
}
