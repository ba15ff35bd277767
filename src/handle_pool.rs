//! LRU-bounded cache of open segment file handles.
//!
//! Two independent caches keyed by file path: append-mode writers and
//! read-mode readers. The pool owns each descriptor; callers receive
//! `Arc` clones, so an evicted descriptor closes once the last in-flight
//! user drops it. Single-writer discipline on the underlying file is the
//! caller's responsibility.

use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Default capacity of each cache, bounded well under typical OS
/// descriptor limits.
pub const DEFAULT_MAX_FILE_HANDLES: usize = 100;

pub struct FileHandlePool {
    writers: Mutex<LruCache<PathBuf, Arc<File>>>,
    readers: Mutex<LruCache<PathBuf, Arc<File>>>,
}

impl FileHandlePool {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            writers: Mutex::new(LruCache::new(capacity)),
            readers: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get (or open) the append-mode writer for `path`, promoting it to
    /// most-recently-used. Creates the file if it does not exist.
    pub fn writer(&self, path: &Path) -> io::Result<Arc<File>> {
        if let Some(file) = self.writers.lock().get(&path.to_path_buf()) {
            return Ok(file.clone());
        }
        // Open outside the lock; the pool mutex is never held across I/O.
        let file = Arc::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)?,
        );
        let mut writers = self.writers.lock();
        if let Some(existing) = writers.get(&path.to_path_buf()) {
            // Lost the race; keep the first-inserted descriptor.
            return Ok(existing.clone());
        }
        writers.push(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Get (or open) the read-mode reader for `path`, promoting it to
    /// most-recently-used.
    pub fn reader(&self, path: &Path) -> io::Result<Arc<File>> {
        if let Some(file) = self.readers.lock().get(&path.to_path_buf()) {
            return Ok(file.clone());
        }
        let file = Arc::new(OpenOptions::new().read(true).open(path)?);
        let mut readers = self.readers.lock();
        if let Some(existing) = readers.get(&path.to_path_buf()) {
            return Ok(existing.clone());
        }
        readers.push(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Drop any cached descriptors for `path` from both caches.
    pub fn remove(&self, path: &Path) {
        self.writers.lock().pop(&path.to_path_buf());
        self.readers.lock().pop(&path.to_path_buf());
    }

    /// Fsync the cached writer for `path`, if present; no-op otherwise.
    pub fn sync(&self, path: &Path) -> io::Result<()> {
        let writer = self.writers.lock().peek(&path.to_path_buf()).cloned();
        if let Some(file) = writer {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Drop every cached descriptor.
    pub fn clear(&self) {
        self.writers.lock().clear();
        self.readers.lock().clear();
    }
}
