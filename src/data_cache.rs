//! On-disk byte cache
//!
//! Append-optimized LRU byte store: one regular file per entry under a root
//! directory, the basename being the hex SHA-256 of the key, no extension.
//! Writes are staged in memory and flushed by a background ticker, on
//! demand, and on drop; readers observe staged values before they reach
//! disk. A hidden sidecar records per-entry access times and sizes; losing
//! the sidecar loses no data — the index is reconstructed from file
//! metadata on startup.
//!
//! Sweeps delete least-recently-used entries until the store is under its
//! size limit. A single sweep runs at a time, on a low-frequency timer and
//! on demand. File writes are atomic (write to a hidden temp file, then
//! rename), so the directory survives arbitrary process termination.
//!
//! All filesystem work reached from the async surface runs off the tokio
//! workers: reads go through `tokio::fs`, and the flush/sweep/clear
//! helpers run under `spawn_blocking`. The same sync helpers are called
//! directly from `Drop`, where no executor is available.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use crate::traits::DataCaching;

const SIDECAR_NAME: &str = ".pixelpipe-index-v1.json";

/// Tuning knobs for [`DataCache`].
#[derive(Debug, Clone)]
pub struct DataCacheConfig {
    /// Total recorded size the sweep trims the store down to.
    pub size_limit: u64,
    /// How often staged writes are flushed to disk.
    pub flush_interval: Duration,
    /// How often the LRU sweep runs.
    pub sweep_interval: Duration,
}

impl Default for DataCacheConfig {
    fn default() -> Self {
        Self {
            size_limit: 150 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    created_ms: u64,
    last_access_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    /// File basename (hex digest) → metadata.
    entries: HashMap<String, IndexEntry>,
}

#[derive(Clone)]
enum StagedOp {
    Write(Bytes),
    Remove,
}

#[derive(Clone)]
struct Staged {
    generation: u64,
    op: StagedOp,
}

/// Counters exposed by [`DataCache::stats`].
#[derive(Debug, Clone, Default)]
pub struct DataCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub swept: u64,
    pub total_size: u64,
    pub count: usize,
}

struct CacheInner {
    root: PathBuf,
    config: DataCacheConfig,
    staging: DashMap<String, Staged>,
    generation: AtomicU64,
    index: Mutex<IndexState>,
    total_size: AtomicU64,
    sweep_lock: tokio::sync::Mutex<()>,
    flush_notify: tokio::sync::Notify,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    swept: AtomicU64,
}

struct IndexState {
    index: Index,
    dirty: bool,
}

/// LRU byte store on persistent storage. See the module docs.
pub struct DataCache {
    inner: Arc<CacheInner>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DataCache {
    /// Open (or create) a store at `root` with default limits.
    ///
    /// Must be called within a tokio runtime: the store spawns its flush
    /// and sweep tickers on construction.
    ///
    /// # Errors
    ///
    /// Filesystem errors while creating the root or scanning it.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        Self::with_config(root, DataCacheConfig::default())
    }

    /// # Errors
    ///
    /// Filesystem errors while creating the root or scanning it.
    pub fn with_config(root: impl Into<PathBuf>, config: DataCacheConfig) -> anyhow::Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data cache root {}", root.display()))?;

        let index = load_index(&root).unwrap_or_else(|error| {
            warn!(%error, "sidecar unreadable, rebuilding index from filesystem");
            Index::default()
        });
        let index = reconcile_index(&root, index)?;
        let total: u64 = index.entries.values().map(|entry| entry.size).sum();
        info!(
            root = %root.display(),
            entries = index.entries.len(),
            total_size = total,
            "data cache opened"
        );

        let inner = Arc::new(CacheInner {
            root,
            config,
            staging: DashMap::new(),
            generation: AtomicU64::new(0),
            index: Mutex::new(IndexState { index, dirty: true }),
            total_size: AtomicU64::new(total),
            sweep_lock: tokio::sync::Mutex::new(()),
            flush_notify: tokio::sync::Notify::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        });

        let cache = Arc::new(Self {
            inner: Arc::clone(&inner),
            background: Mutex::new(Vec::new()),
        });
        let mut background = cache.background.lock();
        background.push(tokio::spawn(flush_loop(Arc::downgrade(&inner))));
        background.push(tokio::spawn(sweep_loop(Arc::downgrade(&inner))));
        drop(background);
        Ok(cache)
    }

    /// Hex digest used as the on-disk basename for `key`.
    #[must_use]
    pub fn filename(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Recorded total size of the store, staged writes excluded.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.inner.total_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> DataCacheStats {
        let inner = &self.inner;
        DataCacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            writes: inner.writes.load(Ordering::Relaxed),
            swept: inner.swept.load(Ordering::Relaxed),
            total_size: inner.total_size.load(Ordering::Relaxed),
            count: inner.index.lock().index.entries.len(),
        }
    }

    /// Run an LRU sweep now. Only one sweep runs at a time; a concurrent
    /// call waits for the running one and returns.
    pub async fn sweep(&self) {
        let _guard = self.inner.sweep_lock.lock().await;
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            inner.flush_all();
            inner.sweep_locked();
        })
        .await;
    }
}

impl Drop for DataCache {
    fn drop(&mut self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        // Final best-effort flush so staged writes survive shutdown.
        self.inner.flush_all();
    }
}

#[async_trait]
impl DataCaching for DataCache {
    async fn contains(&self, key: &str) -> bool {
        let digest = Self::filename(key);
        if let Some(staged) = self.inner.staging.get(&digest) {
            return matches!(staged.op, StagedOp::Write(_));
        }
        self.inner.index.lock().index.entries.contains_key(&digest)
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let digest = Self::filename(key);
        if let Some(staged) = self.inner.staging.get(&digest) {
            return match &staged.op {
                StagedOp::Write(bytes) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    Some(bytes.clone())
                }
                StagedOp::Remove => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            };
        }
        match tokio::fs::read(self.inner.root.join(&digest)).await {
            Ok(bytes) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.touch(&digest);
                Some(Bytes::from(bytes))
            }
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(%error, "data cache read failed");
                }
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put(&self, key: &str, data: Bytes) {
        let digest = Self::filename(key);
        debug!(key = %key, len = data.len(), "staging data cache write");
        self.inner.stage(digest, StagedOp::Write(data));
    }

    async fn remove(&self, key: &str) {
        let digest = Self::filename(key);
        self.inner.stage(digest, StagedOp::Remove);
    }

    async fn remove_all(&self) {
        self.inner.staging.clear();
        {
            let mut state = self.inner.index.lock();
            state.index.entries.clear();
            state.dirty = true;
        }
        self.inner.total_size.store(0, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(entries) = std::fs::read_dir(&inner.root) {
                for entry in entries.flatten() {
                    if !is_hidden(&entry.file_name().to_string_lossy()) {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
            inner.persist_index();
        })
        .await;
        info!("data cache cleared");
    }

    async fn flush(&self) {
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || inner.flush_all()).await;
    }

    async fn flush_key(&self, key: &str) {
        let digest = Self::filename(key);
        let staged = self.inner.staging.get(&digest).map(|entry| entry.value().clone());
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(staged) = staged {
                inner.flush_one(&digest, &staged);
            }
            inner.persist_index();
        })
        .await;
    }
}

impl CacheInner {
    fn stage(&self, digest: String, op: StagedOp) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.staging.insert(digest, Staged { generation, op });
        self.flush_notify.notify_one();
    }

    fn touch(&self, digest: &str) {
        let mut state = self.index.lock();
        if let Some(entry) = state.index.entries.get_mut(digest) {
            entry.last_access_ms = unix_ms_now();
            state.dirty = true;
        }
    }

    /// Flush every staged operation, then persist the sidecar. Blocking;
    /// async callers wrap it in `spawn_blocking`.
    fn flush_all(&self) {
        let snapshot: Vec<(String, Staged)> = self
            .staging
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (digest, staged) in &snapshot {
            self.flush_one(digest, staged);
        }
        self.persist_index();
    }

    fn flush_one(&self, digest: &str, staged: &Staged) {
        match &staged.op {
            StagedOp::Write(bytes) => {
                if let Err(error) = write_atomic(&self.root, digest, bytes) {
                    warn!(%error, "data cache flush failed");
                    return;
                }
                let now = unix_ms_now();
                let mut state = self.index.lock();
                let previous = state.index.entries.insert(
                    digest.to_owned(),
                    IndexEntry {
                        size: bytes.len() as u64,
                        created_ms: now,
                        last_access_ms: now,
                    },
                );
                state.dirty = true;
                drop(state);
                if let Some(previous) = previous {
                    self.total_size.fetch_sub(previous.size, Ordering::Relaxed);
                }
                self.total_size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            StagedOp::Remove => {
                let _ = std::fs::remove_file(self.root.join(digest));
                let mut state = self.index.lock();
                if let Some(previous) = state.index.entries.remove(digest) {
                    state.dirty = true;
                    drop(state);
                    self.total_size.fetch_sub(previous.size, Ordering::Relaxed);
                }
            }
        }
        // Unstage only if no newer operation replaced this one meanwhile.
        self.staging
            .remove_if(digest, |_, current| current.generation == staged.generation);
    }

    fn persist_index(&self) {
        let serialized = {
            let mut state = self.index.lock();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            serde_json::to_vec(&state.index)
        };
        match serialized {
            Ok(bytes) => {
                if let Err(error) = write_atomic(&self.root, SIDECAR_NAME, &bytes) {
                    warn!(%error, "sidecar snapshot failed");
                }
            }
            Err(error) => warn!(%error, "sidecar serialization failed"),
        }
    }

    /// Delete least-recently-used entries until the size limit holds.
    /// Blocking; the caller holds the sweep lock and runs this on the
    /// blocking thread pool.
    fn sweep_locked(&self) {
        let limit = self.config.size_limit;
        if self.total_size.load(Ordering::Relaxed) <= limit {
            return;
        }
        let mut by_access: Vec<(String, IndexEntry)> = {
            let state = self.index.lock();
            state
                .index
                .entries
                .iter()
                .map(|(digest, entry)| (digest.clone(), entry.clone()))
                .collect()
        };
        by_access.sort_by_key(|(_, entry)| entry.last_access_ms);

        let mut removed = 0u64;
        for (digest, entry) in by_access {
            if self.total_size.load(Ordering::Relaxed) <= limit {
                break;
            }
            let _ = std::fs::remove_file(self.root.join(&digest));
            let mut state = self.index.lock();
            if state.index.entries.remove(&digest).is_some() {
                state.dirty = true;
                drop(state);
                self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
                removed += 1;
            }
        }
        if removed > 0 {
            self.swept.fetch_add(removed, Ordering::Relaxed);
            info!(removed, total_size = self.total_size.load(Ordering::Relaxed), "sweep finished");
        }
        self.persist_index();
    }
}

async fn flush_loop(inner: Weak<CacheInner>) {
    loop {
        let Some(cache) = inner.upgrade() else { return };
        let interval = cache.config.flush_interval;
        let notified = async { cache.flush_notify.notified().await };
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = notified => {
                // Collect a batch before writing.
                tokio::time::sleep(interval).await;
            }
        }
        if !cache.staging.is_empty() {
            let worker = Arc::clone(&cache);
            let _ = tokio::task::spawn_blocking(move || worker.flush_all()).await;
        }
        drop(cache);
        tokio::task::yield_now().await;
    }
}

async fn sweep_loop(inner: Weak<CacheInner>) {
    loop {
        let interval = match inner.upgrade() {
            Some(cache) => cache.config.sweep_interval,
            None => return,
        };
        tokio::time::sleep(interval).await;
        let Some(cache) = inner.upgrade() else { return };
        let _guard = cache.sweep_lock.lock().await;
        let worker = Arc::clone(&cache);
        let _ = tokio::task::spawn_blocking(move || {
            worker.flush_all();
            worker.sweep_locked();
        })
        .await;
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn write_atomic(root: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = root.join(format!(".tmp-{}", name.trim_start_matches('.')));
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, root.join(name)).context("renaming temp file into place")?;
    Ok(())
}

fn load_index(root: &Path) -> anyhow::Result<Index> {
    let path = root.join(SIDECAR_NAME);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).context("parsing sidecar")?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
        Err(error) => Err(error.into()),
    }
}

/// Bring the index in line with the actual directory contents: files not in
/// the index are adopted with their mtime as last access; index entries
/// whose file is gone are pruned. No data is ever lost to sidecar loss.
fn reconcile_index(root: &Path, mut index: Index) -> anyhow::Result<Index> {
    let mut present: HashMap<String, (u64, u64)> = HashMap::new();
    for entry in std::fs::read_dir(root).context("scanning data cache root")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) || !entry.file_type()?.is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        present.insert(name, (metadata.len(), mtime_ms));
    }

    index.entries.retain(|digest, _| present.contains_key(digest));
    for (digest, (size, mtime_ms)) in present {
        index.entries.entry(digest).or_insert(IndexEntry {
            size,
            created_ms: mtime_ms,
            last_access_ms: mtime_ms,
        });
    }
    Ok(index)
}
