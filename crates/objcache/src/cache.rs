// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Local download cache for remote objects
//!
//! [`DownloadCache`] maps `bucket/key` to a file under its root directory.
//! There is at most one transfer in flight per key: concurrent callers for
//! the same key wait on a per-key lock and then observe the finished entry.
//! Transfers stream into a hidden `.part` file next to the destination and
//! are renamed into place only after the byte count checks out, so a failed
//! or cancelled transfer never leaves a file at the destination path.
//!
//! Cached entries never expire on their own. What happens to them after
//! [`DownloadCache::reload`] is governed by [`StalenessPolicy`]; every
//! resolution call passes the [`Generation`] it captured when it started,
//! so entries stay valid for the whole call.

use crate::error::{Error, Result};
use crate::storage::{ObjectLister, RemoteObjectDescriptor};
use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

/// What a reload does to objects that are already cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Reload has no effect; entries live until evicted or cleared.
    #[default]
    KeepUntilEvicted,
    /// First use after a reload compares the listing's last-modified time and
    /// size with the cached copy and re-fetches only when they differ.
    RevalidateOnReload,
    /// First use after a reload always re-fetches.
    RefetchOnReload,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Cache root. `None` uses a temporary directory removed on drop.
    pub dir: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    /// Total bytes kept before least-recently-fetched entries are evicted.
    pub capacity_bytes: Option<u64>,
    pub staleness: StalenessPolicy,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            dir: None,
            max_concurrent_downloads: 4,
            capacity_bytes: None,
            staleness: StalenessPolicy::default(),
        }
    }
}

/// Cache epoch, advanced by [`DownloadCache::reload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub fetched_at: DateTime<Utc>,
    pub source_last_modified: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    /// Generation in which this copy was last fetched or revalidated.
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub revalidations: u64,
    pub evictions: u64,
    pub bytes_fetched: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    revalidations: AtomicU64,
    evictions: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        _ = counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
        }
    }
}

type ObjectKey = (String, String);

/// A cached object and the latest generation that handed it out. Entries
/// used in the current generation may be named by live query text, so
/// capacity eviction leaves them alone.
struct Slot {
    object: CachedObject,
    last_used: Generation,
}

enum Freshness {
    Fresh,
    NeedsCheck,
    Stale,
}

/// Removes an unfinished `.part` file unless disarmed. Dropping the fetch
/// future (deadline, cancellation) drops this guard too.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Shared handle on one key's transfer lock. Dropping it, including when
/// the resolve future is cancelled, forgets the lock once no other caller
/// holds or waits on it.
struct KeyLock<'a> {
    cache: &'a DownloadCache,
    id: ObjectKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.cache.release_key_lock(&self.id, &self.lock);
    }
}

const PART_SUFFIX: &str = ".part";

pub struct DownloadCache {
    root: PathBuf,
    _scratch: Option<TempDir>,
    lister: ObjectLister,
    options: CacheOptions,
    entries: Mutex<HashMap<ObjectKey, Slot>>,
    inflight: Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
    downloads: Semaphore,
    generation: AtomicU64,
    counters: Counters,
}

impl DownloadCache {
    pub fn open(options: CacheOptions, lister: ObjectLister) -> Result<Self> {
        if options.max_concurrent_downloads == 0 {
            return Err(Error::Config("max_concurrent_downloads must be at least 1".into()));
        }

        let (root, scratch) = match &options.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let scratch = tempfile::Builder::new().prefix("bucketql-cache-").tempdir()?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        let swept = sweep_partial_files(&root)?;
        if swept > 0 {
            warn!("Removed {swept} unfinished downloads from a previous run", swept: swept);
        }
        let root_display = root.display().to_string();
        info!("Download cache at {root_display}", root_display: root_display);

        Ok(Self {
            root,
            _scratch: scratch,
            downloads: Semaphore::new(options.max_concurrent_downloads),
            lister,
            options,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    #[must_use]
    pub fn lister(&self) -> &ObjectLister {
        &self.lister
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// The generation a resolution call should capture when it starts.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    /// The explicit invalidation point: later calls see cached entries
    /// according to the staleness policy.
    pub fn reload(&self) -> Generation {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = format!("{:?}", self.options.staleness);
        info!("Cache reload: generation {next}, policy {policy}", next: next, policy: policy);
        Generation(next)
    }

    /// Local file for `object`, fetching it unless a valid copy is cached.
    pub async fn resolve(
        &self,
        object: &RemoteObjectDescriptor,
        generation: Generation,
    ) -> Result<CachedObject> {
        let id: ObjectKey = (object.bucket.clone(), object.key.clone());
        let dest = self.local_path(&object.bucket, &object.key)?;

        if let Some(entry) = self.fresh_hit(&id, generation).await {
            return Ok(entry);
        }

        let key_lock = self.key_lock(&id);
        let _guard = key_lock.lock.lock().await;
        self.resolve_locked(object, &id, &dest, generation).await
    }

    async fn resolve_locked(
        &self,
        object: &RemoteObjectDescriptor,
        id: &ObjectKey,
        dest: &Path,
        generation: Generation,
    ) -> Result<CachedObject> {
        let bucket = object.bucket.as_str();
        let key = object.key.as_str();

        // Another caller may have finished the transfer while we waited.
        if let Some(entry) = self.fresh_hit(id, generation).await {
            return Ok(entry);
        }
        if let Some(entry) = self.lookup(id) {
            let present = tokio::fs::try_exists(&entry.local_path).await.unwrap_or(false);
            if present && unchanged(&entry, object) {
                if let Freshness::NeedsCheck = self.freshness(&entry, generation) {
                    let revalidated = CachedObject {
                        generation: generation.max(entry.generation),
                        ..entry
                    };
                    self.store(id, revalidated.clone(), generation);
                    Counters::bump(&self.counters.revalidations, 1);
                    debug!("Revalidated {bucket}/{key}", bucket: bucket, key: key);
                    return Ok(revalidated);
                }
            }
            debug!("Cached copy of {bucket}/{key} is stale", bucket: bucket, key: key);
        }

        Counters::bump(&self.counters.misses, 1);
        let entry = self.fetch(object, dest, generation).await?;
        self.store(id, entry.clone(), generation);
        self.enforce_capacity();
        Ok(entry)
    }

    /// Resolve a single object by key. The object is only looked up
    /// remotely when no valid copy is cached for `generation`.
    pub async fn resolve_key(
        &self,
        bucket: &str,
        key: &str,
        generation: Generation,
    ) -> Result<CachedObject> {
        _ = self.local_path(bucket, key)?;
        let id: ObjectKey = (bucket.to_string(), key.to_string());
        if let Some(entry) = self.fresh_hit(&id, generation).await {
            return Ok(entry);
        }

        let Some(object) = self.lister.stat(bucket, key).await? else {
            return Err(Error::download(bucket, key, "object not found", false));
        };
        self.resolve(&object, generation).await
    }

    /// The cached entry for `id`, if it is valid for `generation` and its
    /// file is still on disk.
    async fn fresh_hit(&self, id: &ObjectKey, generation: Generation) -> Option<CachedObject> {
        let entry = self.lookup(id)?;
        if !matches!(self.freshness(&entry, generation), Freshness::Fresh) {
            return None;
        }
        if !tokio::fs::try_exists(&entry.local_path).await.unwrap_or(false) {
            return None;
        }
        self.touch(id, generation);
        Counters::bump(&self.counters.hits, 1);
        let (bucket, key) = id;
        debug!("Cache hit for {bucket}/{key}", bucket: bucket, key: key);
        Some(entry)
    }

    async fn fetch(
        &self,
        object: &RemoteObjectDescriptor,
        dest: &Path,
        generation: Generation,
    ) -> Result<CachedObject> {
        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| Error::Config("download pool is closed".into()))?;

        let bucket = object.bucket.as_str();
        let key = object.key.as_str();
        info!("Fetching {bucket}/{key}", bucket: bucket, key: key);

        let operation = format!("fetch {bucket}/{key}");
        let written = self
            .lister
            .retry_policy()
            .run(&operation, || self.fetch_once(object, dest))
            .await?;

        Counters::bump(&self.counters.fetches, 1);
        Counters::bump(&self.counters.bytes_fetched, written);
        info!("Fetched {bucket}/{key}: {written} bytes", bucket: bucket, key: key, written: written);

        Ok(CachedObject {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            local_path: dest.to_path_buf(),
            fetched_at: Utc::now(),
            source_last_modified: object.last_modified,
            size_bytes: written,
            generation,
        })
    }

    async fn fetch_once(&self, object: &RemoteObjectDescriptor, dest: &Path) -> Result<u64> {
        let bucket = object.bucket.as_str();
        let key = object.key.as_str();

        let (Some(dir), Some(name)) = (dest.parent(), dest.file_name()) else {
            return Err(Error::download(bucket, key, "no local file name", false));
        };
        tokio::fs::create_dir_all(dir).await?;

        let part_path = dir.join(format!(
            ".{}.{}{PART_SUFFIX}",
            name.to_string_lossy(),
            uuid7::uuid7()
        ));
        let mut partial = PartialFile::new(part_path.clone());

        let mut body = self.lister.storage().get(bucket, key).await?;
        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = body.stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let expected = body
            .content_length
            .or((object.size_bytes > 0).then_some(object.size_bytes));
        if let Some(expected) = expected {
            if expected != written {
                return Err(Error::download(
                    bucket,
                    key,
                    format!("truncated transfer: expected {expected} bytes, received {written}"),
                    true,
                ));
            }
        }

        tokio::fs::rename(&part_path, dest).await?;
        partial.disarm();
        Ok(written)
    }

    /// Remove every cached file and forget every entry. Not meant to run
    /// concurrently with resolutions.
    pub fn clear(&self) -> Result<()> {
        let removed = {
            let mut entries = self.entries();
            let n = entries.len();
            entries.clear();
            n
        };

        if self.root.exists() {
            for entry in std::fs::read_dir(&self.root)? {
                let path = entry?.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Counters::bump(&self.counters.evictions, removed as u64);
        info!("Cleared download cache ({removed} entries)", removed: removed);
        Ok(())
    }

    /// Evict entries fetched longer than `max_age` ago, and cached files
    /// from earlier runs whose modification time is that old. Returns the
    /// number of files removed.
    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::Config(format!("invalid eviction age: {e}")))?;
        let cutoff = Utc::now() - age;

        let mut removed = 0usize;
        let known: Vec<PathBuf> = {
            let inflight = self.inflight_locks();
            let mut entries = self.entries();
            let expired: Vec<ObjectKey> = entries
                .iter()
                .filter(|(id, slot)| slot.object.fetched_at < cutoff && !is_busy(&inflight, id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(slot) = entries.remove(&id) {
                    if remove_if_present(&slot.object.local_path) {
                        removed += 1;
                    }
                }
            }
            entries.values().map(|slot| slot.object.local_path.clone()).collect()
        };

        let cutoff_time = std::time::SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(std::time::UNIX_EPOCH);
        for path in walk_files(&self.root)? {
            if known.contains(&path) {
                continue;
            }
            let old = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified < cutoff_time);
            if old && remove_if_present(&path) {
                removed += 1;
            }
        }

        Counters::bump(&self.counters.evictions, removed as u64);
        if removed > 0 {
            info!("Evicted {removed} cached files older than the age limit", removed: removed);
        }
        Ok(removed)
    }

    /// Evict least-recently-fetched entries until under the capacity
    /// bound, skipping entries used in the current generation and entries
    /// with a transfer in progress.
    fn enforce_capacity(&self) {
        let Some(limit) = self.options.capacity_bytes else {
            return;
        };
        let current = self.generation();

        let inflight = self.inflight_locks();
        let mut entries = self.entries();
        let mut total: u64 = entries.values().map(|slot| slot.object.size_bytes).sum();
        if total <= limit {
            return;
        }

        let mut candidates: Vec<(DateTime<Utc>, ObjectKey)> = entries
            .iter()
            .filter(|(id, slot)| slot.last_used < current && !is_busy(&inflight, id))
            .map(|(id, slot)| (slot.object.fetched_at, id.clone()))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            if total <= limit {
                break;
            }
            if let Some(slot) = entries.remove(&id) {
                _ = remove_if_present(&slot.object.local_path);
                total = total.saturating_sub(slot.object.size_bytes);
                Counters::bump(&self.counters.evictions, 1);
                let (bucket, key) = id;
                debug!("Evicted {bucket}/{key} to stay under capacity", bucket: bucket, key: key);
            }
        }
        if total > limit {
            debug!("Cache holds {total} bytes in use, above the {limit} byte bound", total: total, limit: limit);
        }
    }

    fn freshness(&self, entry: &CachedObject, generation: Generation) -> Freshness {
        if entry.generation >= generation {
            return Freshness::Fresh;
        }
        match self.options.staleness {
            StalenessPolicy::KeepUntilEvicted => Freshness::Fresh,
            StalenessPolicy::RevalidateOnReload => Freshness::NeedsCheck,
            StalenessPolicy::RefetchOnReload => Freshness::Stale,
        }
    }

    fn local_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let invalid = |reason: &str| Error::download(bucket, key, reason, false);

        if !is_safe_segment(bucket) {
            return Err(invalid("bucket name cannot be used as a directory"));
        }
        let mut path = self.root.join(bucket);
        for segment in key.split('/') {
            if !is_safe_segment(segment) {
                return Err(invalid("key cannot be mapped to a local path"));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn lookup(&self, id: &ObjectKey) -> Option<CachedObject> {
        self.entries().get(id).map(|slot| slot.object.clone())
    }

    fn store(&self, id: &ObjectKey, object: CachedObject, used: Generation) {
        let mut entries = self.entries();
        let last_used = entries
            .get(id)
            .map_or(used, |slot| slot.last_used.max(used));
        _ = entries.insert(id.clone(), Slot { object, last_used });
    }

    fn touch(&self, id: &ObjectKey, used: Generation) {
        if let Some(slot) = self.entries().get_mut(id) {
            slot.last_used = slot.last_used.max(used);
        }
    }

    fn key_lock(&self, id: &ObjectKey) -> KeyLock<'_> {
        let lock = Arc::clone(
            self.inflight_locks()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        KeyLock {
            cache: self,
            id: id.clone(),
            lock,
        }
    }

    /// Drop the per-key lock from the map once nobody but the map and the
    /// caller refer to it. Clones are only taken under the map lock, so the
    /// count cannot rise while it is held.
    fn release_key_lock(&self, id: &ObjectKey, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight_locks();
        let last = Arc::strong_count(lock) == 2
            && inflight.get(id).is_some_and(|held| Arc::ptr_eq(held, lock));
        if last {
            _ = inflight.remove(id);
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectKey, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inflight_locks(&self) -> MutexGuard<'_, HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unchanged(entry: &CachedObject, listed: &RemoteObjectDescriptor) -> bool {
    let same_time = match (entry.source_last_modified, listed.last_modified) {
        (Some(cached), Some(remote)) => cached == remote,
        _ => false,
    };
    let same_size = listed.size_bytes == 0 || listed.size_bytes == entry.size_bytes;
    same_time && same_size
}

fn is_busy(inflight: &HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>, id: &ObjectKey) -> bool {
    inflight.get(id).is_some_and(|lock| lock.try_lock().is_err())
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['\\', '\0'])
        && !segment.ends_with(PART_SUFFIX)
}

fn remove_if_present(path: &Path) -> bool {
    std::fs::remove_file(path).is_ok()
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(listing) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in listing {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn sweep_partial_files(root: &Path) -> Result<usize> {
    let mut swept = 0;
    for path in walk_files(root)? {
        let is_part = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| n.starts_with('.') && n.ends_with(PART_SUFFIX));
        if is_part && remove_if_present(&path) {
            swept += 1;
        }
    }
    Ok(swept)
}
