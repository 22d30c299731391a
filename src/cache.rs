//! Local dataset cache.
//!
//! The cache directory holds the downloaded archive, the extracted CSV and one JSON lines file
//! per [Dataset]. Files are always published by renaming a fully written staging file, so a
//! reader sees either the previous or the new version of a file.
//!
//! Refreshes are serialised per cache key: [DatasetCache::ensure_fresh] holds an async mutex
//! for the key across the freshness check and the refresh, so concurrent requests that find a
//! stale cache trigger a single refresh.

use crate::error::RelayError;
use crate::models::Dataset;

use hashbrown::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

/// Default validity window of cached artifacts.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Return a unique path in the same directory as `dest`, used to stage a file before renaming
/// it into place.
pub fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

/// Locations of the cached artifacts.
#[derive(Clone, Debug)]
pub struct CachePaths {
    /// Cache directory
    pub dir: PathBuf,
    /// Downloaded archive
    pub archive: PathBuf,
    /// CSV member extracted from the archive
    pub extract: PathBuf,
    /// Operations log
    pub log: PathBuf,
}

impl CachePaths {
    /// Lay out the cache under `dir`.
    ///
    /// # Arguments
    ///
    /// * `dir`: Cache directory
    /// * `archive_name`: File name of the downloaded archive
    /// * `member`: File name of the extracted member
    pub fn new(dir: &Path, archive_name: &str, member: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            archive: dir.join(archive_name),
            extract: dir.join(member),
            log: dir.join("operations.log"),
        }
    }

    /// Path of the JSON lines export of a dataset.
    pub fn dataset(&self, dataset: Dataset) -> PathBuf {
        self.dir.join(dataset.file_name())
    }

    /// Every artifact produced by a refresh. The operations log is not included.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.archive.clone(), self.extract.clone()];
        paths.extend(Dataset::ALL.iter().map(|dataset| self.dataset(*dataset)));
        paths
    }
}

/// Handle on a cached file and the time it was last refreshed.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub refreshed_at: SystemTime,
}

impl CacheEntry {
    /// Look up a cached file, returning `None` if it does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>, RelayError> {
        match std::fs::metadata(path) {
            Ok(metadata) => Ok(Some(Self {
                path: path.to_path_buf(),
                refreshed_at: metadata.modified()?,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Age of the entry at `now`. Entries stamped in the future have age zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.refreshed_at).unwrap_or_default()
    }

    /// An entry is fresh while its age is strictly below `max_age`.
    pub fn is_fresh(&self, now: SystemTime, max_age: Duration) -> bool {
        self.age(now) < max_age
    }
}

/// A map of per-key async mutexes.
#[derive(Default)]
pub struct KeyedLocks {
    map: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create and return an empty [KeyedLocks].
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the mutex for `key`.
    pub async fn get(&self, key: &str) -> Arc<Mutex<()>> {
        // Common case: the lock already exists.
        {
            let map = self.map.read().await;
            if let Some(lock) = map.get(key) {
                return lock.clone();
            }
        }
        let mut map = self.map.write().await;
        // Allow for a possible race here since we dropped the read lock.
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Freshness-checked access to cached files.
pub struct DatasetCache {
    locks: KeyedLocks,
    max_age: Duration,
}

impl DatasetCache {
    /// Create a cache whose entries expire after `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self {
            locks: KeyedLocks::new(),
            max_age,
        }
    }

    /// Validity window of the cache.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Return a fresh entry for `path`, running `refresh` first if the file is missing or stale.
    ///
    /// The check and the refresh run under the mutex for `key`.
    ///
    /// # Arguments
    ///
    /// * `key`: Lock key shared by every file produced by the same refresh
    /// * `path`: File to check
    /// * `refresh`: Regenerates `path`
    pub async fn ensure_fresh<F, Fut>(
        &self,
        key: &str,
        path: &Path,
        refresh: F,
    ) -> Result<CacheEntry, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), RelayError>>,
    {
        self.with_fresh(key, path, refresh, |entry| async move { Ok(entry) })
            .await
    }

    /// Like [DatasetCache::ensure_fresh], then pass the entry to `open` before releasing the
    /// mutex for `key`.
    ///
    /// A concurrent [DatasetCache::reset] cannot remove the file between the check and `open`.
    pub async fn with_fresh<F, Fut, O, OFut, T>(
        &self,
        key: &str,
        path: &Path,
        refresh: F,
        open: O,
    ) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), RelayError>>,
        O: FnOnce(CacheEntry) -> OFut,
        OFut: Future<Output = Result<T, RelayError>>,
    {
        let lock = self.locks.get(key).await;
        let _guard = lock.lock().await;
        let entry = self.check_or_refresh(path, refresh).await?;
        open(entry).await
    }

    /// Caller holds the mutex for the key of `path`.
    async fn check_or_refresh<F, Fut>(
        &self,
        path: &Path,
        refresh: F,
    ) -> Result<CacheEntry, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), RelayError>>,
    {
        if let Some(entry) = CacheEntry::open(path)? {
            if entry.is_fresh(SystemTime::now(), self.max_age) {
                return Ok(entry);
            }
            tracing::info!(
                "Cache entry {} is stale ({}s old)",
                path.display(),
                entry.age(SystemTime::now()).as_secs()
            );
        } else {
            tracing::info!("Cache entry {} is missing", path.display());
        }
        refresh().await?;
        CacheEntry::open(path)?.ok_or_else(|| RelayError::DatasetMissing {
            dataset: path.display().to_string(),
        })
    }

    /// Delete `paths` under the mutex for `key`.
    ///
    /// Returns the number of files removed.
    pub async fn reset(&self, key: &str, paths: &[PathBuf]) -> Result<usize, RelayError> {
        let lock = self.locks.get(key).await;
        let _guard = lock.lock().await;
        let mut removed = 0;
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry_at(refreshed_at: SystemTime) -> CacheEntry {
        CacheEntry {
            path: PathBuf::from("measurements.csv"),
            refreshed_at,
        }
    }

    #[test]
    fn freshness_boundary() {
        let now = SystemTime::now();
        let max_age = DEFAULT_MAX_AGE;
        let just_inside = entry_at(now - max_age + Duration::from_secs(1));
        let exactly = entry_at(now - max_age);
        let outside = entry_at(now - max_age - Duration::from_secs(1));
        assert!(just_inside.is_fresh(now, max_age));
        assert!(!exactly.is_fresh(now, max_age));
        assert!(!outside.is_fresh(now, max_age));
    }

    #[test]
    fn future_timestamp_is_fresh() {
        let now = SystemTime::now();
        let entry = entry_at(now + Duration::from_secs(60));
        assert_eq!(Duration::ZERO, entry.age(now));
        assert!(entry.is_fresh(now, DEFAULT_MAX_AGE));
    }

    #[test]
    fn staging_path_is_sibling() {
        let dest = Path::new("/cache/openradiation.jsonl");
        let staging = staging_path(dest);
        assert_eq!(dest.parent(), staging.parent());
        assert_ne!(staging, staging_path(dest));
        let name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".openradiation.jsonl."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn cache_paths_layout() {
        let paths = CachePaths::new(Path::new("/cache"), "dataset.tar.gz", "measurements.csv");
        assert_eq!(Path::new("/cache/dataset.tar.gz"), paths.archive);
        assert_eq!(Path::new("/cache/measurements.csv"), paths.extract);
        assert_eq!(
            Path::new("/cache/devices.jsonl"),
            paths.dataset(Dataset::Devices)
        );
        assert_eq!(7, paths.artifacts().len());
        assert!(!paths.artifacts().contains(&paths.log));
    }

    #[tokio::test]
    async fn keyed_locks_reuse() {
        let locks = KeyedLocks::new();
        let a = locks.get("a").await;
        let a2 = locks.get("a").await;
        let b = locks.get("b").await;
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(2, locks.map.read().await.len());
    }

    #[tokio::test]
    async fn ensure_fresh_reuses_fresh_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.csv");
        std::fs::write(&path, "cached").unwrap();
        let cache = DatasetCache::new(DEFAULT_MAX_AGE);

        let entry = cache
            .ensure_fresh("feed", &path, || async {
                // Fails the lookup if a refresh is attempted.
                Err::<(), _>(RelayError::ObjectStoreNotConfigured)
            })
            .await
            .unwrap();
        assert_eq!(path, entry.path);
    }

    #[tokio::test]
    async fn ensure_fresh_refreshes_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.csv");
        std::fs::write(&path, "old").unwrap();
        // A zero window makes every existing entry stale.
        let cache = DatasetCache::new(Duration::ZERO);

        let refreshes = AtomicUsize::new(0);
        cache
            .ensure_fresh("feed", &path, || async {
                refreshes.fetch_add(1, Ordering::SeqCst);
                std::fs::write(&path, "new")?;
                Ok::<(), RelayError>(())
            })
            .await
            .unwrap();
        assert_eq!(1, refreshes.load(Ordering::SeqCst));
        assert_eq!("new", std::fs::read_to_string(&path).unwrap());
    }

    #[tokio::test]
    async fn ensure_fresh_single_refresh_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.csv");
        let cache = Arc::new(DatasetCache::new(DEFAULT_MAX_AGE));
        let refreshes = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let refreshes = refreshes.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    cache
                        .ensure_fresh("feed", &path, || async {
                            refreshes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            tokio::fs::write(&path, "data").await?;
                            Ok::<(), RelayError>(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(1, refreshes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ensure_fresh_propagates_refresh_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.csv");
        let cache = DatasetCache::new(DEFAULT_MAX_AGE);

        let result = cache
            .ensure_fresh("feed", &path, || async {
                Err::<(), _>(RelayError::MemberNotFound {
                    member: "measurements.csv".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(RelayError::MemberNotFound { .. })));
    }

    #[tokio::test]
    async fn ensure_fresh_missing_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.jsonl");
        let cache = DatasetCache::new(DEFAULT_MAX_AGE);

        let result = cache
            .ensure_fresh("feed", &path, || async { Ok::<(), RelayError>(()) })
            .await;
        assert!(matches!(result, Err(RelayError::DatasetMissing { .. })));
    }

    #[tokio::test]
    async fn reset_waits_for_open_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.jsonl");
        std::fs::write(&path, "cached").unwrap();
        let cache = Arc::new(DatasetCache::new(DEFAULT_MAX_AGE));
        let (opening_tx, opening_rx) = tokio::sync::oneshot::channel();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let reader = {
            let cache = cache.clone();
            let path = path.clone();
            tokio::spawn(async move {
                cache
                    .with_fresh(
                        "feed",
                        &path,
                        || async { Err::<(), _>(RelayError::ObjectStoreNotConfigured) },
                        |entry| async move {
                            opening_tx.send(()).unwrap();
                            resume_rx.await.unwrap();
                            tokio::fs::read_to_string(&entry.path)
                                .await
                                .map_err(RelayError::from)
                        },
                    )
                    .await
            })
        };
        opening_rx.await.unwrap();

        let resetter = {
            let cache = cache.clone();
            let path = path.clone();
            tokio::spawn(async move { cache.reset("feed", &[path]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!resetter.is_finished());
        assert!(path.exists());

        resume_tx.send(()).unwrap();
        assert_eq!("cached", reader.await.unwrap().unwrap());
        assert_eq!(1, resetter.await.unwrap().unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reset_removes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("devices.jsonl");
        let absent = dir.path().join("flights.jsonl");
        std::fs::write(&present, "{}").unwrap();
        let cache = DatasetCache::new(DEFAULT_MAX_AGE);

        let removed = cache.reset("feed", &[present.clone(), absent]).await.unwrap();
        assert_eq!(1, removed);
        assert!(!present.exists());
    }
}
