//! The content-addressed object store.
//!
//! Objects are written to a temporary file inside their pool while being
//! hashed, then renamed onto `objects/<algorithm>/<prefix>/<suffix>`. Writes of
//! the same hash are serialized by a per-hash lock; writes of different hashes
//! run in parallel up to `max_concurrent_operations`.

use crate::config::CasConfiguration;
use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashingWriter};
use crate::manifest::ContentManifest;
use crate::pool::{CasObject, CasPool, Pool};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};

type LockKey = (CasPool, ContentHash);

/// A content-addressed store made of one or more pools.
///
/// Cloning is cheap; all clones share the same pools, locks and statistics.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: CasConfiguration,
    primary: Pool,
    installation: Option<Pool>,
    write_permits: Semaphore,
    hash_locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Holds the per-hash lock; removes the lock entry once nobody else waits on it.
pub(crate) struct HashLock<'a> {
    locks: &'a DashMap<LockKey, Arc<Mutex<()>>>,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for HashLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CasStats {
    pub pool: CasPool,
    pub object_count: usize,
    pub total_size: u64,
    /// Bytes that store calls did not have to write because the content was already present.
    pub space_saved: u64,
    pub hits: u64,
    pub misses: u64,
    /// Fraction of store calls satisfied by an existing object, `0.0` when idle.
    pub hit_rate: f64,
}

/// Deduplication figures computed from a set of manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceStats {
    pub pool: CasPool,
    /// Number of manifest entries that reference an object present in the pool.
    pub references: usize,
    /// Sum of the sizes of every reference.
    pub logical_size: u64,
    /// Bytes physically stored for the referenced objects.
    pub physical_size: u64,
    pub space_saved: u64,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("primary", &self.inner.primary.root())
            .field(
                "installation",
                &self.inner.installation.as_ref().map(|pool| pool.root()),
            )
            .finish()
    }
}

impl ObjectStore {
    /// Validate `config` and open (or initialize) every configured pool.
    pub fn open(config: CasConfiguration) -> Result<Self> {
        config.validate()?;

        let primary = Pool::open_or_init(CasPool::Primary, &config.pools.primary, config.algorithm)?;
        let installation = config
            .pools
            .installation
            .as_deref()
            .map(|root| Pool::open_or_init(CasPool::Installation, root, config.algorithm))
            .transpose()?;

        let write_permits = Semaphore::new(config.limits.max_concurrent_operations);
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                primary,
                installation,
                write_permits,
                hash_locks: DashMap::default(),
            }),
        })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &CasConfiguration {
        &self.inner.config
    }

    /// Returns true if `pool` has a root configured.
    pub fn has_pool(&self, pool: CasPool) -> bool {
        match pool {
            CasPool::Primary => true,
            CasPool::Installation => self.inner.installation.is_some(),
        }
    }

    pub(crate) fn pool(&self, pool: CasPool) -> Result<&Pool> {
        match pool {
            CasPool::Primary => Ok(&self.inner.primary),
            CasPool::Installation => self
                .inner
                .installation
                .as_ref()
                .ok_or(Error::PoolUnavailable { pool }),
        }
    }

    /// Root directory of `pool`.
    pub fn pool_root(&self, pool: CasPool) -> Result<&Path> {
        Ok(self.pool(pool)?.root())
    }

    /// Path an object with `hash` has (or would have) in `pool`.
    pub fn object_path(&self, hash: &ContentHash, pool: CasPool) -> Result<PathBuf> {
        Ok(self.pool(pool)?.object_path(hash))
    }

    /// Returns the path of the stored object, or `None` if it is not in `pool`.
    pub fn get_path(&self, hash: &ContentHash, pool: CasPool) -> Option<PathBuf> {
        let path = self.pool(pool).ok()?.object_path(hash);
        path.is_file().then_some(path)
    }

    /// Returns true if `pool` holds an object for `hash`.
    pub fn exists(&self, hash: &ContentHash, pool: CasPool) -> bool {
        self.get_path(hash, pool).is_some()
    }

    /// Metadata of a stored object.
    pub fn object(&self, hash: &ContentHash, pool: CasPool) -> Result<Option<CasObject>> {
        self.pool(pool)?.object_info(hash)
    }

    /// Every object stored in `pool`, ordered by hash.
    pub fn objects(&self, pool: CasPool) -> Result<Vec<CasObject>> {
        let pool_ref = self.pool(pool)?;
        let mut objects = Vec::new();
        for (hash, _) in pool_ref.list_objects()? {
            // Objects may vanish between listing and stat when a sweep runs.
            if let Some(object) = pool_ref.object_info(&hash)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Create an empty temporary file inside `pool`, suitable for
    /// [`import_verified`](Self::import_verified).
    pub fn temp_path(&self, pool: CasPool) -> Result<TempPath> {
        let pool_ref = self.pool(pool)?;
        let temp = tempfile::Builder::new()
            .prefix("incoming-")
            .tempfile_in(pool_ref.tmp_dir())?;
        Ok(temp.into_temp_path())
    }

    /// Store the contents of the file at `path`.
    pub async fn store_file(&self, path: &Path, pool: CasPool) -> Result<ContentHash> {
        let mut file = fs_err::tokio::File::open(path).await?;
        self.store_reader(&mut file, pool).await
    }

    /// Store an in-memory buffer.
    pub async fn store_bytes(&self, bytes: &[u8], pool: CasPool) -> Result<ContentHash> {
        let mut reader = bytes;
        self.store_reader(&mut reader, pool).await
    }

    /// Stream `reader` into `pool`, hashing while writing.
    ///
    /// Storing content that is already present is not an error: the temporary
    /// write is discarded and the existing object is returned unchanged.
    pub async fn store_reader<R>(&self, reader: &mut R, pool: CasPool) -> Result<ContentHash>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pool_ref = self.pool(pool)?;
        let _permit = self
            .inner
            .write_permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let temp = tempfile::Builder::new()
            .prefix("write-")
            .tempfile_in(pool_ref.tmp_dir())?;
        let (file, temp_path) = temp.into_parts();

        let mut writer = HashingWriter::new(tokio::fs::File::from_std(file));
        tokio::io::copy(reader, &mut writer).await?;
        writer.flush().await?;
        let (file, hash, size) = writer.finalize();
        drop(file);

        let lock = self.lock_hash(pool, hash).await;
        self.promote_locked(pool_ref, temp_path, hash, size, &lock)
            .await?;
        Ok(hash)
    }

    /// Promote a file that was written into [`temp_path`](Self::temp_path) if
    /// it hashes to `expected`.
    ///
    /// On mismatch nothing is stored and the temporary file is removed.
    pub async fn import_verified(
        &self,
        temp: TempPath,
        pool: CasPool,
        expected: ContentHash,
    ) -> Result<PathBuf> {
        let pool_ref = self.pool(pool)?;
        let _permit = self
            .inner
            .write_permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let (hash, size) = verify_temp(&temp, &expected).await?;
        let lock = self.lock_hash(pool, hash).await;
        self.promote_locked(pool_ref, temp, hash, size, &lock).await
    }

    /// Return the object for `hash`, calling `fetch` to produce it if it is not stored yet.
    ///
    /// `fetch` receives a temporary path inside the pool and must write the
    /// content there. Concurrent calls for the same hash are coalesced: only
    /// one `fetch` runs and the others observe its result. Fetched content is
    /// verified against `hash` before it becomes visible.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        hash: ContentHash,
        pool: CasPool,
        fetch: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pool_ref = self.pool(pool)?;

        {
            let _lock = self.lock_hash(pool, hash).await;
            if let Some(path) = self.touch_existing(pool_ref, &hash)? {
                return Ok(path);
            }
        }

        // Permit first, then the hash lock.
        let _permit = self
            .inner
            .write_permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let lock = self.lock_hash(pool, hash).await;
        if let Some(path) = self.touch_existing(pool_ref, &hash)? {
            return Ok(path);
        }

        let temp = self.temp_path(pool)?;
        fetch(temp.to_path_buf()).await?;
        let (hash, size) = verify_temp(&temp, &hash).await?;
        self.promote_locked(pool_ref, temp, hash, size, &lock).await
    }

    /// Remove an object. Only the garbage collector deletes objects.
    ///
    /// `retain` is called with the object path while the hash lock is held
    /// and can veto the deletion. Returns the number of bytes freed, or `None`
    /// if the object was absent or retained.
    pub(crate) async fn delete<F>(
        &self,
        hash: &ContentHash,
        pool: CasPool,
        retain: F,
    ) -> Result<Option<u64>>
    where
        F: FnOnce(&Path) -> Result<bool>,
    {
        let pool_ref = self.pool(pool)?;
        let _lock = self.lock_hash(pool, *hash).await;
        if retain(pool_ref.object_path(hash).as_path())? {
            return Ok(None);
        }
        remove_object(pool_ref, hash)
    }

    /// Move an object out of `objects/` into the pool's quarantine directory.
    ///
    /// The object stops counting against the pool size. Returns the new
    /// location, or `None` if the object was absent.
    pub(crate) async fn quarantine(
        &self,
        hash: &ContentHash,
        pool: CasPool,
    ) -> Result<Option<PathBuf>> {
        let pool_ref = self.pool(pool)?;
        let _lock = self.lock_hash(pool, *hash).await;
        let path = pool_ref.object_path(hash);
        let size = match fs_err::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let destination = quarantine_file(pool_ref, &hash.to_hex())?;
        fs_err::rename(&path, &destination)?;
        pool_ref.sub_size(size);
        tracing::warn!(
            "quarantined {} from {} pool to {}",
            hash,
            pool,
            destination.display()
        );
        Ok(Some(destination))
    }

    /// Take the per-hash lock of `hash` in `pool`.
    async fn lock_hash(&self, pool: CasPool, hash: ContentHash) -> HashLock<'_> {
        let key = (pool, hash);
        let mutex = self.inner.hash_locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        HashLock {
            locks: &self.inner.hash_locks,
            key,
            guard: Some(guard),
        }
    }

    /// Current statistics of `pool`.
    pub fn stats(&self, pool: CasPool) -> Result<CasStats> {
        let pool_ref = self.pool(pool)?;
        let objects = self.objects(pool)?;
        let hits = pool_ref.counters.hits.load(Ordering::SeqCst);
        let misses = pool_ref.counters.misses.load(Ordering::SeqCst);
        let lookups = hits + misses;

        Ok(CasStats {
            pool,
            object_count: objects.len(),
            total_size: objects.iter().map(|object| object.size_bytes).sum(),
            space_saved: pool_ref.counters.bytes_deduplicated.load(Ordering::SeqCst),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        })
    }

    /// Compare the logical size referenced by `manifests` with what `pool` physically stores.
    pub fn reference_stats<'a>(
        &self,
        pool: CasPool,
        manifests: impl IntoIterator<Item = &'a ContentManifest>,
    ) -> Result<ReferenceStats> {
        let pool_ref = self.pool(pool)?;
        let mut references = 0;
        let mut logical_size = 0;
        let mut physical_size = 0;
        let mut seen = HashSet::new();

        for manifest in manifests {
            for hash in manifest.files().iter().filter_map(|file| file.content_hash) {
                let Some(object) = pool_ref.object_info(&hash)? else {
                    continue;
                };
                references += 1;
                logical_size += object.size_bytes;
                if seen.insert(hash) {
                    physical_size += object.size_bytes;
                }
            }
        }

        Ok(ReferenceStats {
            pool,
            references,
            logical_size,
            physical_size,
            space_saved: logical_size - physical_size,
        })
    }

    /// Refresh and return an existing object. Must be called with the hash lock held.
    fn touch_existing(&self, pool: &Pool, hash: &ContentHash) -> Result<Option<PathBuf>> {
        let path = pool.object_path(hash);
        let metadata = match fs_err::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        touch(&path)?;
        record_hit(pool, metadata.len());
        Ok(Some(path))
    }

    /// Move a fully written temporary file onto its object path.
    async fn promote_locked(
        &self,
        pool: &Pool,
        temp: TempPath,
        hash: ContentHash,
        size: u64,
        _lock: &HashLock<'_>,
    ) -> Result<PathBuf> {
        if let Some(path) = self.touch_existing(pool, &hash)? {
            tracing::trace!("{} already stored in {} pool", hash, pool.kind());
            return Ok(path);
        }

        // Reserved before the rename so concurrent writers of other hashes see it.
        let limit = self.inner.config.limits.max_total_size;
        if let Err(requested) = pool.reserve(size, limit) {
            return Err(Error::PoolFull {
                pool: pool.kind(),
                requested,
                limit,
            });
        }

        let path = pool.object_path(&hash);
        let destination = path.clone();
        let persisted = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs_err::set_permissions(&*temp, std::fs::Permissions::from_mode(0o644))?;
            }

            let mut temp = temp;
            let mut attempts = 0;
            loop {
                if let Some(parent) = destination.parent() {
                    fs_err::create_dir_all(parent)?;
                }
                match temp.persist_noclobber(&destination) {
                    Ok(()) => return Ok(()),
                    // A sweep may remove the shard directory once it is empty.
                    Err(e) if e.error.kind() == std::io::ErrorKind::NotFound && attempts < 3 => {
                        attempts += 1;
                        temp = e.path;
                    }
                    Err(e) => return Err(e.error),
                }
            }
        })
        .await;

        match persisted {
            Ok(Ok(())) => {
                pool.counters.misses.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("stored {} ({} bytes) in {} pool", hash, size, pool.kind());
                Ok(path)
            }
            // Another process promoted the same content first.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                pool.sub_size(size);
                record_hit(pool, size);
                Ok(path)
            }
            Ok(Err(e)) => {
                pool.sub_size(size);
                Err(e.into())
            }
            Err(e) => {
                pool.sub_size(size);
                Err(e.into())
            }
        }
    }
}

/// Hash a temporary file and compare it to `expected`.
async fn verify_temp(temp: &TempPath, expected: &ContentHash) -> Result<(ContentHash, u64)> {
    let path: &Path = temp.as_ref();
    let actual = ContentHash::hash_file_async(path).await?;
    if actual != *expected {
        return Err(Error::hash_mismatch(
            format!("content fetched for {}", expected),
            expected,
            actual,
        ));
    }
    let size = fs_err::metadata(path)?.len();
    Ok((actual, size))
}

fn record_hit(pool: &Pool, size: u64) {
    pool.counters.hits.fetch_add(1, Ordering::SeqCst);
    pool.counters
        .bytes_deduplicated
        .fetch_add(size, Ordering::SeqCst);
}

/// Mark an object as recently used so the collector grants it a fresh grace period.
fn touch(path: &Path) -> Result<()> {
    filetime::set_file_mtime(path, filetime::FileTime::now())?;
    Ok(())
}

/// A fresh path named after `name` inside the quarantine directory of `pool`.
pub(crate) fn quarantine_file(pool: &Pool, name: &str) -> Result<PathBuf> {
    let dir = pool.quarantine_dir();
    fs_err::create_dir_all(&dir)?;
    let mut destination = dir.join(name);
    let mut n = 1;
    while destination.exists() {
        destination = dir.join(format!("{}.{}", name, n));
        n += 1;
    }
    Ok(destination)
}

/// Remove an object file. Must be called with the hash lock held.
fn remove_object(pool: &Pool, hash: &ContentHash) -> Result<Option<u64>> {
    let path = pool.object_path(hash);
    let size = match fs_err::metadata(&path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match fs_err::remove_file(&path) {
        Ok(()) => {
            pool.sub_size(size);
            Ok(Some(size))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
