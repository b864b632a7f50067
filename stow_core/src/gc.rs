//! Garbage collection.
//!
//! The collector never discovers manifests itself: callers hand it a
//! [`LiveSet`] of every hash that is still referenced. Objects outside the
//! live set are deleted once they are older than the grace period, measured
//! from the last time they were written or re-stored.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::ContentManifest;
use crate::pool::{CasPool, Pool};
use crate::store::ObjectStore;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The set of hashes referenced by every known manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    hashes: HashSet<ContentHash>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live set of all hashes referenced by `manifests`.
    pub fn from_manifests<'a>(manifests: impl IntoIterator<Item = &'a ContentManifest>) -> Self {
        let mut live = Self::new();
        for manifest in manifests {
            live.add_manifest(manifest);
        }
        live
    }

    pub fn add_manifest(&mut self, manifest: &ContentManifest) {
        self.hashes.extend(manifest.hashes());
    }

    pub fn insert(&mut self, hash: ContentHash) -> bool {
        self.hashes.insert(hash)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentHash> {
        self.hashes.iter()
    }
}

impl FromIterator<ContentHash> for LiveSet {
    fn from_iter<T: IntoIterator<Item = ContentHash>>(iter: T) -> Self {
        Self {
            hashes: iter.into_iter().collect(),
        }
    }
}

impl Extend<ContentHash> for LiveSet {
    fn extend<T: IntoIterator<Item = ContentHash>>(&mut self, iter: T) {
        self.hashes.extend(iter);
    }
}

/// Supplies the live set to the periodic collector.
#[async_trait]
pub trait LiveSetProvider: Send + Sync {
    async fn live_set(&self) -> Result<LiveSet>;
}

/// Options of a single collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOptions {
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub objects_scanned: usize,
    /// Number of objects deleted (or that would be, on a dry run).
    pub objects_deleted: usize,
    pub bytes_freed: u64,
    /// Objects kept because the live set references them.
    pub retained_live: usize,
    /// Unreferenced objects kept because they are inside the grace period.
    pub retained_young: usize,
    pub temp_files_removed: usize,
    /// The run stopped early because its token was cancelled.
    pub cancelled: bool,
}

/// Deletes unreferenced objects from the pools of a store.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    store: ObjectStore,
    grace_period: Duration,
}

impl GarbageCollector {
    /// Collector using the grace period from the store configuration.
    pub fn new(store: ObjectStore) -> Self {
        let grace_period = store.config().gc.grace_period;
        Self {
            store,
            grace_period,
        }
    }

    /// Override the grace period. The period must be positive.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Result<Self> {
        if grace_period.is_zero() {
            return Err(Error::invalid_config("GC grace period must be positive"));
        }
        self.grace_period = grace_period;
        Ok(self)
    }

    /// Sweep `pool`, deleting every object that is neither live nor young.
    ///
    /// Concurrent runs on the same pool queue behind each other; a second run
    /// over an unchanged pool deletes nothing. Cancellation is observed between
    /// objects, so every object is either fully deleted or left untouched.
    pub async fn collect(
        &self,
        pool: CasPool,
        live: &LiveSet,
        options: GcOptions,
        cancel: &CancellationToken,
    ) -> Result<GcStats> {
        let pool_ref = self.store.pool(pool)?;
        let _sweep = pool_ref.sweep_lock.lock().await;
        let mut stats = GcStats::default();

        for (hash, path) in pool_ref.list_objects()? {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            stats.objects_scanned += 1;

            if live.contains(&hash) {
                stats.retained_live += 1;
                continue;
            }
            let Some(size) = self.expired_size(&path)? else {
                stats.retained_young += 1;
                continue;
            };

            if options.dry_run {
                stats.objects_deleted += 1;
                stats.bytes_freed += size;
                continue;
            }

            // A writer may have re-stored the object since it was listed.
            let mut young = false;
            let deleted = self
                .store
                .delete(&hash, pool, |path| {
                    young = self.expired_size(path)?.is_none();
                    Ok(young)
                })
                .await;
            match deleted {
                Ok(Some(freed)) => {
                    tracing::debug!("deleted {} ({} bytes) from {} pool", hash, freed, pool);
                    stats.objects_deleted += 1;
                    stats.bytes_freed += freed;
                }
                Ok(None) if young => stats.retained_young += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to delete {}: {}", hash, e),
            }
        }

        if !stats.cancelled {
            stats.temp_files_removed = self.sweep_temp_files(pool_ref, options.dry_run)?;
            if !options.dry_run {
                remove_empty_shards(pool_ref)?;
            }
        }

        tracing::info!(
            "gc of {} pool: scanned {}, deleted {} ({} bytes), kept {} live and {} young{}",
            pool,
            stats.objects_scanned,
            stats.objects_deleted,
            stats.bytes_freed,
            stats.retained_live,
            stats.retained_young,
            if stats.cancelled { ", cancelled" } else { "" }
        );
        Ok(stats)
    }

    /// Run [`collect`](Self::collect) over every configured pool each
    /// `gc.auto_interval`, until `cancel` fires.
    ///
    /// Returns `None` when no interval is configured.
    pub fn spawn_periodic(
        &self,
        provider: Arc<dyn LiveSetProvider>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let interval = self.store.config().gc.auto_interval?;
        let collector = self.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let live = match provider.live_set().await {
                    Ok(live) => live,
                    Err(e) => {
                        tracing::warn!("skipping scheduled gc, live set unavailable: {}", e);
                        continue;
                    }
                };
                for pool in CasPool::ALL {
                    if !collector.store.has_pool(pool) {
                        continue;
                    }
                    if let Err(e) = collector
                        .collect(pool, &live, GcOptions::default(), &cancel)
                        .await
                    {
                        tracing::warn!("scheduled gc of {} pool failed: {}", pool, e);
                    }
                }
            }
            tracing::debug!("periodic gc stopped");
        }))
    }

    /// Size of the file at `path` if it is older than the grace period.
    fn expired_size(&self, path: &Path) -> Result<Option<u64>> {
        let metadata = match fs_err::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(metadata.modified()?)
            .unwrap_or(Duration::ZERO);
        Ok((age >= self.grace_period).then_some(metadata.len()))
    }

    /// Remove abandoned temporary files left behind by crashed writers.
    fn sweep_temp_files(&self, pool: &Pool, dry_run: bool) -> Result<usize> {
        let mut removed = 0;
        for entry in fs_err::read_dir(pool.tmp_dir())? {
            let path = entry?.path();
            if self.expired_size(&path)?.is_none() {
                continue;
            }
            if !dry_run {
                if let Err(e) = fs_err::remove_file(&path) {
                    tracing::warn!("failed to remove stale temp file: {}", e);
                    continue;
                }
            }
            removed += 1;
        }
        Ok(removed)
    }
}

/// Remove shard directories with no objects left.
fn remove_empty_shards(pool: &Pool) -> Result<()> {
    let objects_dir = pool.objects_dir();
    if !objects_dir.exists() {
        return Ok(());
    }

    for shard_entry in fs_err::read_dir(&objects_dir)? {
        let shard_path = shard_entry?.path();
        if shard_path.is_dir()
            && let Ok(mut entries) = fs_err::read_dir(&shard_path)
            && entries.next().is_none()
        {
            let _ = fs_err::remove_dir(&shard_path);
        }
    }
    Ok(())
}
