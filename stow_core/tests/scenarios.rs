//! End-to-end scenarios across the store, materializer, collector and validator.

#![cfg(unix)]

use assert_matches::assert_matches;
use async_trait::async_trait;
use filetime::FileTime;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use stow_core::{
    CasConfiguration, CasPool, ContentHash, DownloadReporter, Error, ErrorCategory, FilePrimitives,
    FileStage, GarbageCollector, GcOptions, IssueKind, LiveSet, ManifestBuilder, ManifestFile,
    Materializer, ObjectStore, PlacementAction, PlatformCapabilities, Result, ValidationOptions,
    Validator, WorkspaceStrategy,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Serves downloads from memory and can refuse links like a restricted or
/// cross-volume filesystem would.
#[derive(Default)]
struct FakePrimitives {
    downloads: HashMap<Url, Vec<u8>>,
    /// Number of times each URL fails with a transient error before it succeeds.
    flaky: HashMap<Url, usize>,
    refuse_symlinks: bool,
    refuse_hard_links: bool,
    download_calls: AtomicUsize,
    /// Time each copy takes, so overlapping copies can be counted.
    copy_delay: Option<Duration>,
    copies_in_flight: AtomicUsize,
    max_copies_in_flight: AtomicUsize,
}

impl FakePrimitives {
    fn serve(mut self, url: &Url, bytes: &[u8]) -> Self {
        self.downloads.insert(url.clone(), bytes.to_vec());
        self
    }

    fn flaky(mut self, url: &Url, failures: usize) -> Self {
        self.flaky.insert(url.clone(), failures);
        self
    }

    fn refuse_symlinks(mut self) -> Self {
        self.refuse_symlinks = true;
        self
    }

    fn refuse_hard_links(mut self) -> Self {
        self.refuse_hard_links = true;
        self
    }

    fn slow_copies(mut self, delay: Duration) -> Self {
        self.copy_delay = Some(delay);
        self
    }

    fn max_copies_in_flight(&self) -> usize {
        self.max_copies_in_flight.load(Ordering::SeqCst)
    }

    fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

fn refused(what: &str) -> Error {
    Error::Io {
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, what.to_string()),
    }
}

#[async_trait]
impl FilePrimitives for FakePrimitives {
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        let Some(delay) = self.copy_delay else {
            return Ok(std::fs::copy(src, dst)?);
        };
        let now = self.copies_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_copies_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        let copied = std::fs::copy(src, dst);
        self.copies_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(copied?)
    }

    async fn symlink(
        &self,
        link: &Path,
        target: &Path,
        allow_fallback: bool,
    ) -> Result<PlacementAction> {
        if self.refuse_symlinks {
            if allow_fallback {
                self.copy(target, link).await?;
                return Ok(PlacementAction::Copy);
            }
            return Err(refused("symlinks are not permitted"));
        }
        std::os::unix::fs::symlink(target, link)?;
        Ok(PlacementAction::Symlink)
    }

    async fn hardlink(&self, link: &Path, target: &Path) -> Result<()> {
        if self.refuse_hard_links {
            return Err(refused("source is on another volume"));
        }
        std::fs::hard_link(target, link)?;
        Ok(())
    }

    async fn download(
        &self,
        url: &Url,
        dst: &Path,
        _reporter: Option<&dyn DownloadReporter>,
    ) -> Result<u64> {
        let call = self.download_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.flaky.get(url).copied().unwrap_or(0) {
            return Err(Error::Io {
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            });
        }
        let bytes = self.downloads.get(url).ok_or_else(|| Error::UnsupportedUrl {
            url: url.to_string(),
        })?;
        std::fs::write(dst, bytes)?;
        Ok(bytes.len() as u64)
    }

    // Refusals surface per file, like a cross-volume link no capability check can foresee.
    async fn probe_capabilities(&self, _dir: &Path) -> PlatformCapabilities {
        PlatformCapabilities::default()
    }
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn open_store(temp_dir: &TempDir) -> ObjectStore {
    ObjectStore::open(CasConfiguration::new(temp_dir.path().join("cas"))).unwrap()
}

fn set_age(path: &Path, age: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, mtime).unwrap();
}

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::test]
async fn test_identical_downloads_are_stored_once() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let content = b"shared texture atlas";
    let hash = ContentHash::hash_bytes(content);
    let mirror_a = url("https://mirror-a.example/atlas.pak");
    let mirror_b = url("https://mirror-b.example/atlas.pak");
    let primitives = Arc::new(
        FakePrimitives::default()
            .serve(&mirror_a, content)
            .serve(&mirror_b, content),
    );

    let manifest = ManifestBuilder::new("pack", "1")
        .file(ManifestFile::remote("mods/a/atlas.pak", mirror_a, hash))
        .file(ManifestFile::remote("mods/b/atlas.pak", mirror_b, hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store.clone(), primitives.clone())
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(store.objects(CasPool::Primary).unwrap().len(), 1);
    assert!(store.exists(&hash, CasPool::Primary));
    assert_eq!(primitives.download_calls(), 1);
    assert_eq!(std::fs::read(target.join("mods/a/atlas.pak")).unwrap(), content);
    assert_eq!(std::fs::read(target.join("mods/b/atlas.pak")).unwrap(), content);
}

#[tokio::test]
async fn test_generated_file_only_creates_its_directory() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let manifest = ManifestBuilder::new("saves", "1")
        .file(ManifestFile::new(
            "saves/slot1.sav",
            stow_core::SourceType::Generated,
        ))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store.clone(), Arc::new(FakePrimitives::default()))
        .materialize(
            &manifest,
            &target,
            WorkspaceStrategy::HybridSymlink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let outcome = result.get("saves/slot1.sav").unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.action_taken, None);
    assert!(target.join("saves").is_dir());
    assert!(!target.join("saves/slot1.sav").exists());
    assert!(store.objects(CasPool::Primary).unwrap().is_empty());
}

#[tokio::test]
async fn test_download_with_wrong_content_stores_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let declared = ContentHash::hash_bytes(b"what the manifest promised");
    let source = url("https://cdn.example/patch.bin");
    let primitives = Arc::new(FakePrimitives::default().serve(&source, b"what the server sent"));

    let manifest = ManifestBuilder::new("pack", "1")
        .file(ManifestFile::remote("patch.bin", source, declared))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store.clone(), primitives)
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = result.get("patch.bin").unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.stage, FileStage::Acquiring);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Integrity)
    );
    assert!(!store.exists(&declared, CasPool::Primary));
    assert!(store.objects(CasPool::Primary).unwrap().is_empty());
    assert!(!target.join("patch.bin").exists());
}

#[tokio::test]
async fn test_young_unreferenced_object_survives_gc() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let hash = store.store_bytes(b"orphan", CasPool::Primary).await.unwrap();
    set_age(&store.get_path(&hash, CasPool::Primary).unwrap(), HOUR);

    let stats = GarbageCollector::new(store.clone())
        .with_grace_period(7 * DAY)
        .unwrap()
        .collect(
            CasPool::Primary,
            &LiveSet::new(),
            GcOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.objects_deleted, 0);
    assert_eq!(stats.retained_young, 1);
    assert!(store.exists(&hash, CasPool::Primary));
}

#[tokio::test]
async fn test_gc_deletes_only_expired_garbage() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let garbage = store.store_bytes(b"old and unused", CasPool::Primary).await.unwrap();
    let live = store.store_bytes(b"old but used", CasPool::Primary).await.unwrap();
    let fresh = store.store_bytes(b"just written", CasPool::Primary).await.unwrap();
    for hash in [garbage, live] {
        set_age(&store.get_path(&hash, CasPool::Primary).unwrap(), 8 * DAY);
    }

    let manifest = ManifestBuilder::new("profile", "1")
        .file(ManifestFile::from_cas("data/used.bin", live))
        .build()
        .unwrap();
    let stats = GarbageCollector::new(store.clone())
        .with_grace_period(7 * DAY)
        .unwrap()
        .collect(
            CasPool::Primary,
            &LiveSet::from_manifests([&manifest]),
            GcOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.objects_deleted, 1);
    assert_eq!(stats.bytes_freed, b"old and unused".len() as u64);
    assert!(!store.exists(&garbage, CasPool::Primary));
    assert!(store.exists(&live, CasPool::Primary));
    assert!(store.exists(&fresh, CasPool::Primary));
}

#[tokio::test]
async fn test_hard_link_falls_back_to_copy() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let hash = store.store_bytes(b"level geometry", CasPool::Primary).await.unwrap();
    let manifest = ManifestBuilder::new("maps", "1")
        .file(ManifestFile::from_cas("maps/level1.bsp", hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let primitives = Arc::new(FakePrimitives::default().refuse_hard_links());
    let result = Materializer::new(store, primitives)
        .materialize(&manifest, &target, WorkspaceStrategy::HardLink, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = result.get("maps/level1.bsp").unwrap();
    assert!(outcome.success);
    assert!(outcome.is_degraded());
    assert_eq!(outcome.preferred, Some(PlacementAction::HardLink));
    assert_eq!(outcome.action_taken, Some(PlacementAction::Copy));
    assert_eq!(outcome.fallbacks.len(), 1);
    assert_eq!(outcome.fallbacks[0].action, PlacementAction::HardLink);
    assert_eq!(result.degraded().count(), 1);

    let placed = target.join("maps/level1.bsp");
    assert!(!placed.is_symlink());
    assert_eq!(std::fs::read(placed).unwrap(), b"level geometry");
}

#[tokio::test]
async fn test_full_symlink_walks_the_whole_chain() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let hash = store.store_bytes(b"music", CasPool::Primary).await.unwrap();
    let manifest = ManifestBuilder::new("audio", "1")
        .file(ManifestFile::from_cas("audio/theme.ogg", hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let primitives = Arc::new(FakePrimitives::default().refuse_symlinks().refuse_hard_links());
    let result = Materializer::new(store, primitives)
        .materialize(&manifest, &target, WorkspaceStrategy::FullSymlink, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = result.get("audio/theme.ogg").unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.action_taken, Some(PlacementAction::Copy));
    let attempted: Vec<_> = outcome.fallbacks.iter().map(|f| f.action).collect();
    assert_eq!(attempted, vec![PlacementAction::Symlink, PlacementAction::HardLink]);
}

#[tokio::test]
async fn test_unsupported_symlinks_are_reported_as_fallbacks() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let hash = store.store_bytes(b"sprites", CasPool::Primary).await.unwrap();
    let manifest = ManifestBuilder::new("gfx", "1")
        .file(ManifestFile::from_cas("gfx/sprites.png", hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    // The fake would happily create symlinks; the declared capabilities forbid them.
    let result = Materializer::new(store, Arc::new(FakePrimitives::default()))
        .with_capabilities(PlatformCapabilities {
            symlinks: false,
            hard_links: true,
        })
        .materialize(&manifest, &target, WorkspaceStrategy::FullSymlink, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = result.get("gfx/sprites.png").unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.preferred, Some(PlacementAction::Symlink));
    assert_eq!(outcome.action_taken, Some(PlacementAction::HardLink));
    assert_eq!(outcome.fallbacks.len(), 1);
    assert_eq!(outcome.fallbacks[0].action, PlacementAction::Symlink);
    assert_eq!(outcome.fallbacks[0].error.category, ErrorCategory::Io);
    assert!(outcome.fallbacks[0].error.message.contains("not supported"));
    assert!(outcome.is_degraded());
    assert_eq!(result.degraded().count(), 1);
    assert!(!target.join("gfx/sprites.png").is_symlink());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_limit_bounds_parallel_placements() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let mut builder = ManifestBuilder::new("bulk", "1");
    for i in 0..12u8 {
        let hash = store.store_bytes(&[i; 64], CasPool::Primary).await.unwrap();
        builder = builder.file(ManifestFile::from_cas(format!("bulk/{}.bin", i), hash));
    }
    let manifest = builder.build().unwrap();

    let target = temp_dir.path().join("workspace");
    let primitives = Arc::new(FakePrimitives::default().slow_copies(Duration::from_millis(20)));
    let result = Materializer::new(store, primitives.clone())
        .with_max_workers(2)
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.succeeded().count(), 12);
    let peak = primitives.max_copies_in_flight();
    assert!((1..=2).contains(&peak), "{} copies overlapped", peak);
}

#[tokio::test]
async fn test_symlink_only_fails_without_symlinks() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let hash = store.store_bytes(b"config", CasPool::Primary).await.unwrap();
    let manifest = ManifestBuilder::new("cfg", "1")
        .file(ManifestFile::from_cas("cfg/game.ini", hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let primitives = Arc::new(FakePrimitives::default().refuse_symlinks());
    let result = Materializer::new(store, primitives)
        .materialize(&manifest, &target, WorkspaceStrategy::SymlinkOnly, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = result.get("cfg/game.ini").unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.stage, FileStage::Placing);
    assert_eq!(outcome.fallbacks.len(), 1);
    assert!(!target.join("cfg/game.ini").exists());
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_transient_download_failure_is_retried() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let content = b"sound bank";
    let hash = ContentHash::hash_bytes(content);
    let source = url("https://cdn.example/sounds.bank");
    let primitives = Arc::new(FakePrimitives::default().serve(&source, content).flaky(&source, 1));

    let manifest = ManifestBuilder::new("audio", "1")
        .file(ManifestFile::remote("sounds.bank", source, hash))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store.clone(), primitives.clone())
        .with_download_retries(2)
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(primitives.download_calls(), 2);
    assert!(store.exists(&hash, CasPool::Primary));
}

#[tokio::test]
async fn test_unknown_url_fails_only_that_file() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let good = url("https://cdn.example/good.bin");
    let primitives = Arc::new(FakePrimitives::default().serve(&good, b"good"));

    let manifest = ManifestBuilder::new("pack", "1")
        .file(ManifestFile::remote("good.bin", good, ContentHash::hash_bytes(b"good")))
        .file(ManifestFile::remote(
            "gone.bin",
            url("https://cdn.example/gone.bin"),
            ContentHash::hash_bytes(b"gone"),
        ))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store, primitives)
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.succeeded().count(), 1);
    assert_eq!(result.failed().count(), 1);
    let failed = result.get("gone.bin").unwrap();
    assert_eq!(
        failed.error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Network)
    );
    assert!(target.join("good.bin").exists());
}

#[tokio::test]
async fn test_conflicting_entries_fail_that_path() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let first = store.store_bytes(b"v1", CasPool::Primary).await.unwrap();
    let second = store.store_bytes(b"v2", CasPool::Primary).await.unwrap();
    let other = store.store_bytes(b"other", CasPool::Primary).await.unwrap();

    let manifest = ManifestBuilder::new("pack", "1")
        .file(ManifestFile::from_cas("data/file.bin", first))
        .file(ManifestFile::from_cas("data/file.bin", second))
        .file(ManifestFile::from_cas("data/other.bin", other))
        .build()
        .unwrap();

    let target = temp_dir.path().join("workspace");
    let result = Materializer::new(store, Arc::new(FakePrimitives::default()))
        .materialize(&manifest, &target, WorkspaceStrategy::FullCopy, &CancellationToken::new())
        .await
        .unwrap();

    let conflict = result.get("data/file.bin").unwrap();
    assert!(!conflict.success);
    assert_eq!(conflict.stage, FileStage::Resolving);
    assert_eq!(
        conflict.error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Conflict)
    );
    assert!(!target.join("data/file.bin").exists());
    assert!(result.get("data/other.bin").unwrap().success);
}

#[tokio::test]
async fn test_validator_detects_flipped_byte() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let intact = store.store_bytes(b"untouched", CasPool::Primary).await.unwrap();
    let damaged = store.store_bytes(b"bit rot victim", CasPool::Primary).await.unwrap();

    let path = store.get_path(&damaged, CasPool::Primary).unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let result = Validator::new(store)
        .validate(CasPool::Primary, &ValidationOptions::default())
        .await
        .unwrap();

    assert_eq!(result.objects_checked, 2);
    assert!(!result.is_valid());
    assert_eq!(result.issues.len(), 1);
    let issue = &result.issues[0];
    assert_matches!(issue.kind, IssueKind::HashMismatch | IssueKind::CorruptedObject);
    assert_eq!(issue.hash, Some(damaged));
    assert_ne!(issue.hash, Some(intact));
}

#[tokio::test]
async fn test_stored_content_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let samples: [&[u8]; 4] = [b"", b"a", &[0u8; 4096], &[7u8; 200_000]];

    for sample in samples {
        let hash = store.store_bytes(sample, CasPool::Primary).await.unwrap();
        let path = store.get_path(&hash, CasPool::Primary).unwrap();
        assert_eq!(ContentHash::hash_file(&path).unwrap(), ContentHash::hash_bytes(sample));
        assert_eq!(std::fs::read(path).unwrap(), sample);
    }
}
