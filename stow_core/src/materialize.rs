//! Workspace materialization.
//!
//! A run takes a manifest and a target directory and produces one
//! [`PlacementOutcome`] per file. Files move through the stages
//! `Pending -> Resolving -> Acquiring -> Placing -> Verifying -> Done`; a
//! failure at any stage is recorded in the outcome instead of aborting the
//! run. Only an unusable target directory fails the whole call.

use crate::error::{Error, ErrorCategory, FileError, Result};
use crate::hash::ContentHash;
use crate::manifest::{ContentManifest, ManifestFile, SourceType};
use crate::pool::CasPool;
use crate::primitives::{DownloadReporter, FilePrimitives, PatchApplier, ReplacePatchApplier};
use crate::store::ObjectStore;
use crate::strategy::{self, PlacementAction, PlacementPlan, PlatformCapabilities, WorkspaceStrategy};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use retry_policies::policies::ExponentialBackoff;
use retry_policies::{RetryDecision, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempPath;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default number of files placed concurrently.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default number of download retries.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;

/// The stage a file reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStage {
    Pending,
    Resolving,
    Acquiring,
    Placing,
    Verifying,
    Done,
}

/// A placement action that failed before another one was tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackAttempt {
    pub action: PlacementAction,
    pub error: FileError,
}

/// Result of materializing one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementOutcome {
    pub relative_path: PathBuf,
    pub source_type: SourceType,
    /// First action of the placement plan.
    pub preferred: Option<PlacementAction>,
    pub action_taken: Option<PlacementAction>,
    pub fallbacks: Vec<FallbackAttempt>,
    pub success: bool,
    /// Last stage entered; `Done` on success.
    pub stage: FileStage,
    pub error: Option<FileError>,
}

impl PlacementOutcome {
    fn new(file: &ManifestFile, plan: Option<&PlacementPlan>) -> Self {
        Self {
            relative_path: file.normalized_path(),
            source_type: file.source_type,
            preferred: plan.and_then(PlacementPlan::preferred),
            action_taken: None,
            fallbacks: Vec::new(),
            success: false,
            stage: FileStage::Pending,
            error: None,
        }
    }

    fn failed(mut self, stage: FileStage, error: &Error) -> Self {
        self.stage = stage;
        self.error = Some(error.into());
        self
    }

    /// Placed, but not with the preferred action.
    pub fn is_degraded(&self) -> bool {
        self.success && self.action_taken.is_some() && self.action_taken != self.preferred
    }

    pub fn is_cancelled(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|error| error.category == ErrorCategory::Cancelled)
    }
}

/// Outcome of a whole run, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializationResult {
    pub outcomes: BTreeMap<PathBuf, PlacementOutcome>,
    pub cancelled: bool,
}

impl MaterializationResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &PlacementOutcome> {
        self.outcomes.values().filter(|outcome| outcome.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PlacementOutcome> {
        self.outcomes.values().filter(|outcome| !outcome.success)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &PlacementOutcome> {
        self.outcomes.values().filter(|outcome| outcome.is_degraded())
    }

    /// True when every file was placed.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.values().all(|outcome| outcome.success)
    }

    pub fn get(&self, relative_path: impl AsRef<Path>) -> Option<&PlacementOutcome> {
        self.outcomes.get(relative_path.as_ref())
    }
}

/// Where the bytes of a file come from once resolved.
enum Source {
    Path(PathBuf),
    Stored(ContentHash),
    Patch(PathBuf),
}

/// Content ready to be placed.
struct Acquired {
    path: PathBuf,
    hash: Option<ContentHash>,
    /// Keeps a patched result alive until it has been placed.
    _scratch: Option<TempPath>,
}

struct RunContext<'a> {
    target: &'a Path,
    strategy: WorkspaceStrategy,
    capabilities: PlatformCapabilities,
}

/// Places the files of a manifest into a target directory.
#[derive(Clone)]
pub struct Materializer {
    store: ObjectStore,
    primitives: Arc<dyn FilePrimitives>,
    patch_applier: Arc<dyn PatchApplier>,
    reporter: Option<Arc<dyn DownloadReporter>>,
    base_path: Option<PathBuf>,
    max_workers: usize,
    verify_integrity: bool,
    download_retries: u32,
    capabilities: Option<PlatformCapabilities>,
}

impl Materializer {
    pub fn new(store: ObjectStore, primitives: Arc<dyn FilePrimitives>) -> Self {
        let verify_integrity = store.config().verify_integrity;
        Self {
            store,
            primitives,
            patch_applier: Arc::new(ReplacePatchApplier),
            reporter: None,
            base_path: None,
            max_workers: DEFAULT_MAX_WORKERS,
            verify_integrity,
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            capabilities: None,
        }
    }

    /// Directory base installation files are read from.
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    /// Number of times a failed download is retried with exponential backoff.
    pub fn with_download_retries(mut self, retries: u32) -> Self {
        self.download_retries = retries;
        self
    }

    pub fn with_patch_applier(mut self, applier: Arc<dyn PatchApplier>) -> Self {
        self.patch_applier = applier;
        self
    }

    pub fn with_download_reporter(mut self, reporter: Arc<dyn DownloadReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Skip probing the target and assume `capabilities`.
    pub fn with_capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Materialize `manifest` into `target`.
    ///
    /// Per-file failures end up in the returned result. When `cancel` fires,
    /// files that have not started are reported as cancelled while files in
    /// flight are allowed to finish.
    pub async fn materialize(
        &self,
        manifest: &ContentManifest,
        target: &Path,
        strategy: WorkspaceStrategy,
        cancel: &CancellationToken,
    ) -> Result<MaterializationResult> {
        fs_err::tokio::create_dir_all(target).await?;
        let capabilities = match self.capabilities {
            Some(capabilities) => capabilities,
            None => self.primitives.probe_capabilities(target).await,
        };
        tracing::info!(
            "materializing {} {} ({} files) into {} with {} strategy",
            manifest.id(),
            manifest.version(),
            manifest.len(),
            target.display(),
            strategy
        );

        let ctx = RunContext {
            target,
            strategy,
            capabilities,
        };
        let (files, conflicts) = manifest.group_by_path();

        let mut result = MaterializationResult::default();
        for (path, conflict) in &conflicts {
            let error = Error::from(conflict);
            tracing::warn!("{}", error);
            if let Some(file) = manifest.files().iter().find(|f| &f.normalized_path() == path) {
                result.outcomes.insert(
                    path.clone(),
                    PlacementOutcome::new(file, None).failed(FileStage::Resolving, &error),
                );
            }
        }

        let semaphore = Semaphore::new(self.max_workers);
        let (semaphore, ctx) = (&semaphore, &ctx);
        let mut pending: FuturesUnordered<_> = files
            .into_iter()
            .map(move |file| async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire() => permit.ok(),
                };
                match permit {
                    Some(_permit) if !cancel.is_cancelled() => self.process(ctx, file).await,
                    _ => PlacementOutcome::new(file, None).failed(FileStage::Pending, &Error::Cancelled),
                }
            })
            .collect();

        while let Some(outcome) = pending.next().await {
            result.outcomes.insert(outcome.relative_path.clone(), outcome);
        }
        result.cancelled = result.outcomes.values().any(PlacementOutcome::is_cancelled);

        tracing::info!(
            "materialized {}: {} placed, {} degraded, {} failed{}",
            manifest.id(),
            result.succeeded().count(),
            result.degraded().count(),
            result.failed().count(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
        Ok(result)
    }

    async fn process(&self, ctx: &RunContext<'_>, file: &ManifestFile) -> PlacementOutcome {
        let plan = strategy::select(
            ctx.strategy,
            file.source_type,
            ctx.capabilities,
            self.store.has_pool(CasPool::Installation),
        );
        let mut outcome = PlacementOutcome::new(file, Some(&plan));

        match self.run_stages(ctx, file, &plan, &mut outcome).await {
            Ok(()) => {
                outcome.stage = FileStage::Done;
                outcome.success = true;
                if outcome.is_degraded() {
                    tracing::warn!(
                        "{} placed by {} instead of {}",
                        outcome.relative_path.display(),
                        outcome.action_taken.map_or("nothing".to_string(), |a| a.to_string()),
                        outcome.preferred.map_or("nothing".to_string(), |a| a.to_string()),
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "failed to materialize {} while {:?}: {}",
                    outcome.relative_path.display(),
                    outcome.stage,
                    e
                );
                outcome.error = Some(FileError::from(&e));
            }
        }
        outcome
    }

    async fn run_stages(
        &self,
        ctx: &RunContext<'_>,
        file: &ManifestFile,
        plan: &PlacementPlan,
        outcome: &mut PlacementOutcome,
    ) -> Result<()> {
        outcome.stage = FileStage::Resolving;
        file.validate()?;
        let relative_path = file.normalized_path();
        let dest = ctx.target.join(&relative_path);
        let parent = dest.parent().unwrap_or(ctx.target).to_path_buf();

        let source = match file.source_type {
            SourceType::Generated => {
                fs_err::tokio::create_dir_all(&parent).await?;
                return Ok(());
            }
            SourceType::BaseInstallation => {
                let base = self.base_path.as_ref().ok_or_else(|| {
                    Error::invalid_config("no base installation path is configured")
                })?;
                Source::Path(base.join(&relative_path))
            }
            SourceType::LocalFile | SourceType::Extracted => {
                Source::Path(required_source(file)?.to_path_buf())
            }
            SourceType::Patch => Source::Patch(required_source(file)?.to_path_buf()),
            SourceType::Cas | SourceType::RemoteDownload => {
                Source::Stored(file.content_hash.ok_or_else(|| {
                    Error::invalid_manifest(&file.relative_path, "missing content hash")
                })?)
            }
        };

        outcome.stage = FileStage::Acquiring;
        fs_err::tokio::create_dir_all(&parent).await?;
        let acquired = match source {
            Source::Stored(hash) => Acquired {
                path: self.acquire_stored(file, hash, plan.pool).await?,
                hash: Some(hash),
                _scratch: None,
            },
            Source::Path(path) if plan.via_store => {
                let hash = self.store.store_file(&path, plan.pool).await?;
                if let Some(expected) = file.content_hash
                    && expected != hash
                {
                    return Err(Error::hash_mismatch(
                        relative_path.display().to_string(),
                        expected,
                        hash,
                    ));
                }
                Acquired {
                    path: self.store.object_path(&hash, plan.pool)?,
                    hash: Some(hash),
                    _scratch: None,
                }
            }
            Source::Path(path) => {
                fs_err::tokio::metadata(&path).await?;
                Acquired {
                    path,
                    hash: None,
                    _scratch: None,
                }
            }
            Source::Patch(payload) => {
                let scratch = tempfile::Builder::new()
                    .prefix(".stow-patch-")
                    .tempfile_in(&parent)?
                    .into_temp_path();
                let original = dest.is_file().then_some(dest.as_path());
                self.patch_applier.apply(original, &payload, &scratch).await?;
                Acquired {
                    path: scratch.to_path_buf(),
                    hash: None,
                    _scratch: Some(scratch),
                }
            }
        };

        outcome.stage = FileStage::Placing;
        let mut last_error = Error::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no placement action is permitted on this filesystem",
            ),
        };
        for &action in &plan.actions {
            if !plan.is_supported(action) {
                let e = Error::failed_to_place(
                    action,
                    &dest,
                    std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "not supported on the target filesystem",
                    ),
                );
                outcome.fallbacks.push(FallbackAttempt {
                    action,
                    error: FileError::from(&e),
                });
                last_error = e;
                continue;
            }
            match self.place(action, &acquired.path, &dest, &parent, file).await {
                Ok(()) => {
                    outcome.action_taken = Some(action);
                    break;
                }
                Err(e) => {
                    tracing::debug!("{} of {} failed: {}", action, relative_path.display(), e);
                    outcome.fallbacks.push(FallbackAttempt {
                        action,
                        error: FileError::from(&e),
                    });
                    last_error = e;
                }
            }
        }
        if outcome.action_taken.is_none() {
            return Err(last_error);
        }

        let expected = file.content_hash.or(acquired.hash);
        if self.verify_integrity
            && let Some(expected) = expected
        {
            outcome.stage = FileStage::Verifying;
            if !self.primitives.verify_hash(&dest, &expected).await? {
                let actual = self.primitives.hash(&dest).await?;
                let _ = fs_err::tokio::remove_file(&dest).await;
                return Err(Error::hash_mismatch(
                    relative_path.display().to_string(),
                    expected,
                    actual,
                ));
            }
        }
        Ok(())
    }

    /// Return the stored object for `hash`, downloading it first if needed.
    async fn acquire_stored(
        &self,
        file: &ManifestFile,
        hash: ContentHash,
        pool: CasPool,
    ) -> Result<PathBuf> {
        let url = file.download_url.as_ref();
        self.store
            .get_or_fetch(hash, pool, |dest| async move {
                match url {
                    Some(url) => self.download_with_retry(url, &dest).await,
                    None => Err(Error::object_not_found(hash.to_hex())),
                }
            })
            .await
    }

    async fn download_with_retry(&self, url: &Url, dest: &Path) -> Result<()> {
        let policy = ExponentialBackoff::builder().build_with_max_retries(self.download_retries);
        let started = SystemTime::now();
        let mut retries = 0;

        loop {
            tracing::debug!("downloading {} to {}", url, dest.display());
            let err = match self
                .primitives
                .download(url, dest, self.reporter.as_deref())
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            match policy.should_retry(started, retries) {
                RetryDecision::Retry { execute_after } => {
                    let wait = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                    retries += 1;
                    tracing::warn!(
                        "failed to download {}: {}. Retry #{}, sleeping {:?}",
                        url,
                        err,
                        retries,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                RetryDecision::DoNotRetry => {
                    return Err(Error::Io {
                        source: std::io::Error::other(format!(
                            "giving up on {} after {} attempt(s): {}",
                            url,
                            retries + 1,
                            err
                        )),
                    });
                }
            }
        }
    }

    /// Perform `action` on a staging path next to `dest` and rename it into place.
    async fn place(
        &self,
        action: PlacementAction,
        from: &Path,
        dest: &Path,
        parent: &Path,
        file: &ManifestFile,
    ) -> Result<()> {
        let staging = staging_path(parent)?;
        let placed = match action {
            PlacementAction::Symlink => {
                let target = std::path::absolute(from)?;
                self.primitives
                    .symlink(&staging, &target, false)
                    .await
                    .map(|_| ())
            }
            PlacementAction::HardLink => self.primitives.hardlink(&staging, from).await,
            PlacementAction::Copy => match self.primitives.copy(from, &staging).await {
                Ok(_) => apply_permissions(&staging, file).await,
                Err(e) => Err(e),
            },
        };

        let renamed = match placed {
            Ok(()) => fs_err::tokio::rename(&staging, dest)
                .await
                .map_err(|e| Error::failed_to_place(action, dest, e)),
            Err(e) => Err(e),
        };
        if renamed.is_err() {
            let _ = fs_err::tokio::remove_file(&staging).await;
        }
        renamed
    }
}

fn required_source(file: &ManifestFile) -> Result<&Path> {
    file.source_path
        .as_deref()
        .ok_or_else(|| Error::invalid_manifest(&file.relative_path, "missing source path"))
}

/// A fresh, unused path inside `dir`.
fn staging_path(dir: &Path) -> Result<PathBuf> {
    let temp = tempfile::Builder::new()
        .prefix(".stow-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    let path = temp.path().to_path_buf();
    temp.close()?;
    Ok(path)
}

#[cfg(unix)]
async fn apply_permissions(path: &Path, file: &ManifestFile) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match (file.permissions, file.is_executable) {
        (Some(mode), _) => mode,
        (None, true) => fs_err::tokio::metadata(path).await?.permissions().mode() | 0o111,
        (None, false) => return Ok(()),
    };
    fs_err::tokio::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn apply_permissions(_path: &Path, _file: &ManifestFile) -> Result<()> {
    Ok(())
}
