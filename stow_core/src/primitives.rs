//! File primitives: the narrow boundary to the operating system.
//!
//! The materializer decides which action to attempt and in what order; the
//! primitives only perform it. Tests and platforms with special needs swap in
//! their own [`FilePrimitives`] implementation.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::strategy::{PlacementAction, PlatformCapabilities};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Receives progress of a download.
pub trait DownloadReporter: Send + Sync {
    /// Called once the response headers arrived.
    fn on_download_start(&self, _url: &Url, _total_bytes: Option<u64>) {}

    /// Called with the running total after each chunk.
    fn on_download_progress(&self, _url: &Url, _bytes_downloaded: u64) {}

    fn on_download_complete(&self, _url: &Url) {}
}

/// Filesystem and network operations used by the materializer.
#[async_trait]
pub trait FilePrimitives: Send + Sync {
    /// Copy `src` to `dst`, replacing `dst`. Returns the number of bytes copied.
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// Create a symbolic link at `link` pointing to `target`.
    ///
    /// With `allow_fallback`, a failed link is replaced by a copy. Returns the
    /// action that was actually performed.
    async fn symlink(&self, link: &Path, target: &Path, allow_fallback: bool)
    -> Result<PlacementAction>;

    /// Create a hard link at `link` to `target`.
    async fn hardlink(&self, link: &Path, target: &Path) -> Result<()>;

    /// Download `url` into `dst`, truncating it first. Returns the number of bytes written.
    async fn download(
        &self,
        url: &Url,
        dst: &Path,
        reporter: Option<&dyn DownloadReporter>,
    ) -> Result<u64>;

    async fn hash(&self, path: &Path) -> Result<ContentHash> {
        ContentHash::hash_file_async(path).await
    }

    async fn verify_hash(&self, path: &Path, expected: &ContentHash) -> Result<bool> {
        Ok(self.hash(path).await? == *expected)
    }

    /// Find out which link kinds work inside `dir`.
    async fn probe_capabilities(&self, dir: &Path) -> PlatformCapabilities;
}

/// Produces the patched content of a file.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    /// Write the result of applying `patch` to `original` (if it exists) into `output`.
    async fn apply(&self, original: Option<&Path>, patch: &Path, output: &Path) -> Result<()>;
}

/// Treats the patch payload as the complete new content of the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplacePatchApplier;

#[async_trait]
impl PatchApplier for ReplacePatchApplier {
    async fn apply(&self, _original: Option<&Path>, patch: &Path, output: &Path) -> Result<()> {
        fs_err::tokio::copy(patch, output)
            .await
            .map_err(|e| Error::patch(output, e.to_string()))?;
        Ok(())
    }
}

/// [`FilePrimitives`] backed by the local filesystem and `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct LocalFilePrimitives {
    client: reqwest::Client,
}

impl LocalFilePrimitives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download_http(
        &self,
        url: &Url,
        dst: &Path,
        reporter: Option<&dyn DownloadReporter>,
    ) -> Result<u64> {
        let download_error = |source| Error::Download {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(download_error)?;

        if let Some(reporter) = reporter {
            reporter.on_download_start(url, response.content_length());
        }

        let mut file = fs_err::tokio::File::create(dst).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(reporter) = reporter {
                reporter.on_download_progress(url, written);
            }
        }
        file.flush().await?;

        if let Some(reporter) = reporter {
            reporter.on_download_complete(url);
        }
        Ok(written)
    }
}

#[async_trait]
impl FilePrimitives for LocalFilePrimitives {
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        fs_err::tokio::copy(src, dst)
            .await
            .map_err(|e| Error::failed_to_place(PlacementAction::Copy, dst, e))
    }

    async fn symlink(
        &self,
        link: &Path,
        target: &Path,
        allow_fallback: bool,
    ) -> Result<PlacementAction> {
        let (link_owned, target_owned) = (link.to_path_buf(), target.to_path_buf());
        let linked = tokio::task::spawn_blocking(move || symlink(&target_owned, &link_owned)).await?;

        match linked {
            Ok(()) => Ok(PlacementAction::Symlink),
            Err(e) if allow_fallback => {
                tracing::debug!("symlink {} failed ({}), copying instead", link.display(), e);
                self.copy(target, link).await?;
                Ok(PlacementAction::Copy)
            }
            Err(e) => Err(Error::failed_to_place(PlacementAction::Symlink, link, e)),
        }
    }

    async fn hardlink(&self, link: &Path, target: &Path) -> Result<()> {
        fs_err::tokio::hard_link(target, link)
            .await
            .map_err(|e| Error::failed_to_place(PlacementAction::HardLink, link, e))
    }

    async fn download(
        &self,
        url: &Url,
        dst: &Path,
        reporter: Option<&dyn DownloadReporter>,
    ) -> Result<u64> {
        match url.scheme() {
            "http" | "https" => self.download_http(url, dst, reporter).await,
            "file" => {
                let src = url.to_file_path().map_err(|()| Error::UnsupportedUrl {
                    url: url.to_string(),
                })?;
                let total = fs_err::tokio::metadata(&src).await?.len();
                if let Some(reporter) = reporter {
                    reporter.on_download_start(url, Some(total));
                }
                let written = fs_err::tokio::copy(src, dst).await?;
                if let Some(reporter) = reporter {
                    reporter.on_download_progress(url, written);
                    reporter.on_download_complete(url);
                }
                Ok(written)
            }
            _ => Err(Error::UnsupportedUrl {
                url: url.to_string(),
            }),
        }
    }

    async fn probe_capabilities(&self, dir: &Path) -> PlatformCapabilities {
        let dir = dir.to_path_buf();
        let probed = tokio::task::spawn_blocking(move || probe(&dir)).await;
        match probed {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(e)) => {
                tracing::debug!("capability probe failed ({}), assuming links work", e);
                PlatformCapabilities::default()
            }
            Err(e) => {
                tracing::debug!("capability probe did not finish: {}", e);
                PlatformCapabilities::default()
            }
        }
    }
}

/// Try both link kinds inside a scratch directory under `dir`.
fn probe(dir: &Path) -> std::io::Result<PlatformCapabilities> {
    let scratch = tempfile::Builder::new().prefix(".stow-probe-").tempdir_in(dir)?;
    let source: PathBuf = scratch.path().join("source");
    fs_err::write(&source, b"probe")?;

    Ok(PlatformCapabilities {
        symlinks: symlink(&source, &scratch.path().join("symlink")).is_ok(),
        hard_links: fs_err::hard_link(&source, scratch.path().join("hardlink")).is_ok(),
    })
}

fn symlink(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    #[cfg(windows)]
    return fs_err::os::windows::fs::symlink_file(source_path, destination_path);
    #[cfg(unix)]
    return fs_err::os::unix::fs::symlink(source_path, destination_path);
}
