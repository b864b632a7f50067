//! # Stow Core
//!
//! A content-addressed object store (CAS) and workspace materializer.
//!
//! File content is stored once per pool, keyed by its BLAKE3 hash. Workspaces
//! are built from manifests by linking or copying stored content into a target
//! directory, falling back from symbolic links to hard links to copies when the
//! filesystem refuses the preferred action.
//!
//! ## Features
//!
//! - Deduplicated, atomically written objects sharded by hash prefix
//! - Per-hash write serialization with bounded store concurrency
//! - Grace-period based garbage collection against a caller supplied live set
//! - Integrity validation with structured reports
//! - Placement strategies with deterministic fallback chains
//! - Concurrent, cancellable materialization with per-file outcomes
//!
//! ## Example
//!
//! ```no_run
//! use stow_core::{
//!     CasConfiguration, CasPool, LocalFilePrimitives, ManifestBuilder, ManifestFile,
//!     Materializer, ObjectStore, WorkspaceStrategy,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ObjectStore::open(CasConfiguration::new("./stow"))?;
//! let hash = store.store_file(Path::new("./mods/textures.pak"), CasPool::Primary).await?;
//!
//! let manifest = ManifestBuilder::new("texture-pack", "1.0")
//!     .file(ManifestFile::from_cas("data/textures.pak", hash))
//!     .build()?;
//!
//! let materializer = Materializer::new(store, Arc::new(LocalFilePrimitives::new()));
//! let result = materializer
//!     .materialize(
//!         &manifest,
//!         Path::new("./workspace"),
//!         WorkspaceStrategy::HybridSymlink,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{} placed, {} failed", result.succeeded().count(), result.failed().count());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod gc;
mod hash;
mod manifest;
mod materialize;
mod pool;
mod primitives;
mod scan;
mod store;
pub mod strategy;
mod validate;

pub use config::{
    CasConfiguration, DEFAULT_GRACE_PERIOD, DEFAULT_MAX_CONCURRENT_OPERATIONS,
    DEFAULT_MAX_TOTAL_SIZE, GcSettings, PoolRoots, StoreLimits,
};
pub use error::{Error, ErrorCategory, FileError, Result};
pub use gc::{GarbageCollector, GcOptions, GcStats, LiveSet, LiveSetProvider};
pub use hash::{Algorithm, ContentHash, HashingWriter};
pub use manifest::{ContentManifest, ManifestBuilder, ManifestConflict, ManifestFile, SourceType};
pub use materialize::{
    DEFAULT_DOWNLOAD_RETRIES, DEFAULT_MAX_WORKERS, FallbackAttempt, FileStage,
    MaterializationResult, Materializer, PlacementOutcome,
};
pub use pool::{CasObject, CasPool};
pub use primitives::{
    DownloadReporter, FilePrimitives, LocalFilePrimitives, PatchApplier, ReplacePatchApplier,
};
pub use scan::scan_installation;
pub use store::{CasStats, ObjectStore, ReferenceStats};
pub use strategy::{PlacementAction, PlacementPlan, PlatformCapabilities, WorkspaceStrategy};
pub use validate::{CasValidationIssue, CasValidationResult, IssueKind, ValidationOptions, Validator};
