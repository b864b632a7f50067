//! Integrity audits of a pool.

use crate::error::Result;
use crate::gc::LiveSet;
use crate::hash::ContentHash;
use crate::pool::{CasPool, hash_from_object_path};
use crate::store::{ObjectStore, quarantine_file};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Classification of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    /// A readable object whose content hashes to another value.
    HashMismatch,
    /// An object that cannot be read or is not a regular file with a hash name.
    CorruptedObject,
    /// An object the caller expected that is not in the pool.
    MissingObject,
    /// The pool itself cannot be inspected.
    Critical,
    /// Debris that does not affect stored content.
    Warning,
}

impl IssueKind {
    /// Kinds that make a pool invalid.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            IssueKind::HashMismatch | IssueKind::CorruptedObject | IssueKind::MissingObject
        )
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueKind::HashMismatch => "hash-mismatch",
            IssueKind::CorruptedObject => "corrupted-object",
            IssueKind::MissingObject => "missing-object",
            IssueKind::Critical => "critical",
            IssueKind::Warning => "warning",
        };
        f.write_str(s)
    }
}

/// One finding of a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CasValidationIssue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub message: String,
}

impl CasValidationIssue {
    fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            hash: None,
            path: None,
            message: message.into(),
        }
    }

    fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Report of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CasValidationResult {
    pub pool: CasPool,
    pub objects_checked: usize,
    pub issues: Vec<CasValidationIssue>,
    /// Corrupted objects removed from the pool.
    pub quarantined: usize,
}

impl CasValidationResult {
    /// False iff a hash mismatch, corrupted object or missing object was found.
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|issue| issue.kind.is_hard())
    }

    /// Number of issues of `kind`.
    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|issue| issue.kind == kind).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Hashes that must be present; absent ones are reported as missing.
    pub expected: Option<LiveSet>,
    /// Delete corrupted objects so they can be acquired again.
    pub quarantine_corrupted: bool,
}

/// Re-hashes stored objects and classifies what it finds.
#[derive(Debug, Clone)]
pub struct Validator {
    store: ObjectStore,
}

impl Validator {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Audit every object in `pool`.
    ///
    /// Fails only when `pool` is not configured; problems with the pool
    /// directory itself are reported as [`IssueKind::Critical`].
    pub async fn validate(
        &self,
        pool: CasPool,
        options: &ValidationOptions,
    ) -> Result<CasValidationResult> {
        let pool_ref = self.store.pool(pool)?;
        let mut result = CasValidationResult {
            pool,
            objects_checked: 0,
            issues: Vec::new(),
            quarantined: 0,
        };

        let objects_dir = pool_ref.objects_dir();
        let shards = match fs_err::read_dir(&objects_dir) {
            Ok(shards) => shards,
            Err(e) => {
                result.issues.push(
                    CasValidationIssue::new(IssueKind::Critical, e.to_string())
                        .with_path(&objects_dir),
                );
                return Ok(result);
            }
        };

        let mut found = HashSet::new();
        let mut corrupted = Vec::new();
        for shard in shards {
            let shard_path = match shard {
                Ok(shard) => shard.path(),
                Err(e) => {
                    result.issues.push(CasValidationIssue::new(IssueKind::Critical, e.to_string()));
                    continue;
                }
            };
            if !shard_path.is_dir() {
                result.issues.push(
                    CasValidationIssue::new(IssueKind::Warning, "foreign file in objects directory")
                        .with_path(&shard_path),
                );
                continue;
            }

            let entries = match fs_err::read_dir(&shard_path) {
                Ok(entries) => entries.filter_map(|entry| entry.ok()).map(|e| e.path()),
                Err(e) => {
                    result.issues.push(
                        CasValidationIssue::new(IssueKind::Critical, e.to_string())
                            .with_path(&shard_path),
                    );
                    continue;
                }
            };

            let mut empty = true;
            for path in entries {
                empty = false;
                result.objects_checked += 1;
                if let Some(issue) = check_object(&path).await {
                    if let Some(hash) = issue.hash {
                        found.insert(hash);
                    }
                    tracing::warn!("{} in {} pool: {}", issue.kind, pool, issue.message);
                    corrupted.push(path);
                    result.issues.push(issue);
                } else if let Some(hash) = hash_from_object_path(&path) {
                    found.insert(hash);
                }
            }
            if empty {
                result.issues.push(
                    CasValidationIssue::new(IssueKind::Warning, "empty shard directory")
                        .with_path(&shard_path),
                );
            }
        }

        if let Ok(entries) = fs_err::read_dir(pool_ref.tmp_dir()) {
            let stray = entries.count();
            if stray > 0 {
                result.issues.push(
                    CasValidationIssue::new(
                        IssueKind::Warning,
                        format!("{} temporary file(s) left behind", stray),
                    )
                    .with_path(pool_ref.tmp_dir()),
                );
            }
        }

        if let Some(expected) = &options.expected {
            let mut missing: Vec<_> = expected.iter().filter(|hash| !found.contains(*hash)).collect();
            missing.sort();
            for hash in missing {
                result.issues.push(
                    CasValidationIssue::new(IssueKind::MissingObject, "expected object is absent")
                        .with_hash(*hash),
                );
            }
        }

        if options.quarantine_corrupted {
            for path in corrupted {
                if self.quarantine(pool, &path).await {
                    result.quarantined += 1;
                }
            }
        }

        tracing::info!(
            "validated {} objects in {} pool, {} issue(s)",
            result.objects_checked,
            pool,
            result.issues.len()
        );
        Ok(result)
    }

    /// Move a corrupted entry into the pool's quarantine directory.
    async fn quarantine(&self, pool: CasPool, path: &Path) -> bool {
        let moved = match hash_from_object_path(path) {
            Some(hash) => self
                .store
                .quarantine(&hash, pool)
                .await
                .map(|moved| moved.is_some()),
            // Not an object the store knows about, so it was never counted.
            None => self.quarantine_foreign(pool, path).map(|()| true),
        };
        match moved {
            Ok(moved) => moved,
            Err(e) => {
                tracing::warn!("failed to quarantine {}: {}", path.display(), e);
                false
            }
        }
    }

    fn quarantine_foreign(&self, pool: CasPool, path: &Path) -> Result<()> {
        let pool_ref = self.store.pool(pool)?;
        let name = match (path.parent().and_then(Path::file_name), path.file_name()) {
            (Some(shard), Some(file)) => {
                format!("{}-{}", shard.to_string_lossy(), file.to_string_lossy())
            }
            _ => "unknown".to_string(),
        };
        let destination = quarantine_file(pool_ref, &name)?;
        fs_err::rename(path, &destination)?;
        tracing::warn!("quarantined {} to {}", path.display(), destination.display());
        Ok(())
    }
}

/// Inspect one entry of a shard directory.
async fn check_object(path: &Path) -> Option<CasValidationIssue> {
    let Some(expected) = hash_from_object_path(path) else {
        return Some(
            CasValidationIssue::new(IssueKind::CorruptedObject, "file name is not a valid hash")
                .with_path(path),
        );
    };
    let corrupted = |message: String| {
        Some(
            CasValidationIssue::new(IssueKind::CorruptedObject, message)
                .with_hash(expected)
                .with_path(path),
        )
    };

    match fs_err::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return corrupted("not a regular file".to_string()),
        Err(e) => return corrupted(e.to_string()),
    }

    match ContentHash::hash_file_async(path).await {
        Ok(actual) if actual == expected => None,
        Ok(actual) => Some(
            CasValidationIssue::new(
                IssueKind::HashMismatch,
                format!("content hashes to {}", actual),
            )
            .with_hash(expected)
            .with_path(path),
        ),
        Err(e) => corrupted(e.to_string()),
    }
}
