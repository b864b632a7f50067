//! Manifests: the declarative list of files a workspace is built from.
//!
//! Manifests are produced upstream and handed to the materializer and the
//! garbage collector read-only. Once built a [`ContentManifest`] offers no
//! mutating API.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use url::Url;

/// Where the content of a manifest entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// A file of the base game installation, read from the configured base path.
    BaseInstallation,
    /// Content already in the object store.
    Cas,
    /// A file on the local disk used as-is.
    LocalFile,
    /// Content fetched from a URL into the store.
    RemoteDownload,
    /// A file extracted from a package by an upstream component.
    Extracted,
    /// A patch payload applied on top of the existing target file.
    Patch,
    /// A file produced at runtime; only its directory is created.
    Generated,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::BaseInstallation => "base-installation",
            SourceType::Cas => "cas",
            SourceType::LocalFile => "local-file",
            SourceType::RemoteDownload => "remote-download",
            SourceType::Extracted => "extracted",
            SourceType::Patch => "patch",
            SourceType::Generated => "generated",
        }
    }

    /// Sources whose bytes are never modified in place by the user.
    pub fn is_immutable(&self) -> bool {
        matches!(
            self,
            SourceType::BaseInstallation | SourceType::Cas | SourceType::RemoteDownload
        )
    }

    /// Sources that must declare their expected digest.
    pub fn requires_hash(&self) -> bool {
        matches!(self, SourceType::Cas | SourceType::RemoteDownload)
    }

    /// Sources read from `source_path`.
    pub fn requires_source_path(&self) -> bool {
        matches!(
            self,
            SourceType::LocalFile | SourceType::Extracted | SourceType::Patch
        )
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical file of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the target directory.
    pub relative_path: PathBuf,
    pub source_type: SourceType,
    /// Expected digest of the placed content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<Url>,
    /// Origin of local and extracted files, or the payload of a patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub is_executable: bool,
    /// POSIX mode applied to copied files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl ManifestFile {
    pub fn new(relative_path: impl Into<PathBuf>, source_type: SourceType) -> Self {
        Self {
            relative_path: relative_path.into(),
            source_type,
            content_hash: None,
            download_url: None,
            source_path: None,
            size: None,
            is_executable: false,
            permissions: None,
        }
    }

    /// An entry served from the object store.
    pub fn from_cas(relative_path: impl Into<PathBuf>, hash: ContentHash) -> Self {
        Self::new(relative_path, SourceType::Cas).with_hash(hash)
    }

    /// An entry downloaded from `url` and verified against `hash`.
    pub fn remote(relative_path: impl Into<PathBuf>, url: Url, hash: ContentHash) -> Self {
        Self::new(relative_path, SourceType::RemoteDownload)
            .with_url(url)
            .with_hash(hash)
    }

    /// An entry copied from a local file.
    pub fn local(relative_path: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self::new(relative_path, SourceType::LocalFile).with_source_path(source)
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.download_url = Some(url);
        self
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.is_executable = executable;
        self
    }

    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }

    /// The relative path with `.` components removed, used to key outcomes.
    pub fn normalized_path(&self) -> PathBuf {
        normalize(&self.relative_path)
    }

    /// Check that the entry is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let path = &self.relative_path;
        let invalid = |reason: &str| Err(Error::invalid_manifest(path, reason));

        if self.normalized_path().as_os_str().is_empty() {
            return invalid("relative path is empty");
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return invalid("relative path escapes the target"),
                Component::RootDir | Component::Prefix(_) => {
                    return invalid("relative path must not be absolute");
                }
            }
        }

        if self.source_type.requires_hash() && self.content_hash.is_none() {
            return invalid(&format!("{} entry has no content hash", self.source_type));
        }
        if self.source_type == SourceType::RemoteDownload && self.download_url.is_none() {
            return invalid("remote-download entry has no URL");
        }
        if self.source_type == SourceType::Generated
            && (self.content_hash.is_some() || self.download_url.is_some())
        {
            return invalid("generated entry must not carry a hash or URL");
        }
        if self.source_type.requires_source_path() && self.source_path.is_none() {
            return invalid(&format!("{} entry has no source path", self.source_type));
        }
        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

/// An ordered, immutable list of files plus identity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    id: String,
    version: String,
    files: Vec<ManifestFile>,
}

impl ContentManifest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn files(&self) -> &[ManifestFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every expected digest referenced by the manifest.
    pub fn hashes(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.files.iter().filter_map(|file| file.content_hash)
    }

    /// Validate every entry, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_manifest(&self.id, "manifest id is empty"));
        }
        self.files.iter().try_for_each(ManifestFile::validate)
    }

    /// Paths declared more than once with different expected content.
    pub fn conflicts(&self) -> Vec<ManifestConflict> {
        self.group_by_path()
            .1
            .into_iter()
            .map(|(_, conflict)| conflict)
            .collect()
    }

    /// Split the manifest into the entries to process and the conflicting paths.
    ///
    /// Exact duplicate entries collapse into one. A path whose entries disagree
    /// on their expected hash is withheld entirely.
    pub(crate) fn group_by_path(
        &self,
    ) -> (Vec<&ManifestFile>, BTreeMap<PathBuf, ManifestConflict>) {
        let mut first_seen: BTreeMap<PathBuf, &ManifestFile> = BTreeMap::new();
        let mut conflicts = BTreeMap::new();
        let mut order = Vec::new();

        for file in &self.files {
            let path = file.normalized_path();
            match first_seen.get(&path) {
                None => {
                    first_seen.insert(path.clone(), file);
                    order.push(path);
                }
                Some(existing) if existing.content_hash != file.content_hash => {
                    conflicts.entry(path.clone()).or_insert(ManifestConflict {
                        path,
                        first: existing.content_hash,
                        second: file.content_hash,
                    });
                }
                Some(_) => {
                    tracing::trace!("skipping duplicate manifest entry {}", path.display());
                }
            }
        }

        let unique = order
            .iter()
            .filter(|path| !conflicts.contains_key(*path))
            .filter_map(|path| first_seen.get(path).copied())
            .collect();
        (unique, conflicts)
    }

    /// Parse and validate a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and validate a manifest file.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_json(&fs_err::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Two entries that declare different content for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestConflict {
    pub path: PathBuf,
    pub first: Option<ContentHash>,
    pub second: Option<ContentHash>,
}

impl From<&ManifestConflict> for Error {
    fn from(conflict: &ManifestConflict) -> Self {
        let describe = |hash: &Option<ContentHash>| {
            hash.map_or_else(|| "no hash".to_string(), |hash| hash.to_hex())
        };
        Error::ManifestConflict {
            path: conflict.path.clone(),
            first: describe(&conflict.first),
            second: describe(&conflict.second),
        }
    }
}

/// Builds a [`ContentManifest`].
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    id: String,
    version: String,
    files: Vec<ManifestFile>,
}

impl ManifestBuilder {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            files: Vec::new(),
        }
    }

    pub fn file(mut self, file: ManifestFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn files(mut self, files: impl IntoIterator<Item = ManifestFile>) -> Self {
        self.files.extend(files);
        self
    }

    /// Validate the entries and freeze the manifest.
    pub fn build(self) -> Result<ContentManifest> {
        let manifest = ContentManifest {
            id: self.id,
            version: self.version,
            files: self.files,
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_build_valid_manifest() {
        let hash = ContentHash::hash_bytes(b"x");
        let manifest = ManifestBuilder::new("pack", "2.1")
            .file(ManifestFile::from_cas("data/a.pak", hash))
            .file(ManifestFile::remote("data/b.pak", url("https://example.com/b"), hash))
            .file(ManifestFile::new("cfg/user.cfg", SourceType::Generated))
            .build()
            .unwrap();

        assert_eq!(manifest.id(), "pack");
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.hashes().count(), 2);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let hash = ContentHash::hash_bytes(b"x");
        for path in ["../outside", "/etc/passwd", "a/../../b", "", "."] {
            let result = ManifestBuilder::new("pack", "1")
                .file(ManifestFile::from_cas(path, hash))
                .build();
            assert_matches!(result, Err(Error::InvalidManifest { .. }), "{path}");
        }
    }

    #[test]
    fn test_rejects_missing_hash_or_url() {
        let cas = ManifestFile::new("a", SourceType::Cas);
        assert!(cas.validate().is_err());

        let mut remote = ManifestFile::remote("a", url("https://x/a"), ContentHash::hash_bytes(b"a"));
        remote.download_url = None;
        assert!(remote.validate().is_err());

        let generated = ManifestFile::new("a", SourceType::Generated).with_hash(ContentHash::hash_bytes(b"a"));
        assert!(generated.validate().is_err());

        let local = ManifestFile::new("a", SourceType::LocalFile);
        assert!(local.validate().is_err());
    }

    #[test]
    fn test_conflicts_and_duplicates() {
        let h1 = ContentHash::hash_bytes(b"one");
        let h2 = ContentHash::hash_bytes(b"two");
        let manifest = ManifestBuilder::new("pack", "1")
            .file(ManifestFile::from_cas("a.txt", h1))
            .file(ManifestFile::from_cas("./a.txt", h1))
            .file(ManifestFile::from_cas("b.txt", h1))
            .file(ManifestFile::from_cas("b.txt", h2))
            .file(ManifestFile::from_cas("b.txt", h1))
            .build()
            .unwrap();

        let (unique, conflicts) = manifest.group_by_path();
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].relative_path, PathBuf::from("a.txt"));
        assert_eq!(conflicts.len(), 1);

        let conflict = &manifest.conflicts()[0];
        assert_eq!(conflict.path, PathBuf::from("b.txt"));
        assert_eq!(conflict.first, Some(h1));
        assert_eq!(conflict.second, Some(h2));
        assert_matches!(Error::from(conflict), Error::ManifestConflict { .. });
    }

    #[test]
    fn test_json_roundtrip() {
        let manifest = ManifestBuilder::new("pack", "1")
            .file(
                ManifestFile::local("bin/tool", "/src/tool")
                    .with_executable(true)
                    .with_permissions(0o755),
            )
            .build()
            .unwrap();

        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"local-file\""));
        assert_eq!(ContentManifest::from_json(&json).unwrap(), manifest);
    }

    #[test]
    fn test_from_json_validates() {
        let json = r#"{
            "id": "pack",
            "version": "1",
            "files": [{ "relative_path": "a", "source_type": "cas" }]
        }"#;
        assert_matches!(
            ContentManifest::from_json(json),
            Err(Error::InvalidManifest { .. })
        );
    }
}
