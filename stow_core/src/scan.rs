//! Building manifests from an existing base installation.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::{ContentManifest, ManifestBuilder, ManifestFile, SourceType};
use std::path::Path;

/// Walk `root` and describe every regular file as a base installation entry.
///
/// Directories listed in `exclude` (typically the installation pool) are
/// skipped. Symbolic links are not followed. Entries are ordered by path.
pub fn scan_installation(
    root: &Path,
    id: impl Into<String>,
    version: impl Into<String>,
    exclude: &[&Path],
) -> Result<ContentManifest> {
    if !root.is_dir() {
        return Err(Error::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Installation directory does not exist: {}", root.display()),
            ),
        });
    }

    let excluded: Vec<_> = exclude.iter().map(|path| path.to_path_buf()).collect();
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false) // Game files are never ignored
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| !excluded.iter().any(|path| entry.path() == path))
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            tracing::debug!("skipping symlink {}", entry.path().display());
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(|_| {
            Error::invalid_manifest(path, "entry is outside the installation directory")
        })?;
        let metadata = fs_err::metadata(path)?;
        let hash = ContentHash::hash_file(path)?;

        files.push(
            ManifestFile::new(relative, SourceType::BaseInstallation)
                .with_hash(hash)
                .with_size(metadata.len())
                .with_executable(is_executable(&metadata)),
        );
    }

    tracing::info!("scanned {} files in {}", files.len(), root.display());
    ManifestBuilder::new(id, version).files(files).build()
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_scan_nested_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        fs::create_dir_all(root.join("data/maps")).unwrap();
        fs::write(root.join("game.exe"), b"binary").unwrap();
        fs::write(root.join("data/maps/one.map"), b"map").unwrap();
        fs::write(root.join(".hidden"), b"hidden").unwrap();

        let manifest = scan_installation(&root, "game", "1.0", &[]).unwrap();
        let paths: Vec<_> = manifest.files().iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from(".hidden"),
                PathBuf::from("data/maps/one.map"),
                PathBuf::from("game.exe"),
            ]
        );

        let map = &manifest.files()[1];
        assert_eq!(map.source_type, SourceType::BaseInstallation);
        assert_eq!(map.content_hash, Some(ContentHash::hash_bytes(b"map")));
        assert_eq!(map.size, Some(3));
    }

    #[test]
    fn test_scan_ignores_gitignore_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(".gitignore"), b"*.log\n").unwrap();
        fs::write(root.join("debug.log"), b"log").unwrap();

        let manifest = scan_installation(&root, "game", "1", &[]).unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_scan_excludes_pool() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        let pool = root.join(".stow");
        fs::create_dir_all(pool.join("objects")).unwrap();
        fs::write(pool.join("config"), b"version=1").unwrap();
        fs::write(root.join("game.exe"), b"binary").unwrap();

        let manifest = scan_installation(&root, "game", "1", &[&pool]).unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_scan_records_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        fs::create_dir_all(&root).unwrap();
        let launcher = root.join("launch.sh");
        fs::write(&launcher, b"#!/bin/sh").unwrap();
        fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();

        let manifest = scan_installation(&root, "game", "1", &[]).unwrap();
        assert!(manifest.files()[0].is_executable);
    }

    #[test]
    fn test_scan_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(scan_installation(&temp_dir.path().join("nope"), "game", "1", &[]).is_err());
    }
}
