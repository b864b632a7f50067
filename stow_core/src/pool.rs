//! Pool layout on disk.
//!
//! Every pool is a self-contained directory tree:
//! - `config` file with version and algorithm
//! - `objects/<algorithm>/<prefix>/<suffix>` for stored objects
//! - `tmp/` for writes that have not been promoted yet

use crate::error::{Error, Result};
use crate::hash::{Algorithm, ContentHash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// The named pools of a store.
///
/// Pools never share objects: each one lives on its own volume so that hard
/// links out of it stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CasPool {
    /// User content (downloads, mods, packages).
    Primary,
    /// Pool co-located with a base game installation.
    Installation,
}

impl CasPool {
    /// All pools, in a fixed order.
    pub const ALL: [CasPool; 2] = [CasPool::Primary, CasPool::Installation];

    pub fn as_str(&self) -> &'static str {
        match self {
            CasPool::Primary => "primary",
            CasPool::Installation => "installation",
        }
    }

    /// Parse a pool name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(CasPool::Primary),
            "installation" => Some(CasPool::Installation),
            _ => None,
        }
    }
}

impl fmt::Display for CasPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CasObject {
    pub hash: ContentHash,
    pub size_bytes: u64,
    pub pool: CasPool,
    /// Last time the object was written or re-stored.
    pub last_accessed_at: SystemTime,
    pub created_at: SystemTime,
}

/// An opened pool directory.
#[derive(Debug)]
pub(crate) struct Pool {
    kind: CasPool,
    root: PathBuf,
    algorithm: Algorithm,
    total_size: AtomicU64,
    pub(crate) counters: PoolCounters,
    /// Serializes collector sweeps over this pool.
    pub(crate) sweep_lock: tokio::sync::Mutex<()>,
}

/// Access statistics gathered while the store is open.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub bytes_deduplicated: AtomicU64,
}

impl Pool {
    /// Open the pool at `root`, initializing it if the directory is new or empty.
    pub(crate) fn open_or_init(kind: CasPool, root: &Path, algorithm: Algorithm) -> Result<Self> {
        let is_new = !root.exists()
            || fs_err::read_dir(root)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);

        let pool = if is_new {
            Self::init(kind, root, algorithm)?
        } else {
            Self::open(kind, root, algorithm)?
        };

        let total = pool.scan_total_size()?;
        pool.total_size.store(total, Ordering::SeqCst);
        tracing::debug!(
            "opened {} pool at {} ({} bytes stored)",
            kind,
            root.display(),
            total
        );
        Ok(pool)
    }

    /// Initialize a new pool at the given path.
    fn init(kind: CasPool, root: &Path, algorithm: Algorithm) -> Result<Self> {
        let root = root.to_path_buf();

        // Create objects directory with algorithm subdirectory
        fs_err::create_dir_all(root.join("objects").join(algorithm.as_str()))?;
        fs_err::create_dir_all(root.join("tmp"))?;

        // Write config file
        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs_err::write(root.join("config"), config_content)?;

        Ok(Self::new(kind, root, algorithm))
    }

    /// Open an existing pool and check it against the configured algorithm.
    fn open(kind: CasPool, root: &Path, algorithm: Algorithm) -> Result<Self> {
        let root = root.to_path_buf();

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs_err::read_to_string(&config_path)?;
        let on_disk = Self::parse_config(&config_content)?;
        if on_disk != algorithm {
            return Err(Error::invalid_config(format!(
                "pool at {} uses {}, configuration requests {}",
                root.display(),
                on_disk,
                algorithm
            )));
        }

        let objects_dir = root.join("objects").join(algorithm.as_str());
        if !objects_dir.exists() {
            return Err(Error::invalid_store(
                &root,
                "objects directory structure missing",
            ));
        }
        fs_err::create_dir_all(root.join("tmp"))?;

        Ok(Self::new(kind, root, algorithm))
    }

    fn new(kind: CasPool, root: PathBuf, algorithm: Algorithm) -> Self {
        Self {
            kind,
            root,
            algorithm,
            total_size: AtomicU64::new(0),
            counters: PoolCounters::default(),
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Parse the config file to extract the algorithm.
    pub(crate) fn parse_config(content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_config(format!(
                "Unsupported pool config version: {:?}",
                version
            )));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_config("Missing algo in pool config"))?;
        Algorithm::parse(algo_str)
    }

    pub(crate) fn kind(&self) -> CasPool {
        self.kind
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all shard directories.
    pub(crate) fn objects_dir(&self) -> PathBuf {
        self.root.join("objects").join(self.algorithm.as_str())
    }

    /// Directory for in-flight writes. Lives inside the pool so promotion is a rename.
    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Where the validator moves corrupted objects. Outside `objects/`, so
    /// nothing in it is listed, served or counted.
    pub(crate) fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    /// Get the path to an object file given its hash.
    ///
    /// Returns: `objects/{algorithm}/{prefix}/{suffix}`
    pub(crate) fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.objects_dir().join(hash.prefix()).join(hash.suffix())
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Account for `bytes` more, unless that would take the pool past `limit`.
    ///
    /// On refusal returns the size the pool would have reached.
    pub(crate) fn reserve(&self, bytes: u64, limit: u64) -> std::result::Result<(), u64> {
        self.total_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let requested = current.saturating_add(bytes);
                (requested <= limit).then_some(requested)
            })
            .map(|_| ())
            .map_err(|current| current.saturating_add(bytes))
    }

    pub(crate) fn sub_size(&self, bytes: u64) {
        let _ = self
            .total_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Enumerate every object file of the pool.
    ///
    /// Entries whose name is not a valid hash are skipped; the validator
    /// reports them separately.
    pub(crate) fn list_objects(&self) -> Result<Vec<(ContentHash, PathBuf)>> {
        let mut objects = Vec::new();
        let objects_dir = self.objects_dir();
        if !objects_dir.exists() {
            return Ok(objects);
        }

        for shard_entry in fs_err::read_dir(&objects_dir)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }

            for obj_entry in fs_err::read_dir(&shard_path)? {
                let obj_path = obj_entry?.path();
                if let Some(hash) = hash_from_object_path(&obj_path) {
                    objects.push((hash, obj_path));
                }
            }
        }

        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    /// Read the metadata of the object stored under `hash`.
    pub(crate) fn object_info(&self, hash: &ContentHash) -> Result<Option<CasObject>> {
        let path = self.object_path(hash);
        let metadata = match fs_err::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let modified = metadata.modified()?;
        Ok(Some(CasObject {
            hash: *hash,
            size_bytes: metadata.len(),
            pool: self.kind,
            last_accessed_at: modified,
            created_at: metadata.created().unwrap_or(modified),
        }))
    }

    fn scan_total_size(&self) -> Result<u64> {
        let mut total = 0;
        for (_, path) in self.list_objects()? {
            total += fs_err::metadata(&path)?.len();
        }
        Ok(total)
    }
}

/// Recover the hash of an object from its `<prefix>/<suffix>` path.
pub(crate) fn hash_from_object_path(path: &Path) -> Option<ContentHash> {
    let suffix = path.file_name()?.to_str()?;
    let prefix = path.parent()?.file_name()?.to_str()?;
    ContentHash::from_hex(&format!("{}{}", prefix, suffix)).ok()
}
