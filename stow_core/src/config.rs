//! Store configuration.
//!
//! A [`CasConfiguration`] is assembled from a handful of small settings
//! structs and validated before any pool is opened.

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use crate::pool::CasPool;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default grace period for unreferenced objects.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default upper bound on in-flight store writes.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 32;

/// Default pool size limit (512 GiB).
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 512 * 1024 * 1024 * 1024;

/// Root directories of the pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRoots {
    /// Root of the primary pool for user content.
    pub primary: PathBuf,
    /// Root of the pool co-located with a game installation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<PathBuf>,
}

impl PoolRoots {
    /// Returns the configured root of `pool`.
    pub fn root(&self, pool: CasPool) -> Option<&Path> {
        match pool {
            CasPool::Primary => Some(self.primary.as_path()),
            CasPool::Installation => self.installation.as_deref(),
        }
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcSettings {
    /// Objects touched more recently than this are never collected.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Interval of the background collector; `None` disables it.
    #[serde(default, with = "humantime_serde::option")]
    pub auto_interval: Option<Duration>,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            auto_interval: None,
        }
    }
}

/// Resource limits of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    /// Upper bound on store writes in flight across all callers.
    pub max_concurrent_operations: usize,
    /// Upper bound on the bytes stored in one pool.
    pub max_total_size: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
        }
    }
}

/// Full configuration of an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasConfiguration {
    pub pools: PoolRoots,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub gc: GcSettings,
    #[serde(default)]
    pub limits: StoreLimits,
    /// Re-hash placed files after materialization.
    #[serde(default = "default_verify_integrity")]
    pub verify_integrity: bool,
}

fn default_verify_integrity() -> bool {
    true
}

impl CasConfiguration {
    /// Configuration with defaults and a single primary pool at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            pools: PoolRoots {
                primary: root.into(),
                installation: None,
            },
            algorithm: Algorithm::default(),
            gc: GcSettings::default(),
            limits: StoreLimits::default(),
            verify_integrity: true,
        }
    }

    /// Add an installation pool rooted at `root`.
    pub fn with_installation_pool(mut self, root: impl Into<PathBuf>) -> Self {
        self.pools.installation = Some(root.into());
        self
    }

    /// Set the GC grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.gc.grace_period = grace_period;
        self
    }

    /// Set the background GC interval.
    pub fn with_auto_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc.auto_interval = interval;
        self
    }

    /// Set the maximum number of concurrent store writes.
    pub fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.limits.max_concurrent_operations = max;
        self
    }

    /// Set the maximum pool size in bytes.
    pub fn with_max_total_size(mut self, max: u64) -> Self {
        self.limits.max_total_size = max;
        self
    }

    /// Enable or disable post-placement verification.
    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value before the store is opened.
    pub fn validate(&self) -> Result<()> {
        if self.pools.primary.as_os_str().is_empty() {
            return Err(Error::invalid_config("primary pool root must not be empty"));
        }
        if let Some(installation) = &self.pools.installation {
            if installation.as_os_str().is_empty() {
                return Err(Error::invalid_config(
                    "installation pool root must not be empty",
                ));
            }
            if installation == &self.pools.primary {
                return Err(Error::invalid_config(
                    "installation and primary pools must not share a root",
                ));
            }
        }
        if self.gc.grace_period.is_zero() {
            return Err(Error::invalid_config("GC grace period must be positive"));
        }
        if self.gc.auto_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::invalid_config("auto GC interval must be positive"));
        }
        if self.limits.max_concurrent_operations == 0 {
            return Err(Error::invalid_config(
                "max concurrent operations must be positive",
            ));
        }
        if self.limits.max_total_size == 0 {
            return Err(Error::invalid_config("max total size must be positive"));
        }
        Ok(())
    }
}

/// Serde adapters for durations written as `"7d"`, `"90s"` and so on.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
