//! Placement strategy selection.
//!
//! Maps a workspace strategy, the source type of a file and what the target
//! filesystem supports onto an ordered list of placement actions. The
//! materializer tries the actions in order and stops at the first success.

use crate::error::{Error, Result};
use crate::manifest::SourceType;
use crate::pool::CasPool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a workspace would prefer its files to be placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceStrategy {
    /// Link immutable content, copy anything the user may modify.
    #[default]
    HybridSymlink,
    FullCopy,
    /// Route every file through the object store and place it from the pool.
    ContentAddressableIndirect,
    FullSymlink,
    /// Symbolic links or nothing.
    SymlinkOnly,
    HardLink,
}

impl WorkspaceStrategy {
    pub const ALL: [WorkspaceStrategy; 6] = [
        WorkspaceStrategy::HybridSymlink,
        WorkspaceStrategy::FullCopy,
        WorkspaceStrategy::ContentAddressableIndirect,
        WorkspaceStrategy::FullSymlink,
        WorkspaceStrategy::SymlinkOnly,
        WorkspaceStrategy::HardLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStrategy::HybridSymlink => "hybrid-symlink",
            WorkspaceStrategy::FullCopy => "full-copy",
            WorkspaceStrategy::ContentAddressableIndirect => "content-addressable-indirect",
            WorkspaceStrategy::FullSymlink => "full-symlink",
            WorkspaceStrategy::SymlinkOnly => "symlink-only",
            WorkspaceStrategy::HardLink => "hard-link",
        }
    }
}

impl fmt::Display for WorkspaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| Error::invalid_config(format!("unknown workspace strategy: {s}")))
    }
}

/// A concrete way of putting content at a destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementAction {
    Symlink,
    HardLink,
    Copy,
}

impl fmt::Display for PlacementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementAction::Symlink => f.write_str("symlink"),
            PlacementAction::HardLink => f.write_str("hard link"),
            PlacementAction::Copy => f.write_str("copy"),
        }
    }
}

/// What the filesystem of a target directory allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    pub symlinks: bool,
    pub hard_links: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            symlinks: true,
            hard_links: true,
        }
    }
}

impl PlatformCapabilities {
    /// Returns true if `action` can be attempted at all. Copying always can.
    pub fn permits(&self, action: PlacementAction) -> bool {
        match action {
            PlacementAction::Symlink => self.symlinks,
            PlacementAction::HardLink => self.hard_links,
            PlacementAction::Copy => true,
        }
    }
}

/// The placement decision for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementPlan {
    /// Acquire the content through the object store before placing it.
    pub via_store: bool,
    /// Pool the content is stored in when `via_store` is set.
    pub pool: CasPool,
    /// The strategy's fallback chain, most preferred first.
    pub actions: Vec<PlacementAction>,
    /// Actions of the chain the target filesystem cannot perform. They are
    /// reported as failed fallbacks instead of being attempted.
    pub unsupported: Vec<PlacementAction>,
}

impl PlacementPlan {
    /// The action the strategy would pick if nothing failed, whether or not
    /// the target supports it.
    pub fn preferred(&self) -> Option<PlacementAction> {
        self.actions.first().copied()
    }

    pub fn is_supported(&self, action: PlacementAction) -> bool {
        !self.unsupported.contains(&action)
    }

    /// Actions that will actually be attempted, in order.
    pub fn supported(&self) -> impl Iterator<Item = PlacementAction> + '_ {
        self.actions
            .iter()
            .copied()
            .filter(|action| self.is_supported(*action))
    }
}

/// Choose the placement plan for a file.
///
/// `installation_pool` tells whether an installation pool is configured;
/// base installation content is kept there so hard links stay on one volume.
pub fn select(
    strategy: WorkspaceStrategy,
    source: SourceType,
    capabilities: PlatformCapabilities,
    installation_pool: bool,
) -> PlacementPlan {
    use PlacementAction::{Copy, HardLink, Symlink};

    let pool = if source == SourceType::BaseInstallation && installation_pool {
        CasPool::Installation
    } else {
        CasPool::Primary
    };

    let (via_store, chain): (bool, &[PlacementAction]) = match (source, strategy) {
        (SourceType::Generated, _) => (false, &[]),
        // The patched result belongs to this workspace only.
        (SourceType::Patch, _) => (false, &[Copy]),
        (_, WorkspaceStrategy::ContentAddressableIndirect) => (true, &[HardLink, Symlink, Copy]),
        (_, WorkspaceStrategy::HybridSymlink) if !source.is_immutable() => (false, &[Copy]),
        (_, WorkspaceStrategy::HybridSymlink | WorkspaceStrategy::FullSymlink) => {
            (false, &[Symlink, HardLink, Copy])
        }
        (_, WorkspaceStrategy::SymlinkOnly) => (false, &[Symlink]),
        (_, WorkspaceStrategy::HardLink) => (false, &[HardLink, Copy]),
        (_, WorkspaceStrategy::FullCopy) => (false, &[Copy]),
    };

    // Store-backed sources always resolve through their pool.
    let via_store = via_store || matches!(source, SourceType::Cas | SourceType::RemoteDownload);

    PlacementPlan {
        via_store,
        pool,
        actions: chain.to_vec(),
        unsupported: chain
            .iter()
            .copied()
            .filter(|action| !capabilities.permits(*action))
            .collect(),
    }
}
