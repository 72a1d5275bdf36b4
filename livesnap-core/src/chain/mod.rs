// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Incremental dump chain management.
//!
//! Every snapshot directory carries a `chain.json` link record naming its
//! parent by snapshot id and path. A chain is strictly linear: once a
//! directory has a successor it cannot be linked again.

mod store;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::engine::{DumpKind, HostInfo};
use crate::error::ChainError;
use crate::types::{ContainerId, SnapshotId};

pub use store::{
    read_native_files, write_native_files, Inventory, PageIndexEntry, PageStore, PageStoreStats,
    PageStoreWriter,
    INVENTORY_FILE, PAGEMAP_FILE, PAGES_FILE,
};

/// Link record file name.
pub const CHAIN_FILE: &str = "chain.json";

/// Current link record format.
pub const FORMAT_VERSION: u32 = 1;

/// Reference from a link to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub snapshot_id: SnapshotId,
    pub path: PathBuf,
}

/// Where the pages of a snapshot are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PageLocation {
    /// `pagemap.json` + `pages.bin` in the snapshot directory.
    Local,
    /// Committed to a page server under the snapshot id.
    Remote { address: String, port: u16 },
}

/// Link record stored in `chain.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub format_version: u32,
    pub snapshot_id: SnapshotId,
    pub container_id: ContainerId,
    pub kind: DumpKind,
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub successor: Option<SnapshotId>,
    pub created_at_unix: u64,
    pub host: HostInfo,
    pub pages: PageLocation,
    #[serde(default)]
    pub deduplicated: bool,
    /// SHA-256 of `processes.json`.
    pub inventory_digest: String,
}

impl ChainLink {
    /// New link stamped with the current time.
    pub fn new(
        snapshot_id: SnapshotId,
        container_id: ContainerId,
        kind: DumpKind,
        parent: Option<ParentRef>,
        host: HostInfo,
        pages: PageLocation,
        inventory_digest: String,
    ) -> Self {
        let created_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            format_version: FORMAT_VERSION,
            snapshot_id,
            container_id,
            kind,
            parent,
            successor: None,
            created_at_unix,
            host,
            pages,
            deduplicated: false,
            inventory_digest,
        }
    }
}

/// One link of a resolved chain and the directory it was read from.
#[derive(Debug, Clone)]
pub struct ResolvedLink {
    pub dir: PathBuf,
    pub link: ChainLink,
}

/// Reads, validates and writes chain link records.
pub struct ChainManager;

impl ChainManager {
    /// Read and verify the link record of `dir`.
    ///
    /// # Errors
    /// MissingMetadata if there is no record, CorruptedMetadata if it does not
    /// parse, has an unknown format, or its inventory digest does not match.
    pub fn read_link(dir: &Path) -> Result<ChainLink, ChainError> {
        let path = dir.join(CHAIN_FILE);
        let raw = store::read_metadata(&path, dir)?;
        let link: ChainLink =
            serde_json::from_slice(&raw).map_err(|e| ChainError::CorruptedMetadata {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if link.format_version != FORMAT_VERSION {
            return Err(ChainError::CorruptedMetadata {
                path,
                reason: format!("unsupported format version {}", link.format_version),
            });
        }

        let digest = Inventory::digest_on_disk(dir)?;
        if digest != link.inventory_digest {
            return Err(ChainError::CorruptedMetadata {
                path,
                reason: "process inventory digest mismatch".to_string(),
            });
        }

        Ok(link)
    }

    /// Validate `prev_dir` as the predecessor of a snapshot about to be
    /// written to `new_dir` for `container`.
    pub fn link(
        new_dir: &Path,
        prev_dir: &Path,
        container: &ContainerId,
    ) -> Result<ParentRef, ChainError> {
        let new_abs = absolute(new_dir)?;
        let prev_abs = absolute(prev_dir)?;
        if new_abs == prev_abs {
            return Err(ChainError::SelfReference { path: prev_abs });
        }
        if !prev_abs.is_dir() {
            return Err(ChainError::MissingPredecessor { path: prev_abs });
        }

        let prev = Self::read_link(&prev_abs)?;
        if &prev.container_id != container {
            return Err(ChainError::ForeignPredecessor {
                path: prev_abs,
                expected: container.clone(),
                found: prev.container_id,
            });
        }
        if let Some(successor) = prev.successor {
            return Err(ChainError::AlreadyHasSuccessor {
                path: prev_abs,
                successor,
            });
        }

        tracing::debug!(
            container_id = %container,
            parent = %prev.snapshot_id,
            path = %prev_abs.display(),
            "Validated chain predecessor"
        );

        Ok(ParentRef {
            snapshot_id: prev.snapshot_id,
            path: prev_abs,
        })
    }

    /// Persist `link` in `dir` and mark it as its parent's successor.
    pub fn record(dir: &Path, link: &ChainLink) -> Result<(), ChainError> {
        Self::write_link(dir, link)?;

        if let Some(parent) = &link.parent {
            let mut parent_link = Self::read_link(&parent.path)?;
            match parent_link.successor {
                Some(existing) if existing != link.snapshot_id => {
                    return Err(ChainError::AlreadyHasSuccessor {
                        path: parent.path.clone(),
                        successor: existing,
                    });
                }
                _ => {}
            }
            parent_link.successor = Some(link.snapshot_id);
            Self::write_link(&parent.path, &parent_link)?;
        }
        Ok(())
    }

    /// Clear `parent_dir`'s successor if it still names `successor`.
    ///
    /// Used when a snapshot is abandoned after its link was recorded.
    pub fn detach(parent_dir: &Path, successor: SnapshotId) -> Result<(), ChainError> {
        let mut parent_link = Self::read_link(parent_dir)?;
        if parent_link.successor == Some(successor) {
            parent_link.successor = None;
            Self::write_link(parent_dir, &parent_link)?;
        }
        Ok(())
    }

    /// Overwrite the link record of `dir` atomically.
    pub fn write_link(dir: &Path, link: &ChainLink) -> Result<(), ChainError> {
        let raw = serde_json::to_vec_pretty(link).map_err(|e| ChainError::CorruptedMetadata {
            path: dir.join(CHAIN_FILE),
            reason: format!("failed to encode link: {}", e),
        })?;
        store::write_atomic(&dir.join(CHAIN_FILE), &raw)
    }

    /// Resolve the chain ending at `leaf_dir`, ordered oldest to newest.
    ///
    /// # Errors
    /// Errors reading the leaf itself pass through; any missing, mismatching
    /// or cyclic ancestor is reported as BrokenChain.
    pub fn resolve_chain(leaf_dir: &Path) -> Result<Vec<ResolvedLink>, ChainError> {
        let mut dir = absolute(leaf_dir)?;
        let mut link = Self::read_link(&dir)?;
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        loop {
            if !seen.insert(link.snapshot_id) {
                return Err(ChainError::BrokenChain {
                    path: dir,
                    reason: format!("cycle detected at snapshot {}", link.snapshot_id),
                });
            }

            let Some(parent) = link.parent.clone() else {
                links.push(ResolvedLink { dir, link });
                break;
            };

            let parent_dir = if parent.path.is_absolute() {
                parent.path.clone()
            } else {
                dir.join(&parent.path)
            };
            if !parent_dir.is_dir() {
                return Err(ChainError::BrokenChain {
                    path: parent_dir,
                    reason: format!("predecessor {} is missing", parent.snapshot_id),
                });
            }
            let parent_link =
                Self::read_link(&parent_dir).map_err(|e| ChainError::BrokenChain {
                    path: parent_dir.clone(),
                    reason: e.to_string(),
                })?;
            if parent_link.snapshot_id != parent.snapshot_id {
                return Err(ChainError::BrokenChain {
                    path: parent_dir,
                    reason: format!(
                        "expected snapshot {}, found {}",
                        parent.snapshot_id, parent_link.snapshot_id
                    ),
                });
            }
            if parent_link.container_id != link.container_id {
                return Err(ChainError::BrokenChain {
                    path: parent_dir,
                    reason: format!(
                        "predecessor belongs to container {}, not {}",
                        parent_link.container_id, link.container_id
                    ),
                });
            }
            if parent_link.successor != Some(link.snapshot_id) {
                tracing::warn!(
                    path = %parent_dir.display(),
                    snapshot_id = %link.snapshot_id,
                    "Predecessor does not record this snapshot as its successor"
                );
            }

            links.push(ResolvedLink { dir, link });
            dir = parent_dir;
            link = parent_link;
        }

        links.reverse();
        Ok(links)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ChainError> {
    std::path::absolute(path).map_err(|e| ChainError::Io {
        context: format!("resolving {}", path.display()),
        source: e,
    })
}
