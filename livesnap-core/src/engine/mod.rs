// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Snapshot engine capability interface.
//!
//! The orchestrators never shell out or touch process state directly; they
//! drive an injected [`SnapshotEngine`]. Two implementations ship:
//! [`CriuEngine`] for real process trees and [`InMemoryEngine`] for
//! simulated containers.

mod criu;
mod memory;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{ContainerId, PageId, ProcessId, SnapshotId};

pub use criu::{CriuEngine, CriuSettings};
pub use memory::{FailurePoint, InMemoryEngine, SimulatedProcess, SimulatedState};

/// Size of one memory page handled by the engines.
pub const PAGE_SIZE: usize = 4096;

/// Kind of snapshot pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpKind {
    /// Non-stopping incremental memory pass.
    PreDump,
    /// Final dump; stops the tree unless leave-running.
    Dump,
}

impl DumpKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PreDump => "pre-dump",
            Self::Dump => "dump",
        }
    }
}

/// Options for one pre-dump or dump pass.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// ID the orchestrator assigned to the snapshot being produced.
    pub snapshot_id: SnapshotId,
    /// Snapshot this pass is incremental against, if any.
    pub parent: Option<SnapshotId>,
    /// Keep the tree running after the final dump.
    pub leave_running: bool,
    /// Keep dirty-page tracking active so the next pass can be incremental.
    pub track_memory: bool,
    /// Directory for engine logs.
    pub work_dir: PathBuf,
}

/// One memory page with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFrame {
    pub id: PageId,
    pub data: Vec<u8>,
}

/// Process tree entry as captured by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessImage {
    pub pid: u32,
    pub ppid: u32,
    #[serde(default)]
    pub command: String,
    /// Virtual addresses of every page resident at capture time.
    pub resident: Vec<u64>,
}

impl ProcessImage {
    /// Page identities resident in this process.
    pub fn page_ids(&self) -> impl Iterator<Item = PageId> + '_ {
        self.resident.iter().map(move |vaddr| PageId::new(self.pid, *vaddr))
    }
}

/// Output of one engine pass.
///
/// `pages` holds only the pages written by this pass; an incremental pass
/// omits pages unchanged since its parent.
#[derive(Debug, Clone, Default)]
pub struct EngineImage {
    pub processes: Vec<ProcessImage>,
    pub pages: Vec<PageFrame>,
    /// Engine-native files stored verbatim in the images directory.
    pub native_files: BTreeMap<String, Vec<u8>>,
}

impl EngineImage {
    /// Total payload bytes of the pages in this image.
    pub fn page_bytes(&self) -> u64 {
        self.pages.iter().map(|p| p.data.len() as u64).sum()
    }
}

/// Fully merged state handed to the engine at restore time.
#[derive(Debug, Clone)]
pub struct RestoreImage {
    pub processes: Vec<ProcessImage>,
    pub pages: BTreeMap<PageId, Vec<u8>>,
    pub native_files: BTreeMap<String, Vec<u8>>,
    pub work_dir: PathBuf,
}

/// Result of a successful restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredTree {
    pub root_pid: ProcessId,
    pub process_count: usize,
}

/// Host capabilities a snapshot was taken with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub kernel_release: String,
    pub arch: String,
    pub engine: String,
    pub engine_version: String,
}

impl HostInfo {
    /// Describe why a snapshot taken on `self` cannot be restored on `current`.
    pub fn incompatibility(&self, current: &HostInfo) -> Option<String> {
        if self.arch != current.arch {
            return Some(format!(
                "architecture mismatch: snapshot {}, host {}",
                self.arch, current.arch
            ));
        }
        if self.engine != current.engine {
            return Some(format!(
                "engine mismatch: snapshot {}, host {}",
                self.engine, current.engine
            ));
        }
        if self.kernel_release != current.kernel_release {
            return Some(format!(
                "kernel mismatch: snapshot {}, host {}",
                self.kernel_release, current.kernel_release
            ));
        }
        None
    }
}

/// External snapshot engine.
///
/// A final dump without leave-running leaves the tree *stopped*; the
/// orchestrator calls [`terminate`](SnapshotEngine::terminate) once the
/// snapshot is durable, or [`resume`](SnapshotEngine::resume) to roll back.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Short engine name recorded in snapshot metadata.
    fn name(&self) -> &'static str;

    /// Capabilities of the current host.
    async fn host_info(&self) -> Result<HostInfo, EngineError>;

    /// Non-stopping memory pass.
    async fn pre_dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError>;

    /// Final pass. Stops the tree unless `opts.leave_running`.
    async fn dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError>;

    /// Resume a tree stopped by a dump.
    async fn resume(&self, container: &ContainerId) -> Result<(), EngineError>;

    /// Tear down a tree stopped by a committed dump.
    async fn terminate(&self, container: &ContainerId) -> Result<(), EngineError>;

    /// Rebuild and resume a tree from a merged image.
    async fn restore(
        &self,
        container: &ContainerId,
        image: RestoreImage,
    ) -> Result<RestoredTree, EngineError>;
}
