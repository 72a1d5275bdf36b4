// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-memory snapshot engine.
//!
//! Simulates container process trees with page-granular memory, dirty-page
//! tracking across passes, and injectable failures. Used to test the
//! orchestration layer without CRIU or root privileges.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    DumpOptions, EngineImage, HostInfo, PageFrame, ProcessImage, RestoreImage, RestoredTree,
    SnapshotEngine, PAGE_SIZE,
};
use crate::error::EngineError;
use crate::types::{ContainerId, PageId, ProcessId, SnapshotId};

/// First PID handed out to simulated processes.
const FIRST_PID: u32 = 100;
/// Base virtual address of simulated process memory.
const BASE_VADDR: u64 = 0x40_0000;

/// Lifecycle of a simulated container's process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedState {
    Running,
    /// Frozen by a dump, waiting for terminate or resume.
    Stopped,
    /// Tree torn down after a committed dump.
    Exited,
}

/// Point at which an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    PreDump,
    /// Dump fails before the tree is frozen.
    DumpBeforeStop,
    /// Dump fails after the tree was frozen.
    DumpAfterStop,
    Resume,
    Restore,
}

/// Observable state of one simulated process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedProcess {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
    pub memory: BTreeMap<u64, Vec<u8>>,
}

#[derive(Debug)]
struct SimulatedContainer {
    processes: Vec<SimulatedProcess>,
    state: SimulatedState,
    dirty: BTreeSet<PageId>,
    tracked_snapshot: Option<SnapshotId>,
}

/// Engine backed by simulated in-process containers.
#[derive(Debug)]
pub struct InMemoryEngine {
    containers: DashMap<ContainerId, SimulatedContainer>,
    failures: DashMap<ContainerId, HashSet<FailurePoint>>,
    host: RwLock<HostInfo>,
    pre_dump_calls: AtomicU64,
    dump_calls: AtomicU64,
    resume_calls: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            failures: DashMap::new(),
            host: RwLock::new(HostInfo {
                kernel_release: "6.1.0-simulated".to_string(),
                arch: std::env::consts::ARCH.to_string(),
                engine: "in-memory".to_string(),
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            pre_dump_calls: AtomicU64::new(0),
            dump_calls: AtomicU64::new(0),
            resume_calls: AtomicU64::new(0),
        }
    }

    /// Start a simulated container with `processes` processes of
    /// `pages_per_process` pages each. Replaces any existing container.
    pub fn spawn_container(&self, id: &ContainerId, processes: usize, pages_per_process: usize) {
        let root = FIRST_PID;
        let processes = (0..processes)
            .map(|i| {
                let pid = FIRST_PID + i as u32;
                let memory = (0..pages_per_process)
                    .map(|page| {
                        let vaddr = BASE_VADDR + (page * PAGE_SIZE) as u64;
                        (vaddr, page_pattern(pid, vaddr))
                    })
                    .collect();
                SimulatedProcess {
                    pid,
                    ppid: if i == 0 { 1 } else { root },
                    command: format!("{}-worker-{}", id, i),
                    memory,
                }
            })
            .collect();

        self.containers.insert(
            id.clone(),
            SimulatedContainer {
                processes,
                state: SimulatedState::Running,
                dirty: BTreeSet::new(),
                tracked_snapshot: None,
            },
        );
    }

    /// Overwrite one page of a running process and mark it dirty.
    pub fn write_page(
        &self,
        id: &ContainerId,
        pid: u32,
        vaddr: u64,
        fill: u8,
    ) -> Result<(), EngineError> {
        let mut container = self.running(id)?;
        let process = container
            .processes
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or_else(|| EngineError::InvalidContainerState {
                container_id: id.clone(),
                reason: format!("no process with pid {}", pid),
            })?;
        process.memory.insert(vaddr, vec![fill; PAGE_SIZE]);
        container.dirty.insert(PageId::new(pid, vaddr));
        Ok(())
    }

    /// Snapshot of the observable process state, if the container exists.
    pub fn observe(&self, id: &ContainerId) -> Option<Vec<SimulatedProcess>> {
        self.containers.get(id).map(|c| c.processes.clone())
    }

    /// Current tree state, if the container exists.
    pub fn state(&self, id: &ContainerId) -> Option<SimulatedState> {
        self.containers.get(id).map(|c| c.state)
    }

    /// Forget a container entirely (e.g. a fresh migration target).
    pub fn remove_container(&self, id: &ContainerId) {
        self.containers.remove(id);
    }

    /// Make every subsequent call at `point` fail for `id`.
    pub fn inject_failure(&self, id: &ContainerId, point: FailurePoint) {
        self.failures.entry(id.clone()).or_default().insert(point);
    }

    pub fn clear_failures(&self, id: &ContainerId) {
        self.failures.remove(id);
    }

    /// Replace the reported host capabilities.
    pub fn set_host_info(&self, host: HostInfo) {
        let mut guard = self.host.write().unwrap_or_else(|e| e.into_inner());
        *guard = host;
    }

    pub fn pre_dump_calls(&self) -> u64 {
        self.pre_dump_calls.load(Ordering::Relaxed)
    }

    pub fn dump_calls(&self) -> u64 {
        self.dump_calls.load(Ordering::Relaxed)
    }

    pub fn resume_calls(&self) -> u64 {
        self.resume_calls.load(Ordering::Relaxed)
    }

    fn should_fail(&self, id: &ContainerId, point: FailurePoint) -> bool {
        self.failures
            .get(id)
            .map(|set| set.contains(&point))
            .unwrap_or(false)
    }

    fn running(
        &self,
        id: &ContainerId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, ContainerId, SimulatedContainer>, EngineError>
    {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::ContainerNotFound {
                container_id: id.clone(),
            })?;
        if container.state != SimulatedState::Running {
            return Err(EngineError::InvalidContainerState {
                container_id: id.clone(),
                reason: format!("expected running, found {:?}", container.state),
            });
        }
        Ok(container)
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture the container's tree, writing only dirty pages when the pass is
/// incremental against the snapshot tracking was last armed for.
fn capture(container: &mut SimulatedContainer, opts: &DumpOptions) -> EngineImage {
    let incremental = opts.track_memory
        && opts.parent.is_some()
        && container.tracked_snapshot == opts.parent;

    let mut pages = Vec::new();
    let mut processes = Vec::with_capacity(container.processes.len());
    for process in &container.processes {
        for (vaddr, data) in &process.memory {
            let id = PageId::new(process.pid, *vaddr);
            if !incremental || container.dirty.contains(&id) {
                pages.push(PageFrame {
                    id,
                    data: data.clone(),
                });
            }
        }
        processes.push(ProcessImage {
            pid: process.pid,
            ppid: process.ppid,
            command: process.command.clone(),
            resident: process.memory.keys().copied().collect(),
        });
    }

    container.dirty.clear();
    container.tracked_snapshot = opts.track_memory.then_some(opts.snapshot_id);

    let mut native_files = BTreeMap::new();
    native_files.insert(
        "sim-core.img".to_string(),
        format!("simulated tree, {} processes\n", processes.len()).into_bytes(),
    );

    EngineImage {
        processes,
        pages,
        native_files,
    }
}

/// Deterministic page contents for freshly spawned memory.
fn page_pattern(pid: u32, vaddr: u64) -> Vec<u8> {
    let seed = (pid as u64 ^ (vaddr >> 12)) as u8;
    (0..PAGE_SIZE)
        .map(|i| seed.wrapping_add(i as u8))
        .collect()
}

#[async_trait]
impl SnapshotEngine for InMemoryEngine {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn host_info(&self) -> Result<HostInfo, EngineError> {
        Ok(self.host.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn pre_dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        self.pre_dump_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail(container, FailurePoint::PreDump) {
            return Err(EngineError::PreDumpFailed {
                reason: format!("injected pre-dump failure for {}", container),
            });
        }
        let mut entry = self.running(container)?;
        Ok(capture(&mut entry, opts))
    }

    async fn dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        self.dump_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail(container, FailurePoint::DumpBeforeStop) {
            return Err(EngineError::DumpFailed {
                reason: format!("injected dump failure for {}", container),
                tree_stopped: false,
            });
        }

        let fail_after_stop = self.should_fail(container, FailurePoint::DumpAfterStop);
        let mut entry = self.running(container)?;
        if !opts.leave_running {
            entry.state = SimulatedState::Stopped;
        }
        if fail_after_stop {
            return Err(EngineError::DumpFailed {
                reason: format!("injected dump failure after freeze for {}", container),
                tree_stopped: !opts.leave_running,
            });
        }
        Ok(capture(&mut entry, opts))
    }

    async fn resume(&self, container: &ContainerId) -> Result<(), EngineError> {
        self.resume_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail(container, FailurePoint::Resume) {
            return Err(EngineError::ResumeFailed {
                reason: format!("injected resume failure for {}", container),
            });
        }
        let mut entry =
            self.containers
                .get_mut(container)
                .ok_or_else(|| EngineError::ContainerNotFound {
                    container_id: container.clone(),
                })?;
        match entry.state {
            SimulatedState::Stopped | SimulatedState::Running => {
                entry.state = SimulatedState::Running;
                Ok(())
            }
            SimulatedState::Exited => Err(EngineError::ResumeFailed {
                reason: "process tree already exited".to_string(),
            }),
        }
    }

    async fn terminate(&self, container: &ContainerId) -> Result<(), EngineError> {
        let mut entry =
            self.containers
                .get_mut(container)
                .ok_or_else(|| EngineError::ContainerNotFound {
                    container_id: container.clone(),
                })?;
        entry.state = SimulatedState::Exited;
        entry.processes.clear();
        entry.dirty.clear();
        entry.tracked_snapshot = None;
        Ok(())
    }

    async fn restore(
        &self,
        container: &ContainerId,
        image: RestoreImage,
    ) -> Result<RestoredTree, EngineError> {
        if self.should_fail(container, FailurePoint::Restore) {
            return Err(EngineError::RestoreFailed {
                reason: format!("injected restore failure for {}", container),
            });
        }
        if let Some(existing) = self.containers.get(container) {
            if existing.state != SimulatedState::Exited {
                return Err(EngineError::InvalidContainerState {
                    container_id: container.clone(),
                    reason: format!("cannot restore over a {:?} tree", existing.state),
                });
            }
        }

        let mut processes = Vec::with_capacity(image.processes.len());
        for proc_image in &image.processes {
            let mut memory = BTreeMap::new();
            for id in proc_image.page_ids() {
                let data = image
                    .pages
                    .get(&id)
                    .ok_or_else(|| EngineError::RestoreFailed {
                        reason: format!("page {} missing from image", id),
                    })?;
                memory.insert(id.vaddr, data.clone());
            }
            processes.push(SimulatedProcess {
                pid: proc_image.pid,
                ppid: proc_image.ppid,
                command: proc_image.command.clone(),
                memory,
            });
        }

        let pids: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        let root = processes
            .iter()
            .find(|p| !pids.contains(&p.ppid))
            .map(|p| p.pid)
            .ok_or_else(|| EngineError::RestoreFailed {
                reason: "image has no root process".to_string(),
            })?;
        let root_pid = ProcessId::new(root).map_err(|e| EngineError::RestoreFailed {
            reason: e.to_string(),
        })?;
        let process_count = processes.len();

        self.containers.insert(
            container.clone(),
            SimulatedContainer {
                processes,
                state: SimulatedState::Running,
                dirty: BTreeSet::new(),
                tracked_snapshot: None,
            },
        );

        Ok(RestoredTree {
            root_pid,
            process_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(parent: Option<SnapshotId>, track_memory: bool) -> DumpOptions {
        DumpOptions {
            snapshot_id: SnapshotId::generate(),
            parent,
            leave_running: true,
            track_memory,
            work_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_incremental_pass_only_writes_dirty_pages() {
        let engine = InMemoryEngine::new();
        let id = ContainerId::new("sim").unwrap();
        engine.spawn_container(&id, 2, 8);

        let first = opts(None, true);
        let full = engine.pre_dump(&id, &first).await.unwrap();
        assert_eq!(full.pages.len(), 16);

        engine.write_page(&id, FIRST_PID, BASE_VADDR, 0xAB).unwrap();
        let second = opts(Some(first.snapshot_id), true);
        let delta = engine.pre_dump(&id, &second).await.unwrap();
        assert_eq!(delta.pages.len(), 1);
        assert_eq!(delta.pages[0].data, vec![0xAB; PAGE_SIZE]);
        assert_eq!(delta.processes.len(), 2);
    }

    #[tokio::test]
    async fn test_untracked_pass_is_full() {
        let engine = InMemoryEngine::new();
        let id = ContainerId::new("sim").unwrap();
        engine.spawn_container(&id, 1, 4);

        let first = opts(None, false);
        engine.pre_dump(&id, &first).await.unwrap();
        let second = engine
            .pre_dump(&id, &opts(Some(first.snapshot_id), false))
            .await
            .unwrap();
        assert_eq!(second.pages.len(), 4);
    }

    #[tokio::test]
    async fn test_dump_stops_then_resume() {
        let engine = InMemoryEngine::new();
        let id = ContainerId::new("sim").unwrap();
        engine.spawn_container(&id, 1, 1);

        let mut o = opts(None, false);
        o.leave_running = false;
        engine.dump(&id, &o).await.unwrap();
        assert_eq!(engine.state(&id), Some(SimulatedState::Stopped));

        engine.resume(&id).await.unwrap();
        assert_eq!(engine.state(&id), Some(SimulatedState::Running));
    }

    #[tokio::test]
    async fn test_injected_failure_after_stop() {
        let engine = InMemoryEngine::new();
        let id = ContainerId::new("sim").unwrap();
        engine.spawn_container(&id, 1, 1);
        engine.inject_failure(&id, FailurePoint::DumpAfterStop);

        let mut o = opts(None, false);
        o.leave_running = false;
        let err = engine.dump(&id, &o).await.unwrap_err();
        assert!(err.tree_stopped());
        assert_eq!(engine.state(&id), Some(SimulatedState::Stopped));
    }

    #[tokio::test]
    async fn test_restore_rejects_running_tree() {
        let engine = InMemoryEngine::new();
        let id = ContainerId::new("sim").unwrap();
        engine.spawn_container(&id, 1, 1);

        let image = RestoreImage {
            processes: Vec::new(),
            pages: BTreeMap::new(),
            native_files: BTreeMap::new(),
            work_dir: std::env::temp_dir(),
        };
        assert!(matches!(
            engine.restore(&id, image).await,
            Err(EngineError::InvalidContainerState { .. })
        ));
    }
}
