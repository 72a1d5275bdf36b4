// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint session orchestration.
//!
//! One session: lock the container, validate the predecessor, run the
//! pre-dump passes, take the final dump, persist pages locally or on a page
//! server, and record the chain link. Everything up to the recorded link runs
//! under the operation timeout and the caller's cancellation token. On any
//! abort the partially written images directory is removed, a stopped tree
//! is resumed, and passes already committed to a page server are discarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::chain::{
    write_native_files, ChainLink, ChainManager, Inventory, PageLocation, PageStore, ParentRef,
};
use crate::config::OrchestratorConfig;
use crate::dedup::{CompactionReport, DedupCoordinator};
use crate::engine::{DumpKind, DumpOptions, EngineImage, HostInfo, SnapshotEngine};
use crate::error::{BatchError, CheckpointError, StateTransitionError, TransportError};
use crate::lock::OperationLocks;
use crate::request::CheckpointConfig;
use crate::session::{SessionPhase, SessionTracker};
use crate::transport::{PageServerEndpoint, PageServerPool, PageServerSession};
use crate::types::{ContainerId, SnapshotId};

/// Outcome of one successful checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub container_id: ContainerId,
    /// Snapshot ID of the final dump.
    pub snapshot_id: SnapshotId,
    pub images_dir: PathBuf,
    pub pre_dump_passes: u32,
    /// Pages written across all passes.
    pub pages_written: usize,
    pub bytes_written: u64,
    /// Links in the chain ending at this snapshot.
    pub chain_length: usize,
    pub page_location: PageLocation,
    pub phase: SessionPhase,
    pub dedup: Option<CompactionReport>,
    /// Non-fatal problems, e.g. a failed compaction.
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

/// Outcome of one container in a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub container_id: ContainerId,
    pub result: Result<CheckpointReport, CheckpointError>,
}

/// Per-container outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> Vec<&ContainerId> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| &o.container_id)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Collapse into the successful reports, or one aggregate error.
    pub fn into_result(self) -> Result<Vec<CheckpointReport>, BatchError> {
        let total = self.total();
        let mut reports = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for outcome in self.outcomes {
            match outcome.result {
                Ok(report) => reports.push(report),
                Err(_) => failed.push(outcome.container_id),
            }
        }
        if failed.is_empty() {
            Ok(reports)
        } else {
            Err(BatchError {
                operation: "checkpoint",
                failed,
                total,
            })
        }
    }
}

/// State shared between a running session and its abort handling.
struct Progress {
    tree_stopped: AtomicBool,
    tracker: Mutex<SessionTracker>,
    /// Snapshots committed to the page server by this session.
    remote: Mutex<Vec<SnapshotId>>,
}

impl Progress {
    fn new(container: &ContainerId) -> Self {
        Self {
            tree_stopped: AtomicBool::new(false),
            tracker: Mutex::new(SessionTracker::new(container.clone())),
            remote: Mutex::new(Vec::new()),
        }
    }

    fn record_remote(&self, snapshot_id: SnapshotId) {
        self.remote
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(snapshot_id);
    }

    fn take_remote(&self) -> Vec<SnapshotId> {
        std::mem::take(&mut *self.remote.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn transition(&self, phase: SessionPhase) -> Result<(), StateTransitionError> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transition_to(phase)
    }

    fn phase(&self) -> SessionPhase {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).phase()
    }

    fn pre_dump_passes(&self) -> u32 {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pre_dump_passes()
    }

    fn fail(&self, rolled_back: bool) -> SessionPhase {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail(rolled_back)
    }

    fn set_tree_stopped(&self, stopped: bool) {
        self.tree_stopped.store(stopped, Ordering::SeqCst);
    }

    fn tree_stopped(&self) -> bool {
        self.tree_stopped.load(Ordering::SeqCst)
    }
}

/// Removes a partially written images directory unless committed.
struct ImagesDirGuard {
    path: PathBuf,
    created: bool,
    /// Predecessor whose successor must be cleared on abort.
    detach: Option<(PathBuf, SnapshotId)>,
    committed: bool,
}

impl ImagesDirGuard {
    /// Claim `path` for a new snapshot. It must be absent or empty.
    fn prepare(path: &Path) -> Result<Self, CheckpointError> {
        let created = match std::fs::read_dir(path) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(CheckpointError::ImagesDirectoryNotEmpty {
                        path: path.to_path_buf(),
                    });
                }
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path).map_err(|e| CheckpointError::Io {
                    context: format!("creating images directory {}", path.display()),
                    source: e,
                })?;
                true
            }
            Err(e) => {
                return Err(CheckpointError::Io {
                    context: format!("inspecting images directory {}", path.display()),
                    source: e,
                })
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            created,
            detach: None,
            committed: false,
        })
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for ImagesDirGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if let Some((parent, successor)) = &self.detach {
            if let Err(e) = ChainManager::detach(parent, *successor) {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to detach abandoned snapshot from predecessor");
            }
        }

        let result = if self.created {
            std::fs::remove_dir_all(&self.path)
        } else {
            clear_dir(&self.path)
        };
        match result {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Removed partially written images directory")
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to clean up images directory")
            }
        }
    }
}

fn clear_dir(path: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Result of the timed part of a session.
struct Committed {
    snapshot_id: SnapshotId,
    pages_written: usize,
    bytes_written: u64,
    chain_length: usize,
    page_location: PageLocation,
}

/// Drives checkpoint sessions against an injected snapshot engine.
///
/// Cheap to clone; clones share the engine, lock table and connection pool.
#[derive(Clone)]
pub struct CheckpointOrchestrator {
    engine: Arc<dyn SnapshotEngine>,
    locks: OperationLocks,
    pool: PageServerPool,
    settings: OrchestratorConfig,
}

impl CheckpointOrchestrator {
    pub fn new(
        engine: Arc<dyn SnapshotEngine>,
        locks: OperationLocks,
        pool: PageServerPool,
        settings: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            locks,
            pool,
            settings,
        }
    }

    /// Checkpoint one container.
    pub async fn checkpoint(
        &self,
        container: &ContainerId,
        config: &CheckpointConfig,
    ) -> Result<CheckpointReport, CheckpointError> {
        self.checkpoint_with_cancel(container, config, CancellationToken::new())
            .await
    }

    /// Checkpoint one container, aborting when `cancel` fires.
    pub async fn checkpoint_with_cancel(
        &self,
        container: &ContainerId,
        config: &CheckpointConfig,
        cancel: CancellationToken,
    ) -> Result<CheckpointReport, CheckpointError> {
        let start = Instant::now();
        let _lock = self.locks.acquire(
            container,
            "checkpoint",
            &[config.images_dir.as_path(), config.work_dir.as_path()],
        )?;

        tracing::info!(
            container_id = %container,
            images_dir = %config.images_dir.display(),
            pre_dump = config.enable_pre_dump,
            page_server = config.page_server.is_some(),
            "Starting checkpoint"
        );

        let progress = Progress::new(container);
        let timeout = self.settings.operation_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CheckpointError::Cancelled),
            timed = tokio::time::timeout(timeout, self.run(container, config, &progress)) => {
                match timed {
                    Ok(result) => result,
                    Err(_) => Err(CheckpointError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }),
                }
            }
        };

        let committed = match outcome {
            Ok(committed) => committed,
            Err(e) => return Err(self.abort(container, config, e, &progress).await),
        };

        let mut warnings = Vec::new();
        if !config.leave_running {
            if let Err(e) = self.engine.terminate(container).await {
                tracing::warn!(container_id = %container, error = %e, "Failed to tear down stopped process tree");
                warnings.push(format!("failed to tear down stopped process tree: {}", e));
            }
        }

        let mut dedup = None;
        if config.auto_dedup && committed.chain_length > 1 {
            progress.transition(SessionPhase::Deduplicating)?;
            let leaf = config.images_dir.clone();
            match tokio::task::spawn_blocking(move || DedupCoordinator::compact_dir(&leaf)).await {
                Ok(Ok(report)) => dedup = Some(report),
                Ok(Err(e)) => {
                    tracing::warn!(container_id = %container, error = %e, "Chain compaction failed; disk usage was not reduced");
                    warnings.push(format!("deduplication failed, disk usage was not reduced: {}", e));
                }
                Err(e) => {
                    tracing::warn!(container_id = %container, error = %e, "Chain compaction task failed");
                    warnings.push(format!("deduplication task failed: {}", e));
                }
            }
        }
        progress.transition(SessionPhase::Completed)?;

        let report = CheckpointReport {
            container_id: container.clone(),
            snapshot_id: committed.snapshot_id,
            images_dir: config.images_dir.clone(),
            pre_dump_passes: progress.pre_dump_passes(),
            pages_written: committed.pages_written,
            bytes_written: committed.bytes_written,
            chain_length: committed.chain_length,
            page_location: committed.page_location,
            phase: progress.phase(),
            dedup,
            warnings,
            elapsed: start.elapsed(),
        };

        tracing::info!(
            container_id = %container,
            snapshot_id = %report.snapshot_id,
            pre_dump_passes = report.pre_dump_passes,
            pages = report.pages_written,
            chain_length = report.chain_length,
            elapsed_ms = report.elapsed.as_millis(),
            "Checkpoint completed"
        );

        Ok(report)
    }

    /// Checkpoint several containers concurrently.
    ///
    /// With more than one container every directory in `config` is treated
    /// as a parent and each container gets `<dir>/<container_id>`.
    pub async fn checkpoint_batch(
        &self,
        containers: &[ContainerId],
        config: &CheckpointConfig,
    ) -> BatchReport {
        self.checkpoint_batch_with_cancel(containers, config, CancellationToken::new())
            .await
    }

    pub async fn checkpoint_batch_with_cancel(
        &self,
        containers: &[ContainerId],
        config: &CheckpointConfig,
        cancel: CancellationToken,
    ) -> BatchReport {
        let permits = Arc::new(Semaphore::new(self.settings.batch_concurrency));
        let per_container_dirs = containers.len() > 1;

        let mut handles = Vec::with_capacity(containers.len());
        for container in containers {
            let orchestrator = self.clone();
            let container = container.clone();
            let config = if per_container_dirs {
                scoped_config(config, &container)
            } else {
                config.clone()
            };
            let permits = Arc::clone(&permits);
            let cancel = cancel.child_token();
            let id = container.clone();

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| CheckpointError::Cancelled)?;
                orchestrator
                    .checkpoint_with_cancel(&container, &config, cancel)
                    .await
            });
            handles.push((id, handle));
        }

        let mut report = BatchReport::default();
        for (container_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(CheckpointError::TaskAborted {
                    reason: e.to_string(),
                }),
            };
            if let Err(e) = &result {
                tracing::error!(container_id = %container_id, error = %e, "Checkpoint failed");
            }
            report.outcomes.push(BatchOutcome {
                container_id,
                result,
            });
        }
        report
    }

    /// The timed part of a session: everything up to a durable chain link.
    async fn run(
        &self,
        container: &ContainerId,
        config: &CheckpointConfig,
        progress: &Progress,
    ) -> Result<Committed, CheckpointError> {
        let mut parent = match &config.prev_images_dir {
            Some(prev) => Some(ChainManager::link(&config.images_dir, prev, container)?),
            None => None,
        };

        let mut guard = ImagesDirGuard::prepare(&config.images_dir)?;
        let images_dir = guard.path.clone();
        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(|e| CheckpointError::Io {
                context: format!("creating work directory {}", config.work_dir.display()),
                source: e,
            })?;

        let host = self.engine.host_info().await?;

        let mut session = match &config.page_server {
            Some(endpoint) => Some(self.pool.connect(endpoint).await?),
            None => None,
        };
        let endpoint = config.page_server.as_ref();

        let mut engine_parent = parent.as_ref().map(|p| p.snapshot_id);
        let mut pages_written = 0;
        let mut bytes_written = 0;

        if config.enable_pre_dump {
            for pass in 1..=self.settings.pre_dump_max_iterations {
                progress.transition(SessionPhase::PreDumping)?;

                let dir = images_dir.join(format!("pre-dump-{}", pass));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| CheckpointError::Io {
                        context: format!("creating {}", dir.display()),
                        source: e,
                    })?;

                let snapshot_id = SnapshotId::generate();
                let opts = DumpOptions {
                    snapshot_id,
                    parent: engine_parent,
                    leave_running: true,
                    track_memory: config.track_memory,
                    work_dir: config.work_dir.clone(),
                };
                let image = self.engine.pre_dump(container, &opts).await?;
                let pages = image.pages.len();
                let bytes = image.page_bytes();

                self.persist(
                    &dir,
                    container,
                    snapshot_id,
                    DumpKind::PreDump,
                    parent.take(),
                    &host,
                    image,
                    session.as_mut(),
                    endpoint,
                    progress,
                )
                .await?;
                if pass == 1 {
                    if let Some(prev) = &config.prev_images_dir {
                        guard.detach = Some((prev.clone(), snapshot_id));
                    }
                }

                tracing::info!(
                    container_id = %container,
                    pass = pass,
                    pages = pages,
                    "Pre-dump pass completed"
                );

                pages_written += pages;
                bytes_written += bytes;
                parent = Some(ParentRef {
                    snapshot_id,
                    path: std::path::absolute(&dir).unwrap_or(dir),
                });
                engine_parent = Some(snapshot_id);

                if pages <= self.settings.pre_dump_convergence_pages {
                    tracing::debug!(container_id = %container, pass = pass, "Pre-dump converged");
                    break;
                }
            }
        }

        progress.transition(SessionPhase::Dumping)?;
        let snapshot_id = SnapshotId::generate();
        let opts = DumpOptions {
            snapshot_id,
            parent: engine_parent,
            leave_running: config.leave_running,
            track_memory: config.track_memory,
            work_dir: config.work_dir.clone(),
        };

        // Assume the tree may be stopped until the engine says otherwise.
        progress.set_tree_stopped(!config.leave_running);
        let image = match self.engine.dump(container, &opts).await {
            Ok(image) => image,
            Err(e) => {
                progress.set_tree_stopped(e.tree_stopped());
                return Err(e.into());
            }
        };
        let pages = image.pages.len();
        let bytes = image.page_bytes();

        progress.transition(SessionPhase::Persisting)?;
        let page_location = self
            .persist(
                &images_dir,
                container,
                snapshot_id,
                DumpKind::Dump,
                parent,
                &host,
                image,
                session.as_mut(),
                endpoint,
                progress,
            )
            .await?;
        if !config.enable_pre_dump {
            if let Some(prev) = &config.prev_images_dir {
                guard.detach = Some((prev.clone(), snapshot_id));
            }
        }
        pages_written += pages;
        bytes_written += bytes;

        let chain_length = ChainManager::resolve_chain(&images_dir)?.len();
        guard.commit();

        Ok(Committed {
            snapshot_id,
            pages_written,
            bytes_written,
            chain_length,
            page_location,
        })
    }

    /// Write one pass into `dir` and record its chain link.
    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        dir: &Path,
        container: &ContainerId,
        snapshot_id: SnapshotId,
        kind: DumpKind,
        parent: Option<ParentRef>,
        host: &HostInfo,
        image: EngineImage,
        session: Option<&mut PageServerSession>,
        endpoint: Option<&PageServerEndpoint>,
        progress: &Progress,
    ) -> Result<PageLocation, CheckpointError> {
        write_native_files(dir, &image.native_files)?;
        let inventory = Inventory {
            processes: image.processes,
            native_files: image.native_files.keys().cloned().collect(),
        };
        let digest = inventory.write(dir)?;

        let location = match (session, endpoint) {
            (Some(session), Some(endpoint)) => {
                session.send(snapshot_id, container, &image.pages).await?;
                progress.record_remote(snapshot_id);
                PageLocation::Remote {
                    address: endpoint.address.clone(),
                    port: endpoint.port.value(),
                }
            }
            _ => {
                PageStore::write(dir, &image.pages)?;
                PageLocation::Local
            }
        };

        let link = ChainLink::new(
            snapshot_id,
            container.clone(),
            kind,
            parent,
            host.clone(),
            location.clone(),
            digest,
        );
        ChainManager::record(dir, &link)?;
        Ok(location)
    }

    /// Roll back after a failed, timed out or cancelled session.
    async fn abort(
        &self,
        container: &ContainerId,
        config: &CheckpointConfig,
        error: CheckpointError,
        progress: &Progress,
    ) -> CheckpointError {
        let error = self.resume_after_failure(container, error, progress).await;
        if let Some(endpoint) = &config.page_server {
            self.discard_remote(container, endpoint, progress.take_remote())
                .await;
        }
        error
    }

    /// Drop snapshots of an aborted session from the page server. Whatever
    /// cannot be dropped is logged by id.
    async fn discard_remote(
        &self,
        container: &ContainerId,
        endpoint: &PageServerEndpoint,
        mut remaining: Vec<SnapshotId>,
    ) {
        if remaining.is_empty() {
            return;
        }
        let total = remaining.len();

        let discarded = tokio::time::timeout(self.settings.operation_timeout, async {
            let mut session = self.pool.connect(endpoint).await?;
            while let Some(snapshot_id) = remaining.last().copied() {
                session.discard(snapshot_id).await?;
                remaining.pop();
            }
            Ok::<_, TransportError>(())
        })
        .await;

        let reason = match discarded {
            Ok(Ok(())) => {
                tracing::info!(
                    container_id = %container,
                    endpoint = %endpoint,
                    snapshots = total,
                    "Discarded page server snapshots of the aborted checkpoint"
                );
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        let orphaned: Vec<String> = remaining.iter().map(ToString::to_string).collect();
        tracing::warn!(
            container_id = %container,
            endpoint = %endpoint,
            snapshot_ids = %orphaned.join(","),
            error = %reason,
            "Page server still holds snapshots of the aborted checkpoint"
        );
    }

    async fn resume_after_failure(
        &self,
        container: &ContainerId,
        error: CheckpointError,
        progress: &Progress,
    ) -> CheckpointError {
        if !progress.tree_stopped() {
            let phase = progress.fail(false);
            tracing::error!(container_id = %container, phase = %phase, error = %error, "Checkpoint failed");
            return error;
        }

        match self.engine.resume(container).await {
            Ok(()) => {
                let phase = progress.fail(true);
                tracing::warn!(
                    container_id = %container,
                    phase = %phase,
                    error = %error,
                    "Checkpoint failed after the process tree was stopped; tree resumed"
                );
                error
            }
            Err(resume) => {
                let phase = progress.fail(false);
                tracing::error!(
                    container_id = %container,
                    phase = %phase,
                    error = %error,
                    resume_error = %resume,
                    "Checkpoint failed and the process tree could not be resumed"
                );
                CheckpointError::ResumeFailed {
                    original: Box::new(error),
                    resume,
                }
            }
        }
    }
}

/// Per-container directories for a batch.
fn scoped_config(config: &CheckpointConfig, container: &ContainerId) -> CheckpointConfig {
    let scope = |dir: &Path| dir.join(container.as_str());
    CheckpointConfig {
        images_dir: scope(&config.images_dir),
        work_dir: scope(&config.work_dir),
        prev_images_dir: config.prev_images_dir.as_deref().map(scope),
        page_server: config.page_server.clone(),
        ..*config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> CheckpointConfig {
        CheckpointConfig {
            images_dir: root.join("images"),
            work_dir: root.join("work"),
            leave_running: false,
            prev_images_dir: None,
            track_memory: false,
            enable_pre_dump: false,
            auto_dedup: false,
            page_server: None,
        }
    }

    #[test]
    fn test_scoped_config() {
        let base = config(Path::new("/snap"));
        let c = ContainerId::new("web").unwrap();
        let scoped = scoped_config(
            &CheckpointConfig {
                prev_images_dir: Some(PathBuf::from("/prev")),
                ..base
            },
            &c,
        );
        assert_eq!(scoped.images_dir, PathBuf::from("/snap/images/web"));
        assert_eq!(scoped.work_dir, PathBuf::from("/snap/work/web"));
        assert_eq!(scoped.prev_images_dir, Some(PathBuf::from("/prev/web")));
    }

    #[test]
    fn test_guard_removes_created_dir() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("images");
        {
            let guard = ImagesDirGuard::prepare(&path).unwrap();
            assert!(guard.created);
            std::fs::write(path.join("partial"), b"x").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_keeps_committed_and_preexisting_dir() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("images");
        std::fs::create_dir(&path).unwrap();
        {
            let _guard = ImagesDirGuard::prepare(&path).unwrap();
            std::fs::write(path.join("partial"), b"x").unwrap();
        }
        assert!(path.exists());
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);

        {
            let mut guard = ImagesDirGuard::prepare(&path).unwrap();
            std::fs::write(path.join("done"), b"x").unwrap();
            guard.commit();
        }
        assert!(path.join("done").exists());
        assert!(matches!(
            ImagesDirGuard::prepare(&path),
            Err(CheckpointError::ImagesDirectoryNotEmpty { .. })
        ));
    }

    #[test]
    fn test_batch_report_aggregates() {
        let failed = |id: &str| BatchOutcome {
            container_id: ContainerId::new(id).unwrap(),
            result: Err(CheckpointError::Cancelled),
        };
        let report = BatchReport {
            outcomes: vec![failed("c1"), failed("c2")],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed().len(), 2);
        let err = report.into_result().unwrap_err();
        assert_eq!(err.total, 2);
    }
}
