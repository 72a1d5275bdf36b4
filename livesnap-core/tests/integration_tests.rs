// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for livesnap.
//!
//! These tests drive full checkpoint and restore sessions against the
//! in-memory engine, local snapshot directories, and a loopback page server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use livesnap_core::chain::{PageStore, PAGES_FILE};
use async_trait::async_trait;
use livesnap_core::engine::{
    DumpOptions, EngineImage, FailurePoint, HostInfo, RestoreImage, RestoredTree, SimulatedState,
};
use livesnap_core::error::{EngineError, LockError};
use livesnap_core::request::{resolve, resolve_restore};
use livesnap_core::{
    ChainError, ChainManager, CheckpointConfig, CheckpointError, CheckpointOrchestrator,
    ContainerId, InMemoryEngine, OperationLocks, OrchestratorConfig, PageLocation, PageServer,
    PageServerEndpoint, PageServerPool, PageServerStats, Port, RawCheckpointRequest,
    RawRestoreRequest, RestoreConfig, RestoreError, RestoreOrchestrator, SessionPhase,
    SnapshotEngine, ValidationError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PAGE_SIZE: u64 = 4096;

struct Harness {
    engine: Arc<InMemoryEngine>,
    locks: OperationLocks,
    checkpoint: CheckpointOrchestrator,
    restore: RestoreOrchestrator,
}

fn settings(max_passes: u32, convergence: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        pre_dump_max_iterations: max_passes,
        pre_dump_convergence_pages: convergence,
        operation_timeout: Duration::from_secs(30),
        batch_concurrency: 4,
    }
}

fn harness(settings: OrchestratorConfig) -> Harness {
    let engine = Arc::new(InMemoryEngine::new());
    let dyn_engine: Arc<dyn SnapshotEngine> = engine.clone();
    let locks = OperationLocks::new();
    let pool = PageServerPool::new(4, Duration::from_secs(2));
    let timeout = settings.operation_timeout;
    Harness {
        engine,
        locks: locks.clone(),
        checkpoint: CheckpointOrchestrator::new(
            dyn_engine.clone(),
            locks.clone(),
            pool.clone(),
            settings,
        ),
        restore: RestoreOrchestrator::new(dyn_engine, locks, pool, timeout),
    }
}

fn container(name: &str) -> ContainerId {
    ContainerId::new(name).unwrap()
}

fn request(root: &Path, name: &str) -> CheckpointConfig {
    CheckpointConfig {
        images_dir: root.join(name),
        work_dir: root.join("work"),
        leave_running: false,
        prev_images_dir: None,
        track_memory: false,
        enable_pre_dump: false,
        auto_dedup: false,
        page_server: None,
    }
}

fn restore_request(dir: &Path, force: bool) -> RestoreConfig {
    RestoreConfig {
        images_dir: dir.to_path_buf(),
        work_dir: None,
        force,
    }
}

fn stored_bytes(dirs: &[PathBuf]) -> u64 {
    dirs.iter()
        .map(|dir| {
            PageStore::read_index(dir)
                .unwrap()
                .iter()
                .map(|e| e.len as u64)
                .sum::<u64>()
        })
        .sum()
}

/// Invalid page server settings are rejected before any engine work
#[tokio::test]
async fn test_invalid_request_never_reaches_engine() {
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let missing_address = RawCheckpointRequest {
        images_directory: "/tmp/livesnap/web".to_string(),
        work_directory: "/tmp/livesnap/work".to_string(),
        page_server: true,
        port: 27000,
        ..Default::default()
    };
    assert!(matches!(
        resolve(&missing_address),
        Err(ValidationError::PageServerAddressMissing)
    ));

    let missing_port = RawCheckpointRequest {
        address: "10.0.0.2".to_string(),
        port: 0,
        ..missing_address
    };
    assert!(matches!(
        resolve(&missing_port),
        Err(ValidationError::PageServerPortMissing)
    ));

    assert!(resolve_restore(&RawRestoreRequest::default()).is_err());
    assert_eq!(h.engine.pre_dump_calls(), 0);
    assert_eq!(h.engine.dump_calls(), 0);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
}

/// Checkpoint with teardown, then restore the identical tree
#[tokio::test]
async fn test_checkpoint_restore_round_trip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 3, 8);
    h.engine.write_page(&c, 101, 0x40_0000, 0xAB).unwrap();
    let before = h.engine.observe(&c).unwrap();

    let config = request(dir.path(), "snap-1");
    let report = h.checkpoint.checkpoint(&c, &config).await.unwrap();
    assert_eq!(report.phase, SessionPhase::Completed);
    assert_eq!(report.chain_length, 1);
    assert_eq!(report.pages_written, 24);
    assert_eq!(report.page_location, PageLocation::Local);
    assert!(report.warnings.is_empty());
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Exited));

    let restored = h
        .restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap();
    assert_eq!(restored.process_count, 3);
    assert_eq!(restored.root_pid.value(), 100);
    assert_eq!(restored.snapshot_id, report.snapshot_id);
    assert_eq!(restored.pages_restored, 24);
    assert_eq!(h.engine.observe(&c).unwrap(), before);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
}

/// A leave-running base plus a tracked incremental dump restore to the latest memory
#[tokio::test]
async fn test_incremental_chain_restores_latest_pages() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("db");
    h.engine.spawn_container(&c, 2, 4);

    let base = CheckpointConfig {
        leave_running: true,
        track_memory: true,
        ..request(dir.path(), "base")
    };
    let first = h.checkpoint.checkpoint(&c, &base).await.unwrap();
    assert_eq!(first.pages_written, 8);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));

    h.engine.write_page(&c, 100, 0x40_1000, 0x11).unwrap();
    let before = h.engine.observe(&c).unwrap();

    let next = CheckpointConfig {
        prev_images_dir: Some(base.images_dir.clone()),
        track_memory: true,
        ..request(dir.path(), "next")
    };
    let second = h.checkpoint.checkpoint(&c, &next).await.unwrap();
    assert_eq!(second.pages_written, 1);
    assert_eq!(second.chain_length, 2);

    let base_link = ChainManager::read_link(&base.images_dir).unwrap();
    assert_eq!(base_link.successor, Some(second.snapshot_id));

    let chain = ChainManager::resolve_chain(&next.images_dir).unwrap();
    assert_eq!(chain[0].link.snapshot_id, first.snapshot_id);
    assert_eq!(chain[1].link.snapshot_id, second.snapshot_id);

    h.restore
        .restore(&c, &restore_request(&next.images_dir, false))
        .await
        .unwrap();
    assert_eq!(h.engine.observe(&c).unwrap(), before);
}

/// Tracked pre-dumps stop as soon as a pass writes no more than the threshold
#[tokio::test]
async fn test_pre_dump_converges_with_tracked_memory() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(5, 0));
    let c = container("cache");
    h.engine.spawn_container(&c, 2, 4);
    let before = h.engine.observe(&c).unwrap();

    let config = CheckpointConfig {
        enable_pre_dump: true,
        track_memory: true,
        ..request(dir.path(), "snap")
    };
    let report = h.checkpoint.checkpoint(&c, &config).await.unwrap();

    // Full first pass, empty second pass, empty final dump.
    assert_eq!(report.pre_dump_passes, 2);
    assert_eq!(h.engine.pre_dump_calls(), 2);
    assert_eq!(report.pages_written, 8);
    assert_eq!(report.chain_length, 3);
    assert!(config.images_dir.join("pre-dump-1").is_dir());
    assert!(config.images_dir.join("pre-dump-2").is_dir());
    assert!(!config.images_dir.join("pre-dump-3").exists());

    h.restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap();
    assert_eq!(h.engine.observe(&c).unwrap(), before);
}

/// After auto-dedup a chain of N full passes stores at most one full dump
#[tokio::test]
async fn test_auto_dedup_bounds_chain_size() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("batch");
    h.engine.spawn_container(&c, 2, 4);
    let before = h.engine.observe(&c).unwrap();
    let full_dump = 8 * PAGE_SIZE;

    let config = CheckpointConfig {
        enable_pre_dump: true,
        auto_dedup: true,
        ..request(dir.path(), "snap")
    };
    let report = h.checkpoint.checkpoint(&c, &config).await.unwrap();

    assert_eq!(report.pre_dump_passes, 3);
    assert_eq!(report.chain_length, 4);
    assert_eq!(report.bytes_written, 4 * full_dump);
    assert_eq!(report.phase, SessionPhase::Completed);

    let dedup = report.dedup.expect("auto-dedup should have run");
    assert_eq!(dedup.links_scanned, 4);
    assert_eq!(dedup.pages_removed, 24);
    assert_eq!(dedup.bytes_reclaimed, 3 * full_dump);

    let dirs: Vec<PathBuf> = ChainManager::resolve_chain(&config.images_dir)
        .unwrap()
        .into_iter()
        .map(|r| r.dir)
        .collect();
    assert!(stored_bytes(&dirs) <= full_dump);
    for resolved in &ChainManager::resolve_chain(&config.images_dir).unwrap()[..3] {
        assert!(resolved.link.deduplicated);
    }

    h.restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap();
    assert_eq!(h.engine.observe(&c).unwrap(), before);
}

/// One failing container fails the batch without affecting the others
#[tokio::test]
async fn test_batch_reports_aggregate_failure() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let ids = [container("c1"), container("c2"), container("c3")];
    for id in &ids {
        h.engine.spawn_container(id, 1, 4);
    }
    h.engine.inject_failure(&ids[1], FailurePoint::DumpBeforeStop);

    let config = request(dir.path(), "images");
    let report = h.checkpoint.checkpoint_batch(&ids, &config).await;

    assert_eq!(report.total(), 3);
    assert!(!report.is_success());
    assert_eq!(report.failed(), vec![&ids[1]]);
    assert!(config.images_dir.join("c1").join("chain.json").is_file());
    assert!(config.images_dir.join("c3").join("chain.json").is_file());
    assert!(!config.images_dir.join("c2").exists());
    assert_eq!(h.engine.state(&ids[1]), Some(SimulatedState::Running));

    let err = report.into_result().unwrap_err();
    assert_eq!(err.total, 3);
    assert_eq!(err.failed, vec![ids[1].clone()]);
}

/// Removing a middle link breaks restore of the leaf
#[tokio::test]
async fn test_missing_link_breaks_chain() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let config = CheckpointConfig {
        enable_pre_dump: true,
        ..request(dir.path(), "snap")
    };
    h.checkpoint.checkpoint(&c, &config).await.unwrap();

    std::fs::remove_dir_all(config.images_dir.join("pre-dump-2")).unwrap();
    assert!(matches!(
        ChainManager::resolve_chain(&config.images_dir),
        Err(ChainError::BrokenChain { .. })
    ));

    let err = h
        .restore
        .restore(&c, &restore_request(&config.images_dir, true))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RestoreError::Chain(ChainError::BrokenChain { .. })
    ));
}

/// A snapshot may have only one successor
#[tokio::test]
async fn test_second_successor_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let base = CheckpointConfig {
        leave_running: true,
        ..request(dir.path(), "base")
    };
    h.checkpoint.checkpoint(&c, &base).await.unwrap();

    let branch = |name: &str| CheckpointConfig {
        leave_running: true,
        prev_images_dir: Some(base.images_dir.clone()),
        ..request(dir.path(), name)
    };
    h.checkpoint.checkpoint(&c, &branch("b1")).await.unwrap();

    let dumps = h.engine.dump_calls();
    let err = h.checkpoint.checkpoint(&c, &branch("b2")).await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Chain(ChainError::AlreadyHasSuccessor { .. })
    ));
    assert_eq!(h.engine.dump_calls(), dumps);
    assert!(!dir.path().join("b2").exists());
}

/// A non-empty images directory is never overwritten
#[tokio::test]
async fn test_non_empty_images_dir_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let config = request(dir.path(), "snap");
    std::fs::create_dir_all(&config.images_dir).unwrap();
    std::fs::write(config.images_dir.join("keep.txt"), b"data").unwrap();

    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::ImagesDirectoryNotEmpty { .. }));
    assert!(config.images_dir.join("keep.txt").is_file());
    assert_eq!(h.engine.dump_calls(), 0);
}

/// Concurrent operations on one container are rejected
#[tokio::test]
async fn test_busy_container_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let held = h.locks.acquire(&c, "restore", &[]).unwrap();
    let err = h
        .checkpoint
        .checkpoint(&c, &request(dir.path(), "snap"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Lock(LockError::ContainerBusy {
            operation: "restore",
            ..
        })
    ));
    assert_eq!(h.engine.dump_calls(), 0);

    drop(held);
    h.checkpoint
        .checkpoint(&c, &request(dir.path(), "snap"))
        .await
        .unwrap();
}

/// Host and container checks block restore unless forced
#[tokio::test]
async fn test_restore_compatibility_checks() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let config = request(dir.path(), "snap");
    h.checkpoint.checkpoint(&c, &config).await.unwrap();

    let other = container("other");
    let err = h
        .restore
        .restore(&other, &restore_request(&config.images_dir, false))
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::ContainerMismatch { .. }));

    let current = h.engine.host_info().await.unwrap();
    h.engine.set_host_info(HostInfo {
        kernel_release: "7.0.0-other".to_string(),
        ..current
    });

    let err = h
        .restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::Incompatible { .. }));
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Exited));

    let report = h
        .restore
        .restore(&c, &restore_request(&config.images_dir, true))
        .await
        .unwrap();
    assert!(report.forced);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
}

/// A dump failing after the freeze resumes the tree and leaves no images
#[tokio::test]
async fn test_failed_dump_rolls_back() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);
    h.engine.inject_failure(&c, FailurePoint::DumpAfterStop);

    let config = request(dir.path(), "snap");
    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Engine(_)));
    assert_eq!(h.engine.resume_calls(), 1);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
    assert!(!config.images_dir.exists());

    // Resume failure is reported alongside the original error.
    h.engine.inject_failure(&c, FailurePoint::Resume);
    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    match err {
        CheckpointError::ResumeFailed { original, .. } => {
            assert!(matches!(*original, CheckpointError::Engine(_)))
        }
        other => panic!("expected ResumeFailed, got {:?}", other),
    }
}

/// A cancelled session leaves nothing behind
#[tokio::test]
async fn test_cancelled_checkpoint_cleans_up() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let token = CancellationToken::new();
    token.cancel();
    let config = request(dir.path(), "snap");
    let err = h
        .checkpoint
        .checkpoint_with_cancel(&c, &config, token)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Cancelled));
    assert!(!config.images_dir.exists());
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
    assert_eq!(h.locks.active_operation(&c), None);
}

async fn start_page_server(
    root: &Path,
) -> (PageServerEndpoint, Arc<PageServerStats>, CancellationToken) {
    let server = PageServer::bind("127.0.0.1:0", root)
        .await
        .expect("Failed to bind page server");
    let addr = server.local_addr().unwrap();
    let stats = server.stats();
    let token = CancellationToken::new();
    let serve_token = token.clone();
    tokio::spawn(async move { server.serve(serve_token).await });

    let endpoint = PageServerEndpoint {
        address: "127.0.0.1".to_string(),
        port: Port::new(addr.port()).unwrap(),
    };
    (endpoint, stats, token)
}

/// Pages streamed to a page server are fetched back at restore
#[tokio::test]
async fn test_page_server_round_trip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let server_root = TempDir::new().expect("Failed to create temp dir");
    let (endpoint, stats, token) = start_page_server(server_root.path()).await;

    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 2, 4);
    let before = h.engine.observe(&c).unwrap();

    let config = CheckpointConfig {
        page_server: Some(endpoint.clone()),
        ..request(dir.path(), "snap")
    };
    let report = h.checkpoint.checkpoint(&c, &config).await.unwrap();
    assert_eq!(
        report.page_location,
        PageLocation::Remote {
            address: "127.0.0.1".to_string(),
            port: endpoint.port.value(),
        }
    );
    assert!(!config.images_dir.join(PAGES_FILE).exists());
    assert!(server_root
        .path()
        .join(report.snapshot_id.to_string())
        .is_dir());
    assert_eq!(PageServerStats::load(&stats.snapshots_committed), 1);
    assert_eq!(PageServerStats::load(&stats.pages_received), 8);

    h.restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap();
    assert_eq!(h.engine.observe(&c).unwrap(), before);
    assert_eq!(PageServerStats::load(&stats.pages_served), 8);

    token.cancel();
}

/// An unreachable page server fails the session before the engine runs
#[tokio::test]
async fn test_unreachable_page_server() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);

    let config = CheckpointConfig {
        enable_pre_dump: true,
        page_server: Some(PageServerEndpoint {
            address: "127.0.0.1".to_string(),
            port: Port::new(port).unwrap(),
        }),
        ..request(dir.path(), "snap")
    };
    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Transport(_)));
    assert_eq!(h.engine.pre_dump_calls(), 0);
    assert_eq!(h.engine.dump_calls(), 0);
    assert!(!config.images_dir.exists());
}

/// A page server dropping the connection mid-upload rolls the session back
#[tokio::test]
async fn test_page_server_disconnect_resumes_tree() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 2, 4);

    let config = CheckpointConfig {
        page_server: Some(PageServerEndpoint {
            address: "127.0.0.1".to_string(),
            port: Port::new(port).unwrap(),
        }),
        ..request(dir.path(), "snap")
    };
    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Transport(_)));
    assert_eq!(h.engine.dump_calls(), 1);
    assert_eq!(h.engine.resume_calls(), 1);
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
    assert!(!config.images_dir.exists());
}

/// Pre-dump passes already on the page server are discarded on abort
#[tokio::test]
async fn test_aborted_session_discards_remote_pre_dumps() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let server_root = TempDir::new().expect("Failed to create temp dir");
    let (endpoint, stats, token) = start_page_server(server_root.path()).await;

    let h = harness(settings(2, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);
    h.engine.inject_failure(&c, FailurePoint::DumpAfterStop);

    let config = CheckpointConfig {
        enable_pre_dump: true,
        page_server: Some(endpoint),
        ..request(dir.path(), "snap")
    };
    let err = h.checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Engine(_)));
    assert!(h.engine.pre_dump_calls() >= 1);

    let committed = PageServerStats::load(&stats.snapshots_committed);
    assert_eq!(committed, h.engine.pre_dump_calls());
    assert_eq!(PageServerStats::load(&stats.snapshots_discarded), committed);
    assert_eq!(
        std::fs::read_dir(server_root.path()).unwrap().count(),
        0,
        "page server still holds snapshots"
    );
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Running));
    assert!(!config.images_dir.exists());

    token.cancel();
}

/// Engine whose dump and restore take `delay` to return.
///
/// The dump runs the wrapped engine first, so the tree is already stopped
/// while the caller waits.
struct SlowEngine {
    inner: Arc<InMemoryEngine>,
    delay: Duration,
}

#[async_trait]
impl SnapshotEngine for SlowEngine {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn host_info(&self) -> Result<HostInfo, EngineError> {
        self.inner.host_info().await
    }

    async fn pre_dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        self.inner.pre_dump(container, opts).await
    }

    async fn dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        let image = self.inner.dump(container, opts).await?;
        tokio::time::sleep(self.delay).await;
        Ok(image)
    }

    async fn resume(&self, container: &ContainerId) -> Result<(), EngineError> {
        self.inner.resume(container).await
    }

    async fn terminate(&self, container: &ContainerId) -> Result<(), EngineError> {
        self.inner.terminate(container).await
    }

    async fn restore(
        &self,
        container: &ContainerId,
        image: RestoreImage,
    ) -> Result<RestoredTree, EngineError> {
        tokio::time::sleep(self.delay).await;
        self.inner.restore(container, image).await
    }
}

fn slow_orchestrators(
    inner: &Arc<InMemoryEngine>,
    timeout: Duration,
) -> (CheckpointOrchestrator, RestoreOrchestrator, OperationLocks) {
    let engine: Arc<dyn SnapshotEngine> = Arc::new(SlowEngine {
        inner: Arc::clone(inner),
        delay: Duration::from_secs(5),
    });
    let locks = OperationLocks::new();
    let pool = PageServerPool::new(1, Duration::from_secs(2));
    let settings = OrchestratorConfig {
        operation_timeout: timeout,
        ..settings(3, 0)
    };
    (
        CheckpointOrchestrator::new(engine.clone(), locks.clone(), pool.clone(), settings),
        RestoreOrchestrator::new(engine, locks.clone(), pool, timeout),
        locks,
    )
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    token
}

/// A dump outliving the operation timeout resumes the tree and leaves no images
#[tokio::test]
async fn test_timeout_during_dump_rolls_back() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let inner = Arc::new(InMemoryEngine::new());
    let c = container("web");
    inner.spawn_container(&c, 1, 4);
    let (checkpoint, _, locks) = slow_orchestrators(&inner, Duration::from_millis(200));

    let config = request(dir.path(), "snap");
    let err = checkpoint.checkpoint(&c, &config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Timeout { .. }));
    assert_eq!(inner.dump_calls(), 1);
    assert_eq!(inner.resume_calls(), 1);
    assert_eq!(inner.state(&c), Some(SimulatedState::Running));
    assert!(!config.images_dir.exists());
    assert_eq!(locks.active_operation(&c), None);
}

/// Cancelling while the dump is in flight resumes the tree and leaves no images
#[tokio::test]
async fn test_cancel_during_dump_rolls_back() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let inner = Arc::new(InMemoryEngine::new());
    let c = container("web");
    inner.spawn_container(&c, 1, 4);
    let (checkpoint, _, locks) = slow_orchestrators(&inner, Duration::from_secs(30));

    let config = request(dir.path(), "snap");
    let err = checkpoint
        .checkpoint_with_cancel(&c, &config, cancel_after(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Cancelled));
    assert_eq!(inner.dump_calls(), 1);
    assert_eq!(inner.resume_calls(), 1);
    assert_eq!(inner.state(&c), Some(SimulatedState::Running));
    assert!(!config.images_dir.exists());
    assert_eq!(locks.active_operation(&c), None);
}

/// A restore outliving the timeout or cancelled in flight fails without
/// rebuilding the tree
#[tokio::test]
async fn test_restore_timeout_and_cancel() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(settings(3, 0));
    let c = container("web");
    h.engine.spawn_container(&c, 1, 4);
    let config = request(dir.path(), "snap");
    h.checkpoint.checkpoint(&c, &config).await.unwrap();
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Exited));

    let (_, restore, locks) = slow_orchestrators(&h.engine, Duration::from_millis(200));
    let err = restore
        .restore(&c, &restore_request(&config.images_dir, false))
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::Timeout { .. }));
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Exited));
    assert_eq!(locks.active_operation(&c), None);

    let (_, restore, _) = slow_orchestrators(&h.engine, Duration::from_secs(30));
    let err = restore
        .restore_with_cancel(
            &c,
            &restore_request(&config.images_dir, false),
            cancel_after(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::Cancelled));
    assert_eq!(h.engine.state(&c), Some(SimulatedState::Exited));
    assert!(config.images_dir.join("chain.json").exists());
}
