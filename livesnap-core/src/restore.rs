// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Restore orchestration.
//!
//! Resolves the chain ending at the requested directory, merges its pages
//! oldest to newest, and hands the merged image to the engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::chain::{
    read_native_files, ChainManager, Inventory, PageLocation, PageStore, ResolvedLink,
};
use crate::engine::{PageFrame, RestoreImage, SnapshotEngine};
use crate::error::RestoreError;
use crate::lock::OperationLocks;
use crate::request::RestoreConfig;
use crate::transport::{PageServerEndpoint, PageServerPool};
use crate::types::{ContainerId, PageId, Port, ProcessId, SnapshotId};

/// Outcome of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub container_id: ContainerId,
    /// Snapshot the tree was restored from (the chain leaf).
    pub snapshot_id: SnapshotId,
    pub root_pid: ProcessId,
    pub process_count: usize,
    pub chain_length: usize,
    pub pages_restored: usize,
    /// Compatibility checks were skipped.
    pub forced: bool,
    pub elapsed: Duration,
}

/// Rebuilds process trees from snapshot chains.
#[derive(Clone)]
pub struct RestoreOrchestrator {
    engine: Arc<dyn SnapshotEngine>,
    locks: OperationLocks,
    pool: PageServerPool,
    timeout: Duration,
}

impl RestoreOrchestrator {
    pub fn new(
        engine: Arc<dyn SnapshotEngine>,
        locks: OperationLocks,
        pool: PageServerPool,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            locks,
            pool,
            timeout,
        }
    }

    pub async fn restore(
        &self,
        container: &ContainerId,
        config: &RestoreConfig,
    ) -> Result<RestoreReport, RestoreError> {
        self.restore_with_cancel(container, config, CancellationToken::new())
            .await
    }

    /// Restore `container`, aborting when `cancel` fires.
    pub async fn restore_with_cancel(
        &self,
        container: &ContainerId,
        config: &RestoreConfig,
        cancel: CancellationToken,
    ) -> Result<RestoreReport, RestoreError> {
        let start = Instant::now();
        let _lock = self.locks.acquire(container, "restore", &[])?;

        tracing::info!(
            container_id = %container,
            images_dir = %config.images_dir.display(),
            force = config.force,
            "Starting restore"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RestoreError::Cancelled),
            timed = tokio::time::timeout(self.timeout, self.run(container, config, start)) => {
                match timed {
                    Ok(result) => result,
                    Err(_) => Err(RestoreError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }),
                }
            }
        };

        match &result {
            Ok(report) => tracing::info!(
                container_id = %container,
                snapshot_id = %report.snapshot_id,
                root_pid = %report.root_pid,
                processes = report.process_count,
                chain_length = report.chain_length,
                elapsed_ms = report.elapsed.as_millis(),
                "Restore completed"
            ),
            Err(e) => tracing::error!(container_id = %container, error = %e, "Restore failed"),
        }
        result
    }

    async fn run(
        &self,
        container: &ContainerId,
        config: &RestoreConfig,
        start: Instant,
    ) -> Result<RestoreReport, RestoreError> {
        let leaf_dir = config.images_dir.clone();
        let chain = tokio::task::spawn_blocking(move || ChainManager::resolve_chain(&leaf_dir))
            .await
            .map_err(|e| RestoreError::Io {
                context: "resolving snapshot chain".to_string(),
                source: std::io::Error::other(e),
            })??;
        let Some(leaf) = chain.last() else {
            return Err(RestoreError::Incompatible {
                reason: "empty snapshot chain".to_string(),
            });
        };

        self.check_compatibility(container, leaf, config.force).await?;

        let pages = self.merge_pages(&chain).await?;

        let inventory = Inventory::read(&leaf.dir)?;
        let missing: Vec<PageId> = inventory
            .processes
            .iter()
            .flat_map(|p| p.page_ids())
            .filter(|id| !pages.contains_key(id))
            .collect();
        if let Some(first) = missing.first() {
            return Err(RestoreError::MissingPages {
                count: missing.len(),
                first: *first,
            });
        }

        let native_files = read_native_files(&leaf.dir, &inventory.native_files)?;
        let pages_restored = pages.len();
        let image = RestoreImage {
            processes: inventory.processes,
            pages,
            native_files,
            work_dir: config
                .work_dir
                .clone()
                .unwrap_or_else(|| leaf.dir.clone()),
        };

        let tree = self.engine.restore(container, image).await?;

        Ok(RestoreReport {
            container_id: container.clone(),
            snapshot_id: leaf.link.snapshot_id,
            root_pid: tree.root_pid,
            process_count: tree.process_count,
            chain_length: chain.len(),
            pages_restored,
            forced: config.force,
            elapsed: start.elapsed(),
        })
    }

    async fn check_compatibility(
        &self,
        container: &ContainerId,
        leaf: &ResolvedLink,
        force: bool,
    ) -> Result<(), RestoreError> {
        if &leaf.link.container_id != container {
            if !force {
                return Err(RestoreError::ContainerMismatch {
                    expected: container.clone(),
                    found: leaf.link.container_id.clone(),
                });
            }
            tracing::warn!(
                container_id = %container,
                snapshot_container = %leaf.link.container_id,
                "Restoring a snapshot of another container (forced)"
            );
        }

        let current = self.engine.host_info().await?;
        if let Some(reason) = leaf.link.host.incompatibility(&current) {
            if !force {
                return Err(RestoreError::Incompatible { reason });
            }
            tracing::warn!(container_id = %container, reason = %reason, "Ignoring host incompatibility (forced)");
        }
        Ok(())
    }

    /// Overlay every link's pages, oldest first, so newer contents win.
    async fn merge_pages(
        &self,
        chain: &[ResolvedLink],
    ) -> Result<BTreeMap<PageId, Vec<u8>>, RestoreError> {
        let mut merged = BTreeMap::new();
        for resolved in chain {
            let frames = match &resolved.link.pages {
                PageLocation::Local => {
                    let dir = resolved.dir.clone();
                    tokio::task::spawn_blocking(move || PageStore::read_pages(&dir))
                        .await
                        .map_err(|e| RestoreError::Io {
                            context: format!("reading pages of {}", resolved.dir.display()),
                            source: std::io::Error::other(e),
                        })??
                }
                PageLocation::Remote { address, port } => {
                    self.fetch_remote(resolved, address, *port).await?
                }
            };
            tracing::debug!(
                snapshot_id = %resolved.link.snapshot_id,
                pages = frames.len(),
                "Merging snapshot pages"
            );
            for frame in frames {
                merged.insert(frame.id, frame.data);
            }
        }
        Ok(merged)
    }

    async fn fetch_remote(
        &self,
        resolved: &ResolvedLink,
        address: &str,
        port: u16,
    ) -> Result<Vec<PageFrame>, RestoreError> {
        let endpoint = PageServerEndpoint {
            address: address.to_string(),
            port: Port::new(port)?,
        };
        let mut session = self.pool.connect(&endpoint).await?;
        tracing::debug!(
            snapshot_id = %resolved.link.snapshot_id,
            endpoint = %endpoint,
            "Fetching snapshot pages from page server"
        );
        Ok(session.receive(resolved.link.snapshot_id).await?)
    }
}
