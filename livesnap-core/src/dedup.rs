// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Chain deduplication.
//!
//! Keeps exactly one copy of every page id across a chain: the copy in the
//! newest link that holds it. Page contents are never compared; identity
//! alone decides which copies are stale.

use std::collections::HashMap;
use std::path::Path;

use crate::chain::{ChainManager, PageLocation, PageStore, ResolvedLink};
use crate::error::DedupError;
use crate::types::PageId;

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub links_scanned: usize,
    pub pages_removed: usize,
    pub bytes_reclaimed: u64,
    /// Links whose pages live on a page server and were left untouched.
    pub skipped_remote: usize,
}

/// Removes superseded page copies from a snapshot chain.
pub struct DedupCoordinator;

impl DedupCoordinator {
    /// Resolve the chain ending at `leaf_dir` and compact it.
    pub fn compact_dir(leaf_dir: &Path) -> Result<CompactionReport, DedupError> {
        let chain = ChainManager::resolve_chain(leaf_dir)?;
        Self::compact(&chain)
    }

    /// Compact a resolved chain ordered oldest to newest.
    ///
    /// # Errors
    /// A failure leaves every link readable; pages are only removed from a
    /// link once its rewritten page store is in place.
    pub fn compact(chain: &[ResolvedLink]) -> Result<CompactionReport, DedupError> {
        if chain.is_empty() {
            return Err(DedupError::EmptyChain);
        }

        let mut report = CompactionReport {
            links_scanned: chain.len(),
            ..Default::default()
        };

        // Newest local link holding each page id.
        let mut newest: HashMap<PageId, usize> = HashMap::new();
        for (index, resolved) in chain.iter().enumerate() {
            if resolved.link.pages != PageLocation::Local {
                report.skipped_remote += 1;
                continue;
            }
            for entry in PageStore::read_index(&resolved.dir)? {
                newest.insert(entry.id, index);
            }
        }

        for (index, resolved) in chain.iter().enumerate() {
            if resolved.link.pages != PageLocation::Local {
                continue;
            }
            let removed = PageStore::rewrite_retaining(&resolved.dir, |id| {
                newest.get(id).is_none_or(|holder| *holder == index)
            })?;
            if removed.pages == 0 {
                continue;
            }

            let mut link = resolved.link.clone();
            link.deduplicated = true;
            ChainManager::write_link(&resolved.dir, &link)?;

            tracing::debug!(
                snapshot_id = %link.snapshot_id,
                path = %resolved.dir.display(),
                pages_removed = removed.pages,
                bytes = removed.bytes,
                "Removed superseded pages"
            );
            report.pages_removed += removed.pages;
            report.bytes_reclaimed += removed.bytes;
        }

        tracing::info!(
            links = report.links_scanned,
            pages_removed = report.pages_removed,
            bytes_reclaimed = report.bytes_reclaimed,
            skipped_remote = report.skipped_remote,
            "Chain compaction completed"
        );

        Ok(report)
    }
}
