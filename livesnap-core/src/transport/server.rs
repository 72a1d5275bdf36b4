// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Page server receiver.
//!
//! Uploads are staged under `<root>/.staging-<uuid>` and renamed to
//! `<root>/<snapshot_id>` on commit. Pages are appended to the staging store
//! in batches as they arrive. A connection that drops before commit leaves
//! nothing behind.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::frame::{read_frame, write_frame, Frame};
use crate::chain::{PageStore, PageStoreWriter};
use crate::engine::PageFrame;
use crate::error::{ChainError, TransportError};
use crate::types::{ContainerId, SnapshotId};

const STAGING_PREFIX: &str = ".staging-";

/// Pages buffered per connection before they are appended to staging.
const SPILL_PAGES: usize = 256;

/// Live counters of a running page server.
#[derive(Debug, Default)]
pub struct PageServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub snapshots_committed: AtomicU64,
    pub snapshots_discarded: AtomicU64,
    pub pages_received: AtomicU64,
    pub pages_served: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl PageServerStats {
    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// TCP receiver storing committed snapshot pages by snapshot id.
pub struct PageServer {
    listener: TcpListener,
    root: PathBuf,
    stats: Arc<PageServerStats>,
}

impl PageServer {
    /// Bind the listener and prepare the storage root.
    ///
    /// Leftover staging directories from a previous run are removed.
    pub async fn bind(addr: &str, root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| TransportError::Io {
                context: "creating page server root",
                source: e,
            })?;
        remove_stale_staging(&root).await;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: addr.to_string(),
                reason: format!("bind failed: {}", e),
            })?;

        tracing::info!(address = %addr, root = %root.display(), "Page server listening");

        Ok(Self {
            listener,
            root,
            stats: Arc::new(PageServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(|e| TransportError::Io {
            context: "reading listener address",
            source: e,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared handle to the live counters.
    pub fn stats(&self) -> Arc<PageServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Page server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept page server connection");
                            continue;
                        }
                    };
                    let root = self.root.clone();
                    let stats = Arc::clone(&self.stats);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        PageServerStats::add(&stats.connections_total, 1);
                        PageServerStats::add(&stats.connections_active, 1);
                        let result = tokio::select! {
                            _ = cancel.cancelled() => Ok(()),
                            r = handle_connection(stream, &root, &stats) => r,
                        };
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            tracing::warn!(peer = %peer, error = %e, "Page server connection failed");
                        }
                    });
                }
            }
        }
    }
}

/// Upload in progress on one connection.
struct Upload {
    snapshot_id: SnapshotId,
    container_id: ContainerId,
    staging: PathBuf,
    writer: Option<PageStoreWriter>,
    pending: Vec<PageFrame>,
    received: u64,
}

impl Upload {
    fn new(snapshot_id: SnapshotId, container_id: ContainerId, staging: PathBuf) -> Self {
        Self {
            snapshot_id,
            container_id,
            staging,
            writer: None,
            pending: Vec::with_capacity(SPILL_PAGES),
            received: 0,
        }
    }

    async fn push(&mut self, page: PageFrame) -> Result<(), ChainError> {
        self.received += 1;
        self.pending.push(page);
        if self.pending.len() >= SPILL_PAGES {
            self.spill().await?;
        }
        Ok(())
    }

    /// Append buffered pages to the staging store on the blocking pool.
    async fn spill(&mut self) -> Result<(), ChainError> {
        let writer = self.writer.take();
        let staging = self.staging.clone();
        let pages = std::mem::take(&mut self.pending);
        let writer = tokio::task::spawn_blocking(move || {
            let mut writer = match writer {
                Some(writer) => writer,
                None => PageStoreWriter::create(&staging)?,
            };
            for page in &pages {
                writer.append(page)?;
            }
            Ok::<_, ChainError>(writer)
        })
        .await
        .map_err(|e| blocking_failed("appending staged pages", e))??;
        self.writer = Some(writer);
        Ok(())
    }

    /// Finish the staging store and move it into place under the snapshot id.
    async fn commit(mut self, root: &Path) -> Result<(), ChainError> {
        self.spill().await?;
        let writer = self.writer.take();
        let staging = self.staging.clone();
        let target = root.join(self.snapshot_id.to_string());
        tokio::task::spawn_blocking(move || {
            if let Some(writer) = writer {
                writer.finish()?;
            }
            if target.exists() {
                std::fs::remove_dir_all(&target).map_err(|e| ChainError::Io {
                    context: format!("replacing {}", target.display()),
                    source: e,
                })?;
            }
            std::fs::rename(&staging, &target).map_err(|e| ChainError::Io {
                context: format!("committing {}", target.display()),
                source: e,
            })
        })
        .await
        .map_err(|e| blocking_failed("committing staged pages", e))?
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if self.staging.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.staging) {
                tracing::warn!(path = %self.staging.display(), error = %e, "Failed to discard staging dir");
            }
        }
    }
}

fn blocking_failed(context: &str, e: tokio::task::JoinError) -> ChainError {
    ChainError::Io {
        context: context.to_string(),
        source: std::io::Error::other(e.to_string()),
    }
}

async fn handle_connection(
    stream: TcpStream,
    root: &Path,
    stats: &PageServerStats,
) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut upload: Option<Upload> = None;

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                if upload.take().is_some() {
                    PageServerStats::add(&stats.snapshots_discarded, 1);
                }
                return Err(e);
            }
        };

        match frame {
            Frame::Hello {
                snapshot_id,
                container_id,
            } => {
                if upload.is_some() {
                    reply_error(&mut writer, "upload already in progress").await?;
                    continue;
                }
                let staging = root.join(format!("{}{}", STAGING_PREFIX, SnapshotId::generate()));
                tokio::fs::create_dir_all(&staging)
                    .await
                    .map_err(|e| TransportError::Io {
                        context: "creating staging dir",
                        source: e,
                    })?;
                upload = Some(Upload::new(snapshot_id, container_id, staging));
            }
            Frame::Page(page) => match upload.as_mut() {
                Some(active) => {
                    PageServerStats::add(&stats.pages_received, 1);
                    PageServerStats::add(&stats.bytes_received, page.data.len() as u64);
                    let staged = active.push(page).await;
                    if let Err(e) = staged {
                        upload = None;
                        PageServerStats::add(&stats.snapshots_discarded, 1);
                        tracing::warn!(error = %e, "Failed to stage uploaded pages");
                        reply_error(&mut writer, &e.to_string()).await?;
                        return Ok(());
                    }
                }
                None => {
                    reply_error(&mut writer, "page received outside an upload").await?;
                }
            },
            Frame::Commit { pages } => {
                let Some(active) = upload.take() else {
                    reply_error(&mut writer, "commit received outside an upload").await?;
                    continue;
                };
                if active.received != pages {
                    PageServerStats::add(&stats.snapshots_discarded, 1);
                    let message = format!(
                        "commit announced {} pages, received {}",
                        pages, active.received
                    );
                    reply_error(&mut writer, &message).await?;
                    continue;
                }
                let snapshot_id = active.snapshot_id;
                let container_id = active.container_id.clone();
                match active.commit(root).await {
                    Ok(()) => {
                        PageServerStats::add(&stats.snapshots_committed, 1);
                        tracing::info!(
                            snapshot_id = %snapshot_id,
                            container_id = %container_id,
                            pages = pages,
                            "Committed snapshot pages"
                        );
                        write_frame(&mut writer, &Frame::Ack { pages }).await?;
                        flush(&mut writer).await?;
                    }
                    Err(e) => {
                        PageServerStats::add(&stats.snapshots_discarded, 1);
                        reply_error(&mut writer, &e.to_string()).await?;
                    }
                }
            }
            Frame::Fetch { snapshot_id } => {
                let dir = root.join(snapshot_id.to_string());
                if !dir.is_dir() {
                    reply_error(&mut writer, &format!("unknown snapshot {}", snapshot_id)).await?;
                    continue;
                }
                match PageStore::read_pages(&dir) {
                    Ok(pages) => {
                        for page in pages {
                            write_frame(&mut writer, &Frame::Page(page)).await?;
                            PageServerStats::add(&stats.pages_served, 1);
                        }
                        write_frame(&mut writer, &Frame::End).await?;
                        flush(&mut writer).await?;
                    }
                    Err(e) => reply_error(&mut writer, &e.to_string()).await?,
                }
            }
            Frame::Discard { snapshot_id } => match discard(root, snapshot_id).await {
                Ok(pages) => {
                    if pages.is_some() {
                        PageServerStats::add(&stats.snapshots_discarded, 1);
                    }
                    tracing::info!(snapshot_id = %snapshot_id, "Discarded snapshot pages");
                    write_frame(
                        &mut writer,
                        &Frame::Ack {
                            pages: pages.unwrap_or(0),
                        },
                    )
                    .await?;
                    flush(&mut writer).await?;
                }
                Err(e) => reply_error(&mut writer, &e.to_string()).await?,
            },
            other => {
                reply_error(&mut writer, &format!("unexpected {} frame", other.name())).await?;
            }
        }
    }

    if upload.take().is_some() {
        PageServerStats::add(&stats.snapshots_discarded, 1);
        tracing::debug!("Discarded uncommitted upload after disconnect");
    }
    Ok(())
}

/// Remove a committed snapshot. Returns its page count, or `None` when no
/// such snapshot exists.
async fn discard(root: &Path, snapshot_id: SnapshotId) -> Result<Option<u64>, ChainError> {
    let dir = root.join(snapshot_id.to_string());
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        return Ok(None);
    }
    let pages = PageStore::read_index(&dir).map_or(0, |index| index.len() as u64);
    tokio::fs::remove_dir_all(&dir)
        .await
        .map_err(|e| ChainError::Io {
            context: format!("discarding {}", dir.display()),
            source: e,
        })?;
    Ok(Some(pages))
}

async fn reply_error<W>(writer: &mut W, message: &str) -> Result<(), TransportError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    tracing::debug!(message = %message, "Rejecting page server request");
    write_frame(
        writer,
        &Frame::Error {
            message: message.to_string(),
        },
    )
    .await?;
    flush(writer).await
}

async fn flush<W>(writer: &mut W) -> Result<(), TransportError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.flush().await.map_err(|e| TransportError::Io {
        context: "flushing frames",
        source: e,
    })
}

async fn remove_stale_staging(root: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
    }
}
