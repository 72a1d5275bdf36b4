// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bounded pool of outbound page server connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::frame::{read_frame, write_frame, Frame};
use super::PageServerEndpoint;
use crate::engine::PageFrame;
use crate::error::TransportError;
use crate::types::{ContainerId, SnapshotId};

/// Limits concurrent page server connections across all operations.
///
/// Connection failures are returned as-is; the pool never retries.
#[derive(Debug, Clone)]
pub struct PageServerPool {
    permits: Arc<Semaphore>,
    max_connections: usize,
    connect_timeout: Duration,
}

impl PageServerPool {
    pub fn new(max_connections: usize, connect_timeout: Duration) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            connect_timeout,
        }
    }

    /// Open a session to `endpoint`, waiting for a free slot first.
    pub async fn connect(
        &self,
        endpoint: &PageServerEndpoint,
    ) -> Result<PageServerSession, TransportError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::PoolClosed)?;

        let target = endpoint.to_string();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: target.clone(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: target.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(endpoint = %target, "Connected to page server");

        let (reader, writer) = stream.into_split();
        Ok(PageServerSession {
            endpoint: target,
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            _permit: permit,
        })
    }

    /// Connections that can be opened without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Reject all further connects. Open sessions are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// One open connection to a page server. Returns its pool slot on drop.
pub struct PageServerSession {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    _permit: OwnedSemaphorePermit,
}

impl PageServerSession {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Upload the pages of one snapshot and wait for the server to commit.
    pub async fn send(
        &mut self,
        snapshot_id: SnapshotId,
        container_id: &ContainerId,
        pages: &[PageFrame],
    ) -> Result<u64, TransportError> {
        write_frame(
            &mut self.writer,
            &Frame::Hello {
                snapshot_id,
                container_id: container_id.clone(),
            },
        )
        .await?;
        for page in pages {
            write_frame(&mut self.writer, &Frame::Page(page.clone())).await?;
        }
        let sent = pages.len() as u64;
        write_frame(&mut self.writer, &Frame::Commit { pages: sent }).await?;
        self.flush().await?;

        match read_frame(&mut self.reader).await? {
            Some(Frame::Ack { pages }) if pages == sent => {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    snapshot_id = %snapshot_id,
                    pages = pages,
                    "Page server committed snapshot"
                );
                Ok(pages)
            }
            Some(Frame::Ack { pages }) => Err(TransportError::Malformed {
                reason: format!("server acknowledged {} pages, sent {}", pages, sent),
            }),
            Some(Frame::Error { message }) => Err(TransportError::Remote { message }),
            Some(other) => Err(TransportError::UnexpectedFrame {
                expected: "Ack",
                found: other.name(),
            }),
            None => Err(TransportError::Closed),
        }
    }

    /// Download every committed page of `snapshot_id`.
    pub async fn receive(
        &mut self,
        snapshot_id: SnapshotId,
    ) -> Result<Vec<PageFrame>, TransportError> {
        write_frame(&mut self.writer, &Frame::Fetch { snapshot_id }).await?;
        self.flush().await?;

        let mut pages = Vec::new();
        loop {
            match read_frame(&mut self.reader).await? {
                Some(Frame::Page(page)) => pages.push(page),
                Some(Frame::End) => break,
                Some(Frame::Error { message }) => return Err(TransportError::Remote { message }),
                Some(other) => {
                    return Err(TransportError::UnexpectedFrame {
                        expected: "Page",
                        found: other.name(),
                    })
                }
                None => return Err(TransportError::Closed),
            }
        }

        tracing::debug!(
            endpoint = %self.endpoint,
            snapshot_id = %snapshot_id,
            pages = pages.len(),
            "Fetched snapshot pages"
        );
        Ok(pages)
    }

    /// Ask the server to drop a committed snapshot. Unknown snapshots are
    /// not an error.
    pub async fn discard(&mut self, snapshot_id: SnapshotId) -> Result<u64, TransportError> {
        write_frame(&mut self.writer, &Frame::Discard { snapshot_id }).await?;
        self.flush().await?;

        match read_frame(&mut self.reader).await? {
            Some(Frame::Ack { pages }) => {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    snapshot_id = %snapshot_id,
                    pages = pages,
                    "Page server discarded snapshot"
                );
                Ok(pages)
            }
            Some(Frame::Error { message }) => Err(TransportError::Remote { message }),
            Some(other) => Err(TransportError::UnexpectedFrame {
                expected: "Ack",
                found: other.name(),
            }),
            None => Err(TransportError::Closed),
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.writer.flush().await.map_err(|e| TransportError::Io {
            context: "flushing frames",
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Port;

    #[tokio::test]
    async fn test_connect_refused_is_not_retried() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = PageServerPool::new(2, Duration::from_secs(2));
        let endpoint = PageServerEndpoint {
            address: "127.0.0.1".to_string(),
            port: Port::new(port).unwrap(),
        };
        assert!(matches!(
            pool.connect(&endpoint).await,
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = PageServerPool::new(1, Duration::from_secs(1));
        pool.close();
        let endpoint = PageServerEndpoint {
            address: "127.0.0.1".to_string(),
            port: Port::new(9).unwrap(),
        };
        assert!(matches!(
            pool.connect(&endpoint).await,
            Err(TransportError::PoolClosed)
        ));
    }
}
