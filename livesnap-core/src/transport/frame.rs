// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Page server wire frames.
//!
//! Header layout (big endian):
//!
//! ```text
//! +-------+-----+---------+-------+------------------+
//! | magic | tag | length  | crc32 | payload (length) |
//! |  u32  | u8  |   u32   |  u32  |                  |
//! +-------+-----+---------+-------+------------------+
//! ```
//!
//! Control frames carry JSON payloads. Page frames carry the page id
//! (pid u32, vaddr u64) followed by the raw page bytes.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::PageFrame;
use crate::error::TransportError;
use crate::types::{ContainerId, PageId, SnapshotId};

/// Frame magic ("LSPG").
pub const FRAME_MAGIC: u32 = 0x4C53_5047;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 13;

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PAGE_ID_SIZE: usize = 12;

const TAG_HELLO: u8 = 1;
const TAG_PAGE: u8 = 2;
const TAG_COMMIT: u8 = 3;
const TAG_FETCH: u8 = 4;
const TAG_ACK: u8 = 5;
const TAG_ERROR: u8 = 6;
const TAG_END: u8 = 7;
const TAG_DISCARD: u8 = 8;

/// One message on a page server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens an upload for one snapshot.
    Hello {
        snapshot_id: SnapshotId,
        container_id: ContainerId,
    },
    Page(PageFrame),
    /// Closes an upload; `pages` is the number of pages sent.
    Commit { pages: u64 },
    /// Requests every committed page of a snapshot.
    Fetch { snapshot_id: SnapshotId },
    Ack { pages: u64 },
    Error { message: String },
    /// Terminates a fetch response.
    End,
    /// Removes a committed snapshot; answered with `Ack` carrying the number
    /// of pages dropped.
    Discard { snapshot_id: SnapshotId },
}

#[derive(Serialize, Deserialize)]
struct HelloBody {
    snapshot_id: SnapshotId,
    container_id: ContainerId,
}

#[derive(Serialize, Deserialize)]
struct CountBody {
    pages: u64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    snapshot_id: SnapshotId,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    message: String,
}

impl Frame {
    /// Frame name for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Page(_) => "Page",
            Self::Commit { .. } => "Commit",
            Self::Fetch { .. } => "Fetch",
            Self::Ack { .. } => "Ack",
            Self::Error { .. } => "Error",
            Self::End => "End",
            Self::Discard { .. } => "Discard",
        }
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => TAG_HELLO,
            Self::Page(_) => TAG_PAGE,
            Self::Commit { .. } => TAG_COMMIT,
            Self::Fetch { .. } => TAG_FETCH,
            Self::Ack { .. } => TAG_ACK,
            Self::Error { .. } => TAG_ERROR,
            Self::End => TAG_END,
            Self::Discard { .. } => TAG_DISCARD,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, TransportError> {
        let json = |value: serde_json::Result<Vec<u8>>| {
            value.map_err(|e| TransportError::Malformed {
                reason: e.to_string(),
            })
        };
        match self {
            Self::Hello {
                snapshot_id,
                container_id,
            } => json(serde_json::to_vec(&HelloBody {
                snapshot_id: *snapshot_id,
                container_id: container_id.clone(),
            })),
            Self::Page(page) => {
                let mut buf = Vec::with_capacity(PAGE_ID_SIZE + page.data.len());
                buf.extend_from_slice(&page.id.pid.to_be_bytes());
                buf.extend_from_slice(&page.id.vaddr.to_be_bytes());
                buf.extend_from_slice(&page.data);
                Ok(buf)
            }
            Self::Commit { pages } | Self::Ack { pages } => {
                json(serde_json::to_vec(&CountBody { pages: *pages }))
            }
            Self::Fetch { snapshot_id } | Self::Discard { snapshot_id } => {
                json(serde_json::to_vec(&SnapshotBody {
                    snapshot_id: *snapshot_id,
                }))
            }
            Self::Error { message } => json(serde_json::to_vec(&ErrorBody {
                message: message.clone(),
            })),
            Self::End => Ok(Vec::new()),
        }
    }

    /// Encode the frame including its header.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let payload = self.payload()?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf.push(self.tag());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a verified payload.
    fn decode(tag: u8, payload: Vec<u8>) -> Result<Self, TransportError> {
        fn body<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, TransportError> {
            serde_json::from_slice(payload).map_err(|e| TransportError::Malformed {
                reason: e.to_string(),
            })
        }

        match tag {
            TAG_HELLO => {
                let hello: HelloBody = body(&payload)?;
                Ok(Self::Hello {
                    snapshot_id: hello.snapshot_id,
                    container_id: hello.container_id,
                })
            }
            TAG_PAGE => {
                if payload.len() < PAGE_ID_SIZE {
                    return Err(TransportError::Malformed {
                        reason: format!("page frame too short: {} bytes", payload.len()),
                    });
                }
                let mut pid = [0u8; 4];
                pid.copy_from_slice(&payload[0..4]);
                let mut vaddr = [0u8; 8];
                vaddr.copy_from_slice(&payload[4..PAGE_ID_SIZE]);
                Ok(Self::Page(PageFrame {
                    id: PageId::new(u32::from_be_bytes(pid), u64::from_be_bytes(vaddr)),
                    data: payload[PAGE_ID_SIZE..].to_vec(),
                }))
            }
            TAG_COMMIT => Ok(Self::Commit {
                pages: body::<CountBody>(&payload)?.pages,
            }),
            TAG_FETCH => Ok(Self::Fetch {
                snapshot_id: body::<SnapshotBody>(&payload)?.snapshot_id,
            }),
            TAG_ACK => Ok(Self::Ack {
                pages: body::<CountBody>(&payload)?.pages,
            }),
            TAG_ERROR => Ok(Self::Error {
                message: body::<ErrorBody>(&payload)?.message,
            }),
            TAG_END => Ok(Self::End),
            TAG_DISCARD => Ok(Self::Discard {
                snapshot_id: body::<SnapshotBody>(&payload)?.snapshot_id,
            }),
            tag => Err(TransportError::UnknownFrame { tag }),
        }
    }
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| TransportError::Io {
            context: "writing frame",
            source: e,
        })
}

/// Read one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(TransportError::Io {
                context: "reading frame header",
                source: e,
            })
        }
    }

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != FRAME_MAGIC {
        return Err(TransportError::BadMagic { found: magic });
    }
    let tag = header[4];
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let expected = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io {
                context: "reading frame payload",
                source: e,
            },
        })?;

    // Validate checksum - fail immediately on mismatch
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(TransportError::ChecksumMismatch { expected, actual });
    }

    Frame::decode(tag, payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let buf = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        read_frame(&mut cursor).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_page_frame_keeps_identity() {
        let page = Frame::Page(PageFrame {
            id: PageId::new(42, 0x7fff_0000_1000),
            data: vec![9; 4096],
        });
        assert_eq!(roundtrip(page.clone()).await, page);

        let hello = Frame::Hello {
            snapshot_id: SnapshotId::generate(),
            container_id: ContainerId::new("web").unwrap(),
        };
        assert_eq!(roundtrip(hello.clone()).await, hello);
    }

    #[tokio::test]
    async fn test_corrupted_payload_rejected() {
        let mut buf = Frame::Commit { pages: 3 }.encode().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_magic_and_oversize() {
        let mut buf = Frame::End.encode().unwrap();
        buf[0] = 0;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::BadMagic { .. })
        ));

        let mut buf = Frame::End.encode().unwrap();
        buf[5..9].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_and_truncation() {
        let mut empty = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let mut buf = Frame::Ack { pages: 1 }.encode().unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let mut buf = Frame::End.encode().unwrap();
        buf[4] = 99;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::UnknownFrame { tag: 99 })
        ));
    }
}
