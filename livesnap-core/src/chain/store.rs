// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! On-disk contents of one snapshot directory.
//!
//! Pages live in `pages.bin`, indexed by `pagemap.json` with a CRC32 per
//! page. The process tree inventory lives in `processes.json`; its SHA-256
//! digest is recorded in the link so tampering is caught on read.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::{PageFrame, ProcessImage};
use crate::error::ChainError;
use crate::types::PageId;

pub const PAGEMAP_FILE: &str = "pagemap.json";
pub const PAGES_FILE: &str = "pages.bin";
pub const INVENTORY_FILE: &str = "processes.json";

/// Location of one page inside `pages.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageIndexEntry {
    pub id: PageId,
    pub offset: u64,
    pub len: u32,
    pub crc32: u32,
}

/// Totals written by a page store operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStoreStats {
    pub pages: usize,
    pub bytes: u64,
}

/// Local page storage of a snapshot directory.
pub struct PageStore;

impl PageStore {
    /// Write `frames` as the page set of `dir`, replacing any previous one.
    pub fn write(dir: &Path, frames: &[PageFrame]) -> Result<PageStoreStats, ChainError> {
        let mut sorted: Vec<&PageFrame> = frames.iter().collect();
        sorted.sort_by_key(|f| f.id);

        let mut blob = Vec::with_capacity(sorted.iter().map(|f| f.data.len()).sum());
        let mut index = Vec::with_capacity(sorted.len());
        for frame in sorted {
            index.push(PageIndexEntry {
                id: frame.id,
                offset: blob.len() as u64,
                len: frame.data.len() as u32,
                crc32: crc32fast::hash(&frame.data),
            });
            blob.extend_from_slice(&frame.data);
        }

        let index_json = serde_json::to_vec(&index).map_err(|e| ChainError::CorruptedPages {
            path: dir.to_path_buf(),
            reason: format!("failed to encode page index: {}", e),
        })?;
        write_atomic(&dir.join(PAGES_FILE), &blob)?;
        write_atomic(&dir.join(PAGEMAP_FILE), &index_json)?;

        Ok(PageStoreStats {
            pages: index.len(),
            bytes: blob.len() as u64,
        })
    }

    /// Read the page index of `dir`.
    pub fn read_index(dir: &Path) -> Result<Vec<PageIndexEntry>, ChainError> {
        let path = dir.join(PAGEMAP_FILE);
        let raw = fs::read(&path).map_err(|e| ChainError::CorruptedPages {
            path: path.clone(),
            reason: format!("cannot read page index: {}", e),
        })?;
        serde_json::from_slice(&raw).map_err(|e| ChainError::CorruptedPages {
            path,
            reason: format!("invalid page index: {}", e),
        })
    }

    /// Read and verify every page stored in `dir`.
    pub fn read_pages(dir: &Path) -> Result<Vec<PageFrame>, ChainError> {
        let index = Self::read_index(dir)?;
        let path = dir.join(PAGES_FILE);
        let blob = fs::read(&path).map_err(|e| ChainError::CorruptedPages {
            path: path.clone(),
            reason: format!("cannot read pages: {}", e),
        })?;

        let mut frames = Vec::with_capacity(index.len());
        for entry in index {
            let data = usize::try_from(entry.offset)
                .ok()
                .and_then(|start| Some(start..start.checked_add(entry.len as usize)?))
                .and_then(|range| blob.get(range))
                .ok_or_else(|| ChainError::CorruptedPages {
                    path: path.clone(),
                    reason: format!("page {} lies beyond end of file", entry.id),
                })?;
            let actual = crc32fast::hash(data);
            if actual != entry.crc32 {
                return Err(ChainError::CorruptedPages {
                    path: path.clone(),
                    reason: format!(
                        "checksum mismatch for page {}: expected {:#010x}, got {:#010x}",
                        entry.id, entry.crc32, actual
                    ),
                });
            }
            frames.push(PageFrame {
                id: entry.id,
                data: data.to_vec(),
            });
        }
        Ok(frames)
    }

    /// Drop every page for which `keep` is false. Returns what was removed.
    pub fn rewrite_retaining(
        dir: &Path,
        keep: impl Fn(&PageId) -> bool,
    ) -> Result<PageStoreStats, ChainError> {
        let frames = Self::read_pages(dir)?;
        let before = frames.len();
        let before_bytes: u64 = frames.iter().map(|f| f.data.len() as u64).sum();

        let retained: Vec<PageFrame> = frames.into_iter().filter(|f| keep(&f.id)).collect();
        if retained.len() == before {
            return Ok(PageStoreStats::default());
        }
        let after = Self::write(dir, &retained)?;

        Ok(PageStoreStats {
            pages: before - after.pages,
            bytes: before_bytes - after.bytes,
        })
    }
}

/// Streams pages into `pages.bin` as they arrive.
///
/// Only the index stays in memory; `pagemap.json` is written by
/// [`PageStoreWriter::finish`], so an unfinished store has no readable index.
pub struct PageStoreWriter {
    dir: PathBuf,
    file: BufWriter<File>,
    index: Vec<PageIndexEntry>,
    offset: u64,
}

impl PageStoreWriter {
    pub fn create(dir: &Path) -> Result<Self, ChainError> {
        let path = dir.join(PAGES_FILE);
        let file = File::create(&path).map_err(|e| ChainError::Io {
            context: format!("creating {}", path.display()),
            source: e,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file: BufWriter::new(file),
            index: Vec::new(),
            offset: 0,
        })
    }

    pub fn append(&mut self, frame: &PageFrame) -> Result<(), ChainError> {
        let len = u32::try_from(frame.data.len()).map_err(|_| ChainError::CorruptedPages {
            path: self.dir.join(PAGES_FILE),
            reason: format!("page {} is too large", frame.id),
        })?;
        self.file.write_all(&frame.data).map_err(|e| ChainError::Io {
            context: format!("appending page {}", frame.id),
            source: e,
        })?;
        self.index.push(PageIndexEntry {
            id: frame.id,
            offset: self.offset,
            len,
            crc32: crc32fast::hash(&frame.data),
        });
        self.offset += u64::from(len);
        Ok(())
    }

    pub fn pages(&self) -> usize {
        self.index.len()
    }

    /// Sync the page file and write the index.
    pub fn finish(mut self) -> Result<PageStoreStats, ChainError> {
        let path = self.dir.join(PAGES_FILE);
        self.file
            .flush()
            .and_then(|()| self.file.get_ref().sync_all())
            .map_err(|e| ChainError::Io {
                context: format!("syncing {}", path.display()),
                source: e,
            })?;

        self.index.sort_by_key(|entry| entry.id);
        let index_json =
            serde_json::to_vec(&self.index).map_err(|e| ChainError::CorruptedPages {
                path: self.dir.clone(),
                reason: format!("failed to encode page index: {}", e),
            })?;
        write_atomic(&self.dir.join(PAGEMAP_FILE), &index_json)?;

        Ok(PageStoreStats {
            pages: self.index.len(),
            bytes: self.offset,
        })
    }
}

/// Process tree inventory of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub processes: Vec<ProcessImage>,
    /// Engine-native files stored next to the inventory.
    #[serde(default)]
    pub native_files: Vec<String>,
}

impl Inventory {
    /// Write `processes.json` and return its digest.
    pub fn write(&self, dir: &Path) -> Result<String, ChainError> {
        let raw = serde_json::to_vec_pretty(self).map_err(|e| ChainError::CorruptedMetadata {
            path: dir.join(INVENTORY_FILE),
            reason: format!("failed to encode inventory: {}", e),
        })?;
        write_atomic(&dir.join(INVENTORY_FILE), &raw)?;
        Ok(digest(&raw))
    }

    pub fn read(dir: &Path) -> Result<Self, ChainError> {
        let path = dir.join(INVENTORY_FILE);
        let raw = read_metadata(&path, &path)?;
        serde_json::from_slice(&raw).map_err(|e| ChainError::CorruptedMetadata {
            path,
            reason: e.to_string(),
        })
    }

    /// Digest of the inventory file currently on disk.
    pub fn digest_on_disk(dir: &Path) -> Result<String, ChainError> {
        let path = dir.join(INVENTORY_FILE);
        let raw = read_metadata(&path, &path)?;
        Ok(digest(&raw))
    }
}

/// Store engine-native files verbatim in `dir`.
pub fn write_native_files(
    dir: &Path,
    files: &BTreeMap<String, Vec<u8>>,
) -> Result<(), ChainError> {
    for (name, data) in files {
        let path = native_path(dir, name)?;
        write_atomic(&path, data)?;
    }
    Ok(())
}

/// Load the native files listed in an inventory.
pub fn read_native_files(
    dir: &Path,
    names: &[String],
) -> Result<BTreeMap<String, Vec<u8>>, ChainError> {
    let mut files = BTreeMap::new();
    for name in names {
        let path = native_path(dir, name)?;
        let data = fs::read(&path).map_err(|e| ChainError::Io {
            context: format!("reading native file {}", path.display()),
            source: e,
        })?;
        files.insert(name.clone(), data);
    }
    Ok(files)
}

/// Native file names are plain file names; anything else could escape `dir`.
fn native_path(dir: &Path, name: &str) -> Result<PathBuf, ChainError> {
    let reserved = [
        super::CHAIN_FILE,
        INVENTORY_FILE,
        PAGEMAP_FILE,
        PAGES_FILE,
    ];
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || reserved.contains(&name)
    {
        return Err(ChainError::CorruptedMetadata {
            path: dir.to_path_buf(),
            reason: format!("invalid native file name '{}'", name),
        });
    }
    Ok(dir.join(name))
}

/// Read a metadata file. Only a file that does not exist is reported as
/// missing metadata for `missing`.
pub(crate) fn read_metadata(path: &Path, missing: &Path) -> Result<Vec<u8>, ChainError> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ChainError::MissingMetadata {
            path: missing.to_path_buf(),
        },
        _ => ChainError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        },
    })
}

/// SHA-256 hex digest.
pub(crate) fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write via a temporary file and rename so readers never see partial content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ChainError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data).map_err(|e| ChainError::Io {
        context: format!("writing {}", tmp.display()),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| ChainError::Io {
        context: format!("renaming {} into place", path.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PAGE_SIZE;

    fn frame(pid: u32, vaddr: u64, fill: u8) -> PageFrame {
        PageFrame {
            id: PageId::new(pid, vaddr),
            data: vec![fill; PAGE_SIZE],
        }
    }

    #[test]
    fn test_pages_are_sorted_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let stats = PageStore::write(
            dir.path(),
            &[frame(2, 0x1000, 1), frame(1, 0x2000, 2), frame(1, 0x1000, 3)],
        )
        .unwrap();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.bytes, 3 * PAGE_SIZE as u64);

        let pages = PageStore::read_pages(dir.path()).unwrap();
        let ids: Vec<_> = pages.iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec![
                PageId::new(1, 0x1000),
                PageId::new(1, 0x2000),
                PageId::new(2, 0x1000)
            ]
        );
        assert_eq!(pages[0].data, vec![3; PAGE_SIZE]);
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        PageStore::write(dir.path(), &[frame(1, 0x1000, 7)]).unwrap();

        let path = dir.path().join(PAGES_FILE);
        let mut blob = fs::read(&path).unwrap();
        blob[10] ^= 0xFF;
        fs::write(&path, blob).unwrap();

        assert!(matches!(
            PageStore::read_pages(dir.path()),
            Err(ChainError::CorruptedPages { .. })
        ));
    }

    #[test]
    fn test_rewrite_retaining_reports_removed() {
        let dir = tempfile::tempdir().unwrap();
        PageStore::write(dir.path(), &[frame(1, 0x1000, 1), frame(1, 0x2000, 2)]).unwrap();

        let removed = PageStore::rewrite_retaining(dir.path(), |id| id.vaddr == 0x2000).unwrap();
        assert_eq!(removed.pages, 1);
        assert_eq!(removed.bytes, PAGE_SIZE as u64);

        let index = PageStore::read_index(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].offset, 0);
    }

    #[test]
    fn test_out_of_range_index_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        PageStore::write(dir.path(), &[frame(1, 0x1000, 7)]).unwrap();

        let mut index = PageStore::read_index(dir.path()).unwrap();
        index[0].offset = u64::MAX;
        fs::write(
            dir.path().join(PAGEMAP_FILE),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            PageStore::read_pages(dir.path()),
            Err(ChainError::CorruptedPages { .. })
        ));
    }

    #[test]
    fn test_writer_streams_pages_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PageStoreWriter::create(dir.path()).unwrap();
        writer.append(&frame(2, 0x1000, 1)).unwrap();
        writer.append(&frame(1, 0x1000, 2)).unwrap();
        assert_eq!(writer.pages(), 2);
        assert!(!dir.path().join(PAGEMAP_FILE).exists());

        let stats = writer.finish().unwrap();
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.bytes, 2 * PAGE_SIZE as u64);

        let pages = PageStore::read_pages(dir.path()).unwrap();
        assert_eq!(pages[0].id, PageId::new(1, 0x1000));
        assert_eq!(pages[0].data, vec![2; PAGE_SIZE]);
        assert_eq!(pages[1].data, vec![1; PAGE_SIZE]);
    }

    #[test]
    fn test_inventory_digest_matches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory {
            processes: vec![ProcessImage {
                pid: 10,
                ppid: 1,
                command: "init".to_string(),
                resident: vec![0x1000],
            }],
            native_files: vec!["core-10.img".to_string()],
        };
        let digest = inventory.write(dir.path()).unwrap();
        assert_eq!(Inventory::digest_on_disk(dir.path()).unwrap(), digest);
        assert_eq!(Inventory::read(dir.path()).unwrap(), inventory);
    }

    #[test]
    fn test_native_file_names_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("../evil.img".to_string(), vec![1]);
        assert!(write_native_files(dir.path(), &files).is_err());

        let mut files = BTreeMap::new();
        files.insert(INVENTORY_FILE.to_string(), vec![1]);
        assert!(write_native_files(dir.path(), &files).is_err());
    }
}
