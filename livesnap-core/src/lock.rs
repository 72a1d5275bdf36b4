// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-container operation locks and directory claims.
//!
//! At most one checkpoint or restore runs per container, and a directory
//! claimed by one operation cannot be claimed by another until released.
//! With a lock directory, the container lock is also held as an exclusive
//! `flock` on `<lock_dir>/<container>.lock` so separate processes exclude
//! each other too.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::LockError;
use crate::types::ContainerId;

#[derive(Debug, Default)]
struct LockTable {
    /// Container ID to the operation holding it.
    containers: DashMap<ContainerId, &'static str>,
    /// Claimed directory to the container whose operation claimed it.
    directories: DashMap<PathBuf, ContainerId>,
}

/// Shared lock table. Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    table: Arc<LockTable>,
    lock_dir: Option<PathBuf>,
}

impl OperationLocks {
    /// Locks visible to this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that are also taken as lock files under `dir`.
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            table: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    /// Lock `container` for `operation` and claim `dirs`.
    ///
    /// Fails fast instead of waiting; nothing stays claimed on failure.
    pub fn acquire(
        &self,
        container: &ContainerId,
        operation: &'static str,
        dirs: &[&Path],
    ) -> Result<OperationGuard, LockError> {
        match self.table.containers.entry(container.clone()) {
            Entry::Occupied(held) => {
                return Err(LockError::ContainerBusy {
                    container_id: container.clone(),
                    operation: *held.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(operation);
            }
        }

        let mut guard = OperationGuard {
            table: Arc::clone(&self.table),
            container: container.clone(),
            dirs: Vec::with_capacity(dirs.len()),
            lock_file: None,
        };

        if let Some(lock_dir) = &self.lock_dir {
            guard.lock_file = Some(LockFile::acquire(lock_dir, container, operation)?);
        }

        for dir in dirs {
            let path = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
            if guard.dirs.contains(&path) {
                continue;
            }
            let owner = match self.table.directories.entry(path.clone()) {
                Entry::Occupied(owner) => Some(owner.get().clone()),
                Entry::Vacant(slot) => {
                    slot.insert(container.clone());
                    None
                }
            };
            match owner {
                Some(owner) => return Err(LockError::DirectoryInUse { path, owner }),
                None => guard.dirs.push(path),
            }
        }

        tracing::debug!(container_id = %container, operation = operation, "Acquired operation lock");
        Ok(guard)
    }

    /// Operation currently holding `container`, if any.
    pub fn active_operation(&self, container: &ContainerId) -> Option<&'static str> {
        self.table.containers.get(container).map(|op| *op)
    }

    pub fn is_claimed(&self, dir: &Path) -> bool {
        let path = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.table.directories.contains_key(&path)
    }
}

/// Exclusive `flock` on a container's lock file, released on drop.
struct LockFile {
    path: PathBuf,
    _lock: Flock<File>,
}

impl LockFile {
    fn acquire(
        dir: &Path,
        container: &ContainerId,
        operation: &'static str,
    ) -> Result<Self, LockError> {
        let path = dir.join(format!("{}.lock", container));
        let io_error = |source: std::io::Error| LockError::LockFile {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_error)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, Errno::EWOULDBLOCK)) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                return Err(LockError::ContainerBusy {
                    container_id: container.clone(),
                    operation: external_operation(&holder),
                });
            }
            Err((_, errno)) => return Err(io_error(std::io::Error::from(errno))),
        };

        // Tell a blocked process what holds the lock.
        let mut file: &File = &lock;
        if let Err(e) = file.set_len(0).and_then(|()| file.write_all(operation.as_bytes())) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to record lock holder");
        }

        Ok(Self { path, _lock: lock })
    }
}

impl fmt::Debug for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}

fn external_operation(holder: &str) -> &'static str {
    match holder.trim() {
        "checkpoint" => "checkpoint",
        "restore" => "restore",
        _ => "operation in another process",
    }
}

/// Releases the container lock and directory claims on drop.
#[derive(Debug)]
pub struct OperationGuard {
    table: Arc<LockTable>,
    container: ContainerId,
    dirs: Vec<PathBuf>,
    lock_file: Option<LockFile>,
}

impl OperationGuard {
    pub fn container(&self) -> &ContainerId {
        &self.container
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        for dir in &self.dirs {
            self.table.directories.remove(dir);
        }
        self.table.containers.remove(&self.container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_operation_is_busy() {
        let locks = OperationLocks::new();
        let c = ContainerId::new("web").unwrap();
        let guard = locks.acquire(&c, "checkpoint", &[]).unwrap();

        match locks.acquire(&c, "restore", &[]) {
            Err(LockError::ContainerBusy { operation, .. }) => assert_eq!(operation, "checkpoint"),
            other => panic!("expected busy, got {:?}", other),
        }

        drop(guard);
        assert!(locks.acquire(&c, "restore", &[]).is_ok());
    }

    #[test]
    fn test_lock_file_excludes_other_tables() {
        let dir = tempfile::tempdir().unwrap();
        let first = OperationLocks::with_lock_dir(dir.path());
        let second = OperationLocks::with_lock_dir(dir.path());
        let c = ContainerId::new("web").unwrap();

        let guard = first.acquire(&c, "checkpoint", &[]).unwrap();
        assert!(dir.path().join("web.lock").exists());
        match second.acquire(&c, "restore", &[]) {
            Err(LockError::ContainerBusy { operation, .. }) => assert_eq!(operation, "checkpoint"),
            other => panic!("expected busy, got {:?}", other),
        }
        // The rejected attempt leaves no in-process entry behind.
        assert_eq!(second.active_operation(&c), None);

        let other = ContainerId::new("db").unwrap();
        assert!(second.acquire(&other, "restore", &[]).is_ok());

        drop(guard);
        assert!(second.acquire(&c, "restore", &[]).is_ok());
    }

    #[test]
    fn test_directory_claims() {
        let locks = OperationLocks::new();
        let a = ContainerId::new("a").unwrap();
        let b = ContainerId::new("b").unwrap();
        let dir = Path::new("/tmp/livesnap-images");

        let guard = locks.acquire(&a, "checkpoint", &[dir, dir]).unwrap();
        assert!(locks.is_claimed(dir));

        assert!(matches!(
            locks.acquire(&b, "checkpoint", &[dir]),
            Err(LockError::DirectoryInUse { .. })
        ));
        // The failed attempt must not leave b locked.
        assert_eq!(locks.active_operation(&b), None);

        drop(guard);
        assert!(!locks.is_claimed(dir));
        assert_eq!(locks.active_operation(&a), None);
    }
}
