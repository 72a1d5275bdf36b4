// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint and restore request resolution.
//!
//! Raw requests mirror the CLI flags one to one. Resolution is pure: it
//! either produces a validated config or a [`ValidationError`], and never
//! touches the engine, the network, or the filesystem.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ValidationError;
use crate::transport::PageServerEndpoint;
use crate::types::Port;

/// Checkpoint request as supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCheckpointRequest {
    pub images_directory: String,
    pub work_directory: String,
    pub leave_running: bool,
    pub prev_images_directory: Option<String>,
    pub track_memory: bool,
    pub enable_pre_dump: bool,
    pub auto_dedup: bool,
    /// Page-server mode switch; `address` and `port` are only read when set.
    pub page_server: bool,
    pub address: String,
    pub port: i64,
}

/// Validated checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub images_dir: PathBuf,
    pub work_dir: PathBuf,
    pub leave_running: bool,
    pub prev_images_dir: Option<PathBuf>,
    pub track_memory: bool,
    pub enable_pre_dump: bool,
    pub auto_dedup: bool,
    pub page_server: Option<PageServerEndpoint>,
}

impl CheckpointConfig {
    /// Whether the session extends an existing chain.
    pub fn is_incremental(&self) -> bool {
        self.prev_images_dir.is_some()
    }
}

/// Restore request as supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRestoreRequest {
    /// Leaf directory of the chain to restore.
    pub images_directory: String,
    pub work_directory: Option<String>,
    /// Skip container and host compatibility checks.
    pub force: bool,
}

/// Validated restore settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    pub images_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub force: bool,
}

/// Resolve a raw checkpoint request.
///
/// # Errors
/// PageServerAddressMissing / PageServerPortMissing for a half-set endpoint in
/// page-server mode, InvalidPort for an out-of-range port, and
/// MissingRequiredField / InvalidFieldValue for bad directories.
pub fn resolve(raw: &RawCheckpointRequest) -> Result<CheckpointConfig, ValidationError> {
    let page_server = if raw.page_server {
        Some(resolve_endpoint(&raw.address, raw.port)?)
    } else {
        None
    };

    let images_dir = required_path("images_directory", &raw.images_directory)?;
    let work_dir = required_path("work_directory", &raw.work_directory)?;

    let prev_images_dir = match raw.prev_images_directory.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(prev) => {
            let prev = PathBuf::from(prev);
            if prev == images_dir {
                return Err(ValidationError::InvalidFieldValue {
                    field: "prev_images_directory",
                    value: prev.display().to_string(),
                    reason: "Previous images directory must differ from the images directory"
                        .to_string(),
                });
            }
            Some(prev)
        }
    };

    if raw.leave_running && !raw.track_memory && prev_images_dir.is_some() {
        tracing::warn!(
            images_dir = %images_dir.display(),
            "leave-running on an incremental checkpoint without track-memory; \
             later incremental passes cannot rely on dirty-page tracking"
        );
    }

    Ok(CheckpointConfig {
        images_dir,
        work_dir,
        leave_running: raw.leave_running,
        prev_images_dir,
        track_memory: raw.track_memory,
        enable_pre_dump: raw.enable_pre_dump,
        auto_dedup: raw.auto_dedup,
        page_server,
    })
}

/// Resolve a raw restore request.
pub fn resolve_restore(raw: &RawRestoreRequest) -> Result<RestoreConfig, ValidationError> {
    let images_dir = required_path("images_directory", &raw.images_directory)?;
    let work_dir = match raw.work_directory.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(dir) => Some(PathBuf::from(dir)),
    };

    Ok(RestoreConfig {
        images_dir,
        work_dir,
        force: raw.force,
    })
}

fn resolve_endpoint(address: &str, port: i64) -> Result<PageServerEndpoint, ValidationError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ValidationError::PageServerAddressMissing);
    }
    if port == 0 {
        return Err(ValidationError::PageServerPortMissing);
    }
    let port = u16::try_from(port).map_err(|_| ValidationError::InvalidPort {
        port,
        reason: "Port must be between 1 and 65535".to_string(),
    })?;

    Ok(PageServerEndpoint {
        address: address.to_string(),
        port: Port::new(port)?,
    })
}

fn required_path(field: &'static str, value: &str) -> Result<PathBuf, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingRequiredField {
            field,
            context: "checkpoint request".to_string(),
        });
    }
    Ok(PathBuf::from(value))
}
