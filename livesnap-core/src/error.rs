// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for livesnap.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ContainerId, PageId, SnapshotId};

/// Top-level error type for livesnap.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum LivesnapError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Operation Errors
    // =========================================================================
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Restore error: {0}")]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Dedup error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed request or settings. Raised before any engine or network call.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("page server enabled but address not assigned")]
    PageServerAddressMissing,

    #[error("page server enabled but port not assigned")]
    PageServerPortMissing,

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: i64, reason: String },

    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Failures reported by the external snapshot engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{binary} binary not found at expected path")]
    BinaryNotFound { binary: &'static str },

    #[error("Container not found by engine: {container_id}")]
    ContainerNotFound { container_id: ContainerId },

    #[error("Container {container_id} is in the wrong state: {reason}")]
    InvalidContainerState {
        container_id: ContainerId,
        reason: String,
    },

    #[error("Pre-dump failed: {reason}")]
    PreDumpFailed { reason: String },

    #[error("Dump failed (process tree stopped: {tree_stopped}): {reason}")]
    DumpFailed { reason: String, tree_stopped: bool },

    #[error("Restore failed: {reason}")]
    RestoreFailed { reason: String },

    #[error("Resume failed: {reason}")]
    ResumeFailed { reason: String },

    #[error("Failed to query host capabilities: {reason}")]
    HostInfo { reason: String },

    #[error("Engine IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Whether the engine left the process tree stopped when it failed.
    pub fn tree_stopped(&self) -> bool {
        matches!(
            self,
            EngineError::DumpFailed {
                tree_stopped: true,
                ..
            }
        )
    }
}

/// Missing, foreign, or corrupted links in a snapshot chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Previous images directory does not exist: {path}")]
    MissingPredecessor { path: PathBuf },

    #[error("No chain metadata in {path}")]
    MissingMetadata { path: PathBuf },

    #[error("Corrupted chain metadata in {path}: {reason}")]
    CorruptedMetadata { path: PathBuf, reason: String },

    #[error("Corrupted page store in {path}: {reason}")]
    CorruptedPages { path: PathBuf, reason: String },

    #[error("Snapshot in {path} belongs to container {found}, not {expected}")]
    ForeignPredecessor {
        path: PathBuf,
        expected: ContainerId,
        found: ContainerId,
    },

    #[error("Snapshot in {path} already has successor {successor}; branching is not allowed")]
    AlreadyHasSuccessor { path: PathBuf, successor: SnapshotId },

    #[error("Snapshot directory cannot be linked to itself: {path}")]
    SelfReference { path: PathBuf },

    #[error("Broken chain at {path}: {reason}")]
    BrokenChain { path: PathBuf, reason: String },

    #[error("Chain IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Page server connect/stream failures. Never retried implicitly.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to page server {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Timed out connecting to page server {endpoint} after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Page server connection pool is closed")]
    PoolClosed,

    #[error("Transport IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad frame magic: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Frame size exceeds maximum: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unknown frame tag: {tag}")]
    UnknownFrame { tag: u8 },

    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("Unexpected frame: expected {expected}, got {found}")]
    UnexpectedFrame {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Page server reported an error: {message}")]
    Remote { message: String },

    #[error("Connection closed by peer")]
    Closed,
}

/// Compaction failures. The chain stays correct; disk usage was not reduced.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Chain is empty, nothing to compact")]
    EmptyChain,
}

/// Per-container operation locking failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Container {container_id} is busy: {operation} in progress")]
    ContainerBusy {
        container_id: ContainerId,
        operation: &'static str,
    },

    #[error("Directory {path} is in use by an operation on container {owner}")]
    DirectoryInUse { path: PathBuf, owner: ContainerId },

    #[error("Failed to take lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint session phase transition errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for container {container_id}")]
    InvalidTransition {
        container_id: ContainerId,
        from: &'static str,
        to: &'static str,
    },
}

/// Errors from a single checkpoint operation.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Phase(#[from] StateTransitionError),

    #[error("Images directory is not empty: {path}")]
    ImagesDirectoryNotEmpty { path: PathBuf },

    #[error("Checkpoint timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Checkpoint cancelled")]
    Cancelled,

    #[error("Checkpoint task aborted: {reason}")]
    TaskAborted { reason: String },

    #[error("{original}; additionally failed to resume the process tree: {resume}")]
    ResumeFailed {
        #[source]
        original: Box<CheckpointError>,
        resume: EngineError,
    },

    #[error("Checkpoint IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single restore operation.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Snapshot is incompatible with this host: {reason} (use force to override)")]
    Incompatible { reason: String },

    #[error("Snapshot belongs to container {found}, not {expected} (use force to override)")]
    ContainerMismatch {
        expected: ContainerId,
        found: ContainerId,
    },

    #[error("Chain is missing {count} resident page(s), first missing: {first}")]
    MissingPages { count: usize, first: PageId },

    #[error("Restore timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Restore cancelled")]
    Cancelled,

    #[error("Restore IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Aggregate failure of a multi-container operation.
#[derive(Debug, Error)]
#[error("Error: failed to {operation} one or more containers ({} of {total} failed)", .failed.len())]
pub struct BatchError {
    pub operation: &'static str,
    pub failed: Vec<ContainerId>,
    pub total: usize,
}

/// Result type alias using LivesnapError.
pub type LivesnapResult<T> = Result<T, LivesnapError>;
