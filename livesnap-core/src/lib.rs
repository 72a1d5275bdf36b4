//! Livesnap Core Library
//!
//! Core orchestration library for live container checkpoint/restore.
//! Provides request resolution, incremental snapshot chains, page server
//! transport, chain deduplication, and checkpoint/restore orchestration on
//! top of a pluggable snapshot engine (CRIU or in-memory).

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod lock;
pub mod request;
pub mod restore;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use chain::{ChainLink, ChainManager, PageLocation, ResolvedLink};
pub use checkpoint::{BatchOutcome, BatchReport, CheckpointOrchestrator, CheckpointReport};
pub use config::{Config, ConfigLoader, EngineKind, OrchestratorConfig, PageServerConfig};
pub use dedup::{CompactionReport, DedupCoordinator};
pub use engine::{CriuEngine, CriuSettings, InMemoryEngine, SnapshotEngine};
pub use error::{
    BatchError, ChainError, CheckpointError, DedupError, EngineError, LivesnapError,
    LivesnapResult, RestoreError, TransportError, ValidationError,
};
pub use lock::OperationLocks;
pub use request::{CheckpointConfig, RawCheckpointRequest, RawRestoreRequest, RestoreConfig};
pub use restore::{RestoreOrchestrator, RestoreReport};
pub use session::{SessionPhase, SessionTracker};
pub use transport::{PageServer, PageServerEndpoint, PageServerPool, PageServerStats};
pub use types::{ContainerId, PageId, Port, ProcessId, SnapshotId};
