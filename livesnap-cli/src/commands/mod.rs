// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::sync::Arc;

use livesnap_core::{
    Config, ConfigLoader, CriuEngine, CriuSettings, EngineError, EngineKind, InMemoryEngine,
    LivesnapError, OperationLocks, PageServerPool, SnapshotEngine,
};
use tokio_util::sync::CancellationToken;

pub mod chain;
pub mod checkpoint;
pub mod dedup;
pub mod page_server;
pub mod restore;
pub mod validate;

/// Lock files live next to the per-container engine dirs; container IDs
/// cannot start with a dot.
const LOCK_DIR: &str = ".locks";

/// Setup failures shared by the commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] LivesnapError),

    #[error("Snapshot engine unavailable: {0}")]
    Engine(#[from] EngineError),
}

/// Load settings from `path`, or the built-in defaults when no path is given.
pub fn load_config(path: Option<&str>) -> Result<Config, CliError> {
    match path {
        Some(path) => {
            tracing::debug!(config = %path, "Loading configuration");
            Ok(ConfigLoader::load_file(path)?)
        }
        None => Ok(Config::default()),
    }
}

/// Build the snapshot engine selected by the configuration.
pub fn build_engine(config: &Config) -> Result<Arc<dyn SnapshotEngine>, CliError> {
    let engine: Arc<dyn SnapshotEngine> = match config.engine.kind {
        EngineKind::Criu => Arc::new(CriuEngine::new(CriuSettings {
            criu_path: config.engine.criu_path.clone(),
            crit_path: config.engine.crit_path.clone(),
            state_dir: config.engine.state_dir.clone(),
            runtime_state_dir: config.engine.runtime_state_dir.clone(),
            shell_job: config.engine.shell_job,
            tcp_established: config.engine.tcp_established,
        })?),
        EngineKind::InMemory => {
            tracing::warn!(
                "Using the in-memory engine; it has no containers, so checkpoint and restore will not find any"
            );
            Arc::new(InMemoryEngine::new())
        }
    };
    tracing::debug!(engine = engine.name(), "Snapshot engine ready");
    Ok(engine)
}

/// Container locks shared with every other livesnap process using the same
/// engine state dir.
pub fn build_locks(config: &Config) -> OperationLocks {
    OperationLocks::with_lock_dir(config.engine.state_dir.join(LOCK_DIR))
}

pub fn build_pool(config: &Config) -> PageServerPool {
    PageServerPool::new(
        config.page_server.max_connections,
        config.page_server.connect_timeout,
    )
}

/// Token cancelled on Ctrl-C.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Interrupt received, cancelling");
                trigger.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
    token
}
