// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML settings parser with strict schema validation.
//!
//! Every section is optional; omitted fields take their defaults. Any
//! out-of-range value is rejected before an orchestrator is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{LivesnapError, LivesnapResult, ValidationError};

/// Which snapshot engine to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    Criu,
    /// Simulated engine for tests; starts with no containers.
    InMemory,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    #[serde(default = "default_engine_kind")]
    kind: EngineKind,
    #[serde(default)]
    criu_path: Option<String>,
    #[serde(default)]
    crit_path: Option<String>,
    #[serde(default = "default_state_dir")]
    state_dir: String,
    #[serde(default = "default_runtime_state_dir")]
    runtime_state_dir: String,
    #[serde(default)]
    shell_job: bool,
    #[serde(default)]
    tcp_established: bool,
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Criu
}

fn default_state_dir() -> String {
    "/var/lib/livesnap/engine".to_string()
}

fn default_runtime_state_dir() -> String {
    "/run/runc".to_string()
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            criu_path: None,
            crit_path: None,
            state_dir: default_state_dir(),
            runtime_state_dir: default_runtime_state_dir(),
            shell_job: false,
            tcp_established: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOrchestratorConfig {
    #[serde(default = "default_pre_dump_max_iterations")]
    pre_dump_max_iterations: u32,
    #[serde(default = "default_pre_dump_convergence_pages")]
    pre_dump_convergence_pages: usize,
    #[serde(default = "default_operation_timeout_secs")]
    operation_timeout_secs: u64,
    #[serde(default = "default_batch_concurrency")]
    batch_concurrency: usize,
}

fn default_pre_dump_max_iterations() -> u32 {
    3
}

fn default_pre_dump_convergence_pages() -> usize {
    64
}

fn default_operation_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_batch_concurrency() -> usize {
    num_cpus::get()
}

impl Default for RawOrchestratorConfig {
    fn default() -> Self {
        Self {
            pre_dump_max_iterations: default_pre_dump_max_iterations(),
            pre_dump_convergence_pages: default_pre_dump_convergence_pages(),
            operation_timeout_secs: default_operation_timeout_secs(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPageServerConfig {
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    8
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for RawPageServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Raw root settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    engine: RawEngineConfig,
    #[serde(default)]
    orchestrator: RawOrchestratorConfig,
    #[serde(default)]
    page_server: RawPageServerConfig,
}

/// Validated engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub criu_path: Option<PathBuf>,
    pub crit_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub runtime_state_dir: PathBuf,
    pub shell_job: bool,
    pub tcp_established: bool,
}

/// Validated orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pre_dump_max_iterations: u32,
    /// A pre-dump pass writing at most this many pages ends the pre-dump loop.
    pub pre_dump_convergence_pages: usize,
    pub operation_timeout: Duration,
    pub batch_concurrency: usize,
}

/// Validated page server client settings.
#[derive(Debug, Clone)]
pub struct PageServerConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

/// Complete validated settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub orchestrator: OrchestratorConfig,
    pub page_server: PageServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                kind: default_engine_kind(),
                criu_path: None,
                crit_path: None,
                state_dir: PathBuf::from(default_state_dir()),
                runtime_state_dir: PathBuf::from(default_runtime_state_dir()),
                shell_job: false,
                tcp_established: false,
            },
            orchestrator: OrchestratorConfig {
                pre_dump_max_iterations: default_pre_dump_max_iterations(),
                pre_dump_convergence_pages: default_pre_dump_convergence_pages(),
                operation_timeout: Duration::from_secs(default_operation_timeout_secs()),
                batch_concurrency: default_batch_concurrency().clamp(1, 1024),
            },
            page_server: PageServerConfig {
                max_connections: default_max_connections(),
                connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            },
        }
    }
}

/// Settings loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate settings from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> LivesnapResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LivesnapError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| LivesnapError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate settings from a YAML string.
    pub fn load_string(content: &str) -> LivesnapResult<Config> {
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| LivesnapError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> LivesnapResult<Config> {
        Ok(Config {
            engine: Self::validate_engine(raw.engine)?,
            orchestrator: Self::validate_orchestrator(raw.orchestrator)?,
            page_server: Self::validate_page_server(raw.page_server)?,
        })
    }

    fn validate_engine(raw: RawEngineConfig) -> LivesnapResult<EngineConfig> {
        if raw.state_dir.is_empty() {
            return Err(ValidationError::MissingRequiredField {
                field: "state_dir",
                context: "engine".to_string(),
            }
            .into());
        }
        if raw.runtime_state_dir.is_empty() {
            return Err(ValidationError::MissingRequiredField {
                field: "runtime_state_dir",
                context: "engine".to_string(),
            }
            .into());
        }

        let non_empty = |field: &'static str, value: Option<String>| match value {
            Some(v) if v.is_empty() => Err(ValidationError::InvalidFieldValue {
                field,
                value: v,
                reason: "Path cannot be empty; omit the field to auto-detect".to_string(),
            }),
            other => Ok(other.map(PathBuf::from)),
        };

        Ok(EngineConfig {
            kind: raw.kind,
            criu_path: non_empty("criu_path", raw.criu_path)?,
            crit_path: non_empty("crit_path", raw.crit_path)?,
            state_dir: PathBuf::from(raw.state_dir),
            runtime_state_dir: PathBuf::from(raw.runtime_state_dir),
            shell_job: raw.shell_job,
            tcp_established: raw.tcp_established,
        })
    }

    fn validate_orchestrator(raw: RawOrchestratorConfig) -> LivesnapResult<OrchestratorConfig> {
        const MAX_PRE_DUMP_ITERATIONS: u32 = 16;
        const MAX_TIMEOUT_SECS: u64 = 86_400;
        const MAX_BATCH_CONCURRENCY: usize = 1024;

        if raw.pre_dump_max_iterations == 0 || raw.pre_dump_max_iterations > MAX_PRE_DUMP_ITERATIONS
        {
            return Err(ValidationError::InvalidFieldValue {
                field: "pre_dump_max_iterations",
                value: raw.pre_dump_max_iterations.to_string(),
                reason: format!("Must be between 1 and {}", MAX_PRE_DUMP_ITERATIONS),
            }
            .into());
        }

        if raw.operation_timeout_secs == 0 || raw.operation_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ValidationError::InvalidFieldValue {
                field: "operation_timeout_secs",
                value: raw.operation_timeout_secs.to_string(),
                reason: format!("Must be between 1 and {} seconds", MAX_TIMEOUT_SECS),
            }
            .into());
        }

        if raw.batch_concurrency == 0 || raw.batch_concurrency > MAX_BATCH_CONCURRENCY {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_concurrency",
                value: raw.batch_concurrency.to_string(),
                reason: format!("Must be between 1 and {}", MAX_BATCH_CONCURRENCY),
            }
            .into());
        }

        Ok(OrchestratorConfig {
            pre_dump_max_iterations: raw.pre_dump_max_iterations,
            pre_dump_convergence_pages: raw.pre_dump_convergence_pages,
            operation_timeout: Duration::from_secs(raw.operation_timeout_secs),
            batch_concurrency: raw.batch_concurrency,
        })
    }

    fn validate_page_server(raw: RawPageServerConfig) -> LivesnapResult<PageServerConfig> {
        if raw.max_connections == 0 || raw.max_connections > 1024 {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_connections",
                value: raw.max_connections.to_string(),
                reason: "Must be between 1 and 1024".to_string(),
            }
            .into());
        }

        // 5 minutes max
        if raw.connect_timeout_ms == 0 || raw.connect_timeout_ms > 300_000 {
            return Err(ValidationError::InvalidFieldValue {
                field: "connect_timeout_ms",
                value: raw.connect_timeout_ms.to_string(),
                reason: "Must be between 1 and 300000ms".to_string(),
            }
            .into());
        }

        Ok(PageServerConfig {
            max_connections: raw.max_connections,
            connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
        })
    }
}
