// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap restore` command - Restore a container from its snapshot chain.

use livesnap_core::request::resolve_restore;
use livesnap_core::{ContainerId, RawRestoreRequest, RestoreOrchestrator};

use super::{build_engine, build_locks, build_pool, load_config, shutdown_token};

pub async fn execute(
    config_path: Option<&str>,
    container: &str,
    images_dir: String,
    work_dir: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = resolve_restore(&RawRestoreRequest {
        images_directory: images_dir,
        work_directory: work_dir,
        force,
    })?;
    let container = ContainerId::new(container)?;

    let config = load_config(config_path)?;
    let orchestrator = RestoreOrchestrator::new(
        build_engine(&config)?,
        build_locks(&config),
        build_pool(&config),
        config.orchestrator.operation_timeout,
    );

    let report = orchestrator
        .restore_with_cancel(&container, &request, shutdown_token())
        .await?;

    println!(
        "✓ {} restored from snapshot {} (PID: {})",
        report.container_id, report.snapshot_id, report.root_pid
    );
    println!(
        "  Processes: {}  Pages: {}  Chain length: {}  Time: {}ms",
        report.process_count,
        report.pages_restored,
        report.chain_length,
        report.elapsed.as_millis()
    );
    if report.forced {
        println!("  ⚠ compatibility checks skipped (--force)");
    }
    Ok(())
}
