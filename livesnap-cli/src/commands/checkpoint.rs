// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap checkpoint` command - Checkpoint one or more containers.

use livesnap_core::request::resolve;
use livesnap_core::{
    CheckpointOrchestrator, CheckpointReport, ContainerId, PageLocation, RawCheckpointRequest,
};

use super::{build_engine, build_locks, build_pool, load_config, shutdown_token};
use crate::CheckpointArgs;

pub async fn execute(
    config_path: Option<&str>,
    containers: &[String],
    args: &CheckpointArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    // Resolve everything before touching the engine.
    let request = resolve(&RawCheckpointRequest {
        images_directory: args.images_dir.clone(),
        work_directory: args.work_dir.clone(),
        leave_running: args.leave_running,
        prev_images_directory: args.prev_images_dir.clone(),
        track_memory: args.track_memory,
        enable_pre_dump: args.enable_pre_dump,
        auto_dedup: args.auto_dedup,
        page_server: args.page_server,
        address: args.address.clone(),
        port: args.port,
    })?;
    let containers = containers
        .iter()
        .map(ContainerId::new)
        .collect::<Result<Vec<_>, _>>()?;

    let config = load_config(config_path)?;
    let engine = build_engine(&config)?;
    let orchestrator = CheckpointOrchestrator::new(
        engine,
        build_locks(&config),
        build_pool(&config),
        config.orchestrator.clone(),
    );

    let report = orchestrator
        .checkpoint_batch_with_cancel(&containers, &request, shutdown_token())
        .await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(checkpoint) => print_report(checkpoint),
            Err(e) => eprintln!("✗ {}: {}", outcome.container_id, e),
        }
    }

    report.into_result()?;
    Ok(())
}

fn print_report(report: &CheckpointReport) {
    let location = match &report.page_location {
        PageLocation::Local => "local".to_string(),
        PageLocation::Remote { address, port } => format!("page server {}:{}", address, port),
    };

    println!(
        "✓ {} → {} (snapshot {})",
        report.container_id,
        report.images_dir.display(),
        report.snapshot_id
    );
    println!(
        "  Pre-dump passes: {}  Pages: {} ({} bytes, {})  Chain length: {}  Time: {}ms",
        report.pre_dump_passes,
        report.pages_written,
        report.bytes_written,
        location,
        report.chain_length,
        report.elapsed.as_millis()
    );
    if let Some(dedup) = &report.dedup {
        println!(
            "  Deduplicated: {} pages removed, {} bytes reclaimed",
            dedup.pages_removed, dedup.bytes_reclaimed
        );
    }
    for warning in &report.warnings {
        println!("  ⚠ {}", warning);
    }
}
