// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap dedup` command - Compact a snapshot chain.

use std::path::PathBuf;

use livesnap_core::DedupCoordinator;

pub async fn execute(dir: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(dir = %dir, "Compacting snapshot chain");

    let leaf = PathBuf::from(dir);
    let report = tokio::task::spawn_blocking(move || DedupCoordinator::compact_dir(&leaf)).await??;

    println!("✓ Chain compacted");
    println!("  Links scanned:   {}", report.links_scanned);
    println!("  Pages removed:   {}", report.pages_removed);
    println!("  Bytes reclaimed: {}", report.bytes_reclaimed);
    if report.skipped_remote > 0 {
        println!(
            "  Skipped:         {} link(s) stored on a page server",
            report.skipped_remote
        );
    }
    Ok(())
}
