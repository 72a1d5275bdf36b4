// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap page-server` command - Receive snapshot pages over TCP.
//!
//! Runs until Ctrl-C.

use livesnap_core::{PageServer, PageServerStats};

use super::shutdown_token;
use crate::metrics;

pub async fn execute(
    listen: &str,
    root: &str,
    metrics_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = PageServer::bind(listen, root).await?;
    let addr = server.local_addr()?;
    let stats = server.stats();
    let cancel = shutdown_token();

    if let Some(port) = metrics_port {
        metrics::start_metrics_server(port);
        metrics::spawn_stats_exporter(stats.clone(), cancel.clone());
    }

    println!("▶ Page server listening on {}", addr);
    println!("  Storing snapshots in {}", server.root().display());

    server.serve(cancel).await?;

    println!(
        "✓ Page server stopped ({} snapshots committed, {} pages received, {} pages served)",
        PageServerStats::load(&stats.snapshots_committed),
        PageServerStats::load(&stats.pages_received),
        PageServerStats::load(&stats.pages_served)
    );
    Ok(())
}
