// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap chain` command - Show a snapshot chain.

use std::path::Path;

use livesnap_core::chain::PageStore;
use livesnap_core::{ChainManager, PageLocation};

pub async fn execute(dir: &str) -> Result<(), Box<dyn std::error::Error>> {
    let chain = ChainManager::resolve_chain(Path::new(dir))?;

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                              SNAPSHOT CHAIN                                  ║");
    println!("╠════╦══════════════════════════════════════╦══════════╦═══════════╦═══════════╣");
    println!("║ #  ║ Snapshot                             ║ Kind     ║ Pages     ║ Dedup     ║");
    println!("╠════╬══════════════════════════════════════╬══════════╬═══════════╬═══════════╣");

    for (index, resolved) in chain.iter().enumerate() {
        let pages = match &resolved.link.pages {
            PageLocation::Local => PageStore::read_index(&resolved.dir)
                .map(|index| index.len().to_string())
                .unwrap_or_else(|_| "unreadable".to_string()),
            PageLocation::Remote { .. } => "remote".to_string(),
        };
        println!(
            "║ {:<2} ║ {:<36} ║ {:<8} ║ {:<9} ║ {:<9} ║",
            index,
            resolved.link.snapshot_id.to_string(),
            resolved.link.kind.name(),
            pages,
            if resolved.link.deduplicated { "yes" } else { "no" }
        );
    }

    println!("╚════╩══════════════════════════════════════╩══════════╩═══════════╩═══════════╝");
    println!();

    if let Some(leaf) = chain.last() {
        println!("Container: {}", leaf.link.container_id);
        println!(
            "Host:      {} {} ({} {})",
            leaf.link.host.arch,
            leaf.link.host.kernel_release,
            leaf.link.host.engine,
            leaf.link.host.engine_version
        );
    }
    for resolved in &chain {
        if let PageLocation::Remote { address, port } = &resolved.link.pages {
            println!(
                "Snapshot {} pages on page server {}:{}",
                resolved.link.snapshot_id, address, port
            );
        }
    }
    println!("Total: {} link(s)", chain.len());

    Ok(())
}
