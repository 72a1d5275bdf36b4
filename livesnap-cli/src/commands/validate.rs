// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `livesnap validate` command - Validate configuration file.

use livesnap_core::{ConfigLoader, EngineKind};

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let engine = match config.engine.kind {
                EngineKind::Criu => "criu",
                EngineKind::InMemory => "in-memory",
            };
            println!("✓ Configuration is valid");
            println!();
            println!("Engine Settings:");
            println!("  Kind:                {}", engine);
            println!(
                "  State Directory:     {}",
                config.engine.state_dir.display()
            );
            println!(
                "  Runtime State:       {}",
                config.engine.runtime_state_dir.display()
            );
            println!();
            println!("Orchestrator Settings:");
            println!(
                "  Pre-dump Passes:     {} (converge at {} pages)",
                config.orchestrator.pre_dump_max_iterations,
                config.orchestrator.pre_dump_convergence_pages
            );
            println!(
                "  Operation Timeout:   {}s",
                config.orchestrator.operation_timeout.as_secs()
            );
            println!(
                "  Batch Concurrency:   {}",
                config.orchestrator.batch_concurrency
            );
            println!();
            println!("Page Server Client:");
            println!(
                "  Max Connections:     {}",
                config.page_server.max_connections
            );
            println!(
                "  Connect Timeout:     {}ms",
                config.page_server.connect_timeout.as_millis()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
