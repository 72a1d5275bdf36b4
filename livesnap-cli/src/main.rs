// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Livesnap CLI
//!
//! Command-line interface for live container checkpoint/restore.

use clap::{Args, Parser, Subcommand};

mod commands;
mod metrics;

/// Livesnap - live checkpoint/restore for containers
#[derive(Parser)]
#[command(name = "livesnap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every checkpoint invocation.
#[derive(Args, Debug, Clone)]
pub struct CheckpointArgs {
    /// Directory receiving the snapshot (parent directory for several containers)
    #[arg(long = "images-dir")]
    pub images_dir: String,

    /// Directory for engine logs and scratch files
    #[arg(long = "work-dir")]
    pub work_dir: String,

    /// Keep the container running after the final dump
    #[arg(long)]
    pub leave_running: bool,

    /// Previous snapshot to chain this one onto
    #[arg(long = "prev-images-dir")]
    pub prev_images_dir: Option<String>,

    /// Arm dirty-page tracking for later incremental passes
    #[arg(long = "track-mem")]
    pub track_memory: bool,

    /// Run iterative pre-dump passes before the final dump
    #[arg(long = "pre-dump")]
    pub enable_pre_dump: bool,

    /// Compact the chain once the snapshot is committed
    #[arg(long)]
    pub auto_dedup: bool,

    /// Stream pages to a page server instead of the images directory
    #[arg(long)]
    pub page_server: bool,

    /// Page server address
    #[arg(long, default_value = "")]
    pub address: String,

    /// Page server port
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub port: i64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Checkpoint one or more containers
    Checkpoint {
        /// Container IDs
        #[arg(required = true)]
        containers: Vec<String>,

        #[command(flatten)]
        args: CheckpointArgs,
    },

    /// Restore a container from a snapshot chain
    Restore {
        /// Container ID
        container: String,

        /// Leaf directory of the chain to restore
        #[arg(long = "images-dir")]
        images_dir: String,

        /// Directory for engine logs
        #[arg(long = "work-dir")]
        work_dir: Option<String>,

        /// Skip container and host compatibility checks
        #[arg(short, long)]
        force: bool,
    },

    /// Show the snapshot chain ending at a directory
    Chain {
        /// Leaf snapshot directory
        dir: String,
    },

    /// Remove superseded pages from a snapshot chain
    Dedup {
        /// Leaf snapshot directory
        dir: String,
    },

    /// Run a page server receiving snapshot pages
    PageServer {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:27000")]
        listen: String,

        /// Directory storing committed snapshots
        #[arg(short, long)]
        root: String,

        /// Expose Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    // Dispatch to command handlers
    match cli.command {
        Commands::Checkpoint { containers, args } => {
            commands::checkpoint::execute(config_path, &containers, &args).await
        }
        Commands::Restore {
            container,
            images_dir,
            work_dir,
            force,
        } => commands::restore::execute(config_path, &container, images_dir, work_dir, force).await,
        Commands::Chain { dir } => commands::chain::execute(&dir).await,
        Commands::Dedup { dir } => commands::dedup::execute(&dir).await,
        Commands::PageServer {
            listen,
            root,
            metrics_port,
        } => commands::page_server::execute(&listen, &root, metrics_port).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
