// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! # berth CLI
//!
//! The `berth` binary drives the stack engine in-process: every command
//! builds the engine, runs one operation and exits, so user-triggered
//! operations on a stack never overlap within a process.
//!
//! ## Commands
//!
//! - `berth stack list|show|create|deploy|stop|restart|redeploy|rename|delete|discover|import|migrate`
//! - `berth container recreate|logs|stats`
//! - `berth update once|run` - Auto-update poll
//! - `berth config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use berth_core::domain::config::BerthConfig;

mod commands;
mod context;

use commands::{ConfigCommand, ContainerCommand, StackCommand, UpdateCommand};

/// berth - compose stacks on a single Docker host
#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BERTH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to logging.level
    #[arg(long, global = true, env = "BERTH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json); defaults to logging.format
    #[arg(long, global = true, env = "BERTH_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stack operations
    #[command(name = "stack")]
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },

    /// Single container operations
    #[command(name = "container")]
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },

    /// Image auto-update
    #[command(name = "update")]
    Update {
        #[command(subcommand)]
        command: UpdateCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BerthConfig::load_or_default(cli.config.clone()).context("Failed to load configuration")?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    init_logging(level, format)?;

    match cli.command {
        Commands::Stack { command } => commands::stack::handle_command(command, config).await,
        Commands::Container { command } => commands::container::handle_command(command, config).await,
        Commands::Update { command } => commands::update::handle_command(command, config).await,
        Commands::Config { command } => commands::config::handle_command(command, config, cli.config).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
