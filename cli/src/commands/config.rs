// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use berth_core::domain::config::BerthConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write the default configuration as YAML
    Generate {
        #[arg(short, long, default_value = "./berth.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config: BerthConfig,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(&config, config_override, paths),
        ConfigCommand::Validate { file } => match file {
            Some(path) => validate(&BerthConfig::load_or_default(Some(path)).context("Failed to load configuration")?),
            None => validate(&config),
        },
        ConfigCommand::Generate { output } => generate(output).await,
    }
}

fn show(config: &BerthConfig, config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BERTH_CONFIG_PATH: {}",
            std::env::var("BERTH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./berth.yaml");
        println!("  4. ~/.berth/config.yaml");
        println!("  5. /etc/berth/config.yaml");
        match BerthConfig::discover_config() {
            Some(found) => println!("  Discovered: {}", found.display()),
            None => println!("  Discovered: {}", "(none, using defaults)".dimmed()),
        }
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Stacks:".bold());
    println!("  Root: {}", config.stacks_root.display());
    println!(
        "  Docker socket: {}",
        config.docker_socket_path.as_deref().unwrap_or("(platform default)")
    );
    println!();

    println!("{}", "Auto-update:".bold());
    println!("  Enabled: {}", config.auto_update.enabled);
    println!("  Interval: {:?}", config.auto_update.interval);
    println!("  Label: {}", config.auto_update.label);
    println!();

    println!("{}", "Runtime:".bold());
    println!("  Stop timeout: {}s", config.runtime.stop_timeout_secs);
    println!("  Status cache TTL: {:?}", config.runtime.status_cache_ttl);
    println!("  Rename attempts: {}", config.runtime.rename_max_attempts);
    println!("  Prefer attached network: {}", config.runtime.prefer_attached_network);
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", config.logging.level);
    println!("  Log format: {}", config.logging.format);
    match &config.metrics {
        Some(metrics) if metrics.enabled => println!("  Metrics: :{}", metrics.port),
        _ => println!("  Metrics: {}", "disabled".dimmed()),
    }

    Ok(())
}

fn validate(config: &BerthConfig) -> Result<()> {
    println!("Validating configuration...");
    config.validate().context("Configuration validation failed")?;
    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

async fn generate(output: PathBuf) -> Result<()> {
    let sample = serde_yaml::to_string(&BerthConfig::default()).context("Failed to render configuration")?;

    tokio::fs::write(&output, sample)
        .await
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
