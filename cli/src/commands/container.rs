// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use berth_core::domain::config::BerthConfig;
use berth_core::domain::engine::{LogOptions, LogStream};

use crate::context::EngineContext;

#[derive(Subcommand)]
pub enum ContainerCommand {
    /// Replace a container with an equivalent one on its current image tag
    Recreate {
        /// Container id or name
        #[arg(value_name = "CONTAINER")]
        container: String,

        /// Pull the image reference first
        #[arg(long)]
        pull: bool,
    },

    /// Print recent log lines
    Logs {
        #[arg(value_name = "CONTAINER")]
        container: String,

        /// Number of lines from the end
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,

        /// Prefix lines with timestamps
        #[arg(short, long)]
        timestamps: bool,
    },

    /// One-shot CPU and memory usage
    Stats {
        #[arg(value_name = "CONTAINER")]
        container: String,
    },
}

pub async fn handle_command(command: ContainerCommand, config: BerthConfig) -> Result<()> {
    let ctx = EngineContext::new(config).await?;
    let lifecycle = ctx.reconciler.lifecycle();

    match command {
        ContainerCommand::Recreate { container, pull } => {
            if pull {
                let details = ctx.engine.inspect_container(&container).await?;
                println!("Pulling {}...", details.spec.image);
                ctx.engine.pull_image(&details.spec.image).await?;
            }
            let replacement = lifecycle.recreate(&container).await?;
            println!(
                "{}",
                format!("✓ Recreated {} ({})", replacement.name, short(&replacement.id)).green()
            );
        }
        ContainerCommand::Logs {
            container,
            tail,
            timestamps,
        } => {
            let options = LogOptions {
                tail: Some(tail),
                timestamps,
                since: None,
            };
            for line in lifecycle.fetch_logs(&container, &options).await? {
                match line.stream {
                    LogStream::Stdout => print!("{}", line.message),
                    LogStream::Stderr => eprint!("{}", line.message.red()),
                }
            }
        }
        ContainerCommand::Stats { container } => {
            let stats = lifecycle.fetch_stats(&container).await?;
            println!("{}", container.bold());
            println!("  CPU: {:.2}%", stats.cpu_percent);
            println!(
                "  Memory: {:.1} MiB / {:.1} MiB ({:.1}%)",
                stats.memory_usage_bytes as f64 / 1_048_576.0,
                stats.memory_limit_bytes as f64 / 1_048_576.0,
                stats.memory_percent()
            );
        }
    }
    Ok(())
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
