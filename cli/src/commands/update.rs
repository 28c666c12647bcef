// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Auto-update commands
//!
//! `once` runs a single poll cycle regardless of `auto_update.enabled`;
//! `run` polls on the configured interval until Ctrl-C and serves
//! Prometheus metrics when `metrics.enabled` is set.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;

use berth_core::application::auto_update::TickReport;
use berth_core::domain::config::BerthConfig;
use berth_core::domain::events::UpdateTarget;

use crate::context::EngineContext;

#[derive(Subcommand)]
pub enum UpdateCommand {
    /// Check every opted-in container and stack once
    Once,

    /// Poll until interrupted
    Run,
}

pub async fn handle_command(command: UpdateCommand, config: BerthConfig) -> Result<()> {
    match command {
        UpdateCommand::Once => {
            let ctx = EngineContext::new(config).await?;
            let report = ctx.auto_updater().tick().await;
            print_report(&report);
            Ok(())
        }
        UpdateCommand::Run => run(config).await,
    }
}

async fn run(config: BerthConfig) -> Result<()> {
    if let Some(metrics) = config.metrics.as_ref().filter(|m| m.enabled) {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics.port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on 0.0.0.0:{}", metrics.port);
    }

    if !config.auto_update.enabled {
        println!(
            "{}",
            "Auto-update is disabled (auto_update.enabled = false); nothing to poll.".yellow()
        );
        return Ok(());
    }

    let ctx = EngineContext::new(config).await?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    println!(
        "{}",
        format!(
            "Polling every {:?} for containers and stacks labeled {}",
            ctx.config.auto_update.interval, ctx.config.auto_update.label
        )
        .green()
    );
    ctx.auto_updater().run(shutdown).await;
    Ok(())
}

fn print_report(report: &TickReport) {
    println!(
        "Checked {} containers and {} stacks",
        report.containers_checked, report.stacks_checked
    );
    for name in &report.containers_updated {
        println!("  {} container {}", "updated".green(), name);
    }
    for id in &report.stacks_updated {
        println!("  {} stack {}", "updated".green(), id);
    }
    for entity in &report.skipped {
        println!("  {} {} (update already in progress)", "skipped".yellow(), entity);
    }
    for (target, reason) in &report.failures {
        let name = match target {
            UpdateTarget::Container { name, .. } => format!("container {}", name),
            UpdateTarget::Stack { id } => format!("stack {}", id),
        };
        println!("  {} {}: {}", "failed".red(), name, reason);
    }
    if report.containers_updated.is_empty() && report.stacks_updated.is_empty() && report.failures.is_empty() {
        println!("{}", "✓ Everything is up to date".green());
    }
}
