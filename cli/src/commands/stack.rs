// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stack commands
//!
//! Commands: list, show, create, deploy, stop, restart, redeploy, rename,
//! delete, discover, import, migrate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_core::application::maturity::MaturityService;
use berth_core::application::reconciler::StackReconciler;
use berth_core::domain::maturity::UnknownMaturityChecker;
use berth_core::domain::stack::{Stack, StackId};
use berth_core::domain::config::BerthConfig;

use super::status_colored;
use crate::context::EngineContext;

#[derive(Subcommand)]
pub enum StackCommand {
    /// List stacks with live status
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one stack
    Show {
        #[arg(value_name = "STACK")]
        id: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a stack from a compose file
    Create {
        /// Display name; the stack id is derived from it
        #[arg(value_name = "NAME")]
        name: String,

        /// Compose document
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        /// Optional .env overlay
        #[arg(long, value_name = "FILE")]
        env_file: Option<PathBuf>,

        /// Deploy right after creating
        #[arg(long)]
        deploy: bool,
    },

    /// Pull images, provision networks and start every service
    Deploy {
        #[arg(value_name = "STACK")]
        id: String,
    },

    /// Stop and remove the stack's containers and networks
    Stop {
        #[arg(value_name = "STACK")]
        id: String,
    },

    /// Stop then deploy
    Restart {
        #[arg(value_name = "STACK")]
        id: String,
    },

    /// Pull and recreate every container
    Redeploy {
        #[arg(value_name = "STACK")]
        id: String,
    },

    /// Rename a stopped stack
    Rename {
        #[arg(value_name = "STACK")]
        id: String,

        #[arg(value_name = "NEW_NAME")]
        new_name: String,
    },

    /// Tear down and delete a stack, including its directory
    Delete {
        #[arg(value_name = "STACK")]
        id: String,

        /// Skip the confirmation check
        #[arg(short, long)]
        yes: bool,
    },

    /// List compose projects running outside the stacks root
    Discover,

    /// Adopt a discovered project as a managed stack
    Import {
        #[arg(value_name = "PROJECT")]
        project: String,
    },

    /// Move flat <name>.yml files into per-stack directories
    Migrate,
}

pub async fn handle_command(command: StackCommand, config: BerthConfig) -> Result<()> {
    let ctx = EngineContext::new(config).await?;

    match command {
        StackCommand::List { json } => list(&ctx, json).await,
        StackCommand::Show { id, json } => show(&ctx, &parse_id(&id)?, json).await,
        StackCommand::Create {
            name,
            file,
            env_file,
            deploy,
        } => create(&ctx, &name, file, env_file, deploy).await,
        StackCommand::Deploy { id } => {
            let stack = ctx.reconciler.deploy(&parse_id(&id)?).await?;
            print_outcome("Deployed", &stack);
            Ok(())
        }
        StackCommand::Stop { id } => {
            let removed = ctx.reconciler.stop(&parse_id(&id)?).await?;
            println!("{}", format!("✓ Stopped {} ({} containers removed)", id, removed).green());
            Ok(())
        }
        StackCommand::Restart { id } => {
            let stack = ctx.reconciler.restart(&parse_id(&id)?).await?;
            print_outcome("Restarted", &stack);
            Ok(())
        }
        StackCommand::Redeploy { id } => {
            let stack = ctx.reconciler.redeploy(&parse_id(&id)?).await?;
            print_outcome("Redeployed", &stack);
            Ok(())
        }
        StackCommand::Rename { id, new_name } => {
            let stack = ctx.identity.rename(&parse_id(&id)?, &new_name).await?;
            println!("{}", format!("✓ Renamed {} → {}", id, stack.id).green());
            Ok(())
        }
        StackCommand::Delete { id, yes } => {
            if !yes {
                println!(
                    "{}",
                    format!("Refusing to delete '{}' without --yes (removes containers, networks and files)", id)
                        .yellow()
                );
                return Ok(());
            }
            ctx.identity.delete(&parse_id(&id)?).await?;
            println!("{}", format!("✓ Deleted {}", id).green());
            Ok(())
        }
        StackCommand::Discover => discover(&ctx).await,
        StackCommand::Import { project } => {
            let stack = ctx.identity.import(&project).await?;
            println!("{}", format!("✓ Imported {} as {}", project, stack.id).green());
            if stack.compose_document.starts_with("# Reconstructed") {
                println!(
                    "{}",
                    "  Compose file was not readable; a minimal document was rebuilt from images.".yellow()
                );
            }
            Ok(())
        }
        StackCommand::Migrate => {
            let report = ctx.identity.migrate_layout().await?;
            for id in &report.migrated {
                println!("{} {}", "migrated".green(), id);
            }
            for (file, reason) in &report.skipped {
                println!("{} {} ({})", "skipped".yellow(), file, reason);
            }
            if report.migrated.is_empty() && report.skipped.is_empty() {
                println!("Nothing to migrate.");
            }
            Ok(())
        }
    }
}

fn parse_id(id: &str) -> Result<StackId> {
    StackId::new(id).with_context(|| format!("Invalid stack id '{}'", id))
}

fn print_outcome(verb: &str, stack: &Stack) {
    println!(
        "{} {} ({}/{} running)",
        format!("✓ {} {}:", verb, stack.id).green(),
        status_colored(stack.status),
        stack.running_count,
        stack.service_count
    );
}

async fn list(ctx: &EngineContext, json: bool) -> Result<()> {
    let stacks = ctx.reconciler.list_stacks().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stacks)?);
        return Ok(());
    }

    if stacks.is_empty() {
        println!("No stacks in {}", ctx.config.stacks_root.display());
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:<10} {:<12} {}",
        "ID".bold(),
        "NAME".bold(),
        "RUNNING".bold(),
        "AUTO-UPDATE".bold(),
        "STATUS".bold()
    );
    for stack in stacks {
        println!(
            "{:<24} {:<20} {:<10} {:<12} {}",
            stack.id,
            stack.name,
            format!("{}/{}", stack.running_count, stack.service_count),
            if stack.auto_update_enabled { "on" } else { "off" },
            status_colored(stack.status)
        );
    }
    Ok(())
}

async fn show(ctx: &EngineContext, id: &StackId, json: bool) -> Result<()> {
    let stack = ctx.reconciler.get_stack(id).await?;
    let containers = ctx.reconciler.lifecycle().resolve_stack_containers(id).await?;

    if json {
        let value = serde_json::json!({
            "stack": stack,
            "containers": containers,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", format!("Stack {}", stack.id).bold());
    println!("  Name: {}", stack.name);
    println!("  Status: {}", status_colored(stack.status));
    println!("  Containers: {}/{} running", stack.running_count, stack.service_count);
    println!("  Auto-update: {}", if stack.auto_update_enabled { "on" } else { "off" });
    if stack.is_external {
        println!("  Imported: yes");
    }
    if let Some(at) = stack.last_reconciled_at {
        println!("  Last deployed: {}", at.to_rfc3339());
    }
    println!();

    println!("{}", "Containers:".bold());
    for container in &containers {
        println!(
            "  {:<32} {:<10} {}",
            container.name,
            format!("{:?}", container.state).to_lowercase(),
            container.image
        );
    }

    // Maturity is informational; no registry collaborator is wired into the CLI
    if let Ok(document) = ctx.reconciler.parse(&stack) {
        let maturity = MaturityService::new(Arc::new(UnknownMaturityChecker), Duration::from_secs(3600));
        println!();
        println!("{}", "Images:".bold());
        for image in document.image_references() {
            let record = maturity.get(&image).await;
            println!("  {:<40} {}", image, record.status);
        }
    }
    Ok(())
}

async fn create(
    ctx: &EngineContext,
    name: &str,
    file: PathBuf,
    env_file: Option<PathBuf>,
    deploy: bool,
) -> Result<()> {
    let compose = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read compose file {:?}", file))?;
    let env = match env_file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read env file {:?}", path))?,
        None => String::new(),
    };

    let stack = ctx.identity.create(name, &compose, &env).await?;
    println!("{}", format!("✓ Created stack {}", stack.id).green());

    if deploy {
        let stack = ctx.reconciler.deploy(&stack.id).await?;
        print_outcome("Deployed", &stack);
    }
    Ok(())
}

async fn discover(ctx: &EngineContext) -> Result<()> {
    let external = ctx.identity.discover_external().await?;
    if external.is_empty() {
        println!("No external compose projects found.");
        return Ok(());
    }

    println!("{:<24} {:<10} {}", "PROJECT".bold(), "RUNNING".bold(), "CONFIG".bold());
    for project in external {
        println!(
            "{:<24} {:<10} {}",
            project.project,
            format!("{}/{}", project.running_count(), project.containers.len()),
            project.config_file.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("Adopt one with: berth stack import <PROJECT>");
    Ok(())
}
