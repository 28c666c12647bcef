// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-process engine wiring shared by every command.

use anyhow::{Context, Result};
use std::sync::Arc;

use berth_core::{
    application::{
        auto_update::AutoUpdateOrchestrator, identity::StackIdentityManager,
        reconciler::StandardStackReconciler,
    },
    domain::config::BerthConfig,
    domain::engine::ContainerEngine,
    infrastructure::{
        docker::DockerEngine, event_bus::EventBus, filesystem::StackFilesystem,
        repositories::JsonFileStackRepository,
    },
};

pub struct EngineContext {
    pub config: BerthConfig,
    pub engine: Arc<dyn ContainerEngine>,
    pub reconciler: Arc<StandardStackReconciler>,
    pub identity: StackIdentityManager,
}

impl EngineContext {
    pub async fn new(config: BerthConfig) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;

        let docker = DockerEngine::connect(config.docker_socket_path.as_deref())
            .context("Failed to create Docker client")?;
        docker.healthcheck().await.context("Docker daemon is not reachable")?;
        let engine: Arc<dyn ContainerEngine> = Arc::new(docker);

        tokio::fs::create_dir_all(&config.stacks_root)
            .await
            .with_context(|| format!("Failed to create stacks root {:?}", config.stacks_root))?;
        let repository = JsonFileStackRepository::open(&config.stacks_root)
            .await
            .context("Failed to open stack metadata")?;

        let reconciler = Arc::new(StandardStackReconciler::new(
            engine.clone(),
            Arc::new(repository),
            Arc::new(StackFilesystem::new(&config.stacks_root)),
            EventBus::with_default_capacity(),
            &config,
        ));
        let identity = StackIdentityManager::new(reconciler.clone(), config.runtime.rename_max_attempts);

        Ok(Self {
            config,
            engine,
            reconciler,
            identity,
        })
    }

    pub fn auto_updater(&self) -> AutoUpdateOrchestrator {
        AutoUpdateOrchestrator::new(self.reconciler.clone(), self.config.auto_update.clone())
    }
}
