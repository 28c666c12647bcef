// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use berth_core::application::identity::StackIdentityManager;
use berth_core::application::reconciler::{StackReconciler, StandardStackReconciler};
use berth_core::domain::compose::labels;
use berth_core::domain::config::BerthConfig;
use berth_core::domain::engine::{ContainerSpec, ContainerState, RestartPolicy};
use berth_core::domain::stack::{StackError, StackId, StackStatus};
use berth_core::infrastructure::event_bus::{DomainEvent, EventBus};
use berth_core::infrastructure::filesystem::StackFilesystem;
use berth_core::infrastructure::mock_engine::MockContainerEngine;
use berth_core::infrastructure::repositories::InMemoryStackRepository;
use berth_core::domain::events::StackEvent;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    engine: Arc<MockContainerEngine>,
    events: EventBus,
    reconciler: Arc<StandardStackReconciler>,
    identity: StackIdentityManager,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(MockContainerEngine::new());
    let events = EventBus::new(64);
    let config = BerthConfig {
        stacks_root: dir.path().to_path_buf(),
        ..Default::default()
    };
    let reconciler = Arc::new(StandardStackReconciler::new(
        engine.clone(),
        Arc::new(InMemoryStackRepository::new()),
        Arc::new(StackFilesystem::new(dir.path())),
        events.clone(),
        &config,
    ));
    let identity = StackIdentityManager::new(reconciler.clone(), config.runtime.rename_max_attempts);
    Harness {
        _dir: dir,
        engine,
        events,
        reconciler,
        identity,
    }
}

#[tokio::test]
async fn test_first_deploy() {
    let h = harness();
    let stack = h
        .identity
        .create("demo", r#"services: {web: {image: "nginx:1.25", ports: ["8080:80"]}}"#, "")
        .await
        .unwrap();

    let deployed = h.reconciler.deploy(&stack.id).await.unwrap();
    assert_eq!(deployed.status, StackStatus::Running);
    assert_eq!(deployed.service_count, 1);
    assert_eq!(deployed.running_count, 1);

    assert_eq!(h.engine.network_names(), vec!["demo_default"]);
    let containers = h.engine.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "demo_web");
    assert_eq!(containers[0].state, ContainerState::Running);

    let spec = h.engine.container_spec("demo_web").unwrap();
    assert_eq!(spec.port_bindings["80/tcp"][0].host_port.as_deref(), Some("8080"));
    assert_eq!(spec.labels[labels::PROJECT], "demo");
    assert_eq!(spec.network_mode.as_deref(), Some("demo_default"));
}

#[tokio::test]
async fn test_failed_deploy_rolls_back_every_container() {
    let h = harness();
    let doc = r#"
services:
  first: {image: "busybox:1"}
  second: {image: "busybox:1"}
  third: {image: "busybox:1"}
"#;
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.engine.fail_create_for("demo_second");

    let mut events = h.events.subscribe_stack(stack.id.clone());
    let result = h.reconciler.deploy(&stack.id).await;
    assert!(matches!(result, Err(StackError::Provisioning { .. })));

    let remaining = h
        .reconciler
        .lifecycle()
        .resolve_stack_containers(&stack.id)
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert!(h.engine.containers().is_empty());
    assert!(matches!(events.recv().await.unwrap(), StackEvent::StackDeployFailed { .. }));
}

#[tokio::test]
async fn test_start_failure_also_rolls_back() {
    let h = harness();
    let doc = "services:\n  a: {image: x}\n  b: {image: y}\n";
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.engine.fail_start_for("demo_b");

    assert!(h.reconciler.deploy(&stack.id).await.is_err());
    assert!(h.engine.containers().is_empty());
}

#[tokio::test]
async fn test_redeploy_keeps_one_network_per_declared_entry() {
    let h = harness();
    let doc = r#"
services:
  web: {image: nginx, networks: [front]}
  api: {image: api, networks: [front, back]}
networks:
  front: {}
  back: {internal: true}
  proxy: {external: true}
"#;
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();
    h.reconciler.redeploy(&stack.id).await.unwrap();

    let mut names = h.engine.network_names();
    names.sort();
    assert_eq!(names, vec!["demo_back", "demo_front"]);
    assert_eq!(h.engine.containers().len(), 2);
}

#[tokio::test]
async fn test_external_network_is_attached_not_created() {
    let h = harness();
    h.engine.seed_network(berth_core::domain::engine::NetworkSpec {
        name: "traefik".to_string(),
        ..Default::default()
    });
    let doc = r#"
services:
  web:
    image: nginx
    networks: [default, proxy]
networks:
  proxy:
    external: true
    name: traefik
"#;
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();

    let attached = h.engine.container_networks("demo_web");
    assert!(attached.contains_key("demo_default"));
    assert!(attached.contains_key("traefik"));

    h.reconciler.stop(&stack.id).await.unwrap();
    assert_eq!(h.engine.network_names(), vec!["traefik"]);
}

#[tokio::test]
async fn test_status_is_recomputed_without_repair() {
    let h = harness();
    let doc = "services:\n  web: {image: nginx}\n  db: {image: postgres}\n";
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();

    h.engine.set_container_state("demo_db", ContainerState::Exited);
    let observed = h.reconciler.get_stack(&stack.id).await.unwrap();
    assert_eq!(observed.status, StackStatus::PartiallyRunning);
    assert_eq!(observed.running_count, 1);
    assert_eq!(observed.service_count, 2);
}

#[tokio::test]
async fn test_rename_rejected_while_running() {
    let h = harness();
    let stack = h.identity.create("demo", "services: {web: {image: nginx}}", "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();

    let result = h.identity.rename(&stack.id, "renamed").await;
    assert!(matches!(result, Err(StackError::StackRunning(_))));
    assert!(h.reconciler.filesystem().exists(&stack.id));
    assert!(!h.reconciler.filesystem().exists(&StackId::new("renamed").unwrap()));
    assert_eq!(h.reconciler.get_stack(&stack.id).await.unwrap().status, StackStatus::Running);
}

#[tokio::test]
async fn test_rename_rejected_while_partially_running() {
    let h = harness();
    let doc = "services: {web: {image: nginx}, db: {image: postgres}}";
    let stack = h.identity.create("demo", doc, "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();
    h.engine.set_container_state("demo_db", ContainerState::Exited);

    let result = h.identity.rename(&stack.id, "renamed").await;
    assert!(matches!(result, Err(StackError::StackRunning(_))));
    assert_eq!(h.engine.containers().len(), 2);
    assert!(h.reconciler.filesystem().exists(&stack.id));
}

#[tokio::test]
async fn test_rename_rejected_when_document_no_longer_parses() {
    let h = harness();
    let stack = h.identity.create("demo", "services: {web: {image: nginx}}", "").await.unwrap();
    h.engine.seed_container(
        ContainerSpec {
            name: "demo_web".to_string(),
            image: "nginx".to_string(),
            labels: [(labels::PROJECT.to_string(), "demo".to_string())].into_iter().collect(),
            ..Default::default()
        },
        true,
    );
    h.reconciler
        .filesystem()
        .write(&stack.id, "services: {web: {build: .}}", None)
        .await
        .unwrap();

    let observed = h.reconciler.get_stack(&stack.id).await.unwrap();
    assert_eq!(observed.status, StackStatus::Unknown);
    assert_eq!(observed.running_count, 1);

    let result = h.identity.rename(&stack.id, "renamed").await;
    assert!(matches!(result, Err(StackError::StackRunning(_))));
    let containers = h.engine.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].state, ContainerState::Running);
    assert!(h.reconciler.filesystem().exists(&stack.id));
    assert!(!h.reconciler.filesystem().exists(&StackId::new("renamed").unwrap()));
}

#[tokio::test]
async fn test_rename_after_stop_then_deploy_under_new_name() {
    let h = harness();
    let stack = h.identity.create("demo", "services: {web: {image: nginx}}", "").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();
    h.reconciler.stop(&stack.id).await.unwrap();

    let renamed = h.identity.rename(&stack.id, "Renamed Demo").await.unwrap();
    assert_eq!(renamed.id.as_str(), "renamed-demo");

    h.reconciler.deploy(&renamed.id).await.unwrap();
    let names: Vec<String> = h.engine.containers().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["renamed-demo_web"]);

    let listed: Vec<String> = h
        .reconciler
        .list_stacks()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id.to_string())
        .collect();
    assert_eq!(listed, vec!["renamed-demo"]);
}

#[tokio::test]
async fn test_overlay_values_reach_containers() {
    let h = harness();
    let doc = r#"
services:
  app:
    image: "app:${TAG:-latest}"
    restart: unless-stopped
    environment:
      MODE: service
    volumes:
      - ./data:/data
"#;
    let stack = h.identity.create("demo", doc, "TAG=2.1\nMODE=overlay\nTZ=UTC\n").await.unwrap();
    h.reconciler.deploy(&stack.id).await.unwrap();

    let spec = h.engine.container_spec("demo_app").unwrap();
    assert_eq!(spec.image, "app:2.1");
    assert_eq!(spec.restart_policy, RestartPolicy::UnlessStopped);
    assert!(spec.env.contains(&"MODE=service".to_string()));
    assert!(spec.env.contains(&"TZ=UTC".to_string()));
    assert!(!spec.env.contains(&"MODE=overlay".to_string()));

    let stack_dir = h.reconciler.filesystem().stack_dir(&stack.id);
    assert_eq!(spec.binds, vec![format!("{}:/data", stack_dir.join("data").display())]);
}

#[tokio::test]
async fn test_event_stream_reports_deploy() {
    let h = harness();
    let stack = h.identity.create("demo", "services: {web: {image: nginx}}", "").await.unwrap();
    let mut all = h.events.subscribe();
    h.reconciler.deploy(&stack.id).await.unwrap();

    let mut saw_deployed = false;
    while let Ok(event) = all.try_recv() {
        if let DomainEvent::Stack(StackEvent::StackDeployed { service_count, .. }) = event {
            assert_eq!(service_count, 1);
            saw_deployed = true;
        }
    }
    assert!(saw_deployed);
}
