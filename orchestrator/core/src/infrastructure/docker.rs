// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Docker Engine Adapter
//!
//! [`ContainerEngine`] over the Docker Engine API via bollard. Translates
//! between the engine-agnostic specs in `domain::engine` and bollard's
//! request/response models, and classifies API errors by status code.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HealthConfig, HostConfig, Ipam, IpamConfig,
    RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::domain::engine::{
    ContainerDetails, ContainerEngine, ContainerFilter, ContainerSpec, ContainerState,
    ContainerStats, ContainerSummary, EndpointSpec, EngineError, HealthcheckSpec, LogLine,
    LogOptions, LogStream, NetworkFilter, NetworkSpec, NetworkSummary, PortBinding,
    ResourceLimits, RestartPolicy,
};

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to a custom socket, or auto-detect from the environment.
    pub fn connect(socket_path: Option<&str>) -> Result<Self, EngineError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                EngineError::Unavailable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                EngineError::Unavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self { docker })
    }

    /// Verify the Docker daemon answers.
    pub async fn healthcheck(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(|e| {
            EngineError::Unavailable(format!(
                "Cannot connect to Docker daemon: {}\n\n\
                 Verify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }
}

fn map_error(context: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => match status_code {
            404 => EngineError::NotFound(format!("{}: {}", context, message)),
            409 => EngineError::Conflict(format!("{}: {}", context, message)),
            304 => EngineError::NotModified(format!("{}: {}", context, message)),
            _ => EngineError::Request(format!("{}: {} ({})", context, message, status_code)),
        },
        other => EngineError::Request(format!("{}: {}", context, other)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn to_hash_map(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn endpoint_settings(endpoint: &EndpointSpec) -> EndpointSettings {
    let ipam = (endpoint.ipv4_address.is_some() || endpoint.ipv6_address.is_some()).then(|| EndpointIpamConfig {
        ipv4_address: endpoint.ipv4_address.clone(),
        ipv6_address: endpoint.ipv6_address.clone(),
        ..Default::default()
    });
    EndpointSettings {
        aliases: (!endpoint.aliases.is_empty()).then(|| endpoint.aliases.clone()),
        ipam_config: ipam,
        ..Default::default()
    }
}

fn endpoint_spec(settings: &EndpointSettings) -> EndpointSpec {
    let ipam = settings.ipam_config.as_ref();
    EndpointSpec {
        aliases: settings.aliases.clone().unwrap_or_default(),
        ipv4_address: non_empty(ipam.and_then(|c| c.ipv4_address.clone())),
        ipv6_address: non_empty(ipam.and_then(|c| c.ipv6_address.clone())),
    }
}

fn restart_policy_to_docker(policy: &RestartPolicy) -> DockerRestartPolicy {
    let (name, maximum_retry_count) = match policy {
        RestartPolicy::No => (RestartPolicyNameEnum::NO, None),
        RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
        RestartPolicy::UnlessStopped => (RestartPolicyNameEnum::UNLESS_STOPPED, None),
        RestartPolicy::OnFailure { max_retries } => (RestartPolicyNameEnum::ON_FAILURE, *max_retries),
    };
    DockerRestartPolicy {
        name: Some(name),
        maximum_retry_count,
    }
}

fn restart_policy_from_docker(policy: Option<&DockerRestartPolicy>) -> RestartPolicy {
    match policy.and_then(|p| p.name.as_ref().map(|n| (n, p.maximum_retry_count))) {
        Some((RestartPolicyNameEnum::ALWAYS, _)) => RestartPolicy::Always,
        Some((RestartPolicyNameEnum::UNLESS_STOPPED, _)) => RestartPolicy::UnlessStopped,
        Some((RestartPolicyNameEnum::ON_FAILURE, retries)) => RestartPolicy::OnFailure {
            max_retries: retries.filter(|r| *r > 0),
        },
        _ => RestartPolicy::No,
    }
}

fn healthcheck_to_docker(health: &HealthcheckSpec) -> HealthConfig {
    HealthConfig {
        test: Some(health.test.clone()),
        interval: health.interval_ns,
        timeout: health.timeout_ns,
        retries: health.retries,
        start_period: health.start_period_ns,
        ..Default::default()
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .port_bindings
        .keys()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> = spec
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| bollard::models::PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.clone(),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    let host_config = HostConfig {
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        restart_policy: Some(restart_policy_to_docker(&spec.restart_policy)),
        memory: spec.resources.memory_bytes,
        nano_cpus: spec.resources.nano_cpus,
        network_mode: spec.network_mode.clone(),
        privileged: spec.privileged.then_some(true),
        cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
        extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
        ..Default::default()
    };

    let networking_config = (!spec.endpoints.is_empty()).then(|| NetworkingConfig {
        endpoints_config: spec
            .endpoints
            .iter()
            .map(|(name, endpoint)| (name.clone(), endpoint_settings(endpoint)))
            .collect(),
    });

    let volumes: HashMap<String, HashMap<(), ()>> = spec
        .volumes
        .iter()
        .map(|target| (target.clone(), HashMap::new()))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        entrypoint: spec.entrypoint.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        labels: Some(to_hash_map(&spec.labels)),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        volumes: (!volumes.is_empty()).then_some(volumes),
        healthcheck: spec.healthcheck.as_ref().map(healthcheck_to_docker),
        hostname: spec.hostname.clone(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        tty: spec.tty.then_some(true),
        open_stdin: spec.stdin_open.then_some(true),
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}

fn parse_state(status: Option<String>) -> ContainerState {
    status
        .map(|s| ContainerState::parse(&s))
        .unwrap_or(ContainerState::Unknown)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert("label".to_string(), filter.labels.clone());
        }
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        if let Some(id) = &filter.id {
            filters.insert("id".to_string(), vec![id.clone()]);
        }

        let options = ListContainersOptions {
            all: filter.all,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                image_id: c.image_id.unwrap_or_default(),
                state: parse_state(c.state),
                status_text: c.status.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(&format!("inspect container {}", id), e))?;

        let config = inspect.config.unwrap_or_default();
        let host = inspect.host_config.unwrap_or_default();
        let state = inspect.state.unwrap_or_default();

        let container_state = if state.running == Some(true) {
            ContainerState::Running
        } else {
            parse_state(state.status.map(|s| format!("{:?}", s)))
        };

        let binds = host.binds.clone().unwrap_or_default();
        let bind_targets: Vec<&str> = binds
            .iter()
            .filter_map(|b| b.split(':').nth(1))
            .collect();
        let volumes = config
            .volumes
            .as_ref()
            .map(|v| {
                v.keys()
                    .filter(|target| !bind_targets.contains(&target.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let port_bindings = host
            .port_bindings
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: non_empty(b.host_ip),
                        host_port: non_empty(b.host_port),
                    })
                    .collect();
                (port, bindings)
            })
            .collect();

        let healthcheck = config.healthcheck.as_ref().and_then(|h| {
            h.test.as_ref().map(|test| HealthcheckSpec {
                test: test.clone(),
                interval_ns: h.interval,
                timeout_ns: h.timeout,
                retries: h.retries,
                start_period_ns: h.start_period,
            })
        });

        let spec = ContainerSpec {
            name: inspect
                .name
                .clone()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.clone().unwrap_or_default(),
            command: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            env: config.env.clone().unwrap_or_default(),
            labels: config.labels.clone().unwrap_or_default().into_iter().collect(),
            port_bindings,
            binds,
            volumes,
            restart_policy: restart_policy_from_docker(host.restart_policy.as_ref()),
            resources: ResourceLimits {
                memory_bytes: host.memory.filter(|m| *m > 0),
                nano_cpus: host.nano_cpus.filter(|n| *n > 0),
            },
            network_mode: non_empty(host.network_mode.clone()),
            endpoints: BTreeMap::new(),
            healthcheck,
            hostname: non_empty(config.hostname.clone()),
            working_dir: non_empty(config.working_dir.clone()),
            user: non_empty(config.user.clone()),
            privileged: host.privileged.unwrap_or(false),
            cap_add: host.cap_add.clone().unwrap_or_default(),
            extra_hosts: host.extra_hosts.clone().unwrap_or_default(),
            tty: config.tty.unwrap_or(false),
            stdin_open: config.open_stdin.unwrap_or(false),
        };

        let networks = inspect
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .iter()
            .map(|(name, settings)| (name.clone(), endpoint_spec(settings)))
            .collect();

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: spec.name.clone(),
            image_id: inspect.image.unwrap_or_default(),
            state: container_state,
            exit_code: state.exit_code,
            spec,
            networks,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), build_config(spec))
            .await
            .map_err(|e| map_error(&format!("create container {}", spec.name), e))?;
        debug!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(&format!("start container {}", id), e))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| map_error(&format!("stop container {}", id), e))
    }

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        self.docker
            .restart_container(id, Some(RestartContainerOptions { t: timeout_secs as isize }))
            .await
            .map_err(|e| map_error(&format!("restart container {}", id), e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_error(&format!("remove container {}", id), e))
    }

    async fn connect_network(&self, network: &str, container_id: &str, endpoint: &EndpointSpec) -> Result<(), EngineError> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: endpoint_settings(endpoint),
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| map_error(&format!("connect {} to {}", container_id, network), e))
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogLine>, EngineError> {
        let request = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            since: options.since.unwrap_or(0),
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(request));
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            let (stream_kind, message) = match item.map_err(|e| map_error(&format!("logs of {}", id), e))? {
                LogOutput::StdErr { message } => (LogStream::Stderr, message),
                LogOutput::StdOut { message } | LogOutput::Console { message } => (LogStream::Stdout, message),
                LogOutput::StdIn { .. } => continue,
            };
            lines.push(LogLine {
                stream: stream_kind,
                message: String::from_utf8_lossy(&message).trim_end_matches('\n').to_string(),
            });
        }
        Ok(lines)
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, EngineError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(result) => result.map_err(|e| map_error(&format!("stats of {}", id), e))?,
            None => return Err(EngineError::Request(format!("no stats returned for {}", id))),
        };

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats
            .cpu_stats
            .online_cpus
            .or_else(|| {
                stats
                    .cpu_stats
                    .cpu_usage
                    .percpu_usage
                    .as_ref()
                    .map(|p| p.len() as u64)
            })
            .unwrap_or(1)
            .max(1);
        let cpu_percent = if cpu_delta > 0.0 && system_delta > 0.0 {
            cpu_delta / system_delta * online_cpus as f64 * 100.0
        } else {
            0.0
        };

        Ok(ContainerStats {
            cpu_percent,
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        })
    }

    async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<NetworkSummary>, EngineError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert("label".to_string(), filter.labels.clone());
        }
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| map_error("list networks", e))?;

        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver,
                labels: n.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let ipam = Ipam {
            config: (!spec.ipam.is_empty()).then(|| {
                spec.ipam
                    .iter()
                    .map(|pool| IpamConfig {
                        subnet: pool.subnet.clone(),
                        gateway: pool.gateway.clone(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        };

        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: spec.driver.clone().unwrap_or_else(|| "bridge".to_string()),
            internal: spec.internal,
            attachable: spec.attachable,
            enable_ipv6: spec.enable_ipv6,
            ipam,
            options: to_hash_map(&spec.options),
            labels: to_hash_map(&spec.labels),
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map_err(|e| map_error(&format!("create network {}", spec.name), e))?;
        info!("Created network {}", spec.name);
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, name_or_id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(name_or_id)
            .await
            .map_err(|e| map_error(&format!("remove network {}", name_or_id), e))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        info!("Pulling image: {}", reference);
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull {}: {}", reference, status);
                    }
                }
                Err(e) => return Err(map_error(&format!("pull {}", reference), e)),
            }
        }
        Ok(())
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(image.id),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(map_error(&format!("inspect image {}", reference), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = |code| bollard::errors::Error::DockerResponseServerError {
            status_code: code,
            message: "boom".to_string(),
        };
        assert!(map_error("x", err(404)).is_not_found());
        assert!(map_error("x", err(409)).is_conflict());
        assert!(matches!(map_error("x", err(304)), EngineError::NotModified(_)));
        assert!(matches!(map_error("x", err(500)), EngineError::Request(_)));
    }

    #[test]
    fn test_restart_policy_mapping_roundtrip() {
        for policy in [
            RestartPolicy::No,
            RestartPolicy::Always,
            RestartPolicy::UnlessStopped,
            RestartPolicy::OnFailure { max_retries: Some(5) },
        ] {
            let docker = restart_policy_to_docker(&policy);
            assert_eq!(restart_policy_from_docker(Some(&docker)), policy);
        }
    }

    #[test]
    fn test_build_config_exposes_bound_ports() {
        let mut spec = ContainerSpec {
            name: "media_web".to_string(),
            image: "nginx:1.25".to_string(),
            network_mode: Some("media_default".to_string()),
            ..Default::default()
        };
        spec.port_bindings.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: None,
                host_port: Some("8080".to_string()),
            }],
        );
        spec.endpoints.insert(
            "media_default".to_string(),
            EndpointSpec {
                aliases: vec!["web".to_string()],
                ..Default::default()
            },
        );

        let config = build_config(&spec);
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("media_default"));
        let endpoints = config.networking_config.unwrap().endpoints_config;
        assert_eq!(
            endpoints["media_default"].aliases.as_deref(),
            Some(&["web".to_string()][..])
        );
    }
}
