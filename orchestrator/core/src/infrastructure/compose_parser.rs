// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Compose Document Parser
//!
//! Turns raw compose YAML plus a layered environment into a
//! [`ParsedDocument`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external YAML → Domain objects
//! - **Anti-Corruption:** Every shape compose allows (map or list
//!   environment, list or map labels, short or long ports and volumes,
//!   string or list healthcheck tests) is normalized here, once.
//!
//! # Interpolation
//!
//! Every string leaf is scanned for `${NAME}`, `${NAME:-default}` and
//! `${NAME-default}`. Substitution repeats up to
//! [`MAX_INTERPOLATION_PASSES`] times so values may reference other
//! variables. A default may itself hold one level of `${OTHER}` tokens,
//! which resolve on the following pass. Unresolved tokens stay in the output
//! verbatim and are logged. `$$` is a literal `$`.

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::{debug, error, warn};

use crate::domain::compose::{
    NetworkDefinition, ParsedDocument, ServiceDefinition, ServiceNetwork, DEFAULT_NETWORK,
};
use crate::domain::engine::{HealthcheckSpec, IpamPool, ResourceLimits, RestartPolicy};
use crate::domain::stack::{StackError, StackId};

/// Upper bound on substitution passes per string.
pub const MAX_INTERPOLATION_PASSES: usize = 10;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)((?:[^}$]|\$\$|\$\{[^{}]*\}|\$)*))?\}")
        .expect("interpolation pattern is valid")
});

// ============================================================================
// Environment overlay
// ============================================================================

/// Variable lookup: the stack's `.env` overlay first, then the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentOverlay {
    values: BTreeMap<String, String>,
    skip_process_env: bool,
}

impl EnvironmentOverlay {
    /// Parse `.env` text. Malformed lines are logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for item in dotenvy::from_read_iter(text.as_bytes()) {
            match item {
                Ok((key, value)) => {
                    values.insert(key, value);
                }
                Err(e) => warn!("Skipping malformed .env entry: {}", e),
            }
        }
        Self {
            values,
            skip_process_env: false,
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            skip_process_env: false,
        }
    }

    /// Overlay only; the process environment is not consulted.
    pub fn isolated(mut self) -> Self {
        self.skip_process_env = true;
        self
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }
        if self.skip_process_env {
            return None;
        }
        std::env::var(name).ok()
    }

    /// Overlay entries only.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

/// Substitute variables in one string, recording names left unresolved.
pub fn interpolate_str(input: &str, env: &EnvironmentOverlay, unresolved: &mut BTreeSet<String>) -> String {
    if !input.contains('$') {
        return input.to_string();
    }

    let mut current = input.to_string();
    for _ in 0..MAX_INTERPOLATION_PASSES {
        let next = TOKEN_RE
            .replace_all(&current, |caps: &Captures| resolve_token(caps, env))
            .into_owned();
        if next == current {
            break;
        }
        current = next;
    }

    for caps in TOKEN_RE.captures_iter(&current) {
        if let Some(name) = caps.get(1) {
            unresolved.insert(name.as_str().to_string());
        }
    }

    current.replace("$$", "$")
}

fn resolve_token(caps: &Captures, env: &EnvironmentOverlay) -> String {
    let whole = &caps[0];
    let Some(name) = caps.get(1) else {
        // `$$` escape, unescaped after the last pass
        return whole.to_string();
    };
    let operator = caps.get(2).map(|m| m.as_str());
    let default = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    match (env.get(name.as_str()), operator) {
        (Some(value), Some(":-")) if value.is_empty() => default.to_string(),
        (Some(value), _) => value,
        (None, Some(_)) => default.to_string(),
        (None, None) => whole.to_string(),
    }
}

fn interpolate_value(value: &mut Value, env: &EnvironmentOverlay, unresolved: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => *s = interpolate_str(s, env, unresolved),
        Value::Sequence(items) => {
            for item in items.iter_mut() {
                interpolate_value(item, env, unresolved);
            }
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_value(v, env, unresolved);
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env, unresolved),
        _ => {}
    }
}

// ============================================================================
// YAML Schema (External Representation)
// ============================================================================

/// Any YAML scalar, kept as text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScalarYaml {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarYaml {
    fn into_string(self) -> String {
        match self {
            ScalarYaml::Str(s) => s,
            ScalarYaml::Int(i) => i.to_string(),
            ScalarYaml::Float(f) => f.to_string(),
            ScalarYaml::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    Str(String),
    List(Vec<ScalarYaml>),
}

impl StringOrList {
    fn into_command(self) -> Vec<String> {
        match self {
            StringOrList::Str(s) => split_command(&s),
            StringOrList::List(items) => items.into_iter().map(ScalarYaml::into_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KeyValuesYaml {
    List(Vec<ScalarYaml>),
    Map(BTreeMap<String, Option<ScalarYaml>>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortYaml {
    Short(ScalarYaml),
    Long(LongPortYaml),
}

#[derive(Debug, Clone, Deserialize)]
struct LongPortYaml {
    target: ScalarYaml,
    #[serde(default)]
    published: Option<ScalarYaml>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    host_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VolumeYaml {
    Short(String),
    Long(LongVolumeYaml),
}

#[derive(Debug, Clone, Deserialize)]
struct LongVolumeYaml {
    #[serde(default)]
    source: Option<String>,
    target: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ServiceNetworksYaml {
    List(Vec<String>),
    Map(Mapping),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ServiceNetworkYaml {
    aliases: Vec<String>,
    ipv4_address: Option<String>,
    ipv6_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HealthcheckYaml {
    test: Option<StringOrList>,
    interval: Option<String>,
    timeout: Option<String>,
    start_period: Option<String>,
    retries: Option<ScalarYaml>,
    disable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DeployYaml {
    replicas: Option<ScalarYaml>,
    resources: Option<ResourcesYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ResourcesYaml {
    limits: Option<LimitsYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LimitsYaml {
    cpus: Option<ScalarYaml>,
    memory: Option<ScalarYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ServiceYaml {
    image: Option<String>,
    build: Option<Value>,
    container_name: Option<String>,
    command: Option<StringOrList>,
    entrypoint: Option<StringOrList>,
    environment: Option<KeyValuesYaml>,
    env_file: Option<Value>,
    ports: Vec<PortYaml>,
    volumes: Vec<VolumeYaml>,
    networks: Option<ServiceNetworksYaml>,
    network_mode: Option<String>,
    restart: Option<String>,
    healthcheck: Option<HealthcheckYaml>,
    labels: Option<KeyValuesYaml>,
    deploy: Option<DeployYaml>,
    scale: Option<ScalarYaml>,
    mem_limit: Option<ScalarYaml>,
    cpus: Option<ScalarYaml>,
    hostname: Option<String>,
    working_dir: Option<String>,
    user: Option<ScalarYaml>,
    privileged: bool,
    cap_add: Vec<String>,
    extra_hosts: Option<KeyValuesYaml>,
    tty: bool,
    stdin_open: bool,
    depends_on: Option<DependsOnYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DependsOnYaml {
    List(Vec<String>),
    Map(Mapping),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExternalYaml {
    Flag(bool),
    Legacy {
        #[serde(default)]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct NetworkYaml {
    name: Option<String>,
    external: Option<ExternalYaml>,
    driver: Option<String>,
    driver_opts: BTreeMap<String, ScalarYaml>,
    labels: Option<KeyValuesYaml>,
    internal: bool,
    attachable: bool,
    enable_ipv6: bool,
    ipam: Option<IpamYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct IpamYaml {
    config: Vec<IpamPoolYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct IpamPoolYaml {
    subnet: Option<String>,
    gateway: Option<String>,
}

// ============================================================================
// Parser
// ============================================================================

pub struct ComposeParser;

impl ComposeParser {
    /// Parse and normalize a compose document for `stack_id`.
    ///
    /// Never panics on bad input; every malformed shape is a
    /// [`StackError::Parse`].
    pub fn parse(stack_id: &StackId, document: &str, env: &EnvironmentOverlay) -> Result<ParsedDocument, StackError> {
        let mut root: Value = serde_yaml::from_str(document)
            .map_err(|e| StackError::Parse(format!("invalid YAML: {}", e)))?;
        if !root.is_mapping() {
            return Err(StackError::Parse("top level must be a mapping".to_string()));
        }

        // container_name is checked on the raw text before the tree is rewritten
        let broken_container_names = find_unresolved_container_names(&root, env);

        let mut unresolved = BTreeSet::new();
        interpolate_value(&mut root, env, &mut unresolved);
        for name in &unresolved {
            warn!("Stack {}: variable '{}' is not set; leaving ${{{}}} in place", stack_id, name, name);
        }

        let services_value = root
            .get("services")
            .ok_or_else(|| StackError::Parse("missing 'services' section".to_string()))?;
        let services_map = match services_value {
            Value::Mapping(map) => map.clone(),
            Value::Null => Mapping::new(),
            _ => return Err(StackError::Parse("'services' must be a mapping".to_string())),
        };

        let networks = parse_networks(root.get("networks"))?;
        let volumes = parse_volume_keys(root.get("volumes"));

        let mut services = Vec::with_capacity(services_map.len());
        for (key, value) in services_map {
            let name = key
                .as_str()
                .ok_or_else(|| StackError::Parse("service names must be strings".to_string()))?
                .to_string();
            let raw: ServiceYaml = if value.is_null() {
                ServiceYaml::default()
            } else {
                serde_yaml::from_value(value)
                    .map_err(|e| StackError::Parse(format!("service '{}': {}", name, e)))?
            };
            let mut service = convert_service(&name, raw, env)?;

            if broken_container_names.contains(&name) {
                let derived = stack_id.container_name(&name, None);
                error!(
                    "Stack {}: container_name of service '{}' contains an unresolved variable; using '{}' instead",
                    stack_id, name, derived
                );
                service.container_name = Some(derived);
            }

            for network in &service.networks {
                if network.name != DEFAULT_NETWORK && !networks.iter().any(|n: &NetworkDefinition| n.key == network.name) {
                    return Err(StackError::Parse(format!(
                        "service '{}' refers to undefined network '{}'",
                        name, network.name
                    )));
                }
            }

            services.push(service);
        }

        debug!(
            "Parsed stack {}: {} services, {} networks, {} volumes",
            stack_id,
            services.len(),
            networks.len(),
            volumes.len()
        );

        Ok(ParsedDocument {
            services,
            networks,
            volumes,
            unresolved: unresolved.into_iter().collect(),
        })
    }
}

fn find_unresolved_container_names(root: &Value, env: &EnvironmentOverlay) -> BTreeSet<String> {
    let mut broken = BTreeSet::new();
    let Some(Value::Mapping(services)) = root.get("services") else {
        return broken;
    };
    for (key, value) in services {
        let (Some(name), Some(raw)) = (
            key.as_str(),
            value.get("container_name").and_then(Value::as_str),
        ) else {
            continue;
        };
        let mut unresolved = BTreeSet::new();
        interpolate_str(raw, env, &mut unresolved);
        if !unresolved.is_empty() {
            broken.insert(name.to_string());
        }
    }
    broken
}

fn convert_service(name: &str, raw: ServiceYaml, env: &EnvironmentOverlay) -> Result<ServiceDefinition, StackError> {
    let image = raw.image.filter(|i| !i.trim().is_empty());
    if image.is_none() {
        let reason = if raw.build.is_some() {
            "has no image; building images is not supported"
        } else {
            "has no image"
        };
        return Err(StackError::Parse(format!("service '{}' {}", name, reason)));
    }

    if raw.env_file.is_some() {
        warn!("Service '{}': env_file is ignored; use the stack .env overlay", name);
    }

    let restart_policy = match raw.restart.as_deref() {
        None => RestartPolicy::No,
        Some(value) => RestartPolicy::from_compose(value).ok_or_else(|| {
            StackError::Parse(format!("service '{}': unknown restart policy '{}'", name, value))
        })?,
    };

    let replicas = match raw
        .deploy
        .as_ref()
        .and_then(|d| d.replicas.clone())
        .or(raw.scale.clone())
    {
        None => 1,
        Some(value) => {
            let text = value.into_string();
            text.trim().parse::<u32>().map_err(|_| {
                StackError::Parse(format!("service '{}': invalid replica count '{}'", name, text))
            })?
        }
    };

    let mut container_name = raw.container_name;
    if container_name.is_some() && replicas > 1 {
        warn!("Service '{}': container_name ignored because replicas > 1", name);
        container_name = None;
    }

    let limits = raw
        .deploy
        .and_then(|d| d.resources)
        .and_then(|r| r.limits)
        .unwrap_or_default();
    let memory = limits.memory.or(raw.mem_limit).map(ScalarYaml::into_string);
    let cpus = limits.cpus.or(raw.cpus).map(ScalarYaml::into_string);
    let resources = ResourceLimits {
        memory_bytes: match memory {
            Some(m) => Some(parse_memory(&m).ok_or_else(|| {
                StackError::Parse(format!("service '{}': invalid memory limit '{}'", name, m))
            })?),
            None => None,
        },
        nano_cpus: match cpus {
            Some(c) => Some(parse_cpus(&c).ok_or_else(|| {
                StackError::Parse(format!("service '{}': invalid cpus value '{}'", name, c))
            })?),
            None => None,
        },
    };

    let healthcheck = match raw.healthcheck {
        Some(h) => Some(normalize_healthcheck(name, h)?),
        None => None,
    };

    Ok(ServiceDefinition {
        name: name.to_string(),
        image,
        container_name,
        command: raw.command.map(StringOrList::into_command),
        entrypoint: raw.entrypoint.map(StringOrList::into_command),
        environment: flatten_environment(raw.environment, env),
        ports: raw.ports.into_iter().map(render_port).collect(),
        volumes: raw.volumes.into_iter().map(render_volume).collect(),
        networks: convert_service_networks(name, raw.networks)?,
        network_mode: raw.network_mode,
        restart_policy,
        healthcheck,
        labels: normalize_labels(raw.labels),
        replicas,
        resources,
        hostname: raw.hostname,
        working_dir: raw.working_dir,
        user: raw.user.map(ScalarYaml::into_string),
        privileged: raw.privileged,
        cap_add: raw.cap_add,
        extra_hosts: render_extra_hosts(raw.extra_hosts),
        tty: raw.tty,
        stdin_open: raw.stdin_open,
        depends_on: match raw.depends_on {
            None => Vec::new(),
            Some(DependsOnYaml::List(list)) => list,
            Some(DependsOnYaml::Map(map)) => map
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
        },
    })
}

/// Labels in list (`key=value`) or map form, as one ordered map.
fn normalize_labels(raw: Option<KeyValuesYaml>) -> BTreeMap<String, String> {
    match raw {
        None => BTreeMap::new(),
        Some(KeyValuesYaml::List(items)) => items
            .into_iter()
            .map(ScalarYaml::into_string)
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.to_string()),
                None => (item.trim().to_string(), String::new()),
            })
            .collect(),
        Some(KeyValuesYaml::Map(map)) => map
            .into_iter()
            .map(|(k, v)| (k, v.map(ScalarYaml::into_string).unwrap_or_default()))
            .collect(),
    }
}

/// Environment in map or list form, flattened to `KEY=VALUE`. Entries without
/// a value are taken from the overlay, or dropped when it has none.
fn flatten_environment(raw: Option<KeyValuesYaml>, env: &EnvironmentOverlay) -> Vec<String> {
    let from_overlay = |key: &str| -> Option<String> {
        match env.get(key) {
            Some(value) => Some(format!("{}={}", key, value)),
            None => {
                debug!("Environment variable '{}' has no value and is not set; dropping it", key);
                None
            }
        }
    };

    match raw {
        None => Vec::new(),
        Some(KeyValuesYaml::List(items)) => items
            .into_iter()
            .map(ScalarYaml::into_string)
            .filter_map(|item| {
                if item.contains('=') {
                    Some(item)
                } else {
                    from_overlay(item.trim())
                }
            })
            .collect(),
        Some(KeyValuesYaml::Map(map)) => map
            .into_iter()
            .filter_map(|(key, value)| match value {
                Some(v) => Some(format!("{}={}", key, v.into_string())),
                None => from_overlay(&key),
            })
            .collect(),
    }
}

fn render_extra_hosts(raw: Option<KeyValuesYaml>) -> Vec<String> {
    match raw {
        None => Vec::new(),
        Some(KeyValuesYaml::List(items)) => items.into_iter().map(ScalarYaml::into_string).collect(),
        Some(KeyValuesYaml::Map(map)) => map
            .into_iter()
            .map(|(host, ip)| format!("{}:{}", host, ip.map(ScalarYaml::into_string).unwrap_or_default()))
            .collect(),
    }
}

/// Long-form ports rendered as `[host_ip:][published:]target[/protocol]`.
fn render_port(raw: PortYaml) -> String {
    match raw {
        PortYaml::Short(scalar) => scalar.into_string(),
        PortYaml::Long(long) => {
            let mut rendered = String::new();
            if let Some(ip) = long.host_ip.filter(|ip| !ip.is_empty()) {
                rendered.push_str(&ip);
                rendered.push(':');
            }
            if let Some(published) = long.published {
                rendered.push_str(&published.into_string());
                rendered.push(':');
            }
            rendered.push_str(&long.target.into_string());
            if let Some(protocol) = long.protocol.filter(|p| !p.is_empty()) {
                rendered.push('/');
                rendered.push_str(&protocol);
            }
            rendered
        }
    }
}

/// Long-form volumes rendered as `source:target[:ro]` (or bare `target`).
fn render_volume(raw: VolumeYaml) -> String {
    match raw {
        VolumeYaml::Short(s) => s,
        VolumeYaml::Long(long) => {
            let mut rendered = match long.source.filter(|s| !s.is_empty()) {
                Some(source) => format!("{}:{}", source, long.target),
                None => long.target,
            };
            if long.read_only {
                rendered.push_str(":ro");
            }
            rendered
        }
    }
}

fn convert_service_networks(service: &str, raw: Option<ServiceNetworksYaml>) -> Result<Vec<ServiceNetwork>, StackError> {
    match raw {
        None => Ok(Vec::new()),
        Some(ServiceNetworksYaml::List(names)) => Ok(names
            .into_iter()
            .map(|name| ServiceNetwork {
                name,
                ..Default::default()
            })
            .collect()),
        Some(ServiceNetworksYaml::Map(map)) => {
            let mut networks = Vec::with_capacity(map.len());
            for (key, value) in map {
                let name = key
                    .as_str()
                    .ok_or_else(|| StackError::Parse(format!("service '{}': network names must be strings", service)))?
                    .to_string();
                let settings: ServiceNetworkYaml = if value.is_null() {
                    ServiceNetworkYaml::default()
                } else {
                    serde_yaml::from_value(value).map_err(|e| {
                        StackError::Parse(format!("service '{}' network '{}': {}", service, name, e))
                    })?
                };
                networks.push(ServiceNetwork {
                    name,
                    aliases: settings.aliases,
                    ipv4_address: settings.ipv4_address,
                    ipv6_address: settings.ipv6_address,
                });
            }
            Ok(networks)
        }
    }
}

/// Healthcheck `test` in list form. A single string is split on whitespace;
/// a leading `CMD` is added when it does not start with a directive.
fn normalize_healthcheck(service: &str, raw: HealthcheckYaml) -> Result<HealthcheckSpec, StackError> {
    let duration = |field: &str, value: Option<String>| -> Result<Option<i64>, StackError> {
        match value {
            None => Ok(None),
            Some(text) => humantime::parse_duration(text.trim())
                .map(|d| Some(d.as_nanos() as i64))
                .map_err(|e| {
                    StackError::Parse(format!(
                        "service '{}': invalid healthcheck {} '{}': {}",
                        service, field, text, e
                    ))
                }),
        }
    };

    let test = if raw.disable {
        vec!["NONE".to_string()]
    } else {
        match raw.test {
            None => Vec::new(),
            Some(StringOrList::List(items)) => items.into_iter().map(ScalarYaml::into_string).collect(),
            Some(StringOrList::Str(command)) => {
                let mut tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();
                let has_directive = tokens
                    .first()
                    .map(|t| matches!(t.as_str(), "CMD" | "CMD-SHELL" | "NONE"))
                    .unwrap_or(false);
                if !has_directive && !tokens.is_empty() {
                    tokens.insert(0, "CMD".to_string());
                }
                tokens
            }
        }
    };

    let retries = match raw.retries {
        None => None,
        Some(value) => {
            let text = value.into_string();
            Some(text.trim().parse::<i64>().map_err(|_| {
                StackError::Parse(format!("service '{}': invalid healthcheck retries '{}'", service, text))
            })?)
        }
    };

    Ok(HealthcheckSpec {
        test,
        interval_ns: duration("interval", raw.interval)?,
        timeout_ns: duration("timeout", raw.timeout)?,
        retries,
        start_period_ns: duration("start_period", raw.start_period)?,
    })
}

fn parse_networks(raw: Option<&Value>) -> Result<Vec<NetworkDefinition>, StackError> {
    let map = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Mapping(map)) => map,
        Some(_) => return Err(StackError::Parse("'networks' must be a mapping".to_string())),
    };

    let mut networks = Vec::with_capacity(map.len());
    for (key, value) in map {
        let key = key
            .as_str()
            .ok_or_else(|| StackError::Parse("network names must be strings".to_string()))?
            .to_string();
        let raw: NetworkYaml = if value.is_null() {
            NetworkYaml::default()
        } else {
            serde_yaml::from_value(value.clone())
                .map_err(|e| StackError::Parse(format!("network '{}': {}", key, e)))?
        };

        let (external, legacy_name) = match raw.external {
            None | Some(ExternalYaml::Flag(false)) => (false, None),
            Some(ExternalYaml::Flag(true)) => (true, None),
            Some(ExternalYaml::Legacy { name }) => (true, name),
        };

        networks.push(NetworkDefinition {
            key,
            external,
            name: raw.name.or(legacy_name),
            driver: raw.driver,
            driver_opts: raw
                .driver_opts
                .into_iter()
                .map(|(k, v)| (k, v.into_string()))
                .collect(),
            labels: normalize_labels(raw.labels),
            internal: raw.internal,
            attachable: raw.attachable,
            enable_ipv6: raw.enable_ipv6,
            ipam: raw
                .ipam
                .map(|ipam| {
                    ipam.config
                        .into_iter()
                        .map(|pool| IpamPool {
                            subnet: pool.subnet,
                            gateway: pool.gateway,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        });
    }
    Ok(networks)
}

fn parse_volume_keys(raw: Option<&Value>) -> BTreeMap<String, bool> {
    let Some(Value::Mapping(map)) = raw else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let external = match value.get("external") {
                Some(Value::Bool(flag)) => *flag,
                Some(Value::Mapping(_)) => true,
                _ => false,
            };
            key.as_str().map(|k| (k.to_string(), external))
        })
        .collect()
}

/// `512m`, `1g`, `1.5G`, `1024k`, `100b`, `100mb` or plain bytes.
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').map(str::to_string).unwrap_or(value);
    let (number, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024f64),
        'm' => (&value[..value.len() - 1], 1024f64 * 1024.0),
        'g' => (&value[..value.len() - 1], 1024f64 * 1024.0 * 1024.0),
        c if c.is_ascii_digit() => (value.as_str(), 1f64),
        _ => return None,
    };
    let number: f64 = number.trim().parse().ok()?;
    if number < 0.0 {
        return None;
    }
    Some((number * multiplier) as i64)
}

/// Fractional CPUs to nano CPUs.
pub fn parse_cpus(value: &str) -> Option<i64> {
    let cpus: f64 = value.trim().parse().ok()?;
    if cpus <= 0.0 {
        return None;
    }
    Some((cpus * 1_000_000_000.0) as i64)
}

/// Split a command string on whitespace, honouring single and double quotes.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Best-effort `image:` line scan of raw document text. Tolerates comments
/// and quoting; references that still hold an unresolved variable after
/// interpolation are skipped.
pub fn scan_image_references(document: &str, env: &EnvironmentOverlay) -> Vec<String> {
    let mut references: Vec<String> = Vec::new();
    for line in document.lines() {
        let trimmed = line.trim_start();
        let trimmed = trimmed.strip_prefix("- ").unwrap_or(trimmed).trim_start();
        let Some(rest) = trimmed.strip_prefix("image:") else {
            continue;
        };

        let rest = rest.trim();
        let value = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => rest[1..].split(q).next().unwrap_or(""),
            _ => rest
                .split(" #")
                .next()
                .unwrap_or("")
                .split("\t#")
                .next()
                .unwrap_or(""),
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        let mut unresolved = BTreeSet::new();
        let resolved = interpolate_str(value, env, &mut unresolved);
        if !unresolved.is_empty() {
            debug!("Skipping image reference '{}' with unresolved variables", value);
            continue;
        }
        if !references.contains(&resolved) {
            references.push(resolved);
        }
    }
    references
}
