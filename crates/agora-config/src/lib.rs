// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Hub configuration loaded from YAML.
//!
//! Configuration is YAML (never TOML).  Layers are **deep-merged** — you can
//! override only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/agora/config.yaml`
//! 2. `~/.config/agora/config.yaml`
//! 3. `.agora/config.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! Option names on the YAML surface are the wire-protocol's camelCase names
//! (`broadcastInterval`, `agentTTL`, …); durations are plain seconds.
//!
//! ```rust
//! use agora_config::HubConfig;
//!
//! let config = agora_config::load(None).unwrap();
//! assert_eq!(config.network.port, 9090);
//! assert!(config.discovery.enabled);
//! assert_eq!(config.messaging.message_history, 1000);
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use agora_proto::PatternKind;

fn default_true() -> bool {
    true
}

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub agent: AgentIdentityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP + WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind host. Default `localhost` — the hub is a local endpoint.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Soft per-request timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Peer hub WebSocket URLs dialed at startup, e.g. `ws://host:9090/ws`.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_port() -> u16 {
    9090
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_request_timeout() -> u64 {
    30
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_connections: default_max_connections(),
            request_timeout: default_request_timeout(),
            peers: Vec::new(),
        }
    }
}

/// Periodic discovery broadcast + registry TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between host descriptor broadcasts.
    #[serde(rename = "broadcastInterval", default = "default_broadcast_interval")]
    pub broadcast_interval: u64,
    /// Seconds of silence after which an agent record expires.
    #[serde(rename = "agentTTL", default = "default_agent_ttl")]
    pub agent_ttl: u64,
}

fn default_broadcast_interval() -> u64 {
    30
}
fn default_agent_ttl() -> u64 {
    120
}

impl DiscoveryConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval)
    }

    pub fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_ttl)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broadcast_interval: default_broadcast_interval(),
            agent_ttl: default_agent_ttl(),
        }
    }
}

/// Task engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationConfig {
    #[serde(default)]
    pub default_pattern: PatternKind,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Seconds before a non-terminal task expires.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default = "default_max_agents_per_task")]
    pub max_agents_per_task: usize,
    /// Peer-to-peer quorum; `null` means all invitees must respond.
    #[serde(default)]
    pub quorum: Option<usize>,
    /// Seconds a terminal task is retained before it is dropped.
    #[serde(default = "default_task_retention")]
    pub task_retention: u64,
}

fn default_consensus_threshold() -> f64 {
    0.6
}
fn default_task_timeout() -> u64 {
    300
}
fn default_max_agents_per_task() -> usize {
    10
}
fn default_task_retention() -> u64 {
    600
}

impl CoordinationConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention)
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_pattern: PatternKind::PeerToPeer,
            consensus_threshold: default_consensus_threshold(),
            task_timeout: default_task_timeout(),
            max_agents_per_task: default_max_agents_per_task(),
            quorum: None,
            task_retention: default_task_retention(),
        }
    }
}

/// Message validation, history and backpressure bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingConfig {
    #[serde(default = "default_true")]
    pub validate_schema: bool,
    /// Ring-buffer capacity for the diagnostic message history.
    #[serde(default = "default_message_history")]
    pub message_history: usize,
    /// Bound of each connection's outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_message_history() -> usize {
    1000
}
fn default_outbound_queue() -> usize {
    256
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            validate_schema: true,
            message_history: default_message_history(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cors_origin")]
    pub origin: String,
}

fn default_cors_origin() -> String {
    "*".to_string()
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origin: default_cors_origin(),
        }
    }
}

/// Identity advertised on the agent card and in discovery broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentityConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_agent_description")]
    pub description: String,
    /// Defaults to the crate version when absent.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_agent_provider")]
    pub provider: String,
}

fn default_agent_name() -> String {
    "agora".to_string()
}
fn default_agent_description() -> String {
    "Local coordination hub for heterogeneous AI agents".to_string()
}
fn default_agent_provider() -> String {
    "agora".to_string()
}

impl Default for AgentIdentityConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            description: default_agent_description(),
            version: None,
            provider: default_agent_provider(),
        }
    }
}

/// Optional shared-secret auth for the JSON-RPC and WebSocket surfaces.
///
/// When `token_file` is unset the hub is open — the intended deployment is a
/// loopback bind on a developer machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// YAML file storing the SHA-256 hash of the bearer token.
    pub token_file: Option<PathBuf>,
}

// ── Loader ────────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/agora/config.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/agora/config.yaml"));
    }
    paths.push(PathBuf::from(".agora/config.yaml"));
    paths
}

pub fn load(extra: Option<&Path>) -> anyhow::Result<HubConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_file(&mut merged, &path)?;
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_file(&mut merged, p)?;
    }

    let config: HubConfig = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        HubConfig::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };
    Ok(config)
}

fn merge_file(dst: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(dst, layer);
    Ok(())
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
