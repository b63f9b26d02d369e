//! Service configuration types.
//!
//! `ConductorConfig` represents the top-level `conductor.toml`. All fields
//! have defaults so an empty file (or no file) yields a working single-node
//! service on the memory backend. A handful of fields can be overridden by
//! `CONDUCTOR_*` environment variables at startup.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration for the Conductor service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub limits: RequestLimits,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub backend: BackendKind,
    /// Enables leader election and the durable lease (requires the sqlite
    /// backend).
    #[serde(default)]
    pub distributed: bool,
    /// Stable id for this instance; generated at startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookRouteConfig>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ConductorConfig {
    /// Apply `CONDUCTOR_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup (tests inject a map here).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup("CONDUCTOR_LISTEN_SOCKET") {
            self.listener.socket = Some(PathBuf::from(socket));
        }
        if let Some(addr) = lookup("CONDUCTOR_TCP_ADDR") {
            self.listener.tcp_addr = Some(addr);
        }
        if let Some(pid_file) = lookup("CONDUCTOR_PID_FILE") {
            self.server.pid_file = Some(PathBuf::from(pid_file));
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Socket/TCP listener settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Local (Unix) socket path. None disables the local listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
    /// TCP bind address, e.g. `"127.0.0.1:7310"`. None disables TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_addr: Option<String>,
    /// TLS certificate/key paths (both required to enable TLS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require credentials on protected routes.
    #[serde(default = "default_true")]
    pub require_auth: bool,
    /// Skip auth for requests arriving on the local socket.
    #[serde(default = "default_true")]
    pub allow_local_bypass: bool,
    /// A statically configured bearer token accepted alongside API keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            allow_local_bypass: true,
            bearer_token: None,
        }
    }
}

/// Runner/admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Maximum concurrently executing runs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Bounded admission queue size. None means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Per-run recent-event ring size (Last-Event-ID replay window).
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Per-subscriber buffer size; older entries are dropped when full.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            queue_capacity: None,
            event_buffer: default_event_buffer(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Per-identity request rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst_size: u32,
    /// Buckets idle longer than this are swept.
    #[serde(default = "default_bucket_max_age")]
    pub bucket_max_age_secs: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst_size: default_burst(),
            bucket_max_age_secs: default_bucket_max_age(),
        }
    }
}

/// Server lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// How long to wait for in-flight runs during shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// How long the HTTP server gets to finish open requests.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            pid_file: None,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-memory; persists nothing across restarts.
    Memory,
    /// Durable SQLite.
    #[default]
    Sqlite,
}

/// A configured cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Unique schedule name (keys `ScheduleState`).
    pub name: String,
    /// Cron expression (5 or 6 fields).
    pub cron: String,
    /// IANA zone name or fixed offset. Only "UTC" and fixed offsets
    /// (`+HH:MM`) are evaluated; other names fall back to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Workflow path or remote reference to submit at fire time.
    pub workflow: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Signature scheme of a configured webhook route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Generic,
    Github,
    Slack,
}

/// A configured webhook ingress route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRouteConfig {
    /// Path suffix under `/webhooks/`.
    pub path: String,
    pub source: WebhookSource,
    /// Workflow path or remote reference to submit on a verified event.
    pub workflow: String,
    /// Event allow-list; empty accepts all events.
    #[serde(default)]
    pub events: Vec<String>,
    /// Shared secret for signature verification.
    pub secret: String,
    /// Input name -> JSONPath-like expression (`$.a.b.c`) or literal.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_mapping: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    8
}

fn default_event_buffer() -> usize {
    1024
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_rps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    20
}

fn default_bucket_max_age() -> u64 {
    600
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_yields_defaults() {
        let config: ConductorConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.max_parallel, 8);
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert!(config.auth.require_auth);
        assert!(config.auth.allow_local_bypass);
        assert!(!config.distributed);
        assert_eq!(config.server.drain_timeout_secs, 30);
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn test_full_config_parse() {
        let toml_str = r#"
distributed = true
backend = "sqlite"

[listener]
tcp_addr = "127.0.0.1:7310"
socket = "/tmp/conductor.sock"

[auth]
require_auth = true
allow_local_bypass = false

[runner]
max_parallel = 4
queue_capacity = 100

[limits]
requests_per_second = 5.0
burst_size = 10

[[schedules]]
name = "nightly"
cron = "0 0 3 * * *"
workflow = "workflows/nightly.yaml"

[[webhooks]]
path = "github"
source = "github"
workflow = "workflows/ci.yaml"
events = ["push", "pull_request"]
secret = "hunter2"

[webhooks.input_mapping]
branch = "$.ref"
repo = "$.repository.full_name"

[[endpoints]]
name = "deploy-prod"
workflow = "workflows/deploy.yaml"
scopes = ["deploy-*"]
rate_limit = "10/hour"
"#;
        let config: ConductorConfig = toml::from_str(toml_str).unwrap();
        assert!(config.distributed);
        assert_eq!(config.runner.max_parallel, 4);
        assert_eq!(config.runner.queue_capacity, Some(100));
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].cron, "0 0 3 * * *");
        assert!(config.schedules[0].enabled);
        assert_eq!(config.webhooks[0].source, WebhookSource::Github);
        assert_eq!(config.webhooks[0].input_mapping["branch"], "$.ref");
        assert_eq!(config.endpoints[0].name, "deploy-prod");
        assert!(!config.auth.allow_local_bypass);
    }

    #[test]
    fn test_env_overrides_applied() {
        let mut config = ConductorConfig::default();
        let env = HashMap::from([
            (
                "CONDUCTOR_LISTEN_SOCKET".to_string(),
                "/run/conductor.sock".to_string(),
            ),
            ("CONDUCTOR_TCP_ADDR".to_string(), "0.0.0.0:9000".to_string()),
            (
                "CONDUCTOR_PID_FILE".to_string(),
                "/run/conductor.pid".to_string(),
            ),
        ]);
        config.apply_overrides_from(|name| env.get(name).cloned());
        assert_eq!(
            config.listener.socket,
            Some(PathBuf::from("/run/conductor.sock"))
        );
        assert_eq!(config.listener.tcp_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(
            config.server.pid_file,
            Some(PathBuf::from("/run/conductor.pid"))
        );
    }

    #[test]
    fn test_env_overrides_absent_leave_config_untouched() {
        let mut config = ConductorConfig::default();
        config.apply_overrides_from(|_| None);
        assert!(config.listener.socket.is_none());
        assert!(config.listener.tcp_addr.is_none());
        assert!(config.server.pid_file.is_none());
    }
}
