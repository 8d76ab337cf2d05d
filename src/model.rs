//! API-facing data model.
//!
//! These are the JSON shapes presented to the UI layer, so field names are
//! camelCase. The TOML document persisted on disk uses snake_case keys and
//! lives in [`crate::config::document`]; conversions happen at the file
//! boundary.

use serde::{Deserialize, Serialize};

/// Authentication variant strings accepted in `Jumper::auth_type`.
pub const AUTH_PASSWORD: &str = "password";
pub const AUTH_SSH_KEY: &str = "ssh_key";
pub const AUTH_SSH_AGENT: &str = "ssh_agent";

/// Forwarding mode strings accepted in `Tunnel::mode`.
pub const MODE_LOCAL: &str = "local";
pub const MODE_REMOTE: &str = "remote";
pub const MODE_DYNAMIC: &str = "dynamic";

/// Persisted tunnel status strings.
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_ERROR: &str = "error";

/// An SSH endpoint traversed as one hop of a tunnel's chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Jumper {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i64,
    pub user: String,
    pub auth_type: String,
    pub key_path: String,
    pub agent_socket_path: String,
    pub password: String,
    pub bypass_host_verification: bool,
    pub keep_alive_interval_ms: i64,
    pub timeout_ms: i64,
    pub host_key_algorithms: String,
    pub notes: String,
}

/// A forwarding rule. `latency_ms` is runtime-only and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    pub mode: String,
    pub jumper_ids: Vec<i64>,
    pub local_host: String,
    pub local_port: i64,
    pub remote_host: String,
    pub remote_port: i64,
    pub auto_start: bool,
    pub status: String,
    pub last_error: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

/// Full frontend state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub jumpers: Vec<Jumper>,
    pub tunnels: Vec<Tunnel>,
}

/// Create/update input for jumpers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JumperPayload {
    pub name: String,
    pub host: String,
    pub port: i64,
    pub user: String,
    pub auth_type: String,
    pub key_path: String,
    pub agent_socket_path: String,
    pub password: String,
    pub bypass_host_verification: bool,
    pub keep_alive_interval_ms: i64,
    pub timeout_ms: i64,
    pub host_key_algorithms: String,
    pub notes: String,
}

/// Create/update input for tunnels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelPayload {
    pub name: String,
    pub mode: String,
    pub jumper_ids: Vec<i64>,
    pub local_host: String,
    pub local_port: i64,
    pub remote_host: String,
    pub remote_port: i64,
    pub auto_start: bool,
    pub status: String,
    pub description: String,
}

/// Returned by the tunnel connection test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConnectionTestResult {
    pub latency_ms: i64,
}

impl Jumper {
    /// Effective SSH port, defaulting to 22 for unset values.
    pub fn effective_port(&self) -> u16 {
        if self.port >= 1 && self.port <= 65535 {
            self.port as u16
        } else {
            22
        }
    }

    /// Build a jumper from a normalized payload, without assigning an id.
    pub fn from_payload(payload: &JumperPayload) -> Self {
        Jumper {
            id: 0,
            name: payload.name.clone(),
            host: payload.host.clone(),
            port: payload.port,
            user: payload.user.clone(),
            auth_type: payload.auth_type.clone(),
            key_path: payload.key_path.clone(),
            agent_socket_path: payload.agent_socket_path.clone(),
            password: payload.password.clone(),
            bypass_host_verification: payload.bypass_host_verification,
            keep_alive_interval_ms: payload.keep_alive_interval_ms,
            timeout_ms: payload.timeout_ms,
            host_key_algorithms: payload.host_key_algorithms.clone(),
            notes: payload.notes.clone(),
        }
    }
}

impl Tunnel {
    /// Local bind host, defaulting to loopback when unset.
    pub fn effective_local_host(&self) -> String {
        let host = self.local_host.trim();
        if host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        }
    }

    /// Remote bind host for remote-mode listeners, defaulting to loopback.
    pub fn effective_remote_host(&self) -> String {
        let host = self.remote_host.trim();
        if host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        }
    }
}

/// Dedup jumper ids preserving first occurrence, dropping non-positive ids.
pub fn normalize_jumper_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        if id <= 0 {
            continue;
        }
        if seen.insert(id) {
            out.push(id);
        }
    }
    out
}
