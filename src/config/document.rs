//! On-disk TOML schema.
//!
//! The config file uses snake_case keys (`auth_type`, `jumper_ids`, ...) while
//! the API model is camelCase, so the file gets its own serde shapes with
//! conversions in both directions. Runtime-only fields (tunnel latency) have
//! no column here and are dropped on save.

use serde::{Deserialize, Serialize};

use super::Config;
use crate::model::{Jumper, Tunnel};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub version: i64,
    pub jumpers: Vec<JumperRecord>,
    pub tunnels: Vec<TunnelRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JumperRecord {
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelRecord {
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
}

impl From<&Jumper> for JumperRecord {
    fn from(jumper: &Jumper) -> Self {
        JumperRecord {
            id: jumper.id,
            name: jumper.name.clone(),
            host: jumper.host.clone(),
            port: jumper.port,
            user: jumper.user.clone(),
            auth_type: jumper.auth_type.clone(),
            key_path: jumper.key_path.clone(),
            agent_socket_path: jumper.agent_socket_path.clone(),
            password: jumper.password.clone(),
            bypass_host_verification: jumper.bypass_host_verification,
            keep_alive_interval_ms: jumper.keep_alive_interval_ms,
            timeout_ms: jumper.timeout_ms,
            host_key_algorithms: jumper.host_key_algorithms.clone(),
            notes: jumper.notes.clone(),
        }
    }
}

impl From<JumperRecord> for Jumper {
    fn from(record: JumperRecord) -> Self {
        Jumper {
            id: record.id,
            name: record.name,
            host: record.host,
            port: record.port,
            user: record.user,
            auth_type: record.auth_type,
            key_path: record.key_path,
            agent_socket_path: record.agent_socket_path,
            password: record.password,
            bypass_host_verification: record.bypass_host_verification,
            keep_alive_interval_ms: record.keep_alive_interval_ms,
            timeout_ms: record.timeout_ms,
            host_key_algorithms: record.host_key_algorithms,
            notes: record.notes,
        }
    }
}

impl From<&Tunnel> for TunnelRecord {
    fn from(tunnel: &Tunnel) -> Self {
        TunnelRecord {
            id: tunnel.id,
            name: tunnel.name.clone(),
            mode: tunnel.mode.clone(),
            jumper_ids: tunnel.jumper_ids.clone(),
            local_host: tunnel.local_host.clone(),
            local_port: tunnel.local_port,
            remote_host: tunnel.remote_host.clone(),
            remote_port: tunnel.remote_port,
            auto_start: tunnel.auto_start,
            status: tunnel.status.clone(),
            last_error: tunnel.last_error.clone(),
            description: tunnel.description.clone(),
        }
    }
}

impl From<TunnelRecord> for Tunnel {
    fn from(record: TunnelRecord) -> Self {
        Tunnel {
            id: record.id,
            name: record.name,
            mode: record.mode,
            jumper_ids: record.jumper_ids,
            local_host: record.local_host,
            local_port: record.local_port,
            remote_host: record.remote_host,
            remote_port: record.remote_port,
            auto_start: record.auto_start,
            status: record.status,
            last_error: record.last_error,
            description: record.description,
            latency_ms: None,
        }
    }
}

impl From<&Config> for ConfigDocument {
    fn from(cfg: &Config) -> Self {
        ConfigDocument {
            version: cfg.version,
            jumpers: cfg.jumpers.iter().map(JumperRecord::from).collect(),
            tunnels: cfg.tunnels.iter().map(TunnelRecord::from).collect(),
        }
    }
}

impl From<ConfigDocument> for Config {
    fn from(doc: ConfigDocument) -> Self {
        Config {
            version: doc.version,
            jumpers: doc.jumpers.into_iter().map(Jumper::from).collect(),
            tunnels: doc.tunnels.into_iter().map(Tunnel::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_keys_are_snake_case() {
        let mut cfg = Config::new();
        cfg.jumpers.push(Jumper {
            id: 1,
            name: "hop".to_string(),
            auth_type: crate::model::AUTH_SSH_KEY.to_string(),
            keep_alive_interval_ms: 5000,
            ..Default::default()
        });
        let doc = ConfigDocument::from(&cfg);
        let toml = toml::to_string(&doc).expect("encode");
        assert!(toml.contains("[[jumpers]]"));
        assert!(toml.contains("auth_type"));
        assert!(toml.contains("keep_alive_interval_ms"));
        assert!(!toml.contains("authType"));
    }

    #[test]
    fn test_latency_never_persisted() {
        let mut cfg = Config::new();
        cfg.tunnels.push(Tunnel {
            id: 1,
            name: "t".to_string(),
            latency_ms: Some(42),
            ..Default::default()
        });
        let doc = ConfigDocument::from(&cfg);
        let toml = toml::to_string(&doc).expect("encode");
        assert!(!toml.contains("latency"));

        let back: Config = toml::from_str::<ConfigDocument>(&toml).expect("decode").into();
        assert_eq!(back.tunnels[0].latency_ms, None);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut cfg = Config::new();
        cfg.jumpers.push(Jumper {
            id: 3,
            name: "bastion".to_string(),
            host: "bastion.example.com".to_string(),
            port: 2222,
            user: "ops".to_string(),
            auth_type: crate::model::AUTH_PASSWORD.to_string(),
            password: "s3cret".to_string(),
            bypass_host_verification: true,
            keep_alive_interval_ms: 7000,
            timeout_ms: 4000,
            host_key_algorithms: "+ssh-rsa".to_string(),
            notes: "prod hop".to_string(),
            ..Default::default()
        });
        cfg.tunnels.push(Tunnel {
            id: 9,
            name: "db".to_string(),
            mode: crate::model::MODE_LOCAL.to_string(),
            jumper_ids: vec![3],
            local_host: "127.0.0.1".to_string(),
            local_port: 15432,
            remote_host: "db.internal".to_string(),
            remote_port: 5432,
            auto_start: true,
            status: crate::model::STATUS_STOPPED.to_string(),
            description: "postgres".to_string(),
            ..Default::default()
        });

        let encoded = toml::to_string(&ConfigDocument::from(&cfg)).expect("encode");
        let decoded: Config = toml::from_str::<ConfigDocument>(&encoded)
            .expect("decode")
            .into();
        assert_eq!(decoded, cfg);
    }
}
