//! Jumper CRUD service.
//!
//! Validates, normalizes, assigns ids and persists jumper mutations. A
//! jumper referenced by any tunnel cannot be deleted.

use std::sync::Arc;

use tracing::info;

use crate::config::Storage;
use crate::error::{Error, Result};
use crate::forward::probe;
use crate::model::{self, Jumper, JumperPayload, normalize_jumper_ids};

pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL_MS: i64 = 5000;
pub(crate) const MIN_KEEP_ALIVE_INTERVAL_MS: i64 = 1000;
pub(crate) const MAX_KEEP_ALIVE_INTERVAL_MS: i64 = 120_000;

pub struct JumperService {
    storage: Arc<Storage>,
}

impl JumperService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn list(&self) -> Result<Vec<Jumper>> {
        Ok(self.storage.load()?.jumpers)
    }

    pub fn create(&self, payload: JumperPayload) -> Result<Jumper> {
        let payload = normalize_jumper_payload(payload);
        validate_jumper_payload(&payload)?;

        let mut created = Jumper::default();
        self.storage.update(|cfg| {
            created = Jumper {
                id: next_jumper_id(&cfg.jumpers),
                ..Jumper::from_payload(&payload)
            };
            cfg.jumpers.push(created.clone());
            Ok(())
        })?;

        info!(jumper_id = created.id, name = %created.name, "jumper created");
        Ok(created)
    }

    pub fn update(&self, id: i64, payload: JumperPayload) -> Result<Jumper> {
        if id <= 0 {
            return Err(Error::validation("invalid jumper id"));
        }
        let payload = normalize_jumper_payload(payload);
        validate_jumper_payload(&payload)?;

        let mut updated = Jumper::default();
        self.storage.update(|cfg| {
            let Some(existing) = cfg.jumpers.iter_mut().find(|j| j.id == id) else {
                return Err(Error::JumperNotFound);
            };
            updated = Jumper {
                id,
                ..Jumper::from_payload(&payload)
            };
            *existing = updated.clone();
            Ok(())
        })?;

        Ok(updated)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(Error::validation("invalid jumper id"));
        }

        self.storage.update(|cfg| {
            let referenced = cfg
                .tunnels
                .iter()
                .any(|tunnel| tunnel.jumper_ids.contains(&id));
            if referenced {
                return Err(Error::JumperInUse);
            }

            let before = cfg.jumpers.len();
            cfg.jumpers.retain(|j| j.id != id);
            if cfg.jumpers.len() == before {
                return Err(Error::JumperNotFound);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Dial the jumper once to verify handshake and auth.
    pub async fn test_connection(&self, payload: JumperPayload) -> Result<()> {
        let payload = normalize_jumper_payload(payload);
        validate_jumper_payload(&payload)?;
        probe::test_jumper_connection(&Jumper::from_payload(&payload)).await
    }
}

pub(crate) fn normalize_jumper_payload(mut payload: JumperPayload) -> JumperPayload {
    payload.name = payload.name.trim().to_string();
    payload.host = payload.host.trim().to_string();
    payload.user = payload.user.trim().to_string();
    payload.auth_type = payload.auth_type.trim().to_string();
    payload.key_path = payload.key_path.trim().to_string();
    payload.agent_socket_path = payload.agent_socket_path.trim().to_string();
    payload.host_key_algorithms = payload.host_key_algorithms.trim().to_string();
    payload.notes = payload.notes.trim().to_string();

    if payload.port <= 0 {
        payload.port = 22;
    }
    if payload.timeout_ms <= 0 {
        payload.timeout_ms = 5000;
    }
    if payload.keep_alive_interval_ms < 0 {
        payload.keep_alive_interval_ms = DEFAULT_KEEP_ALIVE_INTERVAL_MS;
    }
    if payload.auth_type.is_empty() {
        payload.auth_type = model::AUTH_SSH_KEY.to_string();
    }
    if payload.auth_type != model::AUTH_SSH_KEY {
        payload.key_path = String::new();
    }
    if payload.auth_type == model::AUTH_SSH_AGENT {
        payload.password = String::new();
    }

    payload
}

pub(crate) fn validate_jumper_payload(payload: &JumperPayload) -> Result<()> {
    if payload.name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    if payload.host.is_empty() {
        return Err(Error::validation("host is required"));
    }
    if payload.user.is_empty() {
        return Err(Error::validation("user is required"));
    }
    if payload.port < 1 || payload.port > 65535 {
        return Err(Error::validation("port must be between 1 and 65535"));
    }
    if payload.timeout_ms < 100 || payload.timeout_ms > 120_000 {
        return Err(Error::validation("timeoutMs must be between 100 and 120000"));
    }
    if payload.keep_alive_interval_ms > MAX_KEEP_ALIVE_INTERVAL_MS
        || (payload.keep_alive_interval_ms > 0
            && payload.keep_alive_interval_ms < MIN_KEEP_ALIVE_INTERVAL_MS)
    {
        return Err(Error::validation(format!(
            "keepAliveIntervalMs must be 0 (disable) or between {MIN_KEEP_ALIVE_INTERVAL_MS} and {MAX_KEEP_ALIVE_INTERVAL_MS}"
        )));
    }
    match payload.auth_type.as_str() {
        model::AUTH_PASSWORD => {
            if payload.password.trim().is_empty() {
                return Err(Error::validation("password auth requires password"));
            }
        }
        model::AUTH_SSH_KEY => {
            if payload.key_path.is_empty() {
                return Err(Error::validation("ssh_key auth requires keyPath"));
            }
        }
        model::AUTH_SSH_AGENT => {}
        other => {
            return Err(Error::validation(format!("unsupported authType: {other}")));
        }
    }
    Ok(())
}

pub(crate) fn next_jumper_id(jumpers: &[Jumper]) -> i64 {
    1 + jumpers.iter().map(|j| j.id).max().unwrap_or(0).max(0)
}

/// Resolve every id to a jumper, preserving chain order. Any missing id
/// fails the whole lookup.
pub(crate) fn collect_jumpers(jumpers: &[Jumper], ids: &[i64]) -> Result<Vec<Jumper>> {
    let ids = normalize_jumper_ids(ids);
    if ids.is_empty() {
        return Err(Error::JumperNotFound);
    }
    let mut collected = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(jumper) = jumpers.iter().find(|j| j.id == id) else {
            return Err(Error::JumperNotFound);
        };
        collected.push(jumper.clone());
    }
    Ok(collected)
}
