//! Tunnel CRUD service and runtime manager.
//!
//! One instance per process holds the mapping from tunnel id to live
//! [`LocalForward`] under a mutex; no I/O happens while the map lock is held.
//! Every started runtime gets a watcher task that reconciles persisted tunnel
//! status with the runtime's event stream and completion signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::config::Storage;
use crate::error::{Error, Result};
use crate::forward::{LocalForward, RuntimeEvent, probe};
use crate::model::{
    self, Jumper, JumperPayload, Tunnel, TunnelPayload, normalize_jumper_ids,
};

use super::jumper::{collect_jumpers, normalize_jumper_payload, validate_jumper_payload};

#[derive(Clone)]
pub struct TunnelService {
    storage: Arc<Storage>,
    runs: Arc<Mutex<HashMap<i64, Arc<LocalForward>>>>,
}

impl TunnelService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// List tunnels with runtime latencies attached to the running ones.
    pub async fn list(&self) -> Result<Vec<Tunnel>> {
        let mut tunnels = self.storage.load()?.tunnels;
        self.attach_runtime_latencies(&mut tunnels).await;
        Ok(tunnels)
    }

    pub fn create(&self, payload: TunnelPayload) -> Result<Tunnel> {
        let payload = normalize_tunnel_payload(payload);

        let mut created = Tunnel::default();
        self.storage.update(|cfg| {
            validate_tunnel_payload(&payload)?;
            collect_jumpers(&cfg.jumpers, &payload.jumper_ids)?;

            created = Tunnel {
                id: next_tunnel_id(&cfg.tunnels),
                last_error: String::new(),
                ..tunnel_from_payload(&payload)
            };
            cfg.tunnels.push(created.clone());
            Ok(())
        })?;

        info!(tunnel_id = created.id, name = %created.name, "tunnel created");
        Ok(created)
    }

    /// Update a tunnel's definition. Rejected while its runtime is active.
    pub async fn update(&self, id: i64, payload: TunnelPayload) -> Result<Tunnel> {
        if id <= 0 {
            return Err(Error::validation("invalid tunnel id"));
        }
        if self.is_running(id).await {
            return Err(Error::validation(
                "tunnel is running, stop it before editing",
            ));
        }

        let payload = normalize_tunnel_payload(payload);

        let mut updated = Tunnel::default();
        self.storage.update(|cfg| {
            validate_tunnel_payload(&payload)?;
            collect_jumpers(&cfg.jumpers, &payload.jumper_ids)?;

            let Some(existing) = cfg.tunnels.iter_mut().find(|t| t.id == id) else {
                return Err(Error::TunnelNotFound);
            };
            updated = Tunnel {
                id,
                last_error: existing.last_error.clone(),
                ..tunnel_from_payload(&payload)
            };
            *existing = updated.clone();
            Ok(())
        })?;

        Ok(updated)
    }

    /// Delete a tunnel, stopping its runtime first when one is tracked.
    pub async fn delete(&self, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(Error::validation("invalid tunnel id"));
        }
        self.stop_runtime(id).await;

        self.storage.update(|cfg| {
            let before = cfg.tunnels.len();
            cfg.tunnels.retain(|t| t.id != id);
            if cfg.tunnels.len() == before {
                return Err(Error::TunnelNotFound);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Flip a tunnel between running and stopped. Start failures are
    /// persisted as `status=error` with the trimmed reason and returned as a
    /// successful toggle carrying that state.
    pub async fn toggle(&self, id: i64) -> Result<Tunnel> {
        if id <= 0 {
            return Err(Error::validation("invalid tunnel id"));
        }

        let cfg = self.storage.load()?;
        let Some(tunnel) = cfg.tunnels.iter().find(|t| t.id == id).cloned() else {
            return Err(Error::TunnelNotFound);
        };

        if self.is_running(id).await || tunnel.status == model::STATUS_RUNNING {
            info!(tunnel_id = id, name = %tunnel.name, "tunnel toggle stop");
            self.stop_runtime(id).await;
            return self.update_status(id, model::STATUS_STOPPED, "");
        }

        let jumpers = match collect_jumpers(&cfg.jumpers, &tunnel.jumper_ids) {
            Ok(jumpers) => jumpers,
            Err(_) => {
                return self.update_status(id, model::STATUS_ERROR, "jumper not found");
            }
        };
        if !is_supported_mode(&tunnel.mode) {
            let msg = format!(
                "mode {} is not supported yet, only local, remote and dynamic forward are implemented",
                tunnel.mode
            );
            return self.update_status(id, model::STATUS_ERROR, &msg);
        }

        if let Err(err) = self.start_runtime(&tunnel, jumpers).await {
            return self.update_status(id, model::STATUS_ERROR, &err.reason());
        }

        info!(tunnel_id = id, name = %tunnel.name, "tunnel toggle start");
        match self.update_status(id, model::STATUS_RUNNING, "") {
            Ok(updated) => Ok(updated),
            Err(err) => {
                self.stop_runtime(id).await;
                Err(err)
            }
        }
    }

    /// Verify a tunnel definition end to end, optionally appending an inline
    /// jumper (not yet persisted) as the final hop.
    pub async fn test_connection(
        &self,
        payload: TunnelPayload,
        inline_jumper: Option<JumperPayload>,
    ) -> Result<Duration> {
        let mut payload = normalize_tunnel_payload(payload);
        if payload.status.is_empty() {
            payload.status = model::STATUS_STOPPED.to_string();
        }
        let require_jumpers = inline_jumper.is_none();
        validate_tunnel_payload_with_option(&payload, require_jumpers)?;

        let mut chain: Vec<Jumper> = Vec::with_capacity(payload.jumper_ids.len() + 1);

        if !payload.jumper_ids.is_empty() {
            let cfg = self.storage.load()?;
            chain.extend(collect_jumpers(&cfg.jumpers, &payload.jumper_ids)?);
        }

        if let Some(inline) = inline_jumper {
            let inline = normalize_jumper_payload(inline);
            validate_jumper_payload(&inline)
                .map_err(|err| Error::validation(format!("jumper: {err}")))?;
            chain.push(Jumper::from_payload(&inline));
        }

        let tunnel = tunnel_from_payload(&payload);
        probe::test_tunnel_connection(&tunnel, &chain).await
    }

    /// Start every tunnel flagged auto-start. Per-tunnel failures are
    /// persisted and do not abort the batch.
    pub async fn start_auto_start(&self) -> Result<()> {
        let cfg = self.storage.load()?;

        for tunnel in cfg.tunnels.iter().filter(|t| t.auto_start) {
            if !is_supported_mode(&tunnel.mode) {
                let msg = format!(
                    "mode {} is not supported yet, only local, remote and dynamic forward are implemented",
                    tunnel.mode
                );
                let _ = self.update_status(tunnel.id, model::STATUS_ERROR, &msg);
                continue;
            }

            let jumpers = match collect_jumpers(&cfg.jumpers, &tunnel.jumper_ids) {
                Ok(jumpers) => jumpers,
                Err(_) => {
                    let _ = self.update_status(tunnel.id, model::STATUS_ERROR, "jumper not found");
                    continue;
                }
            };

            if let Err(err) = self.start_runtime(tunnel, jumpers).await {
                let _ = self.update_status(tunnel.id, model::STATUS_ERROR, &err.reason());
                continue;
            }
            let _ = self.update_status(tunnel.id, model::STATUS_RUNNING, "");
        }
        Ok(())
    }

    /// Stop every tracked runtime and persist `status=stopped`.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = {
            let runs = self.runs.lock().await;
            runs.keys().copied().collect()
        };

        for id in ids {
            self.stop_runtime(id).await;
            let _ = self.update_status(id, model::STATUS_STOPPED, "");
        }
    }

    async fn start_runtime(&self, tunnel: &Tunnel, jumpers: Vec<Jumper>) -> Result<()> {
        {
            let runs = self.runs.lock().await;
            if runs.contains_key(&tunnel.id) {
                return Ok(());
            }
        }

        let run = Arc::new(LocalForward::new(tunnel.clone(), jumpers));
        run.start().await?;

        {
            let mut runs = self.runs.lock().await;
            if runs.contains_key(&tunnel.id) {
                // A racing toggle started another runtime first; keep that
                // one and discard ours.
                drop(runs);
                run.stop().await;
                return Ok(());
            }
            runs.insert(tunnel.id, run.clone());
        }
        info!(tunnel_id = tunnel.id, name = %tunnel.name, "tunnel runtime started");

        let service = self.clone();
        let id = tunnel.id;
        tokio::spawn(async move { service.watch_runtime(id, run).await });
        Ok(())
    }

    /// Reconcile persisted status with one runtime's lifecycle. Deregisters
    /// from the map only while the tracked instance is still this one, so a
    /// racing stop+start keeps its fresh runtime.
    async fn watch_runtime(&self, id: i64, run: Arc<LocalForward>) {
        let done = run.done();
        let mut events = run.take_events();

        loop {
            tokio::select! {
                _ = done.cancelled() => {
                    {
                        let mut runs = self.runs.lock().await;
                        let still_tracked =
                            matches!(runs.get(&id), Some(active) if Arc::ptr_eq(active, &run));
                        if !still_tracked {
                            return;
                        }
                        runs.remove(&id);
                    }

                    if let Some(err) = run.err().await {
                        warn!(tunnel_id = id, error = %err, "tunnel runtime exited with error");
                        let _ = self.update_status(id, model::STATUS_ERROR, &err);
                    } else {
                        info!(tunnel_id = id, "tunnel runtime exited");
                    }
                    return;
                }
                event = recv_event(&mut events) => {
                    let Some(event) = event else {
                        events = None;
                        continue;
                    };
                    if !self.is_tracked_instance(id, &run).await {
                        continue;
                    }
                    match event {
                        RuntimeEvent::Disconnected(reason) => {
                            warn!(tunnel_id = id, reason = %reason, "tunnel runtime disconnected");
                            let _ = self.update_status(id, model::STATUS_ERROR, &reason);
                        }
                        RuntimeEvent::Reconnected => {
                            info!(tunnel_id = id, "tunnel runtime reconnected");
                            let _ = self.update_status(id, model::STATUS_RUNNING, "");
                        }
                    }
                }
            }
        }
    }

    async fn stop_runtime(&self, id: i64) {
        let run = {
            let mut runs = self.runs.lock().await;
            runs.remove(&id)
        };
        if let Some(run) = run {
            run.stop().await;
        }
    }

    async fn is_running(&self, id: i64) -> bool {
        self.runs.lock().await.contains_key(&id)
    }

    async fn is_tracked_instance(&self, id: i64, run: &Arc<LocalForward>) -> bool {
        let runs = self.runs.lock().await;
        matches!(runs.get(&id), Some(active) if Arc::ptr_eq(active, run))
    }

    fn update_status(&self, id: i64, status: &str, last_error: &str) -> Result<Tunnel> {
        let mut updated = Tunnel::default();
        self.storage.update(|cfg| {
            let Some(tunnel) = cfg.tunnels.iter_mut().find(|t| t.id == id) else {
                return Err(Error::TunnelNotFound);
            };
            tunnel.status = status.to_string();
            tunnel.last_error = last_error.trim().to_string();
            updated = tunnel.clone();
            Ok(())
        })?;

        info!(
            tunnel_id = updated.id,
            name = %updated.name,
            status = %updated.status,
            error = %updated.last_error,
            "tunnel status updated"
        );
        Ok(updated)
    }

    async fn attach_runtime_latencies(&self, tunnels: &mut [Tunnel]) {
        if tunnels.is_empty() {
            return;
        }

        let runs: HashMap<i64, Arc<LocalForward>> = {
            let runs = self.runs.lock().await;
            runs.clone()
        };

        for tunnel in tunnels.iter_mut() {
            tunnel.latency_ms = None;
            if tunnel.status != model::STATUS_RUNNING {
                continue;
            }
            if let Some(run) = runs.get(&tunnel.id)
                && let Some(latency) = run.last_latency().await
                && !latency.is_zero()
            {
                tunnel.latency_ms = Some(latency.as_millis() as i64);
            }
        }
    }
}

async fn recv_event(
    events: &mut Option<mpsc::Receiver<RuntimeEvent>>,
) -> Option<RuntimeEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn is_supported_mode(mode: &str) -> bool {
    mode == model::MODE_LOCAL || mode == model::MODE_REMOTE || mode == model::MODE_DYNAMIC
}

fn tunnel_from_payload(payload: &TunnelPayload) -> Tunnel {
    Tunnel {
        id: 0,
        name: payload.name.clone(),
        mode: payload.mode.clone(),
        jumper_ids: payload.jumper_ids.clone(),
        local_host: payload.local_host.clone(),
        local_port: payload.local_port,
        remote_host: payload.remote_host.clone(),
        remote_port: payload.remote_port,
        auto_start: payload.auto_start,
        status: payload.status.clone(),
        last_error: String::new(),
        description: payload.description.clone(),
        latency_ms: None,
    }
}

pub(crate) fn normalize_tunnel_payload(mut payload: TunnelPayload) -> TunnelPayload {
    payload.name = payload.name.trim().to_string();
    payload.mode = payload.mode.trim().to_string();
    payload.local_host = payload.local_host.trim().to_string();
    payload.remote_host = payload.remote_host.trim().to_string();
    payload.description = payload.description.trim().to_string();
    payload.status = payload.status.trim().to_string();
    payload.jumper_ids = normalize_jumper_ids(&payload.jumper_ids);

    if payload.mode.is_empty() {
        payload.mode = model::MODE_LOCAL.to_string();
    }
    if payload.status.is_empty() {
        payload.status = model::STATUS_STOPPED.to_string();
    }
    if payload.local_host.is_empty() {
        payload.local_host = "127.0.0.1".to_string();
    }

    payload
}

pub(crate) fn validate_tunnel_payload(payload: &TunnelPayload) -> Result<()> {
    validate_tunnel_payload_with_option(payload, true)
}

pub(crate) fn validate_tunnel_payload_with_option(
    payload: &TunnelPayload,
    require_jumpers: bool,
) -> Result<()> {
    if payload.name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    if require_jumpers && payload.jumper_ids.is_empty() {
        return Err(Error::validation("jumperIds is required"));
    }
    if payload.local_host.is_empty() {
        return Err(Error::validation("localHost is required"));
    }
    if payload.local_port < 1 || payload.local_port > 65535 {
        return Err(Error::validation("localPort must be between 1 and 65535"));
    }
    if !is_supported_mode(&payload.mode) {
        return Err(Error::validation(format!(
            "unsupported mode: {}",
            payload.mode
        )));
    }
    if payload.mode != model::MODE_DYNAMIC {
        if payload.remote_host.is_empty() {
            return Err(Error::validation(
                "remoteHost is required for non-dynamic mode",
            ));
        }
        if payload.remote_port < 1 || payload.remote_port > 65535 {
            return Err(Error::validation("remotePort must be between 1 and 65535"));
        }
    }
    match payload.status.as_str() {
        model::STATUS_RUNNING | model::STATUS_STOPPED | model::STATUS_ERROR => {}
        other => {
            return Err(Error::validation(format!("unsupported status: {other}")));
        }
    }
    Ok(())
}

pub(crate) fn next_tunnel_id(tunnels: &[Tunnel]) -> i64 {
    1 + tunnels.iter().map(|t| t.id).max().unwrap_or(0).max(0)
}
