//! Programmatic API facade presented to the UI layer.
//!
//! One [`App`] per process wires the config store, the CRUD services, the
//! tunnel manager and the machine id together. Methods map one-to-one onto
//! the UI-facing operations.

use std::sync::Arc;

use tracing::info;

use crate::config::Storage;
use crate::device;
use crate::error::Result;
use crate::model::{
    Jumper, JumperPayload, State, Tunnel, TunnelConnectionTestResult, TunnelPayload,
};
use crate::service::{JumperService, TunnelService};
use crate::updater;

pub struct App {
    storage: Arc<Storage>,
    jumpers: JumperService,
    tunnels: TunnelService,
    updater: updater::Service,
    machine_id: String,
}

impl App {
    /// Build the app against the default config location.
    pub fn new() -> Result<Self> {
        let storage = Arc::new(Storage::open_default()?);
        Ok(Self::with_storage(storage))
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        Self {
            jumpers: JumperService::new(storage.clone()),
            tunnels: TunnelService::new(storage.clone()),
            updater: updater::Service::with_default_provider(),
            machine_id: device::machine_id(),
            storage,
        }
    }

    pub fn config_path(&self) -> &std::path::Path {
        self.storage.path()
    }

    /// Daemon startup: launch every auto-start tunnel. Per-tunnel failures
    /// are persisted, never fatal.
    pub async fn startup(&self) {
        info!("app startup");
        let _ = self.tunnels.start_auto_start().await;
    }

    /// Daemon shutdown: stop all runtimes and persist their stopped status.
    pub async fn shutdown(&self) {
        info!("app shutdown");
        self.tunnels.shutdown().await;
    }

    pub async fn get_state(&self) -> Result<State> {
        Ok(State {
            jumpers: self.jumpers.list()?,
            tunnels: self.tunnels.list().await?,
        })
    }

    pub fn list_jumpers(&self) -> Result<Vec<Jumper>> {
        self.jumpers.list()
    }

    pub fn create_jumper(&self, payload: JumperPayload) -> Result<Jumper> {
        self.jumpers.create(payload)
    }

    pub fn update_jumper(&self, id: i64, payload: JumperPayload) -> Result<Jumper> {
        self.jumpers.update(id, payload)
    }

    pub fn delete_jumper(&self, id: i64) -> Result<()> {
        self.jumpers.delete(id)
    }

    pub async fn test_jumper_connection(&self, payload: JumperPayload) -> Result<()> {
        self.jumpers.test_connection(payload).await
    }

    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>> {
        self.tunnels.list().await
    }

    pub fn create_tunnel(&self, payload: TunnelPayload) -> Result<Tunnel> {
        self.tunnels.create(payload)
    }

    pub async fn update_tunnel(&self, id: i64, payload: TunnelPayload) -> Result<Tunnel> {
        self.tunnels.update(id, payload).await
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<()> {
        self.tunnels.delete(id).await
    }

    pub async fn toggle_tunnel(&self, id: i64) -> Result<Tunnel> {
        self.tunnels.toggle(id).await
    }

    pub async fn test_tunnel_connection(
        &self,
        payload: TunnelPayload,
        inline_jumper: Option<JumperPayload>,
    ) -> Result<TunnelConnectionTestResult> {
        let latency = self.tunnels.test_connection(payload, inline_jumper).await?;
        Ok(TunnelConnectionTestResult {
            latency_ms: latency.as_millis() as i64,
        })
    }

    pub fn get_machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Poll the release feed for a newer version than the one running.
    pub async fn check_update(&self, current_version: &str) -> Result<updater::UpdateCheck> {
        self.updater.check(current_version).await
    }
}
