//! Per-tunnel forwarding runtime.
//!
//! A [`LocalForward`] owns one tunnel's execution: the SSH chain client, the
//! listener, the accept loop, one bridge pair per accepted connection, the
//! lifecycle monitor and (optionally) the keepalive probe task. The state
//! machine is `Starting -> Running -> Disconnected -> Reconnecting ->
//! Running | Failed | Stopped`; reconnection uses doubling backoff from
//! 500 ms capped at 60 s inside a 15 minute window measured from the loss.
//!
//! Nothing holds the runtime mutex across a suspension point: handles are
//! cloned out under the lock and all I/O happens after release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use russh::Channel;
use russh::client::Msg;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::forward::chain::{ChainClient, dial_ssh_chain};
use crate::forward::{probe, socks5};
use crate::model::{self, Jumper, Tunnel};

pub(crate) const INIT_RECONNECT_WAIT: Duration = Duration::from_millis(500);
pub(crate) const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(60);
pub(crate) const RECONNECT_WINDOW: Duration = Duration::from_secs(15 * 60);

const REMOTE_ACCEPT_RETRY: Duration = Duration::from_millis(200);
const CLIENT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 8;

/// Lifecycle events observed by the manager, emitted in causal order from the
/// monitor task.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Connection lost; carries the trimmed reason.
    Disconnected(String),
    /// A reconnect attempt succeeded and forwarding resumed.
    Reconnected,
}

#[derive(Default)]
struct RuntimeShared {
    client: Option<Arc<ChainClient>>,
    run_err: Option<String>,
    last_latency: Option<Duration>,
}

/// One tunnel's live runtime. At most one SSH client and one listener exist
/// at a time; `stop` is idempotent and joins every spawned task.
pub struct LocalForward {
    tunnel: Tunnel,
    jumpers: Vec<Jumper>,

    shared: Mutex<RuntimeShared>,
    started: AtomicBool,
    /// User stop intent. Cancelling also wakes backoff sleeps and probes.
    stop: CancellationToken,
    /// Serve-loop shutdown: child of `stop`, also cancelled when the
    /// reconnect window is exhausted.
    serve_stop: CancellationToken,
    /// Completion signal, cancelled when the serve loop exits.
    done: CancellationToken,
    events_tx: mpsc::Sender<RuntimeEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<RuntimeEvent>>>,
    forwarded_tx: mpsc::UnboundedSender<Channel<Msg>>,
    forwarded_rx: Mutex<Option<mpsc::UnboundedReceiver<Channel<Msg>>>>,
    tracker: TaskTracker,
    stop_done: tokio::sync::OnceCell<()>,
}

impl LocalForward {
    pub fn new(tunnel: Tunnel, jumpers: Vec<Jumper>) -> Self {
        let stop = CancellationToken::new();
        let serve_stop = stop.child_token();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        LocalForward {
            tunnel,
            jumpers,
            shared: Mutex::new(RuntimeShared::default()),
            started: AtomicBool::new(false),
            stop,
            serve_stop,
            done: CancellationToken::new(),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            forwarded_tx,
            forwarded_rx: Mutex::new(Some(forwarded_rx)),
            tracker: TaskTracker::new(),
            stop_done: tokio::sync::OnceCell::new(),
        }
    }

    pub fn tunnel_id(&self) -> i64 {
        self.tunnel.id
    }

    /// Completion signal: cancelled once the runtime's serve loop has exited.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Hand the event stream to the watcher. Yields `None` on second call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<RuntimeEvent>> {
        self.events_rx.lock().expect("events mutex poisoned").take()
    }

    /// First error of the current failure cascade, if any.
    pub async fn err(&self) -> Option<String> {
        self.shared.lock().await.run_err.clone()
    }

    /// Most recent successful keepalive round-trip.
    pub async fn last_latency(&self) -> Option<Duration> {
        self.shared.lock().await.last_latency
    }

    /// Run the start sequence: dial the chain, probe the mode's precondition,
    /// bind the listener, measure initial latency, then spawn the accept loop
    /// and the lifecycle monitor. Any failure before the spawn tears down
    /// whatever was opened and is returned synchronously; no event is emitted.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mode = probe::normalize_mode(&self.tunnel.mode).to_string();
        if mode != model::MODE_LOCAL && mode != model::MODE_REMOTE && mode != model::MODE_DYNAMIC {
            return Err(Error::validation(
                "only local, remote and dynamic modes are supported",
            ));
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            tunnel_id = self.tunnel.id,
            name = %self.tunnel.name,
            jumper_hops = self.jumpers.len(),
            keepalive_interval_ms = self.last_jumper().keep_alive_interval_ms,
            timeout_ms = self.last_jumper().timeout_ms,
            "tunnel forward start"
        );

        let forwarded_tx = (mode == model::MODE_REMOTE).then(|| self.forwarded_tx.clone());
        let client = match dial_ssh_chain(&self.jumpers, forwarded_tx).await {
            Ok(client) => Arc::new(client),
            Err(err) => {
                self.set_run_err(&err.reason()).await;
                error!(tunnel_id = self.tunnel.id, error = %err, "tunnel initial dial failed");
                return Err(err);
            }
        };

        let precondition = match mode.as_str() {
            model::MODE_LOCAL => {
                probe::probe_remote_dial(
                    &client,
                    self.tunnel.remote_host.trim(),
                    self.tunnel.remote_port as u16,
                )
                .await
            }
            model::MODE_DYNAMIC => probe::probe_dynamic_capability(&client).await,
            _ => Ok(()),
        };
        if let Err(err) = precondition {
            client.close().await;
            self.set_run_err(&err.reason()).await;
            error!(tunnel_id = self.tunnel.id, error = %err, "tunnel initial probe failed");
            return Err(err);
        }

        let listener = if mode == model::MODE_REMOTE {
            if let Err(err) = client
                .request_remote_forward(
                    &self.tunnel.effective_remote_host(),
                    self.tunnel.remote_port as u16,
                )
                .await
            {
                client.close().await;
                self.set_run_err(&err.reason()).await;
                error!(tunnel_id = self.tunnel.id, error = %err, "tunnel remote listen failed");
                return Err(err);
            }
            None
        } else {
            let addr = format!(
                "{}:{}",
                self.tunnel.effective_local_host(),
                self.tunnel.local_port
            );
            match TcpListener::bind(&addr).await {
                Ok(listener) => Some(listener),
                Err(err) => {
                    client.close().await;
                    let err = Error::network(format!("listen {addr} failed: {err}"));
                    self.set_run_err(&err.reason()).await;
                    error!(tunnel_id = self.tunnel.id, addr = %addr, error = %err, "tunnel listen failed");
                    return Err(err);
                }
            }
        };

        {
            let mut shared = self.shared.lock().await;
            shared.client = Some(client.clone());
            shared.run_err = None;
            shared.last_latency = None;
        }

        if let Ok(latency) = probe::measure_latency(&client).await {
            self.set_last_latency(latency).await;
        }

        match listener {
            Some(listener) => {
                let this = self.clone();
                let mode = mode.clone();
                self.tracker.spawn(async move { this.serve_local(listener, mode).await });
            }
            None => {
                let this = self.clone();
                self.tracker.spawn(async move { this.serve_remote().await });
            }
        }

        let this = self.clone();
        self.tracker
            .spawn(async move { this.monitor_lifecycle(client, mode).await });
        Ok(())
    }

    /// Stop the runtime: close the stop signal, the client and the listener,
    /// then join every spawned task. Calling it again is a no-op that waits
    /// for the first call to finish.
    pub async fn stop(&self) {
        self.stop_done
            .get_or_init(|| async {
                info!(tunnel_id = self.tunnel.id, name = %self.tunnel.name, "tunnel forward stop requested");
                self.stop.cancel();

                let client = {
                    let mut shared = self.shared.lock().await;
                    shared.client.take()
                };
                if let Some(client) = client {
                    client.close().await;
                }

                self.tracker.close();
                self.tracker.wait().await;
            })
            .await;
    }

    async fn serve_local(self: Arc<Self>, listener: TcpListener, mode: String) {
        loop {
            tokio::select! {
                _ = self.serve_stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(tunnel_id = self.tunnel.id, peer = %peer, "connection accepted");
                        let this = self.clone();
                        let dynamic = mode == model::MODE_DYNAMIC;
                        self.tracker.spawn(async move {
                            let client = this.current_client().await;
                            let Some(client) = client else { return };
                            if dynamic {
                                this.handle_dynamic_conn(stream, client).await;
                            } else {
                                this.handle_local_conn(stream, client).await;
                            }
                        });
                    }
                    Err(err) => {
                        if self.is_stopping() {
                            break;
                        }
                        self.set_run_err(&format!("accept failed: {err}")).await;
                        warn!(tunnel_id = self.tunnel.id, error = %err, "accept failed");
                        break;
                    }
                }
            }
        }
        self.done.cancel();
    }

    /// Remote-mode accept loop: forwarded channels delivered by the SSH
    /// client handler. The queue survives reconnects (the runtime keeps a
    /// sender and installs clones into each new chain), so the loop must not
    /// exit on a transient closed-queue state.
    async fn serve_remote(self: Arc<Self>) {
        let receiver = { self.forwarded_rx.lock().await.take() };
        let Some(mut receiver) = receiver else {
            self.done.cancel();
            return;
        };

        loop {
            tokio::select! {
                _ = self.serve_stop.cancelled() => break,
                channel = receiver.recv() => match channel {
                    Some(channel) => {
                        debug!(tunnel_id = self.tunnel.id, "remote connection accepted");
                        let this = self.clone();
                        self.tracker.spawn(async move { this.handle_remote_conn(channel).await });
                    }
                    None => {
                        if self.is_stopping() {
                            break;
                        }
                        tokio::time::sleep(REMOTE_ACCEPT_RETRY).await;
                    }
                }
            }
        }
        self.done.cancel();
    }

    async fn handle_local_conn(&self, stream: TcpStream, client: Arc<ChainClient>) {
        let host = self.tunnel.remote_host.trim().to_string();
        let port = self.tunnel.remote_port as u16;
        match client.open_direct(&host, port).await {
            Ok(channel) => bridge(stream, channel.into_stream()).await,
            Err(err) => {
                debug!(tunnel_id = self.tunnel.id, error = %err, "remote dial failed");
            }
        }
    }

    async fn handle_dynamic_conn(&self, mut stream: TcpStream, client: Arc<ChainClient>) {
        let target = match socks5::read_connect_target(&mut stream).await {
            Ok(target) => target,
            Err(err) => {
                debug!(tunnel_id = self.tunnel.id, error = %err, "socks5 handshake failed");
                return;
            }
        };

        match client.open_direct(&target.host, target.port).await {
            Ok(channel) => {
                if socks5::write_reply(&mut stream, socks5::REPLY_SUCCEEDED)
                    .await
                    .is_err()
                {
                    return;
                }
                bridge(stream, channel.into_stream()).await;
            }
            Err(err) => {
                debug!(tunnel_id = self.tunnel.id, target = %target, error = %err, "socks5 target dial failed");
                let _ = socks5::write_reply(&mut stream, socks5::REPLY_GENERAL_FAILURE).await;
            }
        }
    }

    async fn handle_remote_conn(&self, channel: Channel<Msg>) {
        let addr = format!(
            "{}:{}",
            self.tunnel.effective_local_host(),
            self.tunnel.local_port
        );
        match TcpStream::connect(&addr).await {
            Ok(stream) => bridge(stream, channel.into_stream()).await,
            Err(err) => {
                debug!(tunnel_id = self.tunnel.id, addr = %addr, error = %err, "local dial failed");
            }
        }
    }

    /// Lifecycle monitor: wait for connection loss, emit `disconnected`,
    /// reconnect with backoff and emit `reconnected`, or give up after the
    /// reconnect window and shut the serve loop down.
    async fn monitor_lifecycle(self: Arc<Self>, mut client: Arc<ChainClient>, mode: String) {
        loop {
            let Some(reason) = self.wait_client_loss(&client).await else {
                return;
            };

            warn!(tunnel_id = self.tunnel.id, name = %self.tunnel.name, reason = %reason, "tunnel connection lost");
            self.emit(RuntimeEvent::Disconnected(reason.clone()));
            self.replace_client(None).await;

            match self.reconnect_with_backoff(&mode).await {
                ReconnectOutcome::Stopped => return,
                ReconnectOutcome::Failed(err) => {
                    self.set_run_err(&format!("{reason}: {err}")).await;
                    error!(tunnel_id = self.tunnel.id, error = %err, "tunnel reconnect failed");
                    self.serve_stop.cancel();
                    return;
                }
                ReconnectOutcome::Reconnected(new_client) => {
                    self.emit(RuntimeEvent::Reconnected);
                    info!(tunnel_id = self.tunnel.id, name = %self.tunnel.name, "tunnel reconnected");
                    self.replace_client(Some(new_client.clone())).await;
                    client = new_client;
                }
            }
        }
    }

    /// Block until the client is lost or the runtime is stopping. Returns the
    /// loss reason, or `None` when stopping. Loss is observed either through
    /// the session ending or through a failed/timed-out keepalive probe.
    async fn wait_client_loss(&self, client: &Arc<ChainClient>) -> Option<String> {
        let interval = keep_alive_interval(&self.last_jumper());
        tokio::select! {
            _ = self.stop.cancelled() => None,
            reason = watch_closed(client) => {
                if self.is_stopping() { None } else { Some(reason) }
            }
            reason = self.keepalive_loop(client, interval) => {
                if self.is_stopping() { None } else { Some(reason) }
            }
        }
    }

    /// Keepalive probe loop; resolves with the loss reason on failure. Never
    /// resolves when the interval is zero (probing disabled).
    async fn keepalive_loop(&self, client: &Arc<ChainClient>, interval: Duration) -> String {
        if interval.is_zero() {
            return std::future::pending().await;
        }
        let timeout = keep_alive_request_timeout(interval);

        loop {
            match tokio::time::timeout(timeout, probe::measure_latency(client)).await {
                Ok(Ok(latency)) => {
                    self.set_last_latency(latency).await;
                    debug!(tunnel_id = self.tunnel.id, latency_ms = latency.as_millis() as u64, "tunnel keepalive probe ok");
                }
                Ok(Err(err)) => {
                    warn!(tunnel_id = self.tunnel.id, error = %err, "tunnel keepalive failed");
                    client.close().await;
                    return format!("keepalive failed: {err}");
                }
                Err(_) => {
                    warn!(tunnel_id = self.tunnel.id, timeout_ms = timeout.as_millis() as u64, "tunnel keepalive timeout");
                    client.close().await;
                    return format!("keepalive timeout after {}s", timeout.as_secs());
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Dial a fresh chain under the backoff policy. For remote tunnels the
    /// listener is re-requested on the new client before success is declared;
    /// a rebind failure counts as a failed attempt.
    async fn reconnect_with_backoff(&self, mode: &str) -> ReconnectOutcome {
        let deadline = Instant::now() + RECONNECT_WINDOW;
        let mut wait = INIT_RECONNECT_WAIT;
        let mut last_err: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            if !self.wait_or_stop(wait.min(remaining)).await {
                return ReconnectOutcome::Stopped;
            }
            attempt += 1;
            info!(
                tunnel_id = self.tunnel.id,
                name = %self.tunnel.name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "tunnel reconnect attempt"
            );

            let forwarded_tx = (mode == model::MODE_REMOTE).then(|| self.forwarded_tx.clone());
            match dial_ssh_chain(&self.jumpers, forwarded_tx).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    if mode == model::MODE_REMOTE {
                        if let Err(err) = client
                            .request_remote_forward(
                                &self.tunnel.effective_remote_host(),
                                self.tunnel.remote_port as u16,
                            )
                            .await
                        {
                            client.close().await;
                            warn!(tunnel_id = self.tunnel.id, attempt, error = %err, "tunnel remote listen rebind failed");
                            last_err = Some(err.reason());
                            wait = next_reconnect_wait(wait);
                            continue;
                        }
                    }
                    info!(tunnel_id = self.tunnel.id, name = %self.tunnel.name, attempt, "tunnel reconnect succeeded");
                    return ReconnectOutcome::Reconnected(client);
                }
                Err(err) => {
                    warn!(tunnel_id = self.tunnel.id, attempt, error = %err, "tunnel reconnect failed");
                    last_err = Some(err.reason());
                    wait = next_reconnect_wait(wait);
                }
            }
        }

        let last = last_err.unwrap_or_else(|| "reconnect timeout".to_string());
        ReconnectOutcome::Failed(Error::timeout(format!(
            "reconnect timeout after {}m: {last}",
            RECONNECT_WINDOW.as_secs() / 60
        )))
    }

    /// Sleep for `wait`, waking immediately on stop. Returns false when
    /// stopping.
    async fn wait_or_stop(&self, wait: Duration) -> bool {
        if wait.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn current_client(&self) -> Option<Arc<ChainClient>> {
        self.shared.lock().await.client.clone()
    }

    /// Swap the chain client. The old chain is closed in the background so
    /// the monitor is not delayed; latency restarts from scratch.
    async fn replace_client(&self, client: Option<Arc<ChainClient>>) {
        let old = {
            let mut shared = self.shared.lock().await;
            let old = shared.client.take();
            shared.client = client;
            shared.last_latency = None;
            old
        };
        if let Some(old) = old {
            tokio::spawn(async move { old.close().await });
        }
    }

    async fn set_last_latency(&self, latency: Duration) {
        if latency.is_zero() {
            return;
        }
        self.shared.lock().await.last_latency = Some(latency);
    }

    async fn set_run_err(&self, reason: &str) {
        let mut shared = self.shared.lock().await;
        if shared.run_err.is_none() {
            shared.run_err = Some(reason.trim().to_string());
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        // Bounded channel with drop-newest semantics: status reconciliation
        // is idempotent, missed intermediate events are harmless.
        let _ = self.events_tx.try_send(event);
    }

    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn last_jumper(&self) -> Jumper {
        self.jumpers.last().cloned().unwrap_or_default()
    }
}

enum ReconnectOutcome {
    Reconnected(Arc<ChainClient>),
    Failed(Error),
    Stopped,
}

/// Resolve with a loss reason once the chain's session has ended.
async fn watch_closed(client: &Arc<ChainClient>) -> String {
    loop {
        if client.is_closed().await {
            return "ssh connection closed".to_string();
        }
        tokio::time::sleep(CLIENT_POLL_INTERVAL).await;
    }
}

/// Symmetric bidirectional copy: two copy halves, and when either side
/// finishes both endpoints are dropped, which closes them. No idle timeout.
async fn bridge<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(err) = result {
                debug!(error = %err, "bridge copy ended");
            }
        }
        result = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(err) = result {
                debug!(error = %err, "bridge copy ended");
            }
        }
    }
}

pub(crate) fn keep_alive_interval(jumper: &Jumper) -> Duration {
    if jumper.keep_alive_interval_ms > 0 {
        Duration::from_millis(jumper.keep_alive_interval_ms as u64)
    } else {
        Duration::ZERO
    }
}

/// Per-probe timeout: half the interval clamped into [5s, 10s]; 5s when
/// probing is disabled.
pub(crate) fn keep_alive_request_timeout(interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::from_secs(5);
    }
    (interval / 2).clamp(Duration::from_secs(5), Duration::from_secs(10))
}

pub(crate) fn next_reconnect_wait(current: Duration) -> Duration {
    if current.is_zero() {
        return INIT_RECONNECT_WAIT;
    }
    let next = current.saturating_mul(2);
    if next > MAX_RECONNECT_WAIT {
        MAX_RECONNECT_WAIT
    } else {
        next
    }
}
