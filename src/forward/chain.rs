//! Multi-hop SSH chain dialer.
//!
//! A tunnel's chain is an ordered list of jumpers where each hop is reached
//! by tunneling through its predecessor: the first jumper is dialed over
//! plain TCP, every further hop runs its SSH handshake over a direct-tcpip
//! channel opened on the previous hop's client. Failure at any hop tears
//! down everything already opened and reports the hop index.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Msg};
use russh::keys::ssh_key::Algorithm;
use russh::{Channel, Disconnect};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::forward::auth;
use crate::model::Jumper;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default host key algorithm preference, mirroring the OpenSSH client set
/// this daemon has always negotiated with.
pub(crate) const DEFAULT_HOST_KEY_ALGORITHMS: [&str; 7] = [
    "ssh-rsa",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-ed25519",
];

/// russh client handler: host key policy plus delivery of remote-forward
/// channels to the tunnel runtime.
pub struct ClientHandler {
    host: String,
    port: u16,
    bypass_host_verification: bool,
    forwarded_tx: Option<mpsc::UnboundedSender<Channel<Msg>>>,
}

impl ClientHandler {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        bypass_host_verification: bool,
        forwarded_tx: Option<mpsc::UnboundedSender<Channel<Msg>>>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            bypass_host_verification,
            forwarded_tx,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.bypass_host_verification {
            // The jumper records an explicit trust choice.
            return Ok(true);
        }

        let Some(home) = dirs::home_dir() else {
            warn!(host = %self.host, "cannot resolve home dir for known_hosts");
            return Ok(false);
        };
        let known_hosts = home.join(".ssh").join("known_hosts");

        match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, &known_hosts)
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, port = self.port, "host key not found in known_hosts");
                Ok(false)
            }
            Err(err) => {
                warn!(host = %self.host, port = self.port, error = %err, "host key verification failed");
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(address = %connected_address, port = connected_port, "forwarded channel opened");
        if let Some(tx) = &self.forwarded_tx {
            // The runtime's accept loop owns the channel from here; when the
            // runtime is gone the channel is dropped and closes.
            let _ = tx.send(channel);
        }
        Ok(())
    }
}

/// One established chain: the ordered clients with the last hop carrying the
/// tunnel traffic. Closing tears the chain down in reverse order exactly once.
pub struct ChainClient {
    hops: Vec<Arc<Mutex<client::Handle<ClientHandler>>>>,
    close_once: tokio::sync::OnceCell<()>,
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("hops", &self.hops.len())
            .finish()
    }
}

impl ChainClient {
    fn last(&self) -> Arc<Mutex<client::Handle<ClientHandler>>> {
        self.hops
            .last()
            .cloned()
            .expect("chain always holds at least one hop")
    }

    /// Close every hop in reverse order. Safe to call more than once.
    pub async fn close(&self) {
        self.close_once
            .get_or_init(|| async {
                for hop in self.hops.iter().rev() {
                    let guard = hop.lock().await;
                    let _ = guard
                        .disconnect(Disconnect::ByApplication, "", "en")
                        .await;
                }
            })
            .await;
    }

    /// Whether the last hop's session has ended.
    pub async fn is_closed(&self) -> bool {
        let handle = self.last();
        let guard = handle.lock().await;
        guard.is_closed()
    }

    /// Open a direct-tcpip channel from the last hop to `host:port`.
    pub async fn open_direct(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<Channel<Msg>, russh::Error> {
        let handle = self.last();
        let guard = handle.lock().await;
        guard
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
    }

    /// Request a remote-side listener on the last hop.
    pub async fn request_remote_forward(&self, host: &str, port: u16) -> Result<()> {
        let handle = self.last();
        let mut guard = handle.lock().await;
        guard
            .tcpip_forward(host, port as u32)
            .await
            .map(|_| ())
            .map_err(|err| Error::capability(format!("remote listen {host}:{port} failed: {err}")))
    }

    /// Cancel a remote-side listener; failures are ignored because the
    /// session may already be gone.
    pub async fn cancel_remote_forward(&self, host: &str, port: u16) {
        let handle = self.last();
        let mut guard = handle.lock().await;
        let _ = guard.cancel_tcpip_forward(host, port as u32).await;
    }

    /// Send a `keepalive@openssh.com` global request with reply-wanted on the
    /// last hop and wait for the reply.
    pub async fn keepalive(&self) -> Result<()> {
        let handle = self.last();
        let mut guard = handle.lock().await;
        guard
            .send_keepalive(true)
            .await
            .map_err(|err| Error::network(format!("keepalive request failed: {err}")))
    }
}

/// Dial the full jumper chain. `forwarded_tx`, when present, is installed on
/// the final hop so remote-forward channels reach the tunnel runtime.
pub async fn dial_ssh_chain(
    jumpers: &[Jumper],
    forwarded_tx: Option<mpsc::UnboundedSender<Channel<Msg>>>,
) -> Result<ChainClient> {
    if jumpers.is_empty() {
        return Err(Error::validation("at least one jumper is required"));
    }

    let last_index = jumpers.len() - 1;
    let mut hops: Vec<Arc<Mutex<client::Handle<ClientHandler>>>> = Vec::with_capacity(jumpers.len());

    for (index, jumper) in jumpers.iter().enumerate() {
        let tx = (index == last_index).then(|| forwarded_tx.clone()).flatten();

        let dialed = if index == 0 {
            dial_first_hop(jumper, tx).await
        } else {
            dial_next_hop(&hops[index - 1], jumper, index, tx).await
        };

        match dialed {
            Ok(handle) => hops.push(Arc::new(Mutex::new(handle))),
            Err(err) => {
                close_hops(&hops).await;
                return Err(err);
            }
        }
    }

    Ok(ChainClient {
        hops,
        close_once: tokio::sync::OnceCell::new(),
    })
}

async fn close_hops(hops: &[Arc<Mutex<client::Handle<ClientHandler>>>]) {
    for hop in hops.iter().rev() {
        let guard = hop.lock().await;
        let _ = guard.disconnect(Disconnect::ByApplication, "", "en").await;
    }
}

async fn dial_first_hop(
    jumper: &Jumper,
    forwarded_tx: Option<mpsc::UnboundedSender<Channel<Msg>>>,
) -> Result<client::Handle<ClientHandler>> {
    let host = required_host(jumper, 0)?;
    let port = jumper.effective_port();
    let config = make_client_config(jumper);
    let handler = ClientHandler::new(&host, port, jumper.bypass_host_verification, forwarded_tx);
    let timeout = dial_timeout(jumper);

    let connect = client::connect(config, (host.as_str(), port), handler);
    let mut handle = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| Error::timeout(format!("ssh dial {host}:{port} timed out after {}ms", timeout.as_millis())))?
        .map_err(|err| Error::network(format!("ssh dial {host}:{port} failed: {err}")))?;

    authenticate(jumper, &mut handle).await?;
    Ok(handle)
}

async fn dial_next_hop(
    previous: &Arc<Mutex<client::Handle<ClientHandler>>>,
    jumper: &Jumper,
    hop_index: usize,
    forwarded_tx: Option<mpsc::UnboundedSender<Channel<Msg>>>,
) -> Result<client::Handle<ClientHandler>> {
    let host = required_host(jumper, hop_index)?;
    let port = jumper.effective_port();
    let config = make_client_config(jumper);
    let handler = ClientHandler::new(&host, port, jumper.bypass_host_verification, forwarded_tx);
    let timeout = dial_timeout(jumper);

    let channel = {
        let guard = previous.lock().await;
        guard
            .channel_open_direct_tcpip(host.as_str(), port as u32, "127.0.0.1", 0)
            .await
            .map_err(|err| {
                Error::network(format!(
                    "ssh dial {host}:{port} via hop {hop_index} failed: {err}"
                ))
            })?
    };

    let connect = client::connect_stream(config, channel.into_stream(), handler);
    let mut handle = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            Error::timeout(format!(
                "ssh handshake {host}:{port} via hop {hop_index} timed out after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|err| {
            Error::network(format!(
                "ssh handshake {host}:{port} via hop {hop_index} failed: {err}"
            ))
        })?;

    authenticate(jumper, &mut handle).await?;
    Ok(handle)
}

async fn authenticate(jumper: &Jumper, handle: &mut client::Handle<ClientHandler>) -> Result<()> {
    let user = jumper.user.trim();
    if user.is_empty() {
        return Err(Error::validation("jumper user is required"));
    }
    let strategy = auth::for_jumper(jumper)?;
    debug!(host = %jumper.host, strategy = strategy.name(), "authenticating");
    strategy.authenticate(handle, user).await
}

fn required_host(jumper: &Jumper, hop_index: usize) -> Result<String> {
    let host = jumper.host.trim();
    if host.is_empty() {
        if hop_index == 0 {
            return Err(Error::validation("jumper host is required"));
        }
        return Err(Error::validation(format!(
            "jumper[{hop_index}] host is required"
        )));
    }
    Ok(host.to_string())
}

fn dial_timeout(jumper: &Jumper) -> Duration {
    if jumper.timeout_ms > 0 {
        Duration::from_millis(jumper.timeout_ms as u64)
    } else {
        DEFAULT_DIAL_TIMEOUT
    }
}

fn make_client_config(jumper: &Jumper) -> Arc<client::Config> {
    let mut preferred = russh::Preferred::default();

    let spec = jumper.host_key_algorithms.trim();
    if !spec.is_empty() {
        let names = parse_host_key_algorithms(spec);
        let algorithms: Vec<Algorithm> = names
            .iter()
            .filter_map(|name| match name.parse::<Algorithm>() {
                Ok(algorithm) => Some(algorithm),
                Err(_) => {
                    warn!(algorithm = %name, "unknown host key algorithm, skipping");
                    None
                }
            })
            .collect();
        if !algorithms.is_empty() {
            preferred.key = Cow::Owned(algorithms);
        }
    }

    Arc::new(client::Config {
        preferred,
        ..Default::default()
    })
}

/// Parse an OpenSSH-style host key algorithm spec:
/// `+name` appends to the default list, `-name` removes from it, anything
/// else is a comma-separated replacement list.
pub(crate) fn parse_host_key_algorithms(spec: &str) -> Vec<String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Vec::new();
    }

    if let Some(name) = spec.strip_prefix('+') {
        let mut list: Vec<String> = DEFAULT_HOST_KEY_ALGORITHMS
            .iter()
            .map(|s| s.to_string())
            .collect();
        list.push(name.to_string());
        return list;
    }

    if let Some(name) = spec.strip_prefix('-') {
        return DEFAULT_HOST_KEY_ALGORITHMS
            .iter()
            .filter(|algo| **algo != name)
            .map(|s| s.to_string())
            .collect();
    }

    spec.split(',').map(|s| s.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod host_key_algorithms {
        use super::*;

        #[test]
        fn test_plus_appends_to_defaults() {
            let list = parse_host_key_algorithms("+sk-ssh-ed25519@openssh.com");
            assert_eq!(list.len(), DEFAULT_HOST_KEY_ALGORITHMS.len() + 1);
            assert_eq!(list.last().map(String::as_str), Some("sk-ssh-ed25519@openssh.com"));
            assert!(list.iter().any(|a| a == "ssh-ed25519"));
        }

        #[test]
        fn test_minus_removes_from_defaults() {
            let list = parse_host_key_algorithms("-ssh-rsa");
            assert_eq!(list.len(), DEFAULT_HOST_KEY_ALGORITHMS.len() - 1);
            assert!(!list.iter().any(|a| a == "ssh-rsa"));
            assert!(list.iter().any(|a| a == "rsa-sha2-256"));
        }

        #[test]
        fn test_plain_list_replaces_defaults() {
            let list = parse_host_key_algorithms("ssh-ed25519,rsa-sha2-512");
            assert_eq!(list, vec!["ssh-ed25519", "rsa-sha2-512"]);
        }

        #[test]
        fn test_single_name_replaces_defaults() {
            let list = parse_host_key_algorithms("ssh-ed25519");
            assert_eq!(list, vec!["ssh-ed25519"]);
        }

        #[test]
        fn test_empty_spec_yields_nothing() {
            assert!(parse_host_key_algorithms("   ").is_empty());
        }

        #[test]
        fn test_default_list_contents() {
            assert_eq!(DEFAULT_HOST_KEY_ALGORITHMS.len(), 7);
            assert!(DEFAULT_HOST_KEY_ALGORITHMS.contains(&"ssh-ed25519"));
            assert!(DEFAULT_HOST_KEY_ALGORITHMS.contains(&"ecdsa-sha2-nistp384"));
        }
    }

    mod dial_parameters {
        use super::*;

        #[test]
        fn test_dial_timeout_from_jumper() {
            let jumper = Jumper {
                timeout_ms: 2500,
                ..Default::default()
            };
            assert_eq!(dial_timeout(&jumper), Duration::from_millis(2500));
        }

        #[test]
        fn test_dial_timeout_default() {
            let jumper = Jumper::default();
            assert_eq!(dial_timeout(&jumper), DEFAULT_DIAL_TIMEOUT);
        }

        #[test]
        fn test_required_host_rejects_blank() {
            let jumper = Jumper {
                host: "   ".to_string(),
                ..Default::default()
            };
            assert!(required_host(&jumper, 0).is_err());
            let err = required_host(&jumper, 2).expect_err("must fail");
            assert!(err.to_string().contains("jumper[2]"));
        }

        #[test]
        fn test_required_host_trims() {
            let jumper = Jumper {
                host: "  bastion.example.com ".to_string(),
                ..Default::default()
            };
            assert_eq!(required_host(&jumper, 0).expect("host"), "bastion.example.com");
        }
    }

    #[tokio::test]
    async fn test_empty_chain_rejected() {
        let err = dial_ssh_chain(&[], None).await.expect_err("must fail");
        assert!(err.to_string().contains("at least one jumper"));
    }
}
