//! SSH agent authentication.
//!
//! The agent socket is picked from a candidate list: the jumper's explicit
//! socket path, then `LORIS_TUNNEL_SSH_AUTH_SOCK`, then `SSH_AUTH_SOCK`, then
//! OS defaults. `~/` is expanded, empty and duplicate entries are dropped with
//! order preserved.
//!
//! The agent connection is cached process-wide so every tunnel start does not
//! redial the agent. When listing identities fails (the agent restarted while
//! the daemon keeps running) the cache is reset and the candidate walk starts
//! over.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use russh::client;
use russh::keys::agent::client::AgentClient;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::forward::chain::ClientHandler;

use super::traits::AuthStrategy;

#[cfg(unix)]
type AgentStream = tokio::net::UnixStream;
#[cfg(windows)]
type AgentStream = tokio::net::windows::named_pipe::NamedPipeClient;

struct AgentConnection {
    socket: String,
    client: AgentClient<AgentStream>,
}

/// Process-wide agent cache: socket path plus the live client, guarded by its
/// own mutex. Resetting means dropping the record; the next caller re-walks
/// the candidate list.
static SSH_AGENT: Lazy<Mutex<Option<AgentConnection>>> = Lazy::new(|| Mutex::new(None));

/// SSH agent authentication strategy. Tries every identity the agent offers
/// until one is accepted.
pub struct AgentAuth {
    preferred_socket: String,
}

impl std::fmt::Debug for AgentAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAuth")
            .field("preferred_socket", &self.preferred_socket)
            .finish()
    }
}

impl AgentAuth {
    pub fn new(preferred_socket: impl Into<String>) -> Self {
        Self {
            preferred_socket: preferred_socket.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()> {
        let mut slot = SSH_AGENT.lock().await;
        let identities = ensure_agent(&mut slot, &self.preferred_socket).await?;
        let conn = slot
            .as_mut()
            .ok_or_else(|| Error::auth("ssh agent connection lost"))?;

        for identity in identities {
            debug!(comment = %identity.comment(), "trying SSH agent identity");

            let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut conn.client)
                .await
            {
                Ok(result) if result.success() => {
                    info!(socket = %conn.socket, "authenticated with SSH agent");
                    return Ok(());
                }
                Ok(_) => {
                    debug!("agent identity not accepted, trying next");
                }
                Err(err) => {
                    debug!(error = %err, "agent authentication error, trying next");
                }
            }
        }

        Err(Error::auth("agent authentication failed: no identities accepted"))
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Make sure a usable agent connection is cached and return its identities.
/// A cached connection is reused only while its socket is still a candidate
/// and it still lists identities; otherwise the cache is reset and each
/// candidate is dialed in order.
async fn ensure_agent(
    slot: &mut Option<AgentConnection>,
    preferred_socket: &str,
) -> Result<Vec<russh::keys::PublicKey>> {
    let candidates = agent_socket_candidates(preferred_socket);
    if candidates.is_empty() {
        return Err(Error::auth(
            "no SSH agent socket found; set agent socket path, SSH_AUTH_SOCK, or LORIS_TUNNEL_SSH_AUTH_SOCK",
        ));
    }

    if let Some(conn) = slot.as_mut()
        && candidates.contains(&conn.socket)
        && let Ok(identities) = conn.client.request_identities().await
        && !identities.is_empty()
    {
        return Ok(identities);
    }
    // Agent may have restarted while the daemon keeps running; reconnect.
    *slot = None;

    let mut failures = Vec::new();
    for socket in &candidates {
        let mut agent = match connect_agent_socket(socket).await {
            Ok(agent) => agent,
            Err(err) => {
                failures.push(format!("{socket}: {err}"));
                continue;
            }
        };

        match agent.request_identities().await {
            Ok(identities) if !identities.is_empty() => {
                *slot = Some(AgentConnection {
                    socket: socket.clone(),
                    client: agent,
                });
                return Ok(identities);
            }
            Ok(_) => failures.push(format!("{socket}: no identities")),
            Err(err) => failures.push(format!("{socket}: {err}")),
        }
    }

    Err(Error::auth(format!(
        "ssh agent has no usable identities; tried: {}",
        failures.join("; ")
    )))
}

#[cfg(unix)]
async fn connect_agent_socket(socket: &str) -> Result<AgentClient<AgentStream>> {
    AgentClient::connect_uds(socket)
        .await
        .map_err(|err| Error::auth(format!("connect ssh agent failed: {err}")))
}

#[cfg(windows)]
async fn connect_agent_socket(socket: &str) -> Result<AgentClient<AgentStream>> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let pipe = ClientOptions::new()
        .open(socket)
        .map_err(|err| Error::auth(format!("connect ssh agent pipe failed: {err}")))?;
    Ok(AgentClient::connect(pipe))
}

/// Ordered agent socket candidates: explicit path, the two environment
/// overrides, then OS defaults. Empty and duplicate entries (after `~/`
/// expansion) are dropped, first occurrence wins.
pub fn agent_socket_candidates(preferred_socket: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();
    let mut add = |socket: &str| {
        let normalized = normalize_agent_socket_path(socket);
        if normalized.is_empty() {
            return;
        }
        if seen.insert(normalized.clone()) {
            candidates.push(normalized);
        }
    };

    add(preferred_socket);
    add(&std::env::var("LORIS_TUNNEL_SSH_AUTH_SOCK").unwrap_or_default());
    add(&std::env::var("SSH_AUTH_SOCK").unwrap_or_default());

    if cfg!(windows) {
        add(r"\\.\pipe\openssh-ssh-agent");
    } else if let Some(home) = dirs::home_dir() {
        add(&home.join(".ssh").join("ssh-agent.sock").to_string_lossy());
    }

    candidates
}

fn normalize_agent_socket_path(socket: &str) -> String {
    let trimmed = socket.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Candidate resolution reads environment variables; serialize the tests.
    static ENV_TEST_MUTEX: Lazy<StdMutex<()>> = Lazy::new(|| StdMutex::new(()));

    fn with_agent_env<R>(loris: &str, ssh: &str, body: impl FnOnce() -> R) -> R {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe {
            std::env::set_var("LORIS_TUNNEL_SSH_AUTH_SOCK", loris);
            std::env::set_var("SSH_AUTH_SOCK", ssh);
        }
        let result = body();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe {
            std::env::remove_var("LORIS_TUNNEL_SSH_AUTH_SOCK");
            std::env::remove_var("SSH_AUTH_SOCK");
        }
        result
    }

    #[test]
    fn test_candidate_order_and_tilde_expansion() {
        with_agent_env("~/custom-agent.sock", "/tmp/another-agent.sock", || {
            let candidates = agent_socket_candidates("");
            assert!(candidates.len() >= 2);
            let home = dirs::home_dir().expect("home dir available in test env");
            assert_eq!(
                candidates[0],
                home.join("custom-agent.sock").to_string_lossy()
            );
            assert_eq!(candidates[1], "/tmp/another-agent.sock");
            if cfg!(not(windows)) {
                let default_sock = home.join(".ssh").join("ssh-agent.sock");
                assert!(candidates.contains(&default_sock.to_string_lossy().into_owned()));
            }
        });
    }

    #[test]
    fn test_candidates_deduped_preserving_first() {
        with_agent_env("/tmp/shared-agent.sock", "/tmp/shared-agent.sock", || {
            let candidates = agent_socket_candidates("");
            let count = candidates
                .iter()
                .filter(|c| c.as_str() == "/tmp/shared-agent.sock")
                .count();
            assert_eq!(count, 1);
        });
    }

    #[test]
    fn test_explicit_socket_comes_first() {
        with_agent_env("/tmp/loris-agent.sock", "/tmp/system-agent.sock", || {
            let candidates = agent_socket_candidates("~/user-selected.sock");
            let home = dirs::home_dir().expect("home dir available in test env");
            assert_eq!(
                candidates[0],
                home.join("user-selected.sock").to_string_lossy()
            );
        });
    }

    #[test]
    fn test_blank_entries_dropped() {
        with_agent_env("   ", "", || {
            let candidates = agent_socket_candidates("  ");
            for candidate in &candidates {
                assert!(!candidate.trim().is_empty());
            }
        });
    }

    #[test]
    fn test_agent_auth_name() {
        let auth = AgentAuth::new("");
        assert_eq!(auth.name(), "agent");
    }

    #[test]
    fn test_agent_auth_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AgentAuth>();
    }
}
