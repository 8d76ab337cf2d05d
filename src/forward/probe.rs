//! Liveness probes and connection tests.
//!
//! The keepalive probe doubles as the latency sample: one
//! `keepalive@openssh.com` global request with reply-wanted, timed wall-clock.
//! The capability probes open (and immediately drop) the cheapest possible
//! server-side resource for the tunnel's mode.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{self, Jumper, Tunnel};

use super::chain::{ChainClient, dial_ssh_chain};

/// Measure SSH round-trip latency on the chain's last hop.
pub async fn measure_latency(client: &ChainClient) -> Result<Duration> {
    let start = Instant::now();
    client.keepalive().await?;
    Ok(start.elapsed())
}

/// Verify SSH handshake and auth against a single jumper.
pub async fn test_jumper_connection(jumper: &Jumper) -> Result<()> {
    let client = dial_ssh_chain(std::slice::from_ref(jumper), None).await?;
    client.close().await;
    Ok(())
}

/// Verify tunnel prerequisites and target reachability, returning the
/// measured chain latency. Supports local, remote and dynamic modes.
pub async fn test_tunnel_connection(tunnel: &Tunnel, jumpers: &[Jumper]) -> Result<Duration> {
    let mode = normalize_mode(&tunnel.mode);
    if mode != model::MODE_LOCAL && mode != model::MODE_REMOTE && mode != model::MODE_DYNAMIC {
        return Err(Error::validation(format!(
            "mode {mode} test is not supported yet"
        )));
    }

    if mode == model::MODE_LOCAL || mode == model::MODE_DYNAMIC {
        // The local port must be bindable before anything is dialed.
        let addr = format!("{}:{}", tunnel.effective_local_host(), tunnel.local_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|err| Error::network(format!("local listen {addr} failed: {err}")))?;
        drop(listener);
    }

    let client = dial_ssh_chain(jumpers, None).await?;
    let result = test_tunnel_over_chain(tunnel, mode, &client).await;
    client.close().await;
    result
}

async fn test_tunnel_over_chain(
    tunnel: &Tunnel,
    mode: &str,
    client: &ChainClient,
) -> Result<Duration> {
    let latency = measure_latency(client)
        .await
        .map_err(|err| Error::network(format!("measure ssh latency failed: {err}")))?;

    match mode {
        model::MODE_DYNAMIC => probe_dynamic_capability(client).await?,
        model::MODE_REMOTE => {
            probe_remote_listen(client, &tunnel.effective_remote_host(), tunnel.remote_port as u16)
                .await?
        }
        _ => {
            probe_remote_dial(client, tunnel.remote_host.trim(), tunnel.remote_port as u16).await?
        }
    }
    Ok(latency)
}

/// One-shot channel to the tunnel target, closed immediately.
pub async fn probe_remote_dial(client: &ChainClient, host: &str, port: u16) -> Result<()> {
    let channel = client
        .open_direct(host, port)
        .await
        .map_err(|err| Error::network(format!("remote dial {host}:{port} failed: {err}")))?;
    let _ = channel.close().await;
    Ok(())
}

/// Request a remote-side listener, then cancel it immediately.
pub async fn probe_remote_listen(client: &ChainClient, host: &str, port: u16) -> Result<()> {
    client.request_remote_forward(host, port).await?;
    client.cancel_remote_forward(host, port).await;
    Ok(())
}

/// Detect "port forwarding prohibited" without needing a reachable endpoint:
/// dial a closed local target through the server. A plain refusal means
/// forwarding itself works; only a recognized denial message fails the probe.
pub async fn probe_dynamic_capability(client: &ChainClient) -> Result<()> {
    match client.open_direct("127.0.0.1", 1).await {
        Ok(channel) => {
            let _ = channel.close().await;
            Ok(())
        }
        Err(err) => {
            if is_port_forward_denied(&err) {
                Err(Error::capability(format!(
                    "dynamic forward is not allowed by ssh server: {err}"
                )))
            } else {
                debug!(error = %err, "dynamic probe dial refused, capability ok");
                Ok(())
            }
        }
    }
}

fn is_port_forward_denied(err: &russh::Error) -> bool {
    if let russh::Error::ChannelOpenFailure(reason) = err
        && matches!(reason, russh::ChannelOpenFailure::AdministrativelyProhibited)
    {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("administratively prohibited")
        || msg.contains("forwarding disabled")
        || msg.contains("port forwarding disabled")
}

pub(crate) fn normalize_mode(raw: &str) -> &str {
    let mode = raw.trim();
    if mode.is_empty() { model::MODE_LOCAL } else { mode }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mode_defaults_to_local() {
        assert_eq!(normalize_mode(""), "local");
        assert_eq!(normalize_mode("   "), "local");
        assert_eq!(normalize_mode(" remote "), "remote");
    }

    #[test]
    fn test_denied_detection_by_message() {
        let err = russh::Error::RequestDenied;
        // RequestDenied carries no denial text; not treated as prohibition.
        assert!(!is_port_forward_denied(&err));
    }

    #[test]
    fn test_denied_detection_by_open_failure_reason() {
        let err = russh::Error::ChannelOpenFailure(
            russh::ChannelOpenFailure::AdministrativelyProhibited,
        );
        assert!(is_port_forward_denied(&err));
    }

    #[tokio::test]
    async fn test_tunnel_connection_rejects_unknown_mode() {
        let tunnel = Tunnel {
            mode: "vpn".to_string(),
            ..Default::default()
        };
        let err = test_tunnel_connection(&tunnel, &[]).await.expect_err("must fail");
        assert!(err.to_string().contains("mode vpn test is not supported yet"));
    }

    #[tokio::test]
    async fn test_tunnel_connection_requires_bindable_local_port() {
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = holder.local_addr().expect("addr").port();

        let tunnel = Tunnel {
            mode: "local".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port: port as i64,
            remote_host: "example.com".to_string(),
            remote_port: 80,
            ..Default::default()
        };
        let err = test_tunnel_connection(&tunnel, &[]).await.expect_err("must fail");
        assert!(err.to_string().contains("local listen"));
    }
}
