//! Error types shared across the crate.
//!
//! Each variant maps to one failure kind with its own propagation rules:
//! validation, not-found and in-use errors are returned synchronously by the
//! CRUD layer and leave state unchanged; auth, network, capability and timeout
//! errors surface through the tunnel runtime and end up in a tunnel's
//! `last_error`; protocol errors reject a single SOCKS5 connection without
//! affecting the tunnel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid CRUD input; no state change.
    #[error("{0}")]
    Validation(String),

    #[error("tunnel not found")]
    TunnelNotFound,

    #[error("jumper not found")]
    JumperNotFound,

    #[error("jumper is used by existing tunnels")]
    JumperInUse,

    /// File I/O or rename failure in the config store.
    #[error("{0}")]
    Storage(String),

    /// The config file exists but is not valid TOML.
    #[error("invalid config TOML: {0}")]
    InvalidConfig(String),

    /// SSH authentication, key parsing or agent failure. Not retried beyond
    /// the reconnect window.
    #[error("{0}")]
    Auth(String),

    /// TCP dial, SSH handshake or listener bind failure. The reconnect path
    /// retries these with backoff.
    #[error("{0}")]
    Network(String),

    /// Malformed SOCKS5 request; the offending connection is rejected.
    #[error("{0}")]
    Protocol(String),

    /// The server denies remote listening or port forwarding.
    #[error("{0}")]
    Capability(String),

    /// Dial or keepalive timeout; treated like a network error for
    /// reconnection purposes.
    #[error("{0}")]
    Timeout(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn capability(msg: impl Into<String>) -> Self {
        Error::Capability(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// User-facing reason string, trimmed of whitespace. This is what gets
    /// persisted into a tunnel's `last_error`.
    pub fn reason(&self) -> String {
        self.to_string().trim().to_string()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_trims_whitespace() {
        let err = Error::network("  connection refused \n");
        assert_eq!(err.reason(), "connection refused");
    }

    #[test]
    fn test_not_found_messages() {
        assert_eq!(Error::TunnelNotFound.to_string(), "tunnel not found");
        assert_eq!(Error::JumperNotFound.to_string(), "jumper not found");
    }

    #[test]
    fn test_in_use_message() {
        assert_eq!(
            Error::JumperInUse.to_string(),
            "jumper is used by existing tunnels"
        );
    }

    #[test]
    fn test_invalid_config_prefix() {
        let err = Error::InvalidConfig("expected `=`".to_string());
        assert!(err.to_string().starts_with("invalid config TOML:"));
    }

    #[test]
    fn test_io_error_converts_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
