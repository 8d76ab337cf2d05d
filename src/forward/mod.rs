//! The forwarding runtime.
//!
//! - `chain`: multi-hop SSH chain dialer
//! - `auth`: per-jumper authentication strategies
//! - `socks5`: SOCKS5 CONNECT front end for dynamic tunnels
//! - `probe`: keepalive latency and capability probes
//! - `runtime`: per-tunnel lifecycle state machine

pub mod auth;
pub mod chain;
pub mod probe;
pub mod runtime;
pub mod socks5;

pub use chain::{ChainClient, dial_ssh_chain};
pub use runtime::{LocalForward, RuntimeEvent};
