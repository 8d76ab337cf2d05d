//! Authentication strategies for SSH jumpers.
//!
//! Trait-based authentication following the Strategy pattern: each jumper's
//! `auth_type` selects exactly one strategy.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: password authentication
//! - [`KeyAuth`]: private key file authentication (with passphrase fallback)
//! - [`AgentAuth`]: SSH agent authentication with a process-wide cached
//!   agent connection

mod agent;
mod key;
mod password;
mod traits;

pub use agent::{AgentAuth, agent_socket_candidates};
pub use key::{KeyAuth, resolve_key_path};
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use crate::error::{Error, Result};
use crate::model::{self, Jumper};

/// Select the authentication strategy for a jumper from its `auth_type`.
pub fn for_jumper(jumper: &Jumper) -> Result<Box<dyn AuthStrategy>> {
    match jumper.auth_type.trim() {
        model::AUTH_PASSWORD => {
            if jumper.password.is_empty() {
                return Err(Error::auth("password auth requires password"));
            }
            Ok(Box::new(PasswordAuth::new(&jumper.password)))
        }
        model::AUTH_SSH_KEY => Ok(Box::new(KeyAuth::new(&jumper.key_path, &jumper.password))),
        model::AUTH_SSH_AGENT => Ok(Box::new(AgentAuth::new(&jumper.agent_socket_path))),
        other => Err(Error::auth(format!("unsupported authType: {other}"))),
    }
}
