//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::error::Result;
use crate::forward::chain::ClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across async
/// tasks. Each strategy represents one authentication method (password, key
/// file, SSH agent).
#[async_trait]
pub trait AuthStrategy: Send + Sync + std::fmt::Debug {
    /// Attempt to authenticate against the SSH server. Returns `Ok(())` on
    /// success; a rejected or failed attempt is an [`crate::Error::Auth`].
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()>;

    /// Name of this strategy, used for logging.
    fn name(&self) -> &'static str;
}
