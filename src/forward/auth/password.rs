//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;

use crate::error::{Error, Result};
use crate::forward::chain::ClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
pub struct PasswordAuth {
    password: String,
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|err| Error::auth(format!("password authentication failed: {err}")))?;

        if result.success() {
            Ok(())
        } else {
            Err(Error::auth("password authentication rejected"))
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
