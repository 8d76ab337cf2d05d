//! Private key file SSH authentication.
//!
//! Key paths may start with `~/` or be relative; relative paths are tried as
//! given first and then under `$HOME/.ssh/`. Encrypted keys are decrypted
//! with the jumper's passphrase, falling back to a plain parse so a stale
//! passphrase on an unencrypted key still works.
//!
//! RSA keys negotiate the server's best supported signature hash and fall
//! back through rsa-sha2-512, rsa-sha2-256 and legacy ssh-rsa, so servers
//! that refuse SHA-1 signatures keep working without dropping old ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::ssh_key::{Algorithm, HashAlg};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key};
use tracing::debug;

use crate::error::{Error, Result};
use crate::forward::chain::ClientHandler;

use super::traits::AuthStrategy;

/// Private key file authentication strategy.
pub struct KeyAuth {
    key_path: String,
    passphrase: String,
}

impl std::fmt::Debug for KeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAuth")
            .field("key_path", &self.key_path)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl KeyAuth {
    pub fn new(key_path: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            passphrase: passphrase.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()> {
        let path = resolve_key_path(&self.key_path)?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| Error::auth(format!("read key file failed ({}): {err}", path.display())))?;

        let key = parse_private_key(&raw, &self.passphrase)?;
        let key = Arc::new(key);

        let best = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        let mut last_err: Option<Error> = None;

        for hash in rsa_hash_attempts(&key.algorithm(), best) {
            debug!(hash = ?hash, "trying public key authentication");
            match handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key.clone(), hash))
                .await
            {
                Ok(result) if result.success() => return Ok(()),
                Ok(_) => last_err = Some(Error::auth("key authentication rejected")),
                Err(err) => {
                    last_err = Some(Error::auth(format!("key authentication failed: {err}")))
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::auth("key authentication rejected")))
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

fn parse_private_key(raw: &str, passphrase: &str) -> Result<russh::keys::PrivateKey> {
    if passphrase.is_empty() {
        return decode_secret_key(raw, None)
            .map_err(|err| Error::auth(format!("parse key failed: {err}")));
    }

    match decode_secret_key(raw, Some(passphrase)) {
        Ok(key) => Ok(key),
        Err(pass_err) => match decode_secret_key(raw, None) {
            Ok(key) => Ok(key),
            Err(plain_err) => Err(Error::auth(format!(
                "parse key failed: {pass_err} / {plain_err}"
            ))),
        },
    }
}

/// Signature-hash attempts for a key. RSA keys get the negotiated best hash
/// first and then the full downgrade ladder ending at legacy ssh-rsa; other
/// key types sign with their only algorithm.
pub(crate) fn rsa_hash_attempts(
    algorithm: &Algorithm,
    best: Option<HashAlg>,
) -> Vec<Option<HashAlg>> {
    if !matches!(algorithm, Algorithm::Rsa { .. }) {
        return vec![None];
    }

    let mut attempts = Vec::with_capacity(4);
    let mut push = |hash: Option<HashAlg>| {
        if !attempts.contains(&hash) {
            attempts.push(hash);
        }
    };
    if let Some(hash) = best {
        push(Some(hash));
    }
    push(Some(HashAlg::Sha512));
    push(Some(HashAlg::Sha256));
    push(None);
    attempts
}

/// Resolve a configured key path: expand `~/`, keep absolute paths, and try
/// relative paths as given before looking under `$HOME/.ssh/`.
pub fn resolve_key_path(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(Error::auth("ssh_key auth requires keyPath"));
    }

    if let Some(rest) = trimmed.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::auth("resolve home dir failed"))?;
        return Ok(home.join(rest));
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    if candidate.exists() {
        return Ok(candidate.to_path_buf());
    }

    if let Some(home) = dirs::home_dir() {
        let from_ssh_dir = home.join(".ssh").join(trimmed);
        if from_ssh_dir.exists() {
            return Ok(from_ssh_dir);
        }
    }

    Ok(candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_auth_name() {
        let auth = KeyAuth::new("/path/to/key", "");
        assert_eq!(auth.name(), "key");
    }

    #[test]
    fn test_empty_key_path_rejected() {
        let err = resolve_key_path("   ").expect_err("must fail");
        assert!(err.to_string().contains("requires keyPath"));
    }

    #[test]
    fn test_absolute_path_kept() {
        let path = resolve_key_path("/etc/keys/id_ed25519").expect("resolve");
        assert_eq!(path, PathBuf::from("/etc/keys/id_ed25519"));
    }

    #[test]
    fn test_tilde_expansion() {
        let home = dirs::home_dir().expect("home dir available in test env");
        let path = resolve_key_path("~/keys/id_rsa").expect("resolve");
        assert_eq!(path, home.join("keys/id_rsa"));
    }

    #[test]
    fn test_existing_relative_path_preferred() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = dir.path().join("relative_key");
        std::fs::write(&key, "dummy").expect("write");

        let cwd = std::env::current_dir().expect("cwd");
        std::env::set_current_dir(dir.path()).expect("chdir");
        let resolved = resolve_key_path("relative_key").expect("resolve");
        std::env::set_current_dir(cwd).expect("chdir back");

        assert_eq!(resolved, PathBuf::from("relative_key"));
    }

    #[test]
    fn test_missing_relative_path_returned_as_given() {
        let resolved = resolve_key_path("no_such_key_file_here").expect("resolve");
        assert_eq!(resolved, PathBuf::from("no_such_key_file_here"));
    }

    mod hash_attempts {
        use super::*;

        #[test]
        fn test_rsa_covers_sha512_sha256_and_legacy() {
            let attempts = rsa_hash_attempts(&Algorithm::Rsa { hash: None }, None);
            assert_eq!(
                attempts,
                vec![Some(HashAlg::Sha512), Some(HashAlg::Sha256), None]
            );
        }

        #[test]
        fn test_rsa_best_hash_tried_first_without_duplicates() {
            let attempts =
                rsa_hash_attempts(&Algorithm::Rsa { hash: None }, Some(HashAlg::Sha256));
            assert_eq!(
                attempts,
                vec![Some(HashAlg::Sha256), Some(HashAlg::Sha512), None]
            );
        }

        #[test]
        fn test_non_rsa_unchanged() {
            let attempts = rsa_hash_attempts(&Algorithm::Ed25519, Some(HashAlg::Sha512));
            assert_eq!(attempts, vec![None]);
        }
    }

    #[test]
    fn test_parse_garbage_key_reports_both_attempts() {
        let err = parse_private_key("not a key at all", "passphrase").expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.starts_with("parse key failed:"));
        // Both the passphrase attempt and the plain attempt are reported.
        assert!(msg.contains('/'));
    }

    #[test]
    fn test_parse_garbage_key_without_passphrase() {
        let err = parse_private_key("still not a key", "").expect_err("must fail");
        assert!(err.to_string().starts_with("parse key failed:"));
    }
}
