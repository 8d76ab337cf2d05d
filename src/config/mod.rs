//! Configuration handling.
//!
//! The configuration is a single TOML file holding jumpers and tunnels. The
//! file location is resolved in this order:
//!
//! 1. `LORIS_TUNNEL_CONFIG_PATH` environment variable, if set
//! 2. The current working directory, if writable (portable mode)
//! 3. `$HOME/.loris-tunnel/config.toml`
//!
//! [`Storage`] serializes every read and mutation behind a mutex and persists
//! with an atomic write-to-temp-then-rename, so a crash can never leave a
//! partially written file behind.

pub mod document;
mod storage;

pub use storage::Storage;

use std::path::{Path, PathBuf};

use crate::model::{Jumper, Tunnel, normalize_jumper_ids};

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const CURRENT_CONFIG_VERSION: i64 = 1;

/// In-memory configuration. Snapshots handed out by the store are detached
/// clones; mutating one never affects the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub version: i64,
    pub jumpers: Vec<Jumper>,
    pub tunnels: Vec<Tunnel>,
}

impl Config {
    /// Empty configuration at the current version.
    pub fn new() -> Self {
        Config {
            version: CURRENT_CONFIG_VERSION,
            jumpers: Vec::new(),
            tunnels: Vec::new(),
        }
    }

    /// Ensure stable defaults before save: current version, non-null
    /// collections, deduplicated positive jumper id lists.
    pub fn normalize(&mut self) {
        if self.version <= 0 {
            self.version = CURRENT_CONFIG_VERSION;
        }
        for tunnel in &mut self.tunnels {
            tunnel.jumper_ids = normalize_jumper_ids(&tunnel.jumper_ids);
        }
    }
}

/// Resolve the config file path from the environment or the default location.
pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LORIS_TUNNEL_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path.trim());
    }
    default_config_dir().join(DEFAULT_CONFIG_FILE)
}

/// Default config directory: the current directory when writable (development
/// and portable mode), else `$HOME/.loris-tunnel`.
fn default_config_dir() -> PathBuf {
    if let Ok(cwd) = std::env::current_dir()
        && is_dir_writable(&cwd)
    {
        return cwd;
    }
    match dirs::home_dir() {
        Some(home) => home.join(".loris-tunnel"),
        None => PathBuf::from("."),
    }
}

/// Check writability by actually creating a probe file; permission bits alone
/// are unreliable across platforms.
fn is_dir_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".write_test_{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(file) => {
            drop(file);
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Env-var tests share process state; serialize them.
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    #[test]
    fn test_normalize_fixes_version() {
        let mut cfg = Config {
            version: 0,
            ..Config::default()
        };
        cfg.normalize();
        assert_eq!(cfg.version, CURRENT_CONFIG_VERSION);
    }

    #[test]
    fn test_normalize_dedups_tunnel_jumper_ids() {
        let mut cfg = Config::new();
        cfg.tunnels.push(crate::model::Tunnel {
            jumper_ids: vec![2, 2, -1, 3],
            ..Default::default()
        });
        cfg.normalize();
        assert_eq!(cfg.tunnels[0].jumper_ids, vec![2, 3]);
    }

    #[test]
    fn test_env_override_wins() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe { std::env::set_var("LORIS_TUNNEL_CONFIG_PATH", "/tmp/custom.toml") };
        let path = resolve_config_path();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe { std::env::remove_var("LORIS_TUNNEL_CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe { std::env::set_var("LORIS_TUNNEL_CONFIG_PATH", "   ") };
        let path = resolve_config_path();
        // SAFETY: serialized by ENV_TEST_MUTEX
        unsafe { std::env::remove_var("LORIS_TUNNEL_CONFIG_PATH") };
        assert!(path.ends_with(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_home_fallback_when_cwd_not_writable() {
        // The home fallback itself is deterministic; exercise the path join.
        let home = dirs::home_dir().expect("home dir available in test env");
        let expected = home.join(".loris-tunnel").join(DEFAULT_CONFIG_FILE);
        assert!(expected.ends_with(".loris-tunnel/config.toml"));
    }

    #[test]
    fn test_is_dir_writable_on_temp_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(is_dir_writable(dir.path()));
    }

    #[test]
    fn test_is_dir_writable_on_missing_dir() {
        assert!(!is_dir_writable(Path::new("/definitely/not/a/real/dir")));
    }
}
