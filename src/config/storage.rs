//! Mutex-serialized TOML storage with atomic persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

use super::document::ConfigDocument;
use super::{Config, resolve_config_path};

/// Configuration store. Every load and mutation runs under one mutex so
/// config updates are linearizable within the process; the write path goes
/// through a temp file and rename so readers never observe a torn file.
pub struct Storage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(Error::storage("config path is empty"));
        }
        Ok(Storage {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Store at the resolved default location.
    pub fn open_default() -> Result<Self> {
        Storage::new(resolve_config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, creating a default file when missing or blank.
    /// The returned snapshot is detached from the store.
    pub fn load(&self) -> Result<Config> {
        let _guard = self.lock.lock().expect("storage mutex poisoned");
        self.load_locked()
    }

    /// Load, apply `mutator`, normalize and persist, all in one critical
    /// section. A mutator error aborts the update with nothing written.
    pub fn update(&self, mutator: impl FnOnce(&mut Config) -> Result<()>) -> Result<Config> {
        let _guard = self.lock.lock().expect("storage mutex poisoned");
        let mut cfg = self.load_locked()?;
        mutator(&mut cfg)?;
        cfg.normalize();
        self.save_locked(&cfg)?;
        Ok(cfg)
    }

    fn load_locked(&self) -> Result<Config> {
        self.ensure_parent_dir()?;

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Config::new();
                self.save_locked(&cfg)?;
                debug!(path = %self.path.display(), "created default config");
                return Ok(cfg);
            }
            Err(err) => return Err(err.into()),
        };

        if raw.trim().is_empty() {
            let cfg = Config::new();
            self.save_locked(&cfg)?;
            return Ok(cfg);
        }

        let doc: ConfigDocument =
            toml::from_str(&raw).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        let mut cfg = Config::from(doc);
        cfg.normalize();
        Ok(cfg)
    }

    fn save_locked(&self, cfg: &Config) -> Result<()> {
        self.ensure_parent_dir()?;

        let mut cfg = cfg.clone();
        cfg.normalize();
        let data = toml::to_string(&ConfigDocument::from(&cfg))
            .map_err(|err| Error::storage(format!("encode config failed: {err}")))?;

        let tmp_path = self.path.with_extension("toml.tmp");
        fs::write(&tmp_path, data.as_bytes())?;
        set_config_file_mode(&tmp_path)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_config_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_config_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Jumper, Tunnel};

    fn temp_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path().join("config.toml")).expect("storage");
        (dir, storage)
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(Storage::new("").is_err());
    }

    #[test]
    fn test_initial_load_creates_default() {
        let (_dir, storage) = temp_storage();
        let cfg = storage.load().expect("load");
        assert_eq!(cfg.version, 1);
        assert!(cfg.jumpers.is_empty());
        assert!(cfg.tunnels.is_empty());
        assert!(storage.path().exists());
    }

    #[test]
    fn test_update_then_load_round_trips() {
        let (_dir, storage) = temp_storage();
        storage
            .update(|cfg| {
                cfg.jumpers.push(Jumper {
                    id: 1,
                    name: "Test Jumper".to_string(),
                    host: "localhost".to_string(),
                    ..Default::default()
                });
                Ok(())
            })
            .expect("update");

        let cfg = storage.load().expect("load");
        assert_eq!(cfg.jumpers.len(), 1);
        assert_eq!(cfg.jumpers[0].name, "Test Jumper");

        let content = fs::read_to_string(storage.path()).expect("read file");
        assert!(content.contains("[[jumpers]]"));
        assert!(content.contains("name = \"Test Jumper\""));
    }

    #[test]
    fn test_save_load_equals_normalized_config() {
        let (_dir, storage) = temp_storage();
        let saved = storage
            .update(|cfg| {
                cfg.tunnels.push(Tunnel {
                    id: 1,
                    name: "t".to_string(),
                    mode: "local".to_string(),
                    jumper_ids: vec![2, 2, 0, 1],
                    local_port: 8080,
                    remote_host: "example.com".to_string(),
                    remote_port: 80,
                    status: "stopped".to_string(),
                    ..Default::default()
                });
                Ok(())
            })
            .expect("update");

        // Normalization already applied to the returned snapshot.
        assert_eq!(saved.tunnels[0].jumper_ids, vec![2, 1]);

        let loaded = storage.load().expect("load");
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_mutator_error_leaves_file_unchanged() {
        let (_dir, storage) = temp_storage();
        storage
            .update(|cfg| {
                cfg.jumpers.push(Jumper {
                    id: 1,
                    name: "keep".to_string(),
                    ..Default::default()
                });
                Ok(())
            })
            .expect("seed");
        let before = fs::read_to_string(storage.path()).expect("read");

        let result = storage.update(|cfg| {
            cfg.jumpers.clear();
            Err(Error::validation("rejected"))
        });
        assert!(result.is_err());

        let after = fs::read_to_string(storage.path()).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn test_blank_file_replaced_with_default() {
        let (_dir, storage) = temp_storage();
        fs::write(storage.path(), "  \n\t ").expect("write blank");
        let cfg = storage.load().expect("load");
        assert_eq!(cfg.version, 1);
        let content = fs::read_to_string(storage.path()).expect("read");
        assert!(content.contains("version = 1"));
    }

    #[test]
    fn test_invalid_toml_is_typed_error() {
        let (_dir, storage) = temp_storage();
        fs::write(storage.path(), "version = [not toml").expect("write garbage");
        match storage.load() {
            Err(Error::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_parent_dir_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b").join("config.toml");
        let storage = Storage::new(&nested).expect("storage");
        storage.load().expect("load");
        assert!(nested.exists());
    }

    #[test]
    fn test_snapshots_are_detached() {
        let (_dir, storage) = temp_storage();
        let mut cfg = storage.load().expect("load");
        cfg.jumpers.push(Jumper::default());
        let again = storage.load().expect("load");
        assert!(again.jumpers.is_empty());
    }
}
