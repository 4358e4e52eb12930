//! Durable storage of the bridge configuration

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait ConfigPersistence: Send + Sync {
    /// Last saved configuration, `None` when nothing was saved yet
    fn load(&self) -> Result<Option<BridgeConfig>>;

    fn save(&self, config: &BridgeConfig) -> Result<()>;
}

/// Pretty-printed JSON file; the previous version is kept next to it as
/// `<name>.bak`
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        self.path.with_file_name(name)
    }
}

impl ConfigPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<BridgeConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let config = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::Persistence(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(config))
    }

    fn save(&self, config: &BridgeConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json)?;
        debug!("Saved bridge configuration to {}", self.path.display());
        Ok(())
    }
}

/// Process-lifetime storage
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    config: Mutex<Option<BridgeConfig>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<BridgeConfig>> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &BridgeConfig) -> Result<()> {
        *self.config.lock() = Some(config.clone());
        Ok(())
    }
}
