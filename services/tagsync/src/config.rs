//! Configuration
//!
//! Two records live here:
//! - [`BridgeConfig`]: what to synchronize (device endpoint, store, tags,
//!   aliases). Immutable for one sync epoch, persisted on every start.
//! - [`ServiceConfig`]: how the process runs (intervals, measurement names,
//!   API port), loaded once at startup.

use crate::error::{BridgeError, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tagsync_libs::config::StoreSettings;

/// Synchronization target for one epoch.
///
/// Alias maps are plain JSON objects; when a key appears twice in the
/// submitted document the later entry wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub device_host: String,
    pub device_program_id: String,
    pub store_url: String,
    #[serde(default)]
    pub store_token: String,
    pub store_org: String,
    pub store_bucket: String,
    #[serde(default)]
    pub read_tags: Vec<String>,
    /// device tag -> store field
    #[serde(default)]
    pub read_alias_map: HashMap<String, String>,
    /// store field -> device tag
    #[serde(default)]
    pub write_alias_map: HashMap<String, String>,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_host.trim().is_empty() {
            return Err(BridgeError::Config("deviceHost is empty".to_string()));
        }
        if self.device_program_id.trim().is_empty() {
            return Err(BridgeError::Config("deviceProgramId is empty".to_string()));
        }
        self.store_settings()
            .validate()
            .map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings::new(
            self.store_url.clone(),
            self.store_org.clone(),
            self.store_bucket.clone(),
            self.store_token.clone(),
        )
    }

    /// Non-empty read tags, first occurrence kept
    pub fn read_tags(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.read_tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty() && seen.insert(*t))
            .collect()
    }

    /// Store field name for a device tag (identity when not aliased)
    pub fn read_field_for<'a>(&'a self, tag_id: &'a str) -> &'a str {
        self.read_alias_map
            .get(tag_id)
            .map(String::as_str)
            .filter(|alias| !alias.is_empty())
            .unwrap_or(tag_id)
    }

    /// Device tag for a store field (identity when not aliased)
    pub fn write_tag_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.write_alias_map
            .get(field)
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
            .unwrap_or(field)
    }

    /// Copy with every trace of `tag_id` removed: read tag, its read alias,
    /// and write aliases that target it
    pub fn without_tag(&self, tag_id: &str) -> Self {
        let mut next = self.clone();
        next.read_tags.retain(|t| t != tag_id);
        next.read_alias_map.remove(tag_id);
        next.write_alias_map.retain(|_, target| target != tag_id);
        next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable_api: bool,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where the bridge configuration is persisted
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "tagsync".to_string(),
            enable_api: true,
            api_port: default_api_port(),
            log_level: default_log_level(),
            state_file: default_state_file(),
        }
    }
}

/// Loop timing. The lookback windows are tunables; only the strict
/// watermark comparison is load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    pub ingest_interval_ms: u64,
    pub actuation_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// History scanned per command poll
    pub command_lookback_secs: u64,
    /// Watermark starts this far in the past on every start
    pub watermark_lookback_secs: u64,
    /// Wait after stopping a previous epoch before launching a new one
    pub restart_grace_ms: u64,
    /// Bound on the store ping and the device connect made by a start
    pub start_timeout_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            ingest_interval_ms: 1000,
            actuation_interval_ms: 2000,
            reconnect_backoff_ms: 5000,
            command_lookback_secs: 30 * 60,
            watermark_lookback_secs: 10,
            restart_grace_ms: 500,
            start_timeout_ms: 10_000,
        }
    }
}

impl SyncSection {
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    pub fn actuation_interval(&self) -> Duration {
        Duration::from_millis(self.actuation_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn command_lookback(&self) -> Duration {
        Duration::from_secs(self.command_lookback_secs)
    }

    pub fn watermark_lookback(&self) -> Duration {
        Duration::from_secs(self.watermark_lookback_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSection {
    /// device -> store telemetry
    pub read: String,
    /// store -> device commands
    pub command: String,
    /// command acknowledgements
    pub feedback: String,
}

impl Default for MeasurementSection {
    fn default() -> Self {
        Self {
            read: "device_read".to_string(),
            command: "device_write".to_string(),
            feedback: "device_feedback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    pub driver: DriverKind,
    /// Initial tag table for the simulated driver
    #[serde(default)]
    pub simulated_tags: HashMap<String, f64>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            driver: DriverKind::Simulated,
            simulated_tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub measurements: MeasurementSection,
    #[serde(default)]
    pub device: DeviceSection,
}

impl ServiceConfig {
    pub const DEFAULT_PATH: &'static str = "config/tagsync.yaml";

    /// defaults -> YAML file -> `TAGSYNC_` environment (`__` separates levels)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("TAGSYNC_").split("__"))
            .extract()
            .map_err(|e| BridgeError::Config(format!("Failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(BridgeError::Config("service.name is empty".to_string()));
        }
        let sync = &self.sync;
        if sync.ingest_interval_ms == 0
            || sync.actuation_interval_ms == 0
            || sync.reconnect_backoff_ms == 0
            || sync.start_timeout_ms == 0
        {
            return Err(BridgeError::Config(
                "sync intervals must be greater than zero".to_string(),
            ));
        }
        if sync.command_lookback_secs == 0 {
            return Err(BridgeError::Config(
                "sync.command_lookback_secs must be greater than zero".to_string(),
            ));
        }
        let m = &self.measurements;
        if m.read.trim().is_empty() || m.command.trim().is_empty() || m.feedback.trim().is_empty()
        {
            return Err(BridgeError::Config(
                "measurement names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    8085
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> String {
    "data/bridge.json".to_string()
}
