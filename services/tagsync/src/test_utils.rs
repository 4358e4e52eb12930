//! Shared fixtures for unit tests

use crate::cache::LiveValueCache;
use crate::config::{BridgeConfig, MeasurementSection, SyncSection};
use crate::device::{DeviceSession, SimulatedDevice};
use crate::store::{MemoryStore, TimeSeriesStore};
use crate::sync::SyncContext;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn bridge_config(read_tags: &[&str]) -> BridgeConfig {
    BridgeConfig {
        device_host: "localhost".to_string(),
        device_program_id: "Sim.Server.1".to_string(),
        store_url: "http://localhost:8086".to_string(),
        store_token: "test-token".to_string(),
        store_org: "acme".to_string(),
        store_bucket: "plant".to_string(),
        read_tags: read_tags.iter().map(|t| t.to_string()).collect(),
        read_alias_map: HashMap::new(),
        write_alias_map: HashMap::new(),
    }
}

/// Millisecond timings so loop tests finish quickly
pub(crate) fn fast_timing() -> SyncSection {
    SyncSection {
        ingest_interval_ms: 10,
        actuation_interval_ms: 10,
        reconnect_backoff_ms: 20,
        command_lookback_secs: 3600,
        watermark_lookback_secs: 10,
        restart_grace_ms: 10,
        start_timeout_ms: 200,
    }
}

/// Context over an already connected session
pub(crate) async fn sync_context(
    device: &SimulatedDevice,
    store: &Arc<MemoryStore>,
    config: BridgeConfig,
) -> Arc<SyncContext> {
    let session = Arc::new(DeviceSession::new(Arc::new(device.clone())));
    assert!(
        session
            .ensure_connected(&config.device_host, &config.device_program_id)
            .await
    );
    let store: Arc<dyn TimeSeriesStore> = store.clone();
    Arc::new(SyncContext {
        config: Arc::new(config),
        session,
        store,
        cache: Arc::new(LiveValueCache::new()),
        timing: fast_timing(),
        measurements: MeasurementSection::default(),
    })
}
