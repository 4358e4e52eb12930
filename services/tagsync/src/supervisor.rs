//! Synchronization supervisor
//!
//! Owns the device session, the live value cache and at most one running
//! epoch: an ingestion task and an actuation task sharing one cancellation
//! token. Starting while an epoch runs stops it first, so two generations of
//! loops never write through the same session.

use crate::cache::LiveValueCache;
use crate::config::{BridgeConfig, MeasurementSection, SyncSection};
use crate::device::{BrowseNode, DeviceConnector, DeviceResult, DeviceSession, TagValue};
use crate::error::{BridgeError, Result};
use crate::persist::ConfigPersistence;
use crate::store::StoreConnector;
use crate::sync::{ActuationLoop, IngestionLoop, SyncContext, Watermark};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Active,
    Failed(String),
}

impl StartOutcome {
    pub fn is_active(&self) -> bool {
        matches!(self, StartOutcome::Active)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub connected: bool,
    /// Watermark of the current or most recent epoch
    pub watermark: Option<DateTime<Utc>>,
}

struct Epoch {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Supervisor {
    session: Arc<DeviceSession>,
    stores: Arc<dyn StoreConnector>,
    persistence: Arc<dyn ConfigPersistence>,
    cache: Arc<LiveValueCache>,
    timing: SyncSection,
    measurements: MeasurementSection,
    epoch: Mutex<Option<Epoch>>,
    active: AtomicBool,
    watermark: parking_lot::Mutex<Option<Arc<Watermark>>>,
}

impl Supervisor {
    pub fn new(
        device: Arc<dyn DeviceConnector>,
        stores: Arc<dyn StoreConnector>,
        persistence: Arc<dyn ConfigPersistence>,
        timing: SyncSection,
        measurements: MeasurementSection,
    ) -> Self {
        Self {
            session: Arc::new(DeviceSession::new(device)),
            stores,
            persistence,
            cache: Arc::new(LiveValueCache::new()),
            timing,
            measurements,
            epoch: Mutex::new(None),
            active: AtomicBool::new(false),
            watermark: parking_lot::Mutex::new(None),
        }
    }

    /// Start a new epoch with `config`.
    ///
    /// A valid configuration is persisted before anything is connected, so
    /// it survives a failed attempt. The store ping and the device connect
    /// are each bounded by the start timeout.
    pub async fn start(&self, config: BridgeConfig) -> StartOutcome {
        if let Err(e) = config.validate() {
            warn!("Rejected bridge configuration: {}", e);
            return StartOutcome::Failed(e.to_string());
        }
        let to_save = config.clone();
        if let Err(e) = self.with_persistence(move |p| p.save(&to_save)).await {
            error!("Failed to persist bridge configuration: {}", e);
        }

        let mut epoch = self.epoch.lock().await;
        if let Some(previous) = epoch.take() {
            info!("Stopping previous sync epoch before restart");
            self.wind_down(previous).await;
            self.session.disconnect().await;
            tokio::time::sleep(self.timing.restart_grace()).await;
        }
        self.active.store(false, Ordering::SeqCst);
        self.cache.clear_retired();
        let limit = self.timing.start_timeout();

        let store = match self.stores.open(&config.store_settings()) {
            Ok(store) => store,
            Err(e) => {
                warn!("Failed to open time-series store: {}", e);
                return StartOutcome::Failed(format!("store unavailable: {e}"));
            },
        };
        match tokio::time::timeout(limit, store.ping()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!("Time-series store not reachable: {}", e);
                return StartOutcome::Failed(format!("store unavailable: {e}"));
            },
            Err(_) => {
                warn!("Time-series store did not answer within {:?}", limit);
                return StartOutcome::Failed(format!(
                    "store unavailable: no answer within {limit:?}"
                ));
            },
        }

        let connect = self
            .session
            .ensure_connected(&config.device_host, &config.device_program_id);
        if !tokio::time::timeout(limit, connect).await.unwrap_or(false) {
            return StartOutcome::Failed(format!(
                "could not connect to {}/{}",
                config.device_host, config.device_program_id
            ));
        }

        let watermark = Arc::new(Watermark::starting_lookback(
            self.timing.watermark_lookback(),
        ));
        let ctx = Arc::new(SyncContext {
            config: Arc::new(config),
            session: Arc::clone(&self.session),
            store,
            cache: Arc::clone(&self.cache),
            timing: self.timing.clone(),
            measurements: self.measurements.clone(),
        });

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(IngestionLoop::new(Arc::clone(&ctx)).run(cancel.clone())),
            tokio::spawn(ActuationLoop::new(ctx, Arc::clone(&watermark)).run(cancel.clone())),
        ];

        *self.watermark.lock() = Some(watermark);
        *epoch = Some(Epoch { cancel, handles });
        self.active.store(true, Ordering::SeqCst);
        info!("Sync epoch started");
        StartOutcome::Active
    }

    /// Cancel both loops and disconnect. Safe to call repeatedly.
    pub async fn stop(&self) {
        let previous = self.epoch.lock().await.take();
        self.active.store(false, Ordering::SeqCst);
        if let Some(epoch) = previous {
            self.wind_down(epoch).await;
            info!("Sync epoch stopped");
        }
        self.session.disconnect().await;
    }

    /// Cancel and wait up to the restart grace for the loops to finish
    /// their in-flight call; stragglers are aborted.
    async fn wind_down(&self, epoch: Epoch) {
        epoch.cancel.cancel();
        let aborts: Vec<_> = epoch.handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.timing.restart_grace().max(Duration::from_millis(100));

        match tokio::time::timeout(grace, join_all(epoch.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Sync task ended abnormally: {}", e);
                    }
                }
            },
            Err(_) => {
                warn!("Sync tasks did not stop within {:?}, aborting", grace);
                for abort in aborts {
                    abort.abort();
                }
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn live_values(&self) -> HashMap<String, TagValue> {
        self.cache.snapshot()
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            active: self.is_active(),
            connected: self.session.is_connected().await,
            watermark: self.watermark.lock().as_ref().map(|w| w.get()),
        }
    }

    pub async fn stored_config(&self) -> Result<Option<BridgeConfig>> {
        self.with_persistence(|p| p.load()).await
    }

    /// Drop `tag_id` from the stored configuration and evict its live value.
    ///
    /// The running epoch keeps polling with the configuration it was
    /// started with, but the tag stays out of the live cache and out of the
    /// read measurement until the next start.
    pub async fn remove_tag(&self, tag_id: &str) -> Result<Option<BridgeConfig>> {
        if self.cache.retire(tag_id).is_some() {
            debug!(tag = %tag_id, "Evicted live value");
        }

        let tag = tag_id.to_string();
        self.with_persistence(move |p| match p.load()? {
            Some(config) => {
                let next = config.without_tag(&tag);
                p.save(&next)?;
                Ok(Some(next))
            },
            None => Ok(None),
        })
        .await
    }

    /// Persistence does file I/O; keep it off the async workers
    async fn with_persistence<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn ConfigPersistence) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let persistence = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || op(persistence.as_ref()))
            .await
            .map_err(|e| BridgeError::Persistence(format!("persistence task failed: {e}")))?
    }

    pub async fn browse(
        &self,
        host: &str,
        program_id: &str,
        node_id: Option<&str>,
    ) -> DeviceResult<Vec<BrowseNode>> {
        self.session.browse(host, program_id, node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use crate::persist::{JsonFilePersistence, MemoryPersistence};
    use crate::store::{CommandRecord, MemoryConnector, MemoryStore};
    use crate::test_utils::{bridge_config, fast_timing};

    struct Harness {
        device: SimulatedDevice,
        store: Arc<MemoryStore>,
        connector: Arc<MemoryConnector>,
        persistence: Arc<MemoryPersistence>,
        supervisor: Supervisor,
    }

    fn harness(tags: &[(&str, f64)]) -> Harness {
        let device = SimulatedDevice::with_tags(tags.iter().copied());
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&store)));
        let persistence = Arc::new(MemoryPersistence::new());
        let supervisor = Supervisor::new(
            Arc::new(device.clone()),
            connector.clone(),
            persistence.clone(),
            fast_timing(),
            MeasurementSection::default(),
        );
        Harness {
            device,
            store,
            connector,
            persistence,
            supervisor,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_start_runs_both_directions() {
        let h = harness(&[("T1", 42.5), ("PLC.AI.12", 0.0)]);
        let mut config = bridge_config(&["T1"]);
        config
            .write_alias_map
            .insert("setpoint".to_string(), "PLC.AI.12".to_string());
        h.store
            .push_command("device_write", CommandRecord::new("setpoint", 7i64, Utc::now()));

        assert_eq!(h.supervisor.start(config).await, StartOutcome::Active);
        settle().await;

        assert_eq!(h.supervisor.live_values().get("T1"), Some(&TagValue::Float(42.5)));
        assert!(!h.store.points_in("device_read").is_empty());
        assert_eq!(h.device.value("PLC.AI.12"), Some(TagValue::Int(7)));
        assert_eq!(h.store.points_in("device_feedback").len(), 1);

        let status = h.supervisor.status().await;
        assert!(status.active);
        assert!(status.connected);
        assert!(status.watermark.is_some());

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(&[("T1", 1.0)]);
        h.supervisor.stop().await;

        assert!(h.supervisor.start(bridge_config(&["T1"])).await.is_active());
        h.supervisor.stop().await;
        h.supervisor.stop().await;

        let status = h.supervisor.status().await;
        assert!(!status.active);
        assert!(!status.connected);
        assert_eq!(h.device.group_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_replaces_epoch() {
        let h = harness(&[("T1", 1.0), ("T2", 2.0)]);
        assert!(h.supervisor.start(bridge_config(&["T1"])).await.is_active());
        settle().await;

        assert!(h.supervisor.start(bridge_config(&["T2"])).await.is_active());
        settle().await;

        // one read group and one write group from the new epoch only
        assert_eq!(h.device.group_count(), 2);
        assert_eq!(h.persistence.load().unwrap().unwrap().read_tags, vec!["T2"]);

        h.store.clear_points();
        settle().await;
        let latest = h.store.points_in("device_read");
        assert!(latest.iter().all(|p| p.field_value("T1").is_none()));
        assert!(latest.iter().any(|p| p.field_value("T2").is_some()));

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_failed_connection_still_persists() {
        let h = harness(&[("T1", 1.0)]);
        h.device.set_connect_failure(true);

        let outcome = h.supervisor.start(bridge_config(&["T1"])).await;
        assert!(matches!(outcome, StartOutcome::Failed(_)));
        assert!(!h.supervisor.is_active());
        assert!(h.persistence.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_unavailable_fails_start() {
        let h = harness(&[("T1", 1.0)]);
        h.connector.set_open_failure(true);

        let outcome = h.supervisor.start(bridge_config(&["T1"])).await;
        assert!(matches!(outcome, StartOutcome::Failed(reason) if reason.contains("store")));
        assert_eq!(h.device.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_start() {
        let h = harness(&[("T1", 1.0)]);
        h.store.set_unreachable(true);

        let outcome = h.supervisor.start(bridge_config(&["T1"])).await;
        assert!(matches!(outcome, StartOutcome::Failed(_)));
        assert!(!h.supervisor.is_active());
        assert!(h.persistence.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_without_persisting() {
        let h = harness(&[]);
        let mut config = bridge_config(&["T1"]);
        config.store_url = "localhost:8086".to_string();

        assert!(!h.supervisor.start(config).await.is_active());
        assert!(h.persistence.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_tag_evicts_live_value() {
        let h = harness(&[("T1", 1.0), ("T2", 2.0)]);
        let mut config = bridge_config(&["T1", "T2"]);
        config
            .read_alias_map
            .insert("T2".to_string(), "second".to_string());
        assert!(h.supervisor.start(config).await.is_active());
        settle().await;
        h.supervisor.stop().await;
        assert!(h.supervisor.live_values().contains_key("T2"));

        let updated = h.supervisor.remove_tag("T2").await.unwrap().unwrap();
        assert_eq!(updated.read_tags, vec!["T1"]);
        assert!(updated.read_alias_map.is_empty());
        assert!(!h.supervisor.live_values().contains_key("T2"));
        assert!(h.supervisor.live_values().contains_key("T1"));
    }

    #[tokio::test]
    async fn test_removed_tag_stays_evicted_while_running() {
        let h = harness(&[("T1", 1.0), ("T2", 2.0)]);
        assert!(h.supervisor.start(bridge_config(&["T1", "T2"])).await.is_active());
        settle().await;
        assert!(h.supervisor.live_values().contains_key("T2"));

        h.supervisor.remove_tag("T2").await.unwrap();
        assert!(!h.supervisor.live_values().contains_key("T2"));

        h.store.clear_points();
        settle().await;
        assert!(!h.supervisor.live_values().contains_key("T2"));
        assert!(h.supervisor.live_values().contains_key("T1"));
        let points = h.store.points_in("device_read");
        assert!(!points.is_empty());
        assert!(points.iter().all(|p| p.field_value("T2").is_none()));

        // a start that lists the tag again brings it back
        let stored = h.supervisor.stored_config().await.unwrap().unwrap();
        assert_eq!(stored.read_tags, vec!["T1"]);
        assert!(h.supervisor.start(bridge_config(&["T1", "T2"])).await.is_active());
        settle().await;
        assert!(h.supervisor.live_values().contains_key("T2"));

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_remove_tag_without_stored_config() {
        let h = harness(&[]);
        assert!(h.supervisor.remove_tag("T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_store_does_not_block_stop() {
        let h = harness(&[("T1", 1.0)]);
        h.store.set_stalled(true);

        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(h.supervisor.start(bridge_config(&["T1"])), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                h.supervisor.stop().await;
            })
        })
        .await
        .expect("start and stop must both finish");

        assert!(matches!(outcome, StartOutcome::Failed(reason) if reason.contains("store")));
        assert!(!h.supervisor.is_active());
        assert_eq!(h.device.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_file_persistence_through_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(JsonFilePersistence::new(dir.path().join("bridge.json")));
        let device = SimulatedDevice::with_tags([("T1", 1.0), ("T2", 2.0)]);
        let supervisor = Supervisor::new(
            Arc::new(device),
            Arc::new(MemoryConnector::new(Arc::new(MemoryStore::new()))),
            persistence.clone(),
            fast_timing(),
            MeasurementSection::default(),
        );

        assert!(supervisor.start(bridge_config(&["T1", "T2"])).await.is_active());
        supervisor.stop().await;
        supervisor.remove_tag("T1").await.unwrap();

        let on_disk = persistence.load().unwrap().unwrap();
        assert_eq!(on_disk.read_tags, vec!["T2"]);
        assert_eq!(supervisor.stored_config().await.unwrap(), Some(on_disk));
        assert!(dir.path().join("bridge.json.bak").exists());
    }

    #[tokio::test]
    async fn test_browse_uses_session() {
        let h = harness(&[("PLC.AI.12", 1.0)]);
        let nodes = h
            .supervisor
            .browse("localhost", "Sim.Server.1", None)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "PLC");
    }
}
