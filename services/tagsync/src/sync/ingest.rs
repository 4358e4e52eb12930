//! Device -> store telemetry

use super::{sleep_or_cancelled, SyncContext};
use crate::device::TagGroup;
use crate::error::Result;
use std::sync::Arc;
use tagsync_libs::influxdb::{now_nanos, LinePoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IngestionLoop {
    ctx: Arc<SyncContext>,
}

impl IngestionLoop {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Run until cancelled. Failures never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let backoff = self.ctx.timing.reconnect_backoff();
        info!("Ingestion loop started");

        while !cancel.is_cancelled() {
            if !self.ctx.ensure_connected().await {
                if sleep_or_cancelled(&cancel, backoff).await {
                    break;
                }
                continue;
            }

            let mut group = match TagGroup::create(&self.ctx.session, "read").await {
                Ok(group) => group,
                Err(e) => {
                    warn!("Failed to create read group: {}", e);
                    if sleep_or_cancelled(&cancel, backoff).await {
                        break;
                    }
                    continue;
                },
            };

            let registered = group
                .add_all(&self.ctx.session, self.ctx.config.read_tags())
                .await;

            let outcome = if registered == 0 {
                debug!("No read tags registered, idling");
                sleep_or_cancelled(&cancel, backoff).await;
                Ok(())
            } else {
                info!(group = %group.name(), "Polling {} read tags", registered);
                self.poll(&group, &cancel).await
            };

            group.remove(&self.ctx.session).await;

            if let Err(e) = outcome {
                warn!("Ingestion cycle failed: {}", e);
                if sleep_or_cancelled(&cancel, backoff).await {
                    break;
                }
            }
        }

        info!("Ingestion loop stopped");
    }

    async fn poll(&self, group: &TagGroup, cancel: &CancellationToken) -> Result<()> {
        let interval = self.ctx.timing.ingest_interval();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.run_cycle(group).await?;
            if sleep_or_cancelled(cancel, interval).await {
                return Ok(());
            }
        }
    }

    /// One read of the group: refresh the live cache and write one point.
    /// Returns the number of fields written.
    pub async fn run_cycle(&self, group: &TagGroup) -> Result<usize> {
        let config = &self.ctx.config;
        let readings = group.read(&self.ctx.session).await?;

        let mut point = LinePoint::new(self.ctx.measurements.read.as_str())
            .tag("bucket", config.store_bucket.as_str())
            .tag("org", config.store_org.as_str());

        for reading in readings {
            let Some(value) = reading.value else {
                continue;
            };
            if self.ctx.cache.is_retired(&reading.tag_id) {
                continue;
            }
            self.ctx.cache.update(&reading.tag_id, value.clone());

            let field = config.read_field_for(&reading.tag_id);
            match value.as_f64() {
                Some(number) => point.add_field(field, number),
                None => debug!(tag = %reading.tag_id, "Skipping non-numeric value {}", value),
            }
        }

        let written = point.fields().len();
        if written == 0 {
            return Ok(0);
        }

        let point = point.timestamp(now_nanos());
        self.ctx.store.write_points(&[point]).await?;
        debug!("Wrote {} fields to {}", written, self.ctx.measurements.read);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedDevice, TagValue};
    use crate::store::MemoryStore;
    use crate::test_utils::{bridge_config, sync_context};
    use tagsync_libs::influxdb::FieldValue;

    #[tokio::test]
    async fn test_single_cycle_writes_point_and_cache() {
        let device = SimulatedDevice::with_tags([("T1", 42.5)]);
        let store = Arc::new(MemoryStore::new());
        let ctx = sync_context(&device, &store, bridge_config(&["T1"])).await;

        let mut group = TagGroup::create(&ctx.session, "read").await.unwrap();
        group.add_all(&ctx.session, ctx.config.read_tags()).await;
        let ingest = IngestionLoop::new(ctx.clone());

        assert_eq!(ingest.run_cycle(&group).await.unwrap(), 1);

        let points = store.points_in("device_read");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].field_value("T1"), Some(&FieldValue::Float(42.5)));
        assert_eq!(points[0].tag_value("bucket"), Some("plant"));
        assert_eq!(points[0].tag_value("org"), Some("acme"));
        assert!(points[0].timestamp_nanos().is_some());
        assert_eq!(ctx.cache.snapshot().get("T1"), Some(&TagValue::Float(42.5)));
    }

    #[tokio::test]
    async fn test_alias_and_skips() {
        let device = SimulatedDevice::with_tags([("PLC.AI.12", 3.0), ("T2", 1.0)]);
        device.set_value("T3", Some(TagValue::Text("open".to_string())));
        device.set_value("T4", None);
        let store = Arc::new(MemoryStore::new());
        let mut config = bridge_config(&["PLC.AI.12", "T2", "T3", "T4"]);
        config
            .read_alias_map
            .insert("PLC.AI.12".to_string(), "flow".to_string());
        let ctx = sync_context(&device, &store, config).await;

        let mut group = TagGroup::create(&ctx.session, "read").await.unwrap();
        group.add_all(&ctx.session, ctx.config.read_tags()).await;

        let written = IngestionLoop::new(ctx.clone()).run_cycle(&group).await.unwrap();
        assert_eq!(written, 2);

        let point = &store.points_in("device_read")[0];
        assert_eq!(point.field_value("flow"), Some(&FieldValue::Float(3.0)));
        assert!(point.field_value("PLC.AI.12").is_none());
        assert_eq!(point.field_value("T2"), Some(&FieldValue::Float(1.0)));
        assert!(point.field_value("T3").is_none());

        // non-numeric values still reach the live cache, null values do not
        let live = ctx.cache.snapshot();
        assert_eq!(live.get("T3"), Some(&TagValue::Text("open".to_string())));
        assert!(!live.contains_key("T4"));
    }

    #[tokio::test]
    async fn test_retired_tag_is_neither_cached_nor_written() {
        let device = SimulatedDevice::with_tags([("T1", 1.0), ("T2", 2.0)]);
        let store = Arc::new(MemoryStore::new());
        let ctx = sync_context(&device, &store, bridge_config(&["T1", "T2"])).await;

        let mut group = TagGroup::create(&ctx.session, "read").await.unwrap();
        group.add_all(&ctx.session, ctx.config.read_tags()).await;
        let ingest = IngestionLoop::new(ctx.clone());
        ingest.run_cycle(&group).await.unwrap();
        assert!(ctx.cache.get("T2").is_some());

        ctx.cache.retire("T2");
        store.clear_points();
        assert_eq!(ingest.run_cycle(&group).await.unwrap(), 1);

        assert!(ctx.cache.get("T2").is_none());
        let point = &store.points_in("device_read")[0];
        assert!(point.field_value("T2").is_none());
        assert_eq!(point.field_value("T1"), Some(&FieldValue::Float(1.0)));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_error() {
        let device = SimulatedDevice::with_tags([("T1", 1.0)]);
        let store = Arc::new(MemoryStore::new());
        store.set_write_failure(true);
        let ctx = sync_context(&device, &store, bridge_config(&["T1"])).await;

        let mut group = TagGroup::create(&ctx.session, "read").await.unwrap();
        group.add_all(&ctx.session, ctx.config.read_tags()).await;
        assert!(IngestionLoop::new(ctx).run_cycle(&group).await.is_err());
    }

    #[tokio::test]
    async fn test_loop_recovers_from_connection_loss() {
        let device = SimulatedDevice::with_tags([("T1", 1.0)]);
        let store = Arc::new(MemoryStore::new());
        let ctx = sync_context(&device, &store, bridge_config(&["T1"])).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(IngestionLoop::new(ctx.clone()).run(cancel.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(!store.points_in("device_read").is_empty());

        device.drop_connection();
        device.set_value("T1", Some(TagValue::Float(2.0)));
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        assert!(device.connect_count() >= 2);
        assert_eq!(ctx.cache.get("T1"), Some(TagValue::Float(2.0)));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        // teardown released the read group
        assert_eq!(device.group_count(), 0);
    }
}
