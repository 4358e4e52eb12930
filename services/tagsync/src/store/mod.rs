//! Time-series store seam
//!
//! The loops only see [`TimeSeriesStore`]; [`InfluxStore`] backs it with
//! `InfluxDB` 2.x; [`MemoryStore`] keeps everything in process.

mod memory;

pub use memory::{MemoryConnector, MemoryStore};

use crate::device::TagValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tagsync_libs::config::StoreSettings;
use tagsync_libs::influxdb::{FieldValue, FluxRow, InfluxClient, LinePoint};
use tracing::debug;

/// Latest value of one field on the command measurement
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub field: String,
    pub value: TagValue,
    pub timestamp: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(field: impl Into<String>, value: impl Into<TagValue>, timestamp: DateTime<Utc>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            timestamp,
        }
    }
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_points(&self, points: &[LinePoint]) -> tagsync_libs::Result<()>;

    /// Most recent record per field of `measurement` within `lookback`
    async fn latest_commands(
        &self,
        measurement: &str,
        lookback: Duration,
    ) -> tagsync_libs::Result<Vec<CommandRecord>>;

    /// Reachability check made once when an epoch starts
    async fn ping(&self) -> tagsync_libs::Result<()> {
        Ok(())
    }
}

/// Opens a store for one sync epoch
pub trait StoreConnector: Send + Sync {
    fn open(&self, settings: &StoreSettings) -> tagsync_libs::Result<Arc<dyn TimeSeriesStore>>;
}

pub struct InfluxStore {
    client: InfluxClient,
}

impl InfluxStore {
    pub fn new(settings: &StoreSettings) -> tagsync_libs::Result<Self> {
        Ok(Self {
            client: InfluxClient::new(settings)?,
        })
    }

    fn command_query(&self, measurement: &str, lookback: Duration) -> String {
        format!(
            r#"from(bucket: "{bucket}")
  |> range(start: -{secs}s)
  |> filter(fn: (r) => r._measurement == "{measurement}")
  |> last()"#,
            bucket = escape_flux(self.client.bucket()),
            secs = lookback.as_secs().max(1),
            measurement = escape_flux(measurement),
        )
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_points(&self, points: &[LinePoint]) -> tagsync_libs::Result<()> {
        self.client.write_points(points).await
    }

    async fn latest_commands(
        &self,
        measurement: &str,
        lookback: Duration,
    ) -> tagsync_libs::Result<Vec<CommandRecord>> {
        let rows = self
            .client
            .query_rows(&self.command_query(measurement, lookback))
            .await?;
        let total = rows.len();
        let records: Vec<_> = rows.into_iter().filter_map(row_to_command).collect();
        if records.len() != total {
            debug!(
                "Dropped {} command rows without field, value or time",
                total - records.len()
            );
        }
        Ok(records)
    }

    async fn ping(&self) -> tagsync_libs::Result<()> {
        self.client.ping().await
    }
}

pub struct InfluxConnector;

impl StoreConnector for InfluxConnector {
    fn open(&self, settings: &StoreSettings) -> tagsync_libs::Result<Arc<dyn TimeSeriesStore>> {
        Ok(Arc::new(InfluxStore::new(settings)?))
    }
}

fn row_to_command(row: FluxRow) -> Option<CommandRecord> {
    let value = match row.value? {
        FieldValue::Float(v) => TagValue::Float(v),
        FieldValue::Integer(v) => TagValue::Int(v),
        FieldValue::Boolean(v) => TagValue::Bool(v),
        FieldValue::String(v) => TagValue::Text(v),
    };
    Some(CommandRecord {
        field: row.field?,
        value,
        timestamp: row.time?,
    })
}

fn escape_flux(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_query_shape() {
        let settings = StoreSettings::new("http://localhost:8086", "acme", "plant", "t");
        let store = InfluxStore::new(&settings).unwrap();
        let flux = store.command_query("device_write", Duration::from_secs(1800));
        assert!(flux.contains(r#"from(bucket: "plant")"#));
        assert!(flux.contains("range(start: -1800s)"));
        assert!(flux.contains(r#"r._measurement == "device_write""#));
        assert!(flux.trim_end().ends_with("|> last()"));
    }

    #[test]
    fn test_row_conversion() {
        let time = Utc::now();
        let row = FluxRow {
            measurement: Some("device_write".to_string()),
            field: Some("setpoint".to_string()),
            value: Some(FieldValue::Float(7.0)),
            time: Some(time),
        };
        assert_eq!(
            row_to_command(row),
            Some(CommandRecord::new("setpoint", 7.0, time))
        );

        let incomplete = FluxRow {
            measurement: None,
            field: None,
            value: Some(FieldValue::Integer(1)),
            time: Some(time),
        };
        assert!(row_to_command(incomplete).is_none());
    }
}
