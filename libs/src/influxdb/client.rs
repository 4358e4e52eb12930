//! `InfluxDB` 2.x client

use super::point::{FieldValue, LinePoint};
use crate::config::StoreSettings;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use influxdb2::{models::Query, Client};
use influxdb2_structmap::value::Value;

/// One row of a Flux result, reduced to the columns the bridge reads
#[derive(Debug, Clone, PartialEq)]
pub struct FluxRow {
    pub measurement: Option<String>,
    pub field: Option<String>,
    pub value: Option<FieldValue>,
    pub time: Option<DateTime<Utc>>,
}

/// `InfluxDB` 2.x client bound to one org/bucket
#[derive(Debug)]
pub struct InfluxClient {
    client: Client,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(settings: &StoreSettings) -> Result<Self> {
        settings.validate()?;
        tracing::debug!(
            "Creating InfluxDB client: url={}, org={}, bucket={}",
            settings.url,
            settings.org,
            settings.bucket
        );
        let client = Client::new(&settings.url, &settings.org, &settings.token);

        Ok(Self {
            client,
            org: settings.org.clone(),
            bucket: settings.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    /// Write points as one line-protocol body
    pub async fn write_points(&self, points: &[LinePoint]) -> Result<()> {
        let body = points
            .iter()
            .filter(|p| p.has_fields())
            .map(LinePoint::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        if body.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            "Writing to InfluxDB: org={}, bucket={}, lines={}",
            self.org,
            self.bucket,
            points.len()
        );

        self.client
            .write_line_protocol(&self.org, &self.bucket, body)
            .await
            .map_err(|e| Error::InfluxDB(format!("Write failed: {e}")))?;

        Ok(())
    }

    /// Run a Flux query and flatten the records
    pub async fn query_rows(&self, flux: &str) -> Result<Vec<FluxRow>> {
        let records = self
            .client
            .query_raw(Some(Query::new(flux.to_string())))
            .await
            .map_err(|e| Error::InfluxDB(format!("Query failed: {e}")))?;

        Ok(records
            .into_iter()
            .map(|record| FluxRow {
                measurement: record.values.get("_measurement").and_then(as_string),
                field: record.values.get("_field").and_then(as_string),
                value: record.values.get("_value").and_then(as_field_value),
                time: record.values.get("_time").and_then(as_time),
            })
            .collect())
    }

    /// Health plus readiness check
    pub async fn ping(&self) -> Result<()> {
        let health = self
            .client
            .health()
            .await
            .map_err(|e| Error::InfluxDB(format!("Health check failed: {e}")))?;
        tracing::debug!("InfluxDB health check: {:?}", health);

        let ready = self
            .client
            .ready()
            .await
            .map_err(|e| Error::InfluxDB(format!("Ready check failed: {e}")))?;
        if !ready {
            return Err(Error::InfluxDB("InfluxDB is not ready".to_string()));
        }
        Ok(())
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Double(v) => Some(FieldValue::Float(v.0)),
        Value::Long(v) => Some(FieldValue::Integer(*v)),
        Value::UnsignedLong(v) => Some(FieldValue::Integer(*v as i64)),
        Value::Bool(v) => Some(FieldValue::Boolean(*v)),
        Value::String(v) => Some(FieldValue::String(v.clone())),
        _ => None,
    }
}

fn as_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::TimeRFC(t) => Some(t.with_timezone(&Utc)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}
