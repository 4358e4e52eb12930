//! In-process store, used by tests and dry runs

use super::{CommandRecord, StoreConnector, TimeSeriesStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagsync_libs::config::StoreSettings;
use tagsync_libs::influxdb::LinePoint;
use tagsync_libs::Error;

#[derive(Debug, Default)]
pub struct MemoryStore {
    points: Mutex<Vec<LinePoint>>,
    commands: Mutex<Vec<(String, CommandRecord)>>,
    fail_writes: AtomicBool,
    fail_queries: AtomicBool,
    unreachable: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to a command measurement
    pub fn push_command(&self, measurement: &str, record: CommandRecord) {
        self.commands.lock().push((measurement.to_string(), record));
    }

    pub fn points(&self) -> Vec<LinePoint> {
        self.points.lock().clone()
    }

    pub fn points_in(&self, measurement: &str) -> Vec<LinePoint> {
        self.points
            .lock()
            .iter()
            .filter(|p| p.measurement() == measurement)
            .cloned()
            .collect()
    }

    pub fn clear_points(&self) {
        self.points.lock().clear();
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_query_failure(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Ping never answers while set
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_points(&self, points: &[LinePoint]) -> tagsync_libs::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Generic("memory store write failure".to_string()));
        }
        self.points
            .lock()
            .extend(points.iter().filter(|p| p.has_fields()).cloned());
        Ok(())
    }

    /// Per-field last record, fields in first-seen order (not time order)
    async fn latest_commands(
        &self,
        measurement: &str,
        lookback: Duration,
    ) -> tagsync_libs::Result<Vec<CommandRecord>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Error::Generic("memory store query failure".to_string()));
        }
        let window = chrono::Duration::from_std(lookback)
            .map_err(|e| Error::Parse(format!("lookback out of range: {e}")))?;
        let start = Utc::now() - window;

        let mut latest: Vec<CommandRecord> = Vec::new();
        for (m, record) in self.commands.lock().iter() {
            if m != measurement || record.timestamp < start {
                continue;
            }
            match latest.iter_mut().find(|r| r.field == record.field) {
                Some(existing) if existing.timestamp <= record.timestamp => {
                    *existing = record.clone();
                },
                Some(_) => {},
                None => latest.push(record.clone()),
            }
        }
        Ok(latest)
    }

    async fn ping(&self) -> tagsync_libs::Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Generic("memory store unreachable".to_string()));
        }
        Ok(())
    }
}

/// Hands out the same shared [`MemoryStore`] for every epoch
#[derive(Debug, Default)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    fail_open: AtomicBool,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            fail_open: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    pub fn set_open_failure(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

impl StoreConnector for MemoryConnector {
    fn open(&self, settings: &StoreSettings) -> tagsync_libs::Result<Arc<dyn TimeSeriesStore>> {
        settings.validate()?;
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Generic("memory store unavailable".to_string()));
        }
        let store: Arc<dyn TimeSeriesStore> = self.store.clone();
        Ok(store)
    }
}
