//! Synchronization loops
//!
//! Both directions share one [`SyncContext`] per epoch and run as
//! independent tasks. Each loop iteration walks
//! connect -> build group -> poll until failure or cancel -> teardown,
//! sleeping the reconnect backoff after a failure.

mod actuate;
mod ingest;
mod watermark;

pub use actuate::{ActuationLoop, CycleReport};
pub use ingest::IngestionLoop;
pub use watermark::Watermark;

use crate::cache::LiveValueCache;
use crate::config::{BridgeConfig, MeasurementSection, SyncSection};
use crate::device::DeviceSession;
use crate::store::TimeSeriesStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything one epoch's loops share
pub struct SyncContext {
    pub config: Arc<BridgeConfig>,
    pub session: Arc<DeviceSession>,
    pub store: Arc<dyn TimeSeriesStore>,
    pub cache: Arc<LiveValueCache>,
    pub timing: SyncSection,
    pub measurements: MeasurementSection,
}

impl SyncContext {
    pub(crate) async fn ensure_connected(&self) -> bool {
        self.session
            .ensure_connected(&self.config.device_host, &self.config.device_program_id)
            .await
    }
}

/// Sleep unless cancelled first. Returns `true` when cancelled.
pub(crate) async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => cancel.is_cancelled(),
    }
}
