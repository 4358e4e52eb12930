//! Store -> device command actuation
//!
//! Each cycle fetches the latest record per field from the command
//! measurement inside the lookback window. The watermark, not the window,
//! decides what is new: only records strictly newer than the watermark
//! are applied, oldest first, and the watermark follows each applied
//! timestamp. A record whose target tag is rejected by the server stops the
//! cycle and is retried, together with everything newer, on the next one.
//! Losing the group itself ends the cycle with an error and the group is
//! rebuilt.

use super::{sleep_or_cancelled, SyncContext, Watermark};
use crate::device::{DeviceError, TagGroup};
use crate::error::Result;
use crate::store::CommandRecord;
use std::sync::Arc;
use tagsync_libs::influxdb::{now_nanos, LinePoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one actuation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub applied: usize,
    /// At or below the watermark
    pub skipped: usize,
    /// Target tag rejected by the device; retried next cycle
    pub unresolved: usize,
    /// Newer than the watermark but held back behind an unresolved record
    pub deferred: usize,
}

pub struct ActuationLoop {
    ctx: Arc<SyncContext>,
    watermark: Arc<Watermark>,
}

impl ActuationLoop {
    pub fn new(ctx: Arc<SyncContext>, watermark: Arc<Watermark>) -> Self {
        Self { ctx, watermark }
    }

    pub fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }

    /// Run until cancelled. Failures never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let backoff = self.ctx.timing.reconnect_backoff();
        info!("Actuation loop started, watermark {}", self.watermark.get());

        while !cancel.is_cancelled() {
            if !self.ctx.ensure_connected().await {
                if sleep_or_cancelled(&cancel, backoff).await {
                    break;
                }
                continue;
            }

            // starts empty; items are added as commands target them
            let mut group = match TagGroup::create(&self.ctx.session, "write").await {
                Ok(group) => group,
                Err(e) => {
                    warn!("Failed to create write group: {}", e);
                    if sleep_or_cancelled(&cancel, backoff).await {
                        break;
                    }
                    continue;
                },
            };

            let outcome = self.poll(&mut group, &cancel).await;
            group.remove(&self.ctx.session).await;

            if let Err(e) = outcome {
                warn!("Actuation cycle failed: {}", e);
                if sleep_or_cancelled(&cancel, backoff).await {
                    break;
                }
            }
        }

        info!("Actuation loop stopped, watermark {}", self.watermark.get());
    }

    async fn poll(&self, group: &mut TagGroup, cancel: &CancellationToken) -> Result<()> {
        let interval = self.ctx.timing.actuation_interval();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            // an idle write group never touches the device, so a dropped
            // session has to be noticed here
            if !self.ctx.session.is_connected().await {
                return Err(DeviceError::NotConnected.into());
            }
            let report = self.run_cycle(group).await?;
            if report.applied > 0 || report.unresolved > 0 {
                debug!(
                    "Actuation cycle: fetched={}, applied={}, skipped={}, unresolved={}, deferred={}",
                    report.fetched, report.applied, report.skipped, report.unresolved, report.deferred
                );
            }
            if sleep_or_cancelled(cancel, interval).await {
                return Ok(());
            }
        }
    }

    /// Query the command measurement and apply what is new
    pub async fn run_cycle(&self, group: &mut TagGroup) -> Result<CycleReport> {
        let records = self
            .ctx
            .store
            .latest_commands(
                &self.ctx.measurements.command,
                self.ctx.timing.command_lookback(),
            )
            .await?;
        self.apply(group, records).await
    }

    /// Apply records newer than the watermark in ascending time order.
    ///
    /// Records sharing a timestamp form one batch: every target is resolved
    /// before any of them is written, and the watermark moves to the batch
    /// timestamp only after all of its writes succeed. The first batch with
    /// an unresolvable target ends the cycle, so the watermark never passes
    /// a record that was not applied.
    pub async fn apply(
        &self,
        group: &mut TagGroup,
        mut records: Vec<CommandRecord>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            fetched: records.len(),
            ..CycleReport::default()
        };

        records.retain(|r| self.watermark.is_pending(r.timestamp));
        report.skipped = report.fetched - records.len();
        let candidates = records.len();
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.field.cmp(&b.field))
        });

        let session = &self.ctx.session;
        let mut pending = records.into_iter().peekable();
        'batches: while let Some(first) = pending.next() {
            let timestamp = first.timestamp;
            let mut batch = vec![first];
            while let Some(next) = pending.next_if(|r| r.timestamp == timestamp) {
                batch.push(next);
            }

            let mut items = Vec::with_capacity(batch.len());
            for record in &batch {
                let tag_id = self.ctx.config.write_tag_for(&record.field);
                match group.resolve_or_add(session, tag_id).await? {
                    Some(item) => items.push(item),
                    None => {
                        warn!(
                            field = %record.field,
                            tag = %tag_id,
                            "Command target not resolvable, holding commands from {} on",
                            timestamp
                        );
                        report.unresolved += 1;
                        break 'batches;
                    },
                }
            }

            let client = session.client().await?;
            for (record, item) in batch.iter().zip(items) {
                let tag_id = self.ctx.config.write_tag_for(&record.field);
                if let Err(e) = client.write_item(group.handle(), item, &record.value).await {
                    warn!(
                        field = %record.field,
                        tag = %tag_id,
                        "Command write rejected at {}, blocking later commands until it succeeds: {}",
                        record.timestamp,
                        e
                    );
                    return Err(e.into());
                }
                report.applied += 1;
                info!(
                    field = %record.field,
                    tag = %tag_id,
                    "Applied command {} @ {}",
                    record.value,
                    record.timestamp
                );
                self.write_feedback(record).await;
            }
            self.watermark.advance(timestamp);
        }

        report.deferred = candidates - report.applied - report.unresolved;
        Ok(report)
    }

    /// The command is already applied; a lost acknowledgement only gets logged
    async fn write_feedback(&self, record: &CommandRecord) {
        let mut point = LinePoint::new(self.ctx.measurements.feedback.as_str())
            .tag("status", "success")
            .tag("alias", record.field.as_str());
        match record.value.as_f64() {
            Some(number) => point.add_field("value", number),
            None => point.add_field("raw", record.value.to_string()),
        }
        let point = point.timestamp(now_nanos());

        if let Err(e) = self.ctx.store.write_points(&[point]).await {
            warn!(field = %record.field, "Failed to write command feedback: {}", e);
        }
    }
}
