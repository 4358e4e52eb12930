//! Command watermark
//!
//! Timestamp boundary at or below which command records count as applied.
//! Only the actuation loop advances it; the status surface reads it.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct Watermark {
    nanos: AtomicI64,
}

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(to_nanos(at)),
        }
    }

    /// `now - lookback`, tolerating clock drift against the store
    pub fn starting_lookback(lookback: Duration) -> Self {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());
        Self::new(Utc::now() - lookback)
    }

    pub fn get(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::Acquire))
    }

    /// Strictly newer than the watermark
    pub fn is_pending(&self, timestamp: DateTime<Utc>) -> bool {
        to_nanos(timestamp) > self.nanos.load(Ordering::Acquire)
    }

    /// Move forward to `timestamp`; never moves backwards
    pub fn advance(&self, timestamp: DateTime<Utc>) {
        self.nanos.fetch_max(to_nanos(timestamp), Ordering::AcqRel);
    }
}

pub(crate) fn to_nanos(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_nanos_opt().unwrap_or_else(|| {
        if timestamp.timestamp() > 0 {
            i64::MAX
        } else {
            i64::MIN
        }
    })
}
