//! `InfluxDB` client module
//!
//! - HTTP client (writes and Flux queries)
//! - line-protocol points

mod client;
mod point;

pub use client::{FluxRow, InfluxClient};
pub use point::{FieldValue, LinePoint};

/// Current time in nanoseconds since the epoch
pub fn now_nanos() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}
