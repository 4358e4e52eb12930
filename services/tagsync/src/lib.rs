//! tagsync - bidirectional bridge between a tag server and InfluxDB
//!
//! Device readings flow into a read measurement; command records written to
//! a command measurement flow back to device tags, each applied once.

pub mod api;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod persist;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use config::{BridgeConfig, ServiceConfig};
pub use error::{BridgeError, Result};
pub use supervisor::{StartOutcome, StatusSnapshot, Supervisor};

pub const SERVICE_NAME: &str = "tagsync";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
