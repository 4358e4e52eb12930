//! tagsync basic library
//!
//! Store-side plumbing shared by the bridge service:
//! - `InfluxDB` 2.x client and line-protocol points
//! - store connection settings
//! - error type
//! - logging bootstrap

#[cfg(feature = "influxdb")]
pub mod influxdb;

// Common modules
pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::config::StoreSettings;
    pub use crate::error::{Error, Result};

    #[cfg(feature = "influxdb")]
    pub use crate::influxdb::{FieldValue, InfluxClient, LinePoint};
}
