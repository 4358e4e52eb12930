//! Store connection settings

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// `InfluxDB` 2.x connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl StoreSettings {
    pub fn new(
        url: impl Into<String>,
        org: impl Into<String>,
        bucket: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            org: org.into(),
            bucket: bucket.into(),
            token: token.into(),
        }
    }

    /// Token may be empty (unauthenticated local instances)
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("store url is empty".to_string()));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(Error::Config(format!(
                "store url must be http(s): {}",
                self.url
            )));
        }
        if self.org.trim().is_empty() {
            return Err(Error::Config("store org is empty".to_string()));
        }
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("store bucket is empty".to_string()));
        }
        Ok(())
    }
}
