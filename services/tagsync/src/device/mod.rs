//! Device side: tag server abstraction, session manager, tag groups
//!
//! The server exposes named points through a session/group/item model:
//! a session is opened against (host, program id), groups are created on
//! the session and items (one per tag) are registered inside a group.

mod group;
mod session;
mod sim;

pub use group::TagGroup;
pub use session::DeviceSession;
pub use sim::SimulatedDevice;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    #[error("Invalid group handle: {0}")]
    InvalidGroup(u32),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Server-side group handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupHandle(pub u32);

/// Server-side item handle, scoped to its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemHandle(pub u32);

/// Value carried by a device item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// Real-number view. Text is parsed, booleans are not real numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Float(v) => Some(*v),
            TagValue::Int(v) => Some(*v as f64),
            TagValue::Text(v) => v.trim().parse::<f64>().ok(),
            TagValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_string())
    }
}

/// One item of a group read; `value` is `None` when the server had no value
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReading {
    pub item: ItemHandle,
    pub tag_id: String,
    pub value: Option<TagValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Tag,
}

/// Browse result entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

/// A session against one tag server
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn endpoint(&self) -> String;

    /// May turn false at any time when the server drops the session
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> DeviceResult<()>;

    async fn disconnect(&self) -> DeviceResult<()>;

    async fn add_group(&self, name: &str) -> DeviceResult<GroupHandle>;

    async fn remove_group(&self, group: GroupHandle) -> DeviceResult<()>;

    async fn add_item(&self, group: GroupHandle, tag_id: &str) -> DeviceResult<ItemHandle>;

    /// Read every item of the group from the device (not from a server cache)
    async fn read_group(&self, group: GroupHandle) -> DeviceResult<Vec<ItemReading>>;

    async fn write_item(
        &self,
        group: GroupHandle,
        item: ItemHandle,
        value: &TagValue,
    ) -> DeviceResult<()>;

    /// Children of `node_id`, or of the root when `None`
    async fn browse(&self, node_id: Option<&str>) -> DeviceResult<Vec<BrowseNode>>;
}

/// Creates (unconnected) sessions addressed by host and program id
pub trait DeviceConnector: Send + Sync {
    fn create(&self, host: &str, program_id: &str) -> DeviceResult<Arc<dyn DeviceClient>>;
}
