//! Tag groups
//!
//! A group is owned by exactly one loop iteration. It caches tag id to item
//! handle so an item is registered on the server at most once per group.

use super::{DeviceError, DeviceResult, DeviceSession, GroupHandle, ItemHandle, ItemReading};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct TagGroup {
    name: String,
    handle: GroupHandle,
    order: Vec<String>,
    items: HashMap<String, ItemHandle>,
}

impl TagGroup {
    /// Create a uniquely named group on the session (`{prefix}-{random}`)
    pub async fn create(session: &DeviceSession, prefix: &str) -> DeviceResult<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{prefix}-{}", &suffix[..8]);
        let handle = session.add_group(&name).await?;
        debug!(group = %name, "Created tag group");
        Ok(Self {
            name,
            handle,
            order: Vec::new(),
            items: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> GroupHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tag ids in registration order
    pub fn tags(&self) -> &[String] {
        &self.order
    }

    pub fn item(&self, tag_id: &str) -> Option<ItemHandle> {
        self.items.get(tag_id).copied()
    }

    /// Existing handle, or register the tag on the server.
    ///
    /// `Ok(None)` when the server rejects this tag; the caller decides
    /// whether that is worth a retry. `Err` means the group itself is
    /// unusable (session lost or group gone server-side).
    pub async fn resolve_or_add(
        &mut self,
        session: &DeviceSession,
        tag_id: &str,
    ) -> DeviceResult<Option<ItemHandle>> {
        if let Some(handle) = self.items.get(tag_id) {
            return Ok(Some(*handle));
        }
        match session.add_item(self.handle, tag_id).await {
            Ok(handle) => {
                self.order.push(tag_id.to_string());
                self.items.insert(tag_id.to_string(), handle);
                debug!(group = %self.name, tag = %tag_id, "Registered item");
                Ok(Some(handle))
            },
            Err(e @ (DeviceError::UnknownTag(_) | DeviceError::Rejected(_))) => {
                warn!(group = %self.name, tag = %tag_id, "Failed to add item: {}", e);
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Register every non-empty tag; returns how many are now in the group.
    /// Stops early when the group becomes unusable.
    pub async fn add_all<'a, I>(&mut self, session: &DeviceSession, tags: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        for tag_id in tags {
            if tag_id.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.resolve_or_add(session, tag_id).await {
                warn!(group = %self.name, "Stopped registering items: {}", e);
                break;
            }
        }
        self.len()
    }

    /// Read all items of the group from the device
    pub async fn read(&self, session: &DeviceSession) -> DeviceResult<Vec<ItemReading>> {
        session.client().await?.read_group(self.handle).await
    }

    /// Tear down. Never fails: errors are logged and swallowed.
    pub async fn remove(self, session: &DeviceSession) {
        match session.remove_group(self.handle).await {
            Ok(()) => debug!(group = %self.name, "Removed tag group"),
            Err(e) => warn!(group = %self.name, "Failed to remove tag group: {}", e),
        }
    }
}
