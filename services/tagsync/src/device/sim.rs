//! In-process tag server
//!
//! Behaves like a tag server for the session/group/item model: it keeps a
//! tag table, hands out group and item handles, records writes and can be
//! told to refuse connections or drop the current session.

use super::{
    BrowseNode, DeviceClient, DeviceConnector, DeviceError, DeviceResult, GroupHandle,
    ItemHandle, ItemReading, NodeKind, TagValue,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug)]
struct SimGroup {
    name: String,
    items: Vec<(ItemHandle, String)>,
}

#[derive(Debug, Default)]
struct SimState {
    endpoint: String,
    connected: bool,
    fail_connect: bool,
    fail_reads: bool,
    fail_writes: bool,
    connect_count: usize,
    tags: BTreeMap<String, Option<TagValue>>,
    groups: HashMap<u32, SimGroup>,
    next_handle: u32,
    writes: Vec<(String, TagValue)>,
}

impl SimState {
    fn ensure_connected(&self) -> DeviceResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn next_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Cloning shares the same server state
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<TagValue>,
    {
        let device = Self::new();
        {
            let mut state = device.state.lock();
            for (tag, value) in tags {
                state.tags.insert(tag.into(), Some(value.into()));
            }
        }
        device
    }

    /// Define or overwrite a tag; `None` makes reads report no value
    pub fn set_value(&self, tag_id: &str, value: Option<TagValue>) {
        self.state.lock().tags.insert(tag_id.to_string(), value);
    }

    pub fn value(&self, tag_id: &str) -> Option<TagValue> {
        self.state.lock().tags.get(tag_id).cloned().flatten()
    }

    pub fn writes(&self) -> Vec<(String, TagValue)> {
        self.state.lock().writes.clone()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.state
            .lock()
            .groups
            .values()
            .map(|g| g.name.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn set_connect_failure(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Writes are refused while set; the session stays up
    pub fn set_write_failure(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Server-side session loss; all groups die with it
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.groups.clear();
    }
}

impl DeviceConnector for SimulatedDevice {
    fn create(&self, host: &str, program_id: &str) -> DeviceResult<Arc<dyn DeviceClient>> {
        let mut state = self.state.lock();
        // a new session starts disconnected
        state.connected = false;
        state.groups.clear();
        state.endpoint = format!("{host}/{program_id}");
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DeviceClient for SimulatedDevice {
    fn endpoint(&self) -> String {
        self.state.lock().endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn connect(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(DeviceError::ConnectionFailed {
                endpoint: state.endpoint.clone(),
                reason: "server unavailable".to_string(),
            });
        }
        state.connected = true;
        state.connect_count += 1;
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.groups.clear();
        Ok(())
    }

    async fn add_group(&self, name: &str) -> DeviceResult<GroupHandle> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        if state.groups.values().any(|g| g.name == name) {
            return Err(DeviceError::Rejected(format!("duplicate group name {name}")));
        }
        let handle = state.next_handle();
        state.groups.insert(
            handle,
            SimGroup {
                name: name.to_string(),
                items: Vec::new(),
            },
        );
        Ok(GroupHandle(handle))
    }

    async fn remove_group(&self, group: GroupHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        state
            .groups
            .remove(&group.0)
            .map(|_| ())
            .ok_or(DeviceError::InvalidGroup(group.0))
    }

    async fn add_item(&self, group: GroupHandle, tag_id: &str) -> DeviceResult<ItemHandle> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        if !state.tags.contains_key(tag_id) {
            return Err(DeviceError::UnknownTag(tag_id.to_string()));
        }
        let handle = ItemHandle(state.next_handle());
        let entry = state
            .groups
            .get_mut(&group.0)
            .ok_or(DeviceError::InvalidGroup(group.0))?;
        entry.items.push((handle, tag_id.to_string()));
        Ok(handle)
    }

    async fn read_group(&self, group: GroupHandle) -> DeviceResult<Vec<ItemReading>> {
        let state = self.state.lock();
        state.ensure_connected()?;
        if state.fail_reads {
            return Err(DeviceError::Rejected("device read failed".to_string()));
        }
        let entry = state
            .groups
            .get(&group.0)
            .ok_or(DeviceError::InvalidGroup(group.0))?;
        Ok(entry
            .items
            .iter()
            .map(|(item, tag_id)| ItemReading {
                item: *item,
                tag_id: tag_id.clone(),
                value: state.tags.get(tag_id).cloned().flatten(),
            })
            .collect())
    }

    async fn write_item(
        &self,
        group: GroupHandle,
        item: ItemHandle,
        value: &TagValue,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        if state.fail_writes {
            return Err(DeviceError::Rejected("device write refused".to_string()));
        }
        let tag_id = state
            .groups
            .get(&group.0)
            .ok_or(DeviceError::InvalidGroup(group.0))?
            .items
            .iter()
            .find(|(h, _)| *h == item)
            .map(|(_, tag)| tag.clone())
            .ok_or_else(|| DeviceError::Rejected(format!("unknown item {}", item.0)))?;
        state.tags.insert(tag_id.clone(), Some(value.clone()));
        state.writes.push((tag_id, value.clone()));
        Ok(())
    }

    async fn browse(&self, node_id: Option<&str>) -> DeviceResult<Vec<BrowseNode>> {
        let state = self.state.lock();
        state.ensure_connected()?;

        let prefix = node_id.filter(|n| !n.is_empty());
        let mut folders = BTreeSet::new();
        let mut nodes = Vec::new();

        for tag in state.tags.keys() {
            let rest = match prefix {
                Some(p) => match tag.strip_prefix(p).and_then(|r| r.strip_prefix('.')) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => tag.as_str(),
            };
            let (name, is_leaf) = match rest.split_once('.') {
                Some((head, _)) => (head, false),
                None => (rest, true),
            };
            let id = match prefix {
                Some(p) => format!("{p}.{name}"),
                None => name.to_string(),
            };
            if is_leaf {
                nodes.push(BrowseNode {
                    id,
                    name: name.to_string(),
                    kind: NodeKind::Tag,
                });
            } else if folders.insert(id.clone()) {
                nodes.push(BrowseNode {
                    id,
                    name: name.to_string(),
                    kind: NodeKind::Folder,
                });
            }
        }

        Ok(nodes)
    }
}
