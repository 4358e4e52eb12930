//! Device session manager
//!
//! Owns the single session to the tag server. The session is created lazily
//! on first use and may be dropped by the server at any time; that is only
//! noticed on the next call. Connect, disconnect and every server-side group
//! mutation run under one lock so the two sync loops never race each other
//! into a half-built session.

use super::{
    BrowseNode, DeviceClient, DeviceConnector, DeviceError, DeviceResult, GroupHandle,
    ItemHandle,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct SessionSlot {
    host: String,
    program_id: String,
    client: Arc<dyn DeviceClient>,
}

impl SessionSlot {
    fn addressed_to(&self, host: &str, program_id: &str) -> bool {
        self.host == host && self.program_id == program_id
    }
}

pub struct DeviceSession {
    connector: Arc<dyn DeviceConnector>,
    slot: Mutex<Option<SessionSlot>>,
}

impl DeviceSession {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            slot: Mutex::new(None),
        }
    }

    /// Make sure a connected session to (host, program_id) exists.
    ///
    /// Never fails: any problem is logged and reported as `false`, which
    /// callers treat as "retry later".
    pub async fn ensure_connected(&self, host: &str, program_id: &str) -> bool {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = slot.as_ref() {
            if !existing.addressed_to(host, program_id) {
                info!(
                    "Device endpoint changed from {}/{} to {}/{}, replacing session",
                    existing.host, existing.program_id, host, program_id
                );
                if let Err(e) = existing.client.disconnect().await {
                    debug!("Disconnect of previous session failed: {}", e);
                }
                *slot = None;
            }
        }

        if slot.is_none() {
            match self.connector.create(host, program_id) {
                Ok(client) => {
                    debug!("Created device session for {}", client.endpoint());
                    *slot = Some(SessionSlot {
                        host: host.to_string(),
                        program_id: program_id.to_string(),
                        client,
                    });
                },
                Err(e) => {
                    warn!(
                        "Failed to create device session {}/{}: {}",
                        host, program_id, e
                    );
                    return false;
                },
            }
        }

        let Some(current) = slot.as_ref() else {
            return false;
        };
        if current.client.is_connected() {
            return true;
        }

        match current.client.connect().await {
            Ok(()) => {
                info!("Connected to device {}", current.client.endpoint());
                true
            },
            Err(e) => {
                warn!(
                    "Failed to connect to device {}: {}",
                    current.client.endpoint(),
                    e
                );
                false
            },
        }
    }

    /// Disconnect if connected. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let slot = self.slot.lock().await;
        let Some(current) = slot.as_ref() else {
            return;
        };
        if !current.client.is_connected() {
            return;
        }
        match current.client.disconnect().await {
            Ok(()) => info!("Disconnected from device {}", current.client.endpoint()),
            Err(e) => warn!(
                "Disconnect from {} reported an error: {}",
                current.client.endpoint(),
                e
            ),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.client.is_connected())
    }

    /// Connected client for I/O that needs no serialization (reads, writes)
    pub async fn client(&self) -> DeviceResult<Arc<dyn DeviceClient>> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(s) if s.client.is_connected() => Ok(Arc::clone(&s.client)),
            _ => Err(DeviceError::NotConnected),
        }
    }

    pub(crate) async fn add_group(&self, name: &str) -> DeviceResult<GroupHandle> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(s) if s.client.is_connected() => s.client.add_group(name).await,
            _ => Err(DeviceError::NotConnected),
        }
    }

    pub(crate) async fn add_item(
        &self,
        group: GroupHandle,
        tag_id: &str,
    ) -> DeviceResult<ItemHandle> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(s) if s.client.is_connected() => s.client.add_item(group, tag_id).await,
            _ => Err(DeviceError::NotConnected),
        }
    }

    /// Best effort: a dead session already invalidated its groups server-side
    pub(crate) async fn remove_group(&self, group: GroupHandle) -> DeviceResult<()> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(s) if s.client.is_connected() => s.client.remove_group(group).await,
            _ => Ok(()),
        }
    }

    /// Discovery path over the same session; connects on demand
    pub async fn browse(
        &self,
        host: &str,
        program_id: &str,
        node_id: Option<&str>,
    ) -> DeviceResult<Vec<BrowseNode>> {
        if !self.ensure_connected(host, program_id).await {
            return Err(DeviceError::ConnectionFailed {
                endpoint: format!("{host}/{program_id}"),
                reason: "session could not be established".to_string(),
            });
        }
        self.client().await?.browse(node_id).await
    }
}
