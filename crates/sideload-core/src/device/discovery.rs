//! Live discovery of reachable devices.
//!
//! A search keeps a deduplicated set of devices keyed by
//! `(udid, connection kind)` and re-emits the whole sorted set every time it
//! changes. The first snapshot reflects the devices attached when the search
//! started; later ones follow the transport's event feed.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::{DeviceEventKind, DeviceEvents, DeviceTransport};
use super::{AttachedDevice, ConnectionKind, LookupMode, SearchMode};
use crate::error::DeviceError;

/// A reachable device as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDevice {
    pub udid: String,
    pub kind: ConnectionKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DeviceKey {
    udid: String,
    kind: ConnectionKind,
}

impl From<&AttachedDevice> for DeviceKey {
    fn from(device: &AttachedDevice) -> Self {
        Self {
            udid: device.udid.clone(),
            kind: device.kind,
        }
    }
}

/// The current device set. Ordered by udid, then network before USB.
#[derive(Debug, Default)]
struct DeviceSet {
    entries: BTreeMap<DeviceKey, String>,
}

impl DeviceSet {
    fn insert(&mut self, key: DeviceKey, name: String) -> bool {
        self.entries.insert(key, name.clone()).as_ref() != Some(&name)
    }

    fn remove(&mut self, key: &DeviceKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn snapshot(&self) -> Vec<ClientDevice> {
        self.entries
            .iter()
            .map(|(key, name)| ClientDevice {
                udid: key.udid.clone(),
                kind: key.kind,
                name: name.clone(),
            })
            .collect()
    }
}

/// Starts device searches against a transport.
#[derive(Clone)]
pub struct DeviceDiscovery {
    transport: Arc<dyn DeviceTransport>,
    label: String,
}

impl DeviceDiscovery {
    /// `label` identifies the host in the lockdown clients used for probing.
    pub fn new(transport: Arc<dyn DeviceTransport>, label: impl Into<String>) -> Self {
        Self {
            transport,
            label: label.into(),
        }
    }

    /// Start searching. The returned stream yields a snapshot immediately and
    /// then one per change; it has no end under normal operation.
    pub async fn search(&self, mode: SearchMode) -> Result<DeviceStream, DeviceError> {
        // Subscribe before enumerating so nothing attached in between is lost;
        // replayed events are absorbed by the set.
        let events = self.transport.subscribe().await?;

        let mut set = DeviceSet::default();
        for device in self.transport.devices().await? {
            if !mode.allows(device.kind) {
                continue;
            }
            match probe(self.transport.as_ref(), &device, &self.label).await {
                Ok(name) => {
                    set.insert(DeviceKey::from(&device), name);
                }
                Err(e) => warn!(udid = %device.udid, kind = %device.kind, "Skipping device: {}", e),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is still alive, so the first snapshot always lands.
        let _ = tx.send(set.snapshot());

        let feed = DeviceFeed {
            transport: Arc::clone(&self.transport),
            label: self.label.clone(),
            mode,
            set,
            tx,
        };
        let task = tokio::spawn(feed.run(events));

        Ok(DeviceStream { rx, task })
    }
}

async fn probe(
    transport: &dyn DeviceTransport,
    device: &AttachedDevice,
    label: &str,
) -> Result<String, DeviceError> {
    let handle = transport
        .open(&device.udid, LookupMode::Only(device.kind))
        .await?;
    let lockdown = handle.lockdown(label, false).await?;
    lockdown.device_name().await
}

struct DeviceFeed {
    transport: Arc<dyn DeviceTransport>,
    label: String,
    mode: SearchMode,
    set: DeviceSet,
    tx: mpsc::UnboundedSender<Vec<ClientDevice>>,
}

impl DeviceFeed {
    async fn run(mut self, mut events: DeviceEvents) {
        while let Some(event) = events.recv().await {
            if !self.mode.allows(event.device.kind) {
                continue;
            }
            let key = DeviceKey::from(&event.device);

            let changed = match event.kind {
                DeviceEventKind::Paired => false,
                DeviceEventKind::Removed => self.set.remove(&key),
                DeviceEventKind::Added => {
                    match probe(self.transport.as_ref(), &event.device, &self.label).await {
                        Ok(name) => self.set.insert(key, name),
                        Err(e) => {
                            debug!(udid = %event.device.udid, "Device probe failed: {}", e);
                            self.set.remove(&key)
                        }
                    }
                }
            };

            if changed && self.tx.send(self.set.snapshot()).is_err() {
                break;
            }
        }
        debug!("Device feed ended");
    }
}

/// Snapshots of the device set. Dropping the stream stops the search.
pub struct DeviceStream {
    rx: mpsc::UnboundedReceiver<Vec<ClientDevice>>,
    task: JoinHandle<()>,
}

impl DeviceStream {
    /// The next snapshot, or `None` if the transport's feed ended.
    pub async fn next_snapshot(&mut self) -> Option<Vec<ClientDevice>> {
        self.rx.recv().await
    }

    /// Wait until a device matching `udid` appears (any device if `None`)
    /// and return the snapshot containing it.
    pub async fn wait_for(&mut self, udid: Option<&str>) -> Option<Vec<ClientDevice>> {
        while let Some(devices) = self.next_snapshot().await {
            let found = match udid {
                Some(udid) => devices.iter().any(|d| d.udid == udid),
                None => !devices.is_empty(),
            };
            if found {
                return Some(devices);
            }
        }
        None
    }
}

impl Stream for DeviceStream {
    type Item = Vec<ClientDevice>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(udid: &str, kind: ConnectionKind) -> DeviceKey {
        DeviceKey {
            udid: udid.to_string(),
            kind,
        }
    }

    #[test]
    fn snapshot_orders_by_udid_then_network_first() {
        let mut set = DeviceSet::default();
        set.insert(key("b", ConnectionKind::Usb), "B".into());
        set.insert(key("a", ConnectionKind::Usb), "A".into());
        set.insert(key("a", ConnectionKind::Network), "A".into());

        let order: Vec<_> = set
            .snapshot()
            .into_iter()
            .map(|d| (d.udid, d.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), ConnectionKind::Network),
                ("a".to_string(), ConnectionKind::Usb),
                ("b".to_string(), ConnectionKind::Usb),
            ]
        );
    }

    #[test]
    fn insert_reports_changes_only() {
        let mut set = DeviceSet::default();
        assert!(set.insert(key("a", ConnectionKind::Usb), "Phone".into()));
        assert!(!set.insert(key("a", ConnectionKind::Usb), "Phone".into()));
        assert!(set.insert(key("a", ConnectionKind::Usb), "Renamed".into()));
    }

    #[test]
    fn remove_reports_changes_only() {
        let mut set = DeviceSet::default();
        assert!(!set.remove(&key("a", ConnectionKind::Usb)));
        set.insert(key("a", ConnectionKind::Usb), "Phone".into());
        assert!(set.remove(&key("a", ConnectionKind::Usb)));
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn same_udid_on_two_transports_is_two_entries() {
        let mut set = DeviceSet::default();
        set.insert(key("a", ConnectionKind::Usb), "Phone".into());
        set.insert(key("a", ConnectionKind::Network), "Phone".into());
        assert_eq!(set.snapshot().len(), 2);

        set.remove(&key("a", ConnectionKind::Usb));
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, ConnectionKind::Network);
    }
}
