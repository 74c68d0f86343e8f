//! Transport seam: the contracts a device backend has to fulfil.
//!
//! The wire protocols themselves (multiplexer framing, property lists, TLS
//! session setup) are the backend's business. The session layer only needs:
//!
//! - [`DeviceTransport`]: enumerate, watch, and open devices
//! - [`DeviceHandle`]: an opened device that can mint lockdown clients and
//!   service channels
//! - [`LockdownClient`]: the handshake/session client
//! - [`ServiceChannel`]: a message channel to one device service

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{AttachedDevice, ConnectionKind, LookupMode};
use crate::error::DeviceError;

/// What happened to a device on the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Removed,
    /// Paired with the host, but not necessarily ready for use.
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: AttachedDevice,
}

impl DeviceEvent {
    pub fn added(udid: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            kind: DeviceEventKind::Added,
            device: AttachedDevice::new(udid, kind),
        }
    }

    pub fn removed(udid: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            kind: DeviceEventKind::Removed,
            device: AttachedDevice::new(udid, kind),
        }
    }

    pub fn paired(udid: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            kind: DeviceEventKind::Paired,
            device: AttachedDevice::new(udid, kind),
        }
    }
}

/// Live feed of device events.
pub type DeviceEvents = mpsc::UnboundedReceiver<DeviceEvent>;

/// Host-side device multiplexer.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Devices attached right now.
    async fn devices(&self) -> Result<Vec<AttachedDevice>, DeviceError>;

    /// Subscribe to attach/detach events.
    async fn subscribe(&self) -> Result<DeviceEvents, DeviceError>;

    /// Open the device with the given identifier.
    async fn open(
        &self,
        udid: &str,
        lookup: LookupMode,
    ) -> Result<Arc<dyn DeviceHandle>, DeviceError>;

    /// The host's stored pair record for a device.
    async fn pair_record(&self, udid: &str) -> Result<PairRecord, DeviceError>;
}

/// An opened device.
#[async_trait]
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn udid(&self) -> &str;

    /// Create a lockdown client, optionally performing the session handshake.
    async fn lockdown(
        &self,
        label: &str,
        handshake: bool,
    ) -> Result<Arc<dyn LockdownClient>, DeviceError>;

    /// Connect to a service previously started through lockdown.
    async fn connect_service(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<Box<dyn ServiceChannel>, DeviceError>;
}

/// The handshake/session client.
#[async_trait]
pub trait LockdownClient: Send + Sync {
    async fn value(&self, domain: Option<&str>, key: &str) -> Result<Value, DeviceError>;

    async fn set_value(
        &self,
        domain: Option<&str>,
        key: &str,
        value: Value,
    ) -> Result<(), DeviceError>;

    async fn start_service(
        &self,
        name: &str,
        send_escrow_bag: bool,
    ) -> Result<ServiceEndpoint, DeviceError>;

    async fn pair(&self, record: &PairRecord) -> Result<(), DeviceError>;

    async fn device_name(&self) -> Result<String, DeviceError> {
        match self.value(None, "DeviceName").await? {
            Value::String(name) => Ok(name),
            other => Err(DeviceError::Protocol(format!(
                "DeviceName is not a string: {other}"
            ))),
        }
    }
}

/// Where a started service can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    pub ssl: bool,
}

/// A message-oriented connection to one device service.
#[async_trait]
pub trait ServiceChannel: Send {
    async fn send(&mut self, message: Value) -> Result<(), DeviceError>;

    /// Receive the next message, failing with [`DeviceError::Timeout`] when
    /// nothing arrives in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Value, DeviceError>;
}

/// A typed client for one device service.
pub trait ServiceClient: Sized + Send {
    const SERVICE_NAME: &'static str;

    fn from_channel(channel: Box<dyn ServiceChannel>) -> Self;
}

/// Opaque resource returned by a custom locator. Dropping it may invalidate
/// the link to the device.
pub type LocatorHandle = Box<dyn Any + Send + Sync>;

/// Caller-supplied strategy for making a device reachable.
pub trait DeviceLocator: Send + Sync + fmt::Debug {
    fn create_handle(&self) -> Result<LocatorHandle, DeviceError>;
}

/// The host's pairing credentials for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    #[serde(rename = "DeviceCertificate")]
    pub device_certificate: Vec<u8>,
    #[serde(rename = "HostCertificate")]
    pub host_certificate: Vec<u8>,
    #[serde(rename = "RootCertificate")]
    pub root_certificate: Vec<u8>,
    #[serde(rename = "HostID")]
    pub host_id: String,
    #[serde(rename = "SystemBUID")]
    pub system_buid: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PairRecord {
    /// Derive a record for a second host identity on the same device.
    ///
    /// Two hosts sharing a HostID break each other's wireless heartbeats, and
    /// newer devices accept only one HostID per SystemBUID, so both change.
    /// The first byte of the SystemBUID is inverted; the version and variant
    /// bits live in bytes 6 and 8 and are left alone.
    pub fn derive_secondary(&self) -> Result<PairRecord, DeviceError> {
        if self.device_certificate.is_empty()
            || self.host_certificate.is_empty()
            || self.root_certificate.is_empty()
        {
            return Err(DeviceError::Protocol(
                "pair record is missing certificates".into(),
            ));
        }

        let system_buid = Uuid::parse_str(&self.system_buid).map_err(|e| {
            DeviceError::Protocol(format!("invalid SystemBUID {}: {e}", self.system_buid))
        })?;
        let mut bytes = *system_buid.as_bytes();
        bytes[0] = !bytes[0];

        Ok(PairRecord {
            system_buid: Uuid::from_bytes(bytes).to_string().to_uppercase(),
            host_id: Uuid::new_v4().to_string().to_uppercase(),
            ..self.clone()
        })
    }
}
