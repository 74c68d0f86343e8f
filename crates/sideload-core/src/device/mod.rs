//! Device identities, lookup modes and the transport seam.
//!
//! Everything that actually speaks to a device lives behind the traits in
//! [`transport`]; discovery builds the live device set on top of them.

pub mod discovery;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use discovery::{ClientDevice, DeviceDiscovery, DeviceStream};
pub use transport::{
    DeviceEvent, DeviceEventKind, DeviceEvents, DeviceHandle, DeviceLocator, DeviceTransport,
    LocatorHandle, LockdownClient, PairRecord, ServiceChannel, ServiceClient, ServiceEndpoint,
};

/// How a device is attached to the host.
///
/// Variant order is the display order of discovery snapshots: network
/// entries sort before USB entries of the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Network,
    Usb,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Network => "network",
            ConnectionKind::Usb => "usb",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in strategy for locating a device when opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupMode {
    /// Only accept the given attachment kind.
    Only(ConnectionKind),
    /// Accept whichever attachment is available.
    Either,
}

impl LookupMode {
    pub fn allows(self, kind: ConnectionKind) -> bool {
        match self {
            LookupMode::Only(only) => only == kind,
            LookupMode::Either => true,
        }
    }
}

/// Which devices a discovery search reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Usb,
    Network,
    #[default]
    All,
}

impl SearchMode {
    pub fn allows(self, kind: ConnectionKind) -> bool {
        match self {
            SearchMode::Usb => kind == ConnectionKind::Usb,
            SearchMode::Network => kind == ConnectionKind::Network,
            SearchMode::All => true,
        }
    }

    /// The lookup mode to use when opening a device found by this search.
    pub fn lookup_mode(self) -> LookupMode {
        match self {
            SearchMode::Usb => LookupMode::Only(ConnectionKind::Usb),
            SearchMode::Network => LookupMode::Only(ConnectionKind::Network),
            SearchMode::All => LookupMode::Either,
        }
    }
}

/// A device the transport currently sees attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachedDevice {
    pub udid: String,
    pub kind: ConnectionKind,
}

impl AttachedDevice {
    pub fn new(udid: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            udid: udid.into(),
            kind,
        }
    }
}
