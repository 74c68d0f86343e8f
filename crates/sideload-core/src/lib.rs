//! Sideload Core Library
//!
//! Device session lifecycle and install orchestration for sideloading apps
//! onto mobile devices over USB or the local network:
//!
//! - [`pool`]: deduplicating, weak-lifetime object pool
//! - [`session`]: pooled connections and the heartbeat that keeps them alive
//! - [`device`]: device discovery and the transport seam backends implement
//! - [`install`]: the staged, cancellable install pipeline
//! - [`config`]: `sideload.toml`

pub mod config;
pub mod device;
pub mod error;
pub mod install;
pub mod pool;
pub mod session;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ConfigStore, SideloadConfig};

    // Errors
    pub use crate::error::{DeviceError, InstallError};

    // Devices
    pub use crate::device::{
        AttachedDevice, ClientDevice, ConnectionKind, DeviceDiscovery, DeviceStream,
        DeviceTransport, LookupMode, SearchMode,
    };

    // Sessions
    pub use crate::session::{
        Connection, ConnectionPool, ConnectionPreferences, HeartbeatSettings, ProgressFn,
        SessionSettings, SharedConnection,
    };

    // Install
    pub use crate::install::{
        Certificate, InstallDelegate, InstallMessage, InstallOrchestrator, InstallServices,
        InstallSettings, PackageInstaller, Provisioner, Signer,
    };
}
