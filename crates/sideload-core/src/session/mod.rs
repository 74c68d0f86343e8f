//! Device sessions: pooled connections and their keep-alive heartbeat.

pub mod connection;
pub mod heartbeat;

use std::time::Duration;

pub use connection::{
    Connection, ConnectionKey, ConnectionPool, ConnectionPreferences, CustomLocator,
    LookupHandler, ProgressFn, SharedConnection,
};
pub use heartbeat::{
    HeartbeatClient, HeartbeatHandler, HeartbeatPacket, HeartbeatSource, HeartbeatState,
};

/// Runtime settings for device sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Host label sent with every lockdown handshake.
    pub label: String,
    pub heartbeat: HeartbeatSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            label: "sideload".to_string(),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}

/// Timing of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Run a heartbeat for every connection. Hosts whose OS already keeps
    /// sessions alive can turn this off.
    pub enabled: bool,
    /// Wait between a failed beat or client open and the next attempt.
    pub restart_interval: Duration,
    /// Receive timeout for the first beat of a handler.
    pub initial_timeout: Duration,
    /// Receive timeout for every later beat.
    pub repeated_timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_interval: Duration::from_secs(1),
            initial_timeout: Duration::from_secs(30),
            repeated_timeout: Duration::from_secs(5),
        }
    }
}
