//! Keep-alive loop over an established device session.
//!
//! The device sends `{"Command": "Marco", "Interval": <secs>}` and expects
//! `{"Command": "Polo"}` back before it gives up on the session. The handler
//! moves between three states:
//!
//! ```text
//! Connecting --client opened--> Beating --beat failed--> Restarting
//!     ^                                                      |
//!     +-------------------- restart interval ----------------+
//! ```
//!
//! It never ends on its own. Only [`HeartbeatHandler::stop`] (or dropping the
//! handler) ends it, and no beat runs once `stop` has returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HeartbeatSettings;
use crate::device::{ServiceChannel, ServiceClient};
use crate::error::DeviceError;

const MARCO: &str = "Marco";
const POLO: &str = "Polo";

/// One heartbeat message in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    #[serde(rename = "Command")]
    pub command: String,
    /// Seconds the device wants the host to wait before the next beat.
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl HeartbeatPacket {
    pub fn marco(interval: u64) -> Self {
        Self {
            command: MARCO.to_string(),
            interval: Some(interval),
        }
    }

    pub fn polo() -> Self {
        Self {
            command: POLO.to_string(),
            interval: None,
        }
    }
}

/// Typed client for the device's heartbeat service.
pub struct HeartbeatClient {
    channel: Box<dyn ServiceChannel>,
}

impl ServiceClient for HeartbeatClient {
    const SERVICE_NAME: &'static str = "com.apple.mobile.heartbeat";

    fn from_channel(channel: Box<dyn ServiceChannel>) -> Self {
        Self { channel }
    }
}

impl HeartbeatClient {
    /// Wait for the next request from the device.
    ///
    /// The timeout is enforced here as well as passed down, so a channel that
    /// ignores it still cannot stall the loop.
    pub async fn receive(&mut self, timeout: Duration) -> Result<HeartbeatPacket, DeviceError> {
        let message = tokio::time::timeout(timeout, self.channel.receive(timeout))
            .await
            .map_err(|_| DeviceError::Timeout)??;
        serde_json::from_value(message)
            .map_err(|e| DeviceError::Protocol(format!("malformed heartbeat packet: {e}")))
    }

    pub async fn send(&mut self, packet: &HeartbeatPacket) -> Result<(), DeviceError> {
        let message = serde_json::to_value(packet)
            .map_err(|e| DeviceError::Protocol(format!("cannot encode heartbeat packet: {e}")))?;
        self.channel.send(message).await
    }

    /// Answer one request and return how long to wait before the next.
    async fn beat(&mut self, timeout: Duration) -> Result<Duration, DeviceError> {
        let request = self.receive(timeout).await?;
        if request.command != MARCO {
            return Err(DeviceError::Protocol(format!(
                "unexpected heartbeat command {:?}",
                request.command
            )));
        }
        let interval = request
            .interval
            .ok_or_else(|| DeviceError::Protocol("heartbeat request without interval".into()))?;

        self.send(&HeartbeatPacket::polo()).await?;
        Ok(Duration::from_secs(interval))
    }
}

/// Opens heartbeat clients for one session.
#[async_trait]
pub trait HeartbeatSource: Send + Sync + 'static {
    async fn open(&self) -> Result<HeartbeatClient, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No client yet; opening one.
    Connecting,
    /// Answering requests.
    Beating,
    /// A beat failed; waiting before reconnecting.
    Restarting,
    /// Stopped for good.
    Stopped,
}

/// Runs the heartbeat loop on a background task.
pub struct HeartbeatHandler {
    cancel: CancellationToken,
    state: watch::Receiver<HeartbeatState>,
    beats: Arc<AtomicU64>,
}

impl HeartbeatHandler {
    /// Start beating. Must be called from within a Tokio runtime.
    pub fn start(source: Arc<dyn HeartbeatSource>, settings: HeartbeatSettings) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, state) = watch::channel(HeartbeatState::Connecting);
        let beats = Arc::new(AtomicU64::new(0));

        tokio::spawn(run(
            source,
            settings,
            cancel.clone(),
            state_tx,
            Arc::clone(&beats),
        ));

        Self {
            cancel,
            state,
            beats,
        }
    }

    /// Stop the loop. Idempotent and non-blocking, so safe from `Drop`.
    ///
    /// Every await in the loop checks the token first, so once this returns
    /// the task can only wind down.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> HeartbeatState {
        if self.is_stopped() {
            return HeartbeatState::Stopped;
        }
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state.clone()
    }

    /// Number of requests answered so far.
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run(
    source: Arc<dyn HeartbeatSource>,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
    state: watch::Sender<HeartbeatState>,
    beats: Arc<AtomicU64>,
) {
    // Only the handler's very first beat gets the long timeout; the device
    // may still be waking up.
    let mut first_beat = true;

    'session: loop {
        state.send_replace(HeartbeatState::Connecting);

        let mut client = loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                opened = source.open() => opened,
            };
            match opened {
                Ok(client) => break client,
                Err(e) => {
                    debug!("Heartbeat client unavailable: {}", e);
                    if !sleep_or_cancel(&cancel, settings.restart_interval).await {
                        break 'session;
                    }
                }
            }
        };

        state.send_replace(HeartbeatState::Beating);

        loop {
            let timeout = if first_beat {
                settings.initial_timeout
            } else {
                settings.repeated_timeout
            };
            first_beat = false;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                result = client.beat(timeout) => result,
            };

            match result {
                Ok(interval) => {
                    beats.fetch_add(1, Ordering::SeqCst);
                    if !sleep_or_cancel(&cancel, interval).await {
                        break 'session;
                    }
                }
                Err(e) => {
                    warn!("Heartbeat failed: {}", e);
                    state.send_replace(HeartbeatState::Restarting);
                    if !sleep_or_cancel(&cancel, settings.restart_interval).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }
    }

    state.send_replace(HeartbeatState::Stopped);
    info!(beats = beats.load(Ordering::SeqCst), "Heartbeat stopped");
}
