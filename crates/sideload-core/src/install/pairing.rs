//! Wireless pairing: let the device accept this host over the network with
//! a host identity of its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::recovery::perform_with_recovery;
use super::status::StatusSink;
use crate::device::{DeviceTransport, LockdownClient, PairRecord};
use crate::error::InstallError;

pub const WIRELESS_DOMAIN: &str = "com.apple.mobile.wireless_lockdown";

/// Everything wireless pairing needs from the running install.
pub(crate) struct WirelessPairing<'a> {
    pub transport: &'a Arc<dyn DeviceTransport>,
    pub lockdown: &'a Arc<dyn LockdownClient>,
    pub udid: &'a str,
    pub stage: &'a str,
    pub status: &'a StatusSink,
    pub cancel: &'a CancellationToken,
    pub recovery_interval: Duration,
}

impl WirelessPairing<'_> {
    /// Enable wireless connections and pair a secondary host identity.
    ///
    /// Progress runs from 1/3 (set by the caller) to 1.
    pub async fn run(&self) -> Result<PairRecord, InstallError> {
        let device = |e| InstallError::device(self.stage, e);

        self.lockdown
            .set_value(
                Some(WIRELESS_DOMAIN),
                "WirelessBuddyID",
                Value::String(self.udid.to_string()),
            )
            .await
            .map_err(device)?;
        self.lockdown
            .set_value(Some(WIRELESS_DOMAIN), "EnableWifiConnections", Value::Bool(true))
            .await
            .map_err(device)?;
        self.status.set_progress(Some(2.0 / 3.0));

        let existing = self
            .transport
            .pair_record(self.udid)
            .await
            .map_err(|e| InstallError::PairingFailed(e.to_string()))?;
        let record = existing
            .derive_secondary()
            .map_err(|e| InstallError::PairingFailed(e.to_string()))?;

        let lockdown = Arc::clone(self.lockdown);
        perform_with_recovery(
            self.stage,
            self.status,
            self.cancel,
            self.recovery_interval,
            || {
                let lockdown = Arc::clone(&lockdown);
                let record = record.clone();
                async move { lockdown.pair(&record).await }
            },
        )
        .await?;

        info!(udid = %self.udid, host_id = %record.host_id, "Paired wireless host identity");
        self.status.set_progress(Some(1.0));
        Ok(record)
    }
}

/// Where a device's wireless pair record is kept inside `dir`.
pub fn record_path(dir: &Path, udid: &str) -> PathBuf {
    dir.join(format!("{udid}.json"))
}

/// Store a pair record as `<dir>/<udid>.json`.
pub fn save_record(dir: &Path, udid: &str, record: &PairRecord) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let path = record_path(dir, udid);
    let content =
        serde_json::to_string_pretty(record).context("Failed to serialize pair record")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write pair record: {}", path.display()))?;
    Ok(path)
}

/// Load a previously saved pair record.
pub fn load_record(dir: &Path, udid: &str) -> anyhow::Result<PairRecord> {
    let path = record_path(dir, udid);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read pair record: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse pair record: {}", path.display()))
}
