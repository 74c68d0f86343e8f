//! Contracts of the services an install run drives.
//!
//! Provisioning, signing and package delivery are external; the orchestrator
//! only sequences them, merges their progress, and handles cancellation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::archive;
use crate::session::{Connection, ProgressFn};

/// A developer signing certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial_number: String,
    pub name: String,
    pub expires: DateTime<Utc>,
}

/// Certificate plus private key used to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub certificate: Certificate,
    pub private_key: Vec<u8>,
}

/// Provisioning data for one bundle inside the app (the app itself or an
/// extension).
#[derive(Debug, Clone, PartialEq)]
pub struct TargetProvisioning {
    /// Bundle directory relative to the main `.app` (empty for the app).
    pub bundle_path: PathBuf,
    pub bundle_id: String,
    pub entitlements: serde_json::Value,
    /// Raw provisioning profile, written as `embedded.mobileprovision`.
    pub profile: Vec<u8>,
}

/// Result of provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    pub identity: SigningIdentity,
    pub targets: Vec<TargetProvisioning>,
    /// The main app's (possibly rewritten) bundle identifier.
    pub bundle_id: String,
}

/// The device being installed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    pub udid: String,
    pub name: String,
}

/// A package copied onto the device, ready to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPackage {
    /// Location on the device's filesystem.
    pub location: String,
}

/// Status text and optional fraction reported by the device installer.
pub type InstallStatusFn = Arc<dyn Fn(String, Option<f64>) + Send + Sync>;

/// Messages the user has to act on, shown alongside the stage display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMessage {
    /// Tap "Trust" on the device.
    PairDevice,
    /// Unlock the device.
    UnlockDevice,
}

impl InstallMessage {
    pub fn text(self) -> &'static str {
        match self {
            InstallMessage::PairDevice => {
                "Please tap 'Trust' on your device and enter your passcode if asked"
            }
            InstallMessage::UnlockDevice => "Please unlock your device",
        }
    }
}

/// Receives everything the user should see during an install.
#[async_trait]
pub trait InstallDelegate: Send + Sync {
    /// Show (or clear, with `None`) a message the user must act on.
    fn set_presented_message(&self, message: Option<InstallMessage>);

    /// Stage changed or its progress moved. `None` is indeterminate.
    fn on_stage_progress(&self, stage: &str, progress: Option<f64>);

    /// Whether the listed certificates may be revoked.
    async fn confirm_revocation(&self, _certificates: &[Certificate]) -> bool {
        true
    }

    async fn unarchive(
        &self,
        archive: &Path,
        dest: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        archive::unarchive(archive, dest, progress, cancel).await
    }

    async fn archive(
        &self,
        directory: &Path,
        output: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        archive::archive(directory, output, progress, cancel).await
    }
}

/// Asks the delegate about certificate revocation at most once per run.
pub struct RevocationGate {
    delegate: Arc<dyn InstallDelegate>,
    decision: OnceCell<bool>,
}

impl RevocationGate {
    pub fn new(delegate: Arc<dyn InstallDelegate>) -> Self {
        Self {
            delegate,
            decision: OnceCell::new(),
        }
    }

    /// Ask for consent. Later calls return the first answer without asking.
    pub async fn confirm(&self, certificates: &[Certificate]) -> bool {
        *self
            .decision
            .get_or_init(|| async {
                info!(count = certificates.len(), "Asking to revoke certificates");
                self.delegate.confirm_revocation(certificates).await
            })
            .await
    }

    /// Whether the user refused revocation.
    pub fn declined(&self) -> bool {
        self.decision.get() == Some(&false)
    }
}

/// Issues or refreshes the signing identity and per-target profiles.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision `app` for `device`. When existing certificates must be
    /// revoked, ask `gate` first and give up if it refuses.
    async fn provision(
        &self,
        app: &Path,
        device: &TargetDevice,
        gate: &RevocationGate,
        progress: ProgressFn,
    ) -> anyhow::Result<Provisioned>;
}

/// Signs an app bundle in place.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(
        &self,
        app: &Path,
        identity: &SigningIdentity,
        targets: &[TargetProvisioning],
        progress: ProgressFn,
    ) -> anyhow::Result<()>;
}

/// Copies packages onto a device and installs them.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn upload(
        &self,
        connection: &Connection,
        package: &Path,
        progress: ProgressFn,
    ) -> anyhow::Result<UploadedPackage>;

    async fn install(
        &self,
        connection: &Connection,
        package: &UploadedPackage,
        status: InstallStatusFn,
    ) -> anyhow::Result<()>;

    /// Remove an uploaded package. Called after installing, success or not.
    async fn discard(
        &self,
        connection: &Connection,
        package: &UploadedPackage,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate {
        answer: bool,
        asked: AtomicUsize,
    }

    #[async_trait]
    impl InstallDelegate for CountingDelegate {
        fn set_presented_message(&self, _message: Option<InstallMessage>) {}
        fn on_stage_progress(&self, _stage: &str, _progress: Option<f64>) {}

        async fn confirm_revocation(&self, _certificates: &[Certificate]) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    struct SilentDelegate;

    #[async_trait]
    impl InstallDelegate for SilentDelegate {
        fn set_presented_message(&self, _message: Option<InstallMessage>) {}
        fn on_stage_progress(&self, _stage: &str, _progress: Option<f64>) {}
    }

    #[tokio::test]
    async fn gate_asks_once() {
        let delegate = Arc::new(CountingDelegate {
            answer: false,
            asked: AtomicUsize::new(0),
        });
        let gate = RevocationGate::new(delegate.clone());

        assert!(!gate.declined());
        assert!(!gate.confirm(&[]).await);
        assert!(!gate.confirm(&[]).await);
        assert!(gate.declined());
        assert_eq!(delegate.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_confirmation_accepts() {
        let gate = RevocationGate::new(Arc::new(SilentDelegate));
        assert!(gate.confirm(&[]).await);
        assert!(!gate.declined());
    }
}
