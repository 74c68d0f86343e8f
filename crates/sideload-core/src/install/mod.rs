//! Install orchestration: unpack, prepare the device, provision, sign,
//! package and deliver an app, reporting one ordered status stream.

pub mod archive;
pub mod collaborators;
pub mod delivery;
pub mod orchestrator;
pub mod pairing;
pub mod recovery;
pub mod staging;
pub mod status;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::InstallError;

pub use collaborators::{
    Certificate, InstallDelegate, InstallMessage, InstallStatusFn, PackageInstaller,
    Provisioned, Provisioner, RevocationGate, Signer, SigningIdentity, TargetDevice,
    TargetProvisioning, UploadedPackage,
};
pub use delivery::DeliveryStage;
pub use orchestrator::{InstallOrchestrator, InstallServices};
pub use staging::StagingDir;
pub use status::{StatusQueue, StatusSink};

/// Stage labels in run order. Delivery adds its own after packaging.
pub mod stages {
    pub const UNPACKING: &str = "Unpacking app";
    pub const PREPARING: &str = "Preparing device";
    pub const PROVISIONING: &str = "Provisioning";
    pub const SIGNING: &str = "Signing";
    pub const PACKAGING: &str = "Packaging";
    pub use super::delivery::{CONNECTING, INSTALLING, UPLOADING};
}

/// Runtime settings for install runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    /// Parent of per-run staging directories.
    pub staging_root: PathBuf,
    /// Wait between retries while the user is asked to trust or unlock.
    pub recovery_interval: Duration,
    /// Set the device up for wireless installs as part of preparing it.
    pub configure_device: bool,
    /// Where wireless pair records are saved, if anywhere.
    pub pairing_record_dir: Option<PathBuf>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir().join("sideload"),
            recovery_interval: Duration::from_millis(100),
            configure_device: false,
            pairing_record_dir: None,
        }
    }
}

/// Await `fut` unless the run is cancelled first. Dropping `fut` on
/// cancellation is what propagates it into a collaborator.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, InstallError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InstallError::Cancelled),
        value = fut => Ok(value),
    }
}
