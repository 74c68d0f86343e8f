//! Getting a packaged app onto the device: connect, upload, install.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cancellable;
use super::collaborators::{InstallStatusFn, PackageInstaller, UploadedPackage};
use crate::error::InstallError;
use crate::session::{Connection, ConnectionPool, ConnectionPreferences, ProgressFn};

pub const CONNECTING: &str = "Connecting";
pub const UPLOADING: &str = "Uploading";
pub const INSTALLING: &str = "Installing";

/// Upper bound on removing the uploaded package after an install.
const DISCARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Where delivery currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryStage {
    Connecting(f64),
    Uploading(f64),
    /// Device-reported status text and optional fraction.
    Installing {
        status: String,
        progress: Option<f64>,
    },
}

impl DeliveryStage {
    pub fn display_name(&self) -> String {
        match self {
            DeliveryStage::Connecting(_) => CONNECTING.to_string(),
            DeliveryStage::Uploading(_) => UPLOADING.to_string(),
            DeliveryStage::Installing { status, .. } => format!("{INSTALLING}: {status}"),
        }
    }

    pub fn display_progress(&self) -> Option<f64> {
        match self {
            DeliveryStage::Connecting(p) | DeliveryStage::Uploading(p) => Some(*p),
            DeliveryStage::Installing { progress, .. } => *progress,
        }
    }
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display_progress() {
            Some(p) => write!(f, "{} ({:.0}%)", self.display_name(), p * 100.0),
            None => f.write_str(&self.display_name()),
        }
    }
}

pub type DeliveryFn = Arc<dyn Fn(DeliveryStage) + Send + Sync>;

/// Delivers one package to one device over a pooled connection.
pub struct AppDelivery<'a> {
    pub pool: &'a ConnectionPool,
    pub installer: &'a dyn PackageInstaller,
    pub udid: &'a str,
    pub preferences: ConnectionPreferences,
    pub cancel: &'a CancellationToken,
}

impl AppDelivery<'_> {
    pub async fn deliver(&self, package: &Path, on_stage: DeliveryFn) -> Result<(), InstallError> {
        let connecting = Arc::clone(&on_stage);
        let progress: ProgressFn = Arc::new(move |p| connecting(DeliveryStage::Connecting(p)));
        let connection = cancellable(
            self.cancel,
            self.pool.connection(self.udid, self.preferences.clone(), progress),
        )
        .await?
        .map_err(|e| InstallError::device(CONNECTING, e))?;

        let uploading = Arc::clone(&on_stage);
        let progress: ProgressFn = Arc::new(move |p| uploading(DeliveryStage::Uploading(p)));
        on_stage(DeliveryStage::Uploading(0.0));
        let uploaded =
            cancellable(self.cancel, self.installer.upload(&connection, package, progress))
                .await?
                .map_err(|e| InstallError::stage(UPLOADING, e))?;
        info!(location = %uploaded.location, "Uploaded package");

        let installing = Arc::clone(&on_stage);
        let status: InstallStatusFn = Arc::new(move |status, progress| {
            installing(DeliveryStage::Installing { status, progress })
        });
        let installed =
            cancellable(self.cancel, self.installer.install(&connection, &uploaded, status)).await;

        // The upload is removed whether or not the install went through,
        // unless the run was cancelled
        if !self.cancel.is_cancelled() {
            self.discard(&connection, &uploaded).await;
        }

        installed?.map_err(|e| InstallError::stage(INSTALLING, e))
    }

    async fn discard(&self, connection: &Connection, uploaded: &UploadedPackage) {
        let discard = tokio::time::timeout(
            DISCARD_TIMEOUT,
            self.installer.discard(connection, uploaded),
        );
        match cancellable(self.cancel, discard).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(location = %uploaded.location, "Failed to remove uploaded package: {:#}", e)
            }
            Ok(Err(_)) => {
                warn!(location = %uploaded.location, "Timed out removing uploaded package")
            }
            Err(_) => debug!(location = %uploaded.location, "Cancelled while removing upload"),
        }
    }
}
