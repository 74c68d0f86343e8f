//! Error types shared across the session and install layers.

use thiserror::Error;

/// Failures reported by a device transport or one of its clients.
///
/// Cloneable so that a failed pooled construction can be handed to every
/// requester that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device {udid} not found")]
    NotFound { udid: String },

    /// The device is showing a "Trust this computer?" dialog.
    #[error("pairing dialog response pending")]
    PairingDialogPending,

    /// The device is locked with a passcode.
    #[error("device is password protected")]
    PasswordProtected,

    #[error("timed out waiting for the device")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("service {0} unavailable")]
    ServiceUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection setup was aborted")]
    Aborted,
}

impl DeviceError {
    /// Whether the error clears up once the user interacts with the device.
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::PairingDialogPending | Self::PasswordProtected)
    }
}

/// The task constructing a pooled value ended without producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pooled value creation aborted")]
pub struct CreationAborted;

impl From<CreationAborted> for DeviceError {
    fn from(_: CreationAborted) -> Self {
        Self::Aborted
    }
}

/// Terminal failures of an install run.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("an install is already running")]
    AlreadyInstalling,

    #[error("install cancelled")]
    Cancelled,

    #[error("certificate revocation declined by user")]
    RevocationDeclined,

    #[error("could not read device info")]
    DeviceInfoUnavailable(#[source] DeviceError),

    #[error("app extraction failed: {0}")]
    AppExtractionFailed(String),

    #[error("app bundle is corrupted: {0}")]
    AppCorrupted(String),

    #[error("app packaging failed")]
    AppPackagingFailed(#[source] anyhow::Error),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("{stage}: device error")]
    Device {
        stage: String,
        #[source]
        source: DeviceError,
    },

    #[error("{stage} failed")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

impl InstallError {
    pub(crate) fn device(stage: &str, source: DeviceError) -> Self {
        Self::Device {
            stage: stage.to_string(),
            source,
        }
    }

    pub(crate) fn stage(stage: &str, source: anyhow::Error) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            source,
        }
    }

    /// Name of the stage that failed, when the error is tied to one.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::Device { stage, .. } | Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
