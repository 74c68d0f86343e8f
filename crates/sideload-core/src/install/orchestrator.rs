//! The install pipeline.
//!
//! One run goes through these stages in order:
//!
//! 1. **Unpacking app**: `.ipa` archives are unzipped and `.app` bundles
//!    copied into `<staging>/Payload`
//! 2. **Preparing device**: handshake (retried while the user is asked to
//!    trust or unlock the device), device name, optional wireless pairing
//! 3. **Provisioning**: may stop at the revocation gate
//! 4. **Signing**: profiles are embedded per target, then the signer runs
//! 5. **Packaging**: `Payload` is zipped into `<staging>/app.ipa`
//! 6. **Connecting / Uploading / Installing**: delivery over the pooled
//!    connection
//!
//! Every status update goes through the run's [`StatusQueue`]. The staging
//! directory is removed when the run ends, whatever the outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborators::{
    InstallDelegate, PackageInstaller, Provisioner, RevocationGate, Signer, TargetDevice,
    TargetProvisioning,
};
use super::delivery::{AppDelivery, DeliveryFn, DeliveryStage};
use super::pairing::{WirelessPairing, save_record};
use super::recovery::perform_with_recovery;
use super::stages::{PACKAGING, PREPARING, PROVISIONING, SIGNING, UNPACKING};
use super::staging::StagingDir;
use super::status::{StatusQueue, StatusSink};
use super::{InstallSettings, archive, cancellable};
use crate::error::InstallError;
use crate::session::{ConnectionPool, ConnectionPreferences, ProgressFn, SharedConnection};

const PROFILE_NAME: &str = "embedded.mobileprovision";

/// External services a run drives.
#[derive(Clone)]
pub struct InstallServices {
    pub provisioner: Arc<dyn Provisioner>,
    pub signer: Arc<dyn Signer>,
    pub installer: Arc<dyn PackageInstaller>,
}

/// Installs apps onto one device, one run at a time.
pub struct InstallOrchestrator {
    pool: ConnectionPool,
    udid: String,
    preferences: ConnectionPreferences,
    services: InstallServices,
    delegate: Arc<dyn InstallDelegate>,
    settings: InstallSettings,
    running: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

impl InstallOrchestrator {
    pub fn new(
        pool: ConnectionPool,
        udid: impl Into<String>,
        preferences: ConnectionPreferences,
        services: InstallServices,
        delegate: Arc<dyn InstallDelegate>,
        settings: InstallSettings,
    ) -> Self {
        Self {
            pool,
            udid: udid.into(),
            preferences,
            services,
            delegate,
            settings,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel the run in progress, if any.
    pub fn cancel(&self) {
        if let Some(cancel) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            info!(udid = %self.udid, "Cancelling install");
            cancel.cancel();
        }
    }

    /// Install the app at `app` (an `.ipa` or `.app`) and return its final
    /// bundle identifier.
    ///
    /// Fails with [`InstallError::AlreadyInstalling`] while another run is in
    /// progress. Dropping the returned future cancels the run.
    pub async fn install(&self, app: &Path) -> Result<String, InstallError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(InstallError::AlreadyInstalling);
        }
        let cancel = CancellationToken::new();
        let _guard = RunGuard::new(self, cancel.clone());

        info!(udid = %self.udid, app = %app.display(), "Starting install");
        let queue = StatusQueue::start(Arc::clone(&self.delegate), cancel.clone());
        let run = Run {
            orchestrator: self,
            app,
            status: queue.sink(),
            gate: RevocationGate::new(Arc::clone(&self.delegate)),
            cancel,
        };

        let result = run.execute().await;
        queue.finish().await;

        match &result {
            Ok(bundle_id) => info!(udid = %self.udid, %bundle_id, "Install finished"),
            Err(InstallError::Cancelled) => info!(udid = %self.udid, "Install cancelled"),
            Err(e) => warn!(udid = %self.udid, "Install failed: {}", e),
        }
        result
    }
}

/// Marks the orchestrator busy for the duration of one run.
struct RunGuard<'a> {
    orchestrator: &'a InstallOrchestrator,
    cancel: CancellationToken,
}

impl<'a> RunGuard<'a> {
    fn new(orchestrator: &'a InstallOrchestrator, cancel: CancellationToken) -> Self {
        *orchestrator
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        Self {
            orchestrator,
            cancel,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        // Callbacks still in flight from an abandoned run must stay silent.
        self.cancel.cancel();
        *self
            .orchestrator
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.orchestrator.running.store(false, Ordering::SeqCst);
    }
}

struct Run<'a> {
    orchestrator: &'a InstallOrchestrator,
    app: &'a Path,
    status: StatusSink,
    gate: RevocationGate,
    cancel: CancellationToken,
}

impl Run<'_> {
    async fn execute(&self) -> Result<String, InstallError> {
        let settings = &self.orchestrator.settings;
        let services = &self.orchestrator.services;

        self.enter(UNPACKING, None).await?;
        let staging = StagingDir::create(&settings.staging_root, &self.orchestrator.udid, self.app)
            .map_err(|e| InstallError::stage(UNPACKING, e))?;
        let app_dir = self.unpack(&staging).await?;

        self.enter(PREPARING, Some(0.0)).await?;
        let (connection, device) = self.prepare_device().await?;

        self.enter(PROVISIONING, Some(0.0)).await?;
        let provisioned = cancellable(
            &self.cancel,
            services.provisioner.provision(
                &app_dir,
                &device,
                &self.gate,
                self.progress_for(PROVISIONING),
            ),
        )
        .await?;
        // Refusal wins over whatever the provisioner made of it
        if self.gate.declined() {
            return Err(InstallError::RevocationDeclined);
        }
        let provisioned = provisioned.map_err(|e| InstallError::stage(PROVISIONING, e))?;
        info!(bundle_id = %provisioned.bundle_id, targets = provisioned.targets.len(), "Provisioned");

        self.enter(SIGNING, Some(0.0)).await?;
        embed_profiles(&app_dir, &provisioned.targets)?;
        cancellable(
            &self.cancel,
            services.signer.sign(
                &app_dir,
                &provisioned.identity,
                &provisioned.targets,
                self.progress_for(SIGNING),
            ),
        )
        .await?
        .map_err(|e| InstallError::stage(SIGNING, e))?;

        self.enter(PACKAGING, None).await?;
        let ipa = staging.path().join("app.ipa");
        let packaged = self
            .orchestrator
            .delegate
            .archive(
                &staging.payload(),
                &ipa,
                self.progress_for(PACKAGING),
                self.cancel.clone(),
            )
            .await;
        self.check_cancelled()?;
        packaged.map_err(InstallError::AppPackagingFailed)?;
        self.status.set_progress(Some(1.0));

        self.checkpoint().await?;
        let status = self.status.clone();
        let on_stage: DeliveryFn = Arc::new(move |stage: DeliveryStage| {
            status.report(stage.display_name(), stage.display_progress())
        });
        AppDelivery {
            pool: &self.orchestrator.pool,
            installer: services.installer.as_ref(),
            udid: &self.orchestrator.udid,
            preferences: self.orchestrator.preferences.clone(),
            cancel: &self.cancel,
        }
        .deliver(&ipa, on_stage)
        .await?;

        drop(connection);
        Ok(provisioned.bundle_id)
    }

    /// Cancellation checkpoint followed by a stage switch.
    async fn enter(&self, stage: &str, progress: Option<f64>) -> Result<(), InstallError> {
        self.checkpoint().await?;
        debug!(stage, "Entering stage");
        self.status.set_stage(stage, progress);
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), InstallError> {
        tokio::task::yield_now().await;
        self.check_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        Ok(())
    }

    /// Progress callback bound to `stage`; reports arriving after the run
    /// has moved on are dropped by the status writer.
    fn progress_for(&self, stage: &'static str) -> ProgressFn {
        let status = self.status.clone();
        Arc::new(move |p| status.report(stage, Some(p)))
    }

    async fn unpack(&self, staging: &StagingDir) -> Result<PathBuf, InstallError> {
        let failed = |e: anyhow::Error| InstallError::AppExtractionFailed(format!("{e:#}"));
        if !self.app.exists() {
            return Err(InstallError::AppExtractionFailed(format!(
                "{} does not exist",
                self.app.display()
            )));
        }

        match self.app.extension().and_then(|e| e.to_str()) {
            Some("ipa") => {
                let unpacked = self
                    .orchestrator
                    .delegate
                    .unarchive(
                        self.app,
                        staging.path(),
                        self.progress_for(UNPACKING),
                        self.cancel.clone(),
                    )
                    .await;
                self.check_cancelled()?;
                unpacked.map_err(failed)?;
            }
            Some("app") => {
                let name = self.app.file_name().unwrap_or_default();
                let source = self.app.to_path_buf();
                let dest = staging.payload().join(name);
                tokio::task::spawn_blocking(move || archive::copy_dir(&source, &dest))
                    .await
                    .context("Copy task failed")
                    .and_then(|copied| copied)
                    .map_err(failed)?;
            }
            _ => {
                return Err(InstallError::AppExtractionFailed(format!(
                    "{} is neither an .ipa nor an .app",
                    self.app.display()
                )));
            }
        }
        self.status.set_progress(Some(1.0));

        let app_dir = find_app_bundle(&staging.payload()).ok_or_else(|| {
            InstallError::AppExtractionFailed("no .app bundle inside Payload".into())
        })?;
        if !app_dir.join("Info.plist").is_file() {
            return Err(InstallError::AppCorrupted(format!(
                "{} has no Info.plist",
                app_dir.display()
            )));
        }
        Ok(app_dir)
    }

    async fn prepare_device(&self) -> Result<(SharedConnection, TargetDevice), InstallError> {
        let orchestrator = self.orchestrator;
        let settings = &orchestrator.settings;

        let quiet: ProgressFn = Arc::new(|_| {});
        let connection = perform_with_recovery(
            PREPARING,
            &self.status,
            &self.cancel,
            settings.recovery_interval,
            || {
                orchestrator.pool.connection(
                    &orchestrator.udid,
                    orchestrator.preferences.clone(),
                    Arc::clone(&quiet),
                )
            },
        )
        .await?;
        self.status.set_progress(Some(if settings.configure_device {
            1.0 / 3.0
        } else {
            1.0 / 2.0
        }));

        let name = cancellable(&self.cancel, connection.lockdown().device_name())
            .await?
            .map_err(InstallError::DeviceInfoUnavailable)?;
        info!(udid = %orchestrator.udid, %name, "Device ready");

        if settings.configure_device {
            let record = WirelessPairing {
                transport: orchestrator.pool.transport(),
                lockdown: connection.lockdown(),
                udid: &orchestrator.udid,
                stage: PREPARING,
                status: &self.status,
                cancel: &self.cancel,
                recovery_interval: settings.recovery_interval,
            }
            .run()
            .await?;

            if let Some(dir) = &settings.pairing_record_dir {
                let path = save_record(dir, &orchestrator.udid, &record)
                    .map_err(|e| InstallError::PairingFailed(format!("{e:#}")))?;
                info!(path = %path.display(), "Saved wireless pair record");
            }
        }
        self.status.set_progress(Some(1.0));

        let device = TargetDevice {
            udid: orchestrator.udid.clone(),
            name,
        };
        Ok((connection, device))
    }
}

/// First `.app` directory in `payload`, by name.
fn find_app_bundle(payload: &Path) -> Option<PathBuf> {
    let mut apps: Vec<PathBuf> = fs::read_dir(payload)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.extension().is_some_and(|ext| ext == "app"))
        .collect();
    apps.sort();
    apps.into_iter().next()
}

/// Write each target's profile into its bundle.
fn embed_profiles(app_dir: &Path, targets: &[TargetProvisioning]) -> Result<(), InstallError> {
    for target in targets {
        let bundle = app_dir.join(&target.bundle_path);
        if !bundle.is_dir() {
            return Err(InstallError::AppCorrupted(format!(
                "bundle for {} not found at {}",
                target.bundle_id,
                bundle.display()
            )));
        }
        let path = bundle.join(PROFILE_NAME);
        fs::write(&path, &target.profile)
            .with_context(|| format!("Failed to write profile: {}", path.display()))
            .map_err(|e| InstallError::stage(SIGNING, e))?;
        debug!(bundle_id = %target.bundle_id, "Embedded provisioning profile");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(path: &str, profile: &[u8]) -> TargetProvisioning {
        TargetProvisioning {
            bundle_path: PathBuf::from(path),
            bundle_id: format!("com.example{}", path.replace('/', ".")),
            entitlements: serde_json::json!({}),
            profile: profile.to_vec(),
        }
    }

    #[test]
    fn find_app_bundle_picks_first_app_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let payload = temp.path().join("Payload");
        fs::create_dir_all(payload.join("B.app")).unwrap();
        fs::create_dir_all(payload.join("A.app")).unwrap();
        fs::write(payload.join("C.app"), b"not a dir").unwrap();
        fs::create_dir_all(payload.join("Other")).unwrap();

        assert_eq!(find_app_bundle(&payload), Some(payload.join("A.app")));
    }

    #[test]
    fn find_app_bundle_handles_missing_payload() {
        let temp = tempfile::TempDir::new().unwrap();
        assert_eq!(find_app_bundle(&temp.path().join("Payload")), None);
    }

    #[test]
    fn embed_profiles_writes_into_each_target() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = temp.path().join("Demo.app");
        fs::create_dir_all(app.join("PlugIns/Widget.appex")).unwrap();

        embed_profiles(
            &app,
            &[target("", b"main"), target("PlugIns/Widget.appex", b"widget")],
        )
        .unwrap();

        assert_eq!(fs::read(app.join(PROFILE_NAME)).unwrap(), b"main");
        assert_eq!(
            fs::read(app.join("PlugIns/Widget.appex").join(PROFILE_NAME)).unwrap(),
            b"widget"
        );
    }

    #[test]
    fn embed_profiles_rejects_missing_bundle() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = temp.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();

        let err = embed_profiles(&app, &[target("PlugIns/Gone.appex", b"x")]).unwrap_err();
        assert!(matches!(err, InstallError::AppCorrupted(_)));
    }
}
