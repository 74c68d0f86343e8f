use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sideload_core::install::{
    Certificate, InstallStatusFn, PackageInstaller, Provisioned, Provisioner, RevocationGate,
    Signer, SigningIdentity, TargetDevice, TargetProvisioning, UploadedPackage,
};
use sideload_core::session::{Connection, ProgressFn};
use tracing::info;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A development certificate expiring a year from now.
pub fn sample_certificate(serial: &str) -> Certificate {
    Certificate {
        serial_number: serial.to_string(),
        name: format!("Apple Development: Mock ({serial})"),
        expires: Utc::now() + ChronoDuration::days(365),
    }
}

/// Issues a fixed identity and one profile per bundle found in the app.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    team: String,
    /// Certificates that must be revoked before a new one can be issued.
    revoke: Vec<Certificate>,
    /// Never finish, so a run stays in the provisioning stage until
    /// cancelled.
    hang: bool,
    calls: Arc<AtomicUsize>,
    devices: Arc<Mutex<Vec<TargetDevice>>>,
}

impl MockProvisioner {
    pub fn new(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            ..Self::default()
        }
    }

    pub fn revoking(mut self, certificates: Vec<Certificate>) -> Self {
        self.revoke = certificates;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Devices provisioned for, in call order.
    pub fn devices(&self) -> Vec<TargetDevice> {
        lock(&self.devices).clone()
    }
}

fn stem(bundle: &Path) -> String {
    bundle
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "app".into())
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(
        &self,
        app: &Path,
        device: &TargetDevice,
        gate: &RevocationGate,
        progress: ProgressFn,
    ) -> anyhow::Result<Provisioned> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.devices).push(device.clone());
        progress(0.25);

        if self.hang {
            std::future::pending::<()>().await;
        }

        if !self.revoke.is_empty() && !gate.confirm(&self.revoke).await {
            bail!("Certificate revocation declined");
        }
        progress(0.5);

        let bundle_id = format!("com.{}.{}", self.team.to_lowercase(), stem(app));
        let mut targets = vec![target(PathBuf::new(), &bundle_id)];
        for extension in extensions(app)? {
            let id = format!("{bundle_id}.{}", stem(&extension));
            targets.push(target(extension, &id));
        }
        progress(1.0);

        info!(%bundle_id, targets = targets.len(), "Mock provisioning complete");
        Ok(Provisioned {
            identity: SigningIdentity {
                certificate: sample_certificate("MOCK0001"),
                private_key: b"mock-private-key".to_vec(),
            },
            targets,
            bundle_id,
        })
    }
}

fn target(bundle_path: PathBuf, bundle_id: &str) -> TargetProvisioning {
    TargetProvisioning {
        bundle_path,
        bundle_id: bundle_id.to_string(),
        entitlements: serde_json::json!({ "application-identifier": bundle_id }),
        profile: format!("profile:{bundle_id}").into_bytes(),
    }
}

/// `PlugIns/*.appex` bundles relative to the app, sorted.
fn extensions(app: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let plugins = app.join("PlugIns");
    if !plugins.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&plugins)
        .with_context(|| format!("Failed to read directory: {}", plugins.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "appex") {
            if let Some(name) = path.file_name() {
                found.push(PathBuf::from("PlugIns").join(name));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Marks each signed bundle with a `_CodeSignature/CodeResources` file
/// naming the certificate.
#[derive(Clone, Default)]
pub struct MockSigner {
    calls: Arc<AtomicUsize>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn sign(
        &self,
        app: &Path,
        identity: &SigningIdentity,
        targets: &[TargetProvisioning],
        progress: ProgressFn,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (i, target) in targets.iter().enumerate() {
            let dir = app.join(&target.bundle_path).join("_CodeSignature");
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            fs::write(
                dir.join("CodeResources"),
                format!(
                    "{}\n{}\n",
                    identity.certificate.serial_number, target.bundle_id
                ),
            )
            .with_context(|| format!("Failed to sign {}", target.bundle_id))?;
            progress((i + 1) as f64 / targets.len() as f64);
        }
        Ok(())
    }
}

/// Status texts reported while installing, with their fractions.
const INSTALL_STATUSES: &[(&str, Option<f64>)] = &[
    ("CreatingStagingDirectory", Some(0.05)),
    ("ExtractingPackage", Some(0.15)),
    ("InspectingPackage", Some(0.2)),
    ("VerifyingApplication", Some(0.4)),
    ("GeneratingApplicationMap", Some(0.9)),
    ("Complete", None),
];

/// Records uploads, installs and discards.
#[derive(Clone, Default)]
pub struct MockInstaller {
    fail_install: Arc<AtomicBool>,
    /// Stall install and discard after the first status, like a device that
    /// stopped answering.
    hang: Arc<AtomicBool>,
    uploads: Arc<Mutex<Vec<u64>>>,
    installs: Arc<AtomicUsize>,
    discards: Arc<Mutex<Vec<String>>>,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every install fail after the upload.
    pub fn failing(self) -> Self {
        self.fail_install.store(true, Ordering::SeqCst);
        self
    }

    pub fn hanging(self) -> Self {
        self.hang.store(true, Ordering::SeqCst);
        self
    }

    /// Sizes of uploaded packages, in bytes.
    pub fn uploads(&self) -> Vec<u64> {
        lock(&self.uploads).clone()
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Locations of removed uploads.
    pub fn discards(&self) -> Vec<String> {
        lock(&self.discards).clone()
    }
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    async fn upload(
        &self,
        connection: &Connection,
        package: &Path,
        progress: ProgressFn,
    ) -> anyhow::Result<UploadedPackage> {
        let size = fs::metadata(package)
            .with_context(|| format!("Failed to read package: {}", package.display()))?
            .len();
        for chunk in 1..=4 {
            progress(f64::from(chunk) / 4.0);
        }
        lock(&self.uploads).push(size);
        Ok(UploadedPackage {
            location: format!("PublicStaging/{}/app.ipa", connection.udid()),
        })
    }

    async fn install(
        &self,
        _connection: &Connection,
        _package: &UploadedPackage,
        status: InstallStatusFn,
    ) -> anyhow::Result<()> {
        for (text, progress) in INSTALL_STATUSES {
            if self.fail_install.load(Ordering::SeqCst) && *text == "VerifyingApplication" {
                bail!("ApplicationVerificationFailed");
            }
            status(text.to_string(), *progress);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(
        &self,
        _connection: &Connection,
        package: &UploadedPackage,
    ) -> anyhow::Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        lock(&self.discards).push(package.location.clone());
        Ok(())
    }
}
