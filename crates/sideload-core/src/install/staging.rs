//! Scoped staging directory for one install run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, bail};
use tracing::{debug, warn};

/// Staging directories owned by a live run in this process.
static CLAIMED: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

fn claimed() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    CLAIMED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A staging directory removed when dropped.
///
/// The name is derived from the device and app path, so a directory left
/// over by an interrupted run for the same pair is found and cleared first.
/// While a run holds the directory, nobody else in the process can create
/// it.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn create(root: &Path, udid: &str, app: &Path) -> anyhow::Result<Self> {
        let path = root.join(format!("staging-{}", staging_key(udid, app)));
        if !claimed().insert(path.clone()) {
            bail!(
                "Staging directory is in use by another install: {}",
                path.display()
            );
        }
        // Released by Drop from here on, including on the error paths below
        let staging = Self { path };
        let path = &staging.path;

        if path.exists() {
            debug!(path = %path.display(), "Removing stale staging directory");
            fs::remove_dir_all(path).with_context(|| {
                format!("Failed to remove stale staging directory: {}", path.display())
            })?;
        }
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create staging directory: {}", path.display()))?;

        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Payload/` inside the staging directory.
    pub fn payload(&self) -> PathBuf {
        self.path.join("Payload")
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove staging directory: {}", e),
        }
        claimed().remove(&self.path);
    }
}

fn staging_key(udid: &str, app: &Path) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(udid.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(app.to_string_lossy().as_bytes());
    // 16 bytes is plenty to tell runs apart
    hasher.finalize().to_hex()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_key_is_deterministic() {
        let a = staging_key("udid", Path::new("/tmp/App.ipa"));
        let b = staging_key("udid", Path::new("/tmp/App.ipa"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, staging_key("other", Path::new("/tmp/App.ipa")));
        assert_ne!(a, staging_key("udid", Path::new("/tmp/Other.ipa")));
    }

    #[test]
    fn drop_removes_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = {
            let staging = StagingDir::create(temp.path(), "udid", Path::new("App.ipa")).unwrap();
            fs::write(staging.path().join("file"), b"x").unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn create_clears_stale_contents() {
        let temp = tempfile::TempDir::new().unwrap();
        let stale = temp
            .path()
            .join(format!("staging-{}", staging_key("udid", Path::new("App.ipa"))));
        fs::create_dir_all(stale.join("Payload")).unwrap();
        fs::write(stale.join("Payload/old"), b"old").unwrap();

        let staging = StagingDir::create(temp.path(), "udid", Path::new("App.ipa")).unwrap();
        assert_eq!(staging.path(), stale);
        assert!(!staging.payload().exists());
    }

    #[test]
    fn live_directory_cannot_be_claimed_twice() {
        let temp = tempfile::TempDir::new().unwrap();
        let first = StagingDir::create(temp.path(), "udid", Path::new("Shared.ipa")).unwrap();
        fs::write(first.path().join("file"), b"x").unwrap();

        let second = StagingDir::create(temp.path(), "udid", Path::new("Shared.ipa"));
        assert!(second.is_err());
        assert!(first.path().join("file").exists());

        drop(first);
        assert!(StagingDir::create(temp.path(), "udid", Path::new("Shared.ipa")).is_ok());
    }
}
