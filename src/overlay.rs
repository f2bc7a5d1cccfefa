use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{LabError, Result};

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-instance qcow2 overlays backed by shared base images, so any number
/// of guests can boot the same firmware without write-lock conflicts. Write
/// divergence is thrown away when the instance stops.
pub struct OverlayStore {
    dir: PathBuf,
}

impl OverlayStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub async fn create(&self, base: &Path, run_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            LabError::resource(
                format!("failed to create overlay dir {}", self.dir.display()),
                e,
            )
        })?;

        // qemu-img stores the backing path verbatim, so make it absolute
        let base = base.canonicalize().map_err(|e| {
            LabError::resource(format!("failed to resolve base image {}", base.display()), e)
        })?;
        let overlay = self.dir.join(format!("{}.qcow2", run_id));

        let output = tokio::time::timeout(
            QEMU_IMG_TIMEOUT,
            Command::new("qemu-img")
                .arg("create")
                .args(["-f", "qcow2", "-b"])
                .arg(&base)
                .args(["-F", "qcow2"])
                .arg(&overlay)
                .output(),
        )
        .await
        .map_err(|_| {
            LabError::resource(
                format!("qemu-img timed out creating {}", overlay.display()),
                io::Error::from(io::ErrorKind::TimedOut),
            )
        })?
        .map_err(|e| {
            LabError::resource(format!("failed to run qemu-img for {}", overlay.display()), e)
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LabError::resource(
                format!("qemu-img failed creating {}", overlay.display()),
                io::Error::other(stderr.trim().to_string()),
            ));
        }

        debug!("created overlay {} (base {})", overlay.display(), base.display());
        Ok(overlay)
    }

    /// Unlink an overlay. Missing files are fine; cleanup is idempotent.
    pub fn delete(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed overlay {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove overlay {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_tolerates_missing_file() {
        let store = OverlayStore::new(std::env::temp_dir());
        store.delete(Path::new("/nonexistent/overlay.qcow2"));
    }

    #[tokio::test]
    async fn create_fails_on_missing_base() {
        let store = OverlayStore::new(
            std::env::temp_dir().join(format!("labvisor-overlays-{}", std::process::id())),
        );
        let err = store
            .create(Path::new("/nonexistent/base.qcow2"), "fw_deadbeef")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("base.qcow2"));
    }
}
