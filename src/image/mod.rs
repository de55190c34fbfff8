//! Root filesystem image provisioning.
//!
//! The machine boots from a published root filesystem tarball. `ensure_image`
//! keeps the local copy in sync with the released one by comparing checksums
//! (a `.sha256` sidecar caches the local digest) and only downloads when they
//! differ. Downloads stream through a SHA-256 hasher into a temporary file
//! that is renamed into place after verification.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::cluster::ImageProvisioner;
use crate::errors::{KubenestError, KubenestResult};

pub const HOME_DIR_NAME: &str = "kubenest";
pub const IMAGE_FILENAME: &str = "rootfs.tar.gz";
pub const REMOTE_IMAGE_FILENAME: &str = "kubenest.rootfs.tar.gz";
pub const IMAGE_URL: &str =
    "https://github.com/kubenest/nestd/releases/latest/download/kubenest.rootfs.tar.gz";
pub const IMAGE_CHECKSUM_URL: &str =
    "https://github.com/kubenest/nestd/releases/latest/download/SHA256SUMS";

/// Local state directory (`~/.local/share/kubenest` on Linux).
pub fn home_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(HOME_DIR_NAME)
}

/// Default location of the root filesystem tarball.
pub fn default_image_path() -> PathBuf {
    home_dir().join(IMAGE_FILENAME)
}

/// Per-machine state directory, created on demand.
pub fn ensure_machine_dir(home: &Path, name: &str) -> KubenestResult<PathBuf> {
    let path = home.join(name);
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Remove the per-machine state directory. Missing directories are fine.
pub fn remove_machine_dir(home: &Path, name: &str) -> KubenestResult<()> {
    let path = home.join(name);
    match std::fs::remove_dir_all(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Pick the checksum for `name` out of a SHA256SUMS document.
pub(crate) fn checksum_for_file(sums: &str, name: &str) -> Option<String> {
    sums.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let file = parts.next()?;
        (file.trim_start_matches('*') == name).then(|| digest.to_string())
    })
}

async fn release_checksum(client: &reqwest::Client) -> KubenestResult<String> {
    let body = client
        .get(IMAGE_CHECKSUM_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    checksum_for_file(&body, REMOTE_IMAGE_FILENAME).ok_or_else(|| {
        KubenestError::Image(format!(
            "no checksum for {REMOTE_IMAGE_FILENAME} in {IMAGE_CHECKSUM_URL}"
        ))
    })
}

/// SHA-256 of a local file, hex encoded.
pub async fn file_sha256(path: &Path) -> KubenestResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn local_checksum(image: &Path, sidecar: &Path) -> KubenestResult<Option<String>> {
    if !image.exists() {
        return Ok(None);
    }
    if let Ok(cached) = tokio::fs::read_to_string(sidecar).await {
        return Ok(Some(cached.trim().to_string()));
    }
    let digest = file_sha256(image).await?;
    tokio::fs::write(sidecar, &digest).await?;
    Ok(Some(digest))
}

/// Make sure the image at `path` matches the published release, downloading
/// it when missing or stale.
pub async fn ensure_image(path: &Path) -> KubenestResult<()> {
    let image = path.to_path_buf();
    let home = image
        .parent()
        .ok_or_else(|| KubenestError::Image(format!("image path {} has no parent", image.display())))?;
    std::fs::create_dir_all(home)?;
    let mut sidecar_name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| IMAGE_FILENAME.to_string());
    sidecar_name.push_str(".sha256");
    let sidecar = image.with_file_name(sidecar_name);

    let client = reqwest::Client::new();
    let current = local_checksum(&image, &sidecar).await?;
    tracing::info!(
        image = %image.display(),
        exists = current.is_some(),
        "checking root filesystem"
    );

    let online = release_checksum(&client).await?;
    if current.as_deref() == Some(online.as_str()) {
        tracing::info!(image = %image.display(), checksum = %online, "root filesystem up to date");
        return Ok(());
    }

    tracing::info!(image = %image.display(), url = IMAGE_URL, "downloading root filesystem");
    let response = client
        .get(IMAGE_URL)
        .send()
        .await?
        .error_for_status()?;
    let total = response.content_length();

    let tmp = tempfile::NamedTempFile::new_in(home)?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut last_report: u64 = 0;
    {
        use std::io::Write;
        let mut out = tmp.as_file();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
            // Progress at ~64MiB granularity; downloads run to a few hundred MiB.
            if written - last_report >= 64 * 1024 * 1024 {
                last_report = written;
                tracing::info!(written, total = ?total, "downloading");
            }
        }
        out.flush()?;
    }

    let downloaded = hex::encode(hasher.finalize());
    if downloaded != online {
        return Err(KubenestError::Checksum {
            url: IMAGE_URL.into(),
            expected: online,
            actual: downloaded,
        });
    }

    tmp.persist(&image)
        .map_err(|e| KubenestError::Image(format!("moving download into place: {e}")))?;
    tokio::fs::write(&sidecar, &downloaded).await?;
    tracing::info!(image = %image.display(), checksum = %downloaded, "download ok");
    Ok(())
}

/// Disk-backed provisioner used by the real CLI.
///
/// A user-supplied image path is taken as-is (it just has to exist); the
/// default path is kept in sync with the published release.
pub struct DiskImages {
    image_path: PathBuf,
    download: bool,
}

impl DiskImages {
    /// Provisioner for the default, release-tracked image location.
    pub fn release_tracked() -> Self {
        Self {
            image_path: default_image_path(),
            download: true,
        }
    }

    /// Provisioner for a user-supplied image tarball.
    pub fn local(image_path: PathBuf) -> Self {
        Self {
            image_path,
            download: false,
        }
    }
}

#[async_trait]
impl ImageProvisioner for DiskImages {
    async fn ensure_image(&self) -> KubenestResult<PathBuf> {
        if self.download {
            ensure_image(&self.image_path).await?;
        } else if !self.image_path.exists() {
            return Err(KubenestError::Image(format!(
                "root filesystem {} does not exist",
                self.image_path.display()
            )));
        }
        Ok(self.image_path.clone())
    }

    fn machine_dir(&self, name: &str) -> KubenestResult<PathBuf> {
        ensure_machine_dir(&home_dir(), name)
    }

    fn remove_state(&self, name: &str) -> KubenestResult<()> {
        remove_machine_dir(&home_dir(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_checksum_in_sums_file() {
        let sums = "abc123  kubenest.rootfs.tar.gz\ndef456  other.tar.gz\n";
        assert_eq!(
            checksum_for_file(sums, "kubenest.rootfs.tar.gz").as_deref(),
            Some("abc123")
        );
        assert_eq!(checksum_for_file(sums, "missing.tar.gz"), None);
    }

    #[test]
    fn tolerates_binary_mode_markers() {
        let sums = "abc123 *kubenest.rootfs.tar.gz\n";
        assert_eq!(
            checksum_for_file(sums, "kubenest.rootfs.tar.gz").as_deref(),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn hashes_local_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello").expect("write");
        let digest = file_sha256(&path).await.expect("digest");
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn machine_dir_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = ensure_machine_dir(dir.path(), "nest").expect("create");
        assert!(path.is_dir());
        remove_machine_dir(dir.path(), "nest").expect("remove");
        assert!(!path.exists());
        // Removing again is fine.
        remove_machine_dir(dir.path(), "nest").expect("idempotent remove");
    }
}
