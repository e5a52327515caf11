//! Image Library: on-demand base-image preparation with copy-on-write overlay semantics.
//!
//! `prepare` downloads, converts and resizes a base image exactly once per image id; concurrent
//! callers for the same id wait on the in-flight attempt instead of racing each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use vps_common::{config::DISK_SIZE_GIB, Error, Result};

/// A source image known to the library, by convention `{image_id}.qcow2-image.tar.xz`-style
/// cloud image URLs keyed by id. Real deployments would load this from a manifest; here it's a
/// fixed table mirroring the common cloud distributions.
pub fn known_sources() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("ubuntu-22.04", "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"),
        ("ubuntu-24.04", "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"),
        ("debian-12", "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2"),
        ("fedora-40", "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Cloud/x86_64/images/Fedora-Cloud-Base-40-1.14.x86_64.qcow2"),
        ("rocky-9", "https://download.rockylinux.org/pub/rocky/9/images/x86_64/Rocky-9-GenericCloud.latest.x86_64.qcow2"),
        ("almalinux-9", "https://repo.almalinux.org/almalinux/9/cloud/x86_64/images/AlmaLinux-9-GenericCloud-latest.x86_64.qcow2"),
        ("centos-9", "https://cloud.centos.org/centos/9-stream/x86_64/images/CentOS-Stream-GenericCloud-9-latest.x86_64.qcow2"),
    ])
}

/// Maintains the cache of prepared qcow2 base images.
pub struct ImageLibrary {
    base_dir: PathBuf,
    sources: HashMap<&'static str, &'static str>,
    /// Per-image-id locks so at most one `prepare` runs per id at a time; concurrent callers
    /// await the same in-flight attempt rather than racing the download/convert/resize pipeline.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ImageLibrary {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            sources: known_sources(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_path(&self, image_id: &str) -> PathBuf {
        self.base_dir.join(format!("{image_id}.qcow2"))
    }

    fn lock_for(&self, image_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(image_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Ensures the base image for `image_id` exists and is ready, downloading/converting/resizing
    /// it if necessary. Idempotent: returns immediately if a valid qcow2 is already in place.
    pub async fn prepare(&self, image_id: &str) -> Result<PathBuf> {
        let lock = self.lock_for(image_id);
        let _guard = lock.lock().await;

        let target = self.base_path(image_id);
        if self.is_valid(&target).await {
            debug!(image_id, "base image already prepared");
            return Ok(target);
        }

        let source_url = self
            .sources
            .get(image_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown image id: {image_id}")))?;

        info!(image_id, source_url, "preparing base image");
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let tmp_dir = tempfile::tempdir()?;
        let downloaded = tmp_dir.path().join("source.img");
        download(source_url, &downloaded).await.map_err(|e| {
            warn!(image_id, error = %e, "image download failed");
            e
        })?;

        let converted = tmp_dir.path().join("converted.qcow2");
        qemu_img_convert(&downloaded, &converted).await?;
        qemu_img_resize(&converted, DISK_SIZE_GIB).await?;

        tokio::fs::rename(&converted, &target).await.or_else(|_| {
            // rename across filesystems fails; fall back to copy + remove.
            std::fs::copy(&converted, &target)?;
            std::fs::remove_file(&converted)
        })?;
        set_mode_0644(&target).await?;

        info!(image_id, path = %target.display(), "base image ready");
        Ok(target)
    }

    /// Ensures every image in `image_ids` is prepared; the first failure is reported for that id
    /// but does not stop the others. Suitable for a startup warm-up pass.
    pub async fn ensure_all(&self, image_ids: &[String]) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(image_ids.len());
        for id in image_ids {
            let r = self.prepare(id).await.map(|_| ());
            results.push((id.clone(), r));
        }
        results
    }

    async fn is_valid(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        match qemu_img_info(path).await {
            Ok(info) => {
                info.format == "qcow2" && info.virtual_size_gib() >= DISK_SIZE_GIB
            }
            Err(_) => false,
        }
    }
}

async fn download(url: &str, dest: &Path) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::ExternalTool(format!("download {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::ExternalTool(format!(
            "download {url}: HTTP {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::ExternalTool(format!("download {url}: {e}")))?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

async fn qemu_img_convert(src: &Path, dst: &Path) -> Result<()> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["convert", "-O", "qcow2"])
        .arg(src)
        .arg(dst)
        .output()
        .await
        .map_err(|e| Error::ExternalTool(format!("qemu-img convert not found: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(format!(
            "qemu-img convert failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn qemu_img_resize(path: &Path, size_gib: u64) -> Result<()> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["resize"])
        .arg(path)
        .arg(format!("{size_gib}G"))
        .output()
        .await
        .map_err(|e| Error::ExternalTool(format!("qemu-img resize not found: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(format!(
            "qemu-img resize failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

struct QemuImgInfo {
    format: String,
    virtual_size: u64,
}

impl QemuImgInfo {
    fn virtual_size_gib(&self) -> u64 {
        self.virtual_size / (1024 * 1024 * 1024)
    }
}

async fn qemu_img_info(path: &Path) -> Result<QemuImgInfo> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::ExternalTool(format!("qemu-img info not found: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(String::from_utf8_lossy(&output.stderr).into_owned()));
    }

    let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    Ok(QemuImgInfo {
        format: value.get("format").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        virtual_size: value.get("virtual-size").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

/// Creates a qcow2 overlay over `base`, with a read-only backing file (per the disk model).
pub async fn create_overlay(base: &Path, overlay: &Path) -> Result<()> {
    if let Some(parent) = overlay.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(base)
        .arg(overlay)
        .output()
        .await
        .map_err(|e| Error::ExternalTool(format!("qemu-img create not found: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(format!(
            "qemu-img create (overlay) failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn set_mode_0644(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o644);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_uses_image_id() {
        let lib = ImageLibrary::new(PathBuf::from("/tmp/base"));
        assert_eq!(lib.base_path("ubuntu-22.04"), PathBuf::from("/tmp/base/ubuntu-22.04.qcow2"));
    }

    #[test]
    fn known_sources_cover_all_os_families() {
        let sources = known_sources();
        for family in ["ubuntu-22.04", "debian-12", "fedora-40", "rocky-9", "almalinux-9", "centos-9"] {
            assert!(sources.contains_key(family), "missing source for {family}");
        }
    }
}
