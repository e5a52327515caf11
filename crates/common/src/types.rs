//! Core data types for the VPS control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// VM lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Starting,
    Restarting,
    Failed,
    Expired,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Creating => "creating",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Restarting => "restarting",
            VmStatus::Failed => "failed",
            VmStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Creation-pipeline stage, informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStage {
    Init,
    CreatingDisk,
    PreparingCloudInit,
    StartingQemu,
    ConfiguringVnc,
    InstallingTemplate,
    Completed,
    Failed,
}

impl std::fmt::Display for VmStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStage::Init => "init",
            VmStage::CreatingDisk => "creating_disk",
            VmStage::PreparingCloudInit => "preparing_cloud_init",
            VmStage::StartingQemu => "starting_qemu",
            VmStage::ConfiguringVnc => "configuring_vnc",
            VmStage::InstallingTemplate => "installing_template",
            VmStage::Completed => "completed",
            VmStage::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Immutable identity and placement fields set at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIdentity {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub image_id: String,
    pub template_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub vnc_port: u16,
    pub ssh_port: u16,
    pub disk_path: PathBuf,
    pub cloud_init_path: PathBuf,
    pub monitor_socket_path: PathBuf,
    pub log_path: PathBuf,
    pub password: String,
}

/// A VM record: immutable identity plus mutable runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    #[serde(flatten)]
    pub identity: VmIdentity,
    pub qemu_pid: u32,
    pub status: VmStatus,
    pub stage: VmStage,
    pub progress: u8,
    pub error_message: Option<String>,
}

impl VmRecord {
    pub fn new(identity: VmIdentity) -> Self {
        Self {
            identity,
            qemu_pid: 0,
            status: VmStatus::Creating,
            stage: VmStage::Init,
            progress: 0,
            error_message: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Advances stage/progress; never moves progress backwards (invariant iv).
    pub fn advance(&mut self, stage: VmStage, progress: u8) {
        self.stage = stage;
        self.progress = self.progress.max(progress);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = VmStatus::Failed;
        self.stage = VmStage::Failed;
        self.error_message = Some(message.into());
    }
}

/// An on-disk prepared base image.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub image_id: String,
    pub source_url: String,
    pub local_base_path: PathBuf,
    pub prepared: bool,
}

/// A cloud-init provisioning template, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub name: String,
    /// OS family -> ordered package list.
    pub packages: HashMap<String, Vec<String>>,
    /// OS family -> ordered command list, run verbatim.
    pub commands: HashMap<String, Vec<String>>,
    pub compatible_image_ids: Vec<String>,
}

/// A single point-in-time resource sample for a running VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub t: i64,
    pub cpu_percent: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub mem_cache: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_read_ops: u64,
    pub disk_write_ops: u64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub net_rx_pkts: u64,
    pub net_tx_pkts: u64,
    pub net_rx_rate: f64,
    pub net_tx_rate: f64,
}

/// OS package-manager family, derived from an image id by prefix match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Fedora,
    Rocky,
    AlmaLinux,
    Centos,
}

impl OsFamily {
    /// Derives the OS family from an image id by prefix match, per the cloud-init builder spec.
    pub fn from_image_id(image_id: &str) -> Option<Self> {
        let id = image_id.to_ascii_lowercase();
        if id.starts_with("ubuntu") {
            Some(Self::Ubuntu)
        } else if id.starts_with("debian") {
            Some(Self::Debian)
        } else if id.starts_with("fedora") {
            Some(Self::Fedora)
        } else if id.starts_with("rocky") {
            Some(Self::Rocky)
        } else if id.starts_with("almalinux") {
            Some(Self::AlmaLinux)
        } else if id.starts_with("centos") {
            Some(Self::Centos)
        } else {
            None
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::Fedora => "fedora",
            OsFamily::Rocky => "rocky",
            OsFamily::AlmaLinux => "almalinux",
            OsFamily::Centos => "centos",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_family_prefix_match() {
        assert_eq!(OsFamily::from_image_id("ubuntu-22.04"), Some(OsFamily::Ubuntu));
        assert_eq!(OsFamily::from_image_id("debian-12"), Some(OsFamily::Debian));
        assert_eq!(OsFamily::from_image_id("rocky-9"), Some(OsFamily::Rocky));
        assert_eq!(OsFamily::from_image_id("almalinux-9"), Some(OsFamily::AlmaLinux));
        assert_eq!(OsFamily::from_image_id("arch-linux"), None);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let identity = VmIdentity {
            id: "abc".into(),
            name: "n".into(),
            hostname: "n.vps.local".into(),
            image_id: "ubuntu-22.04".into(),
            template_id: "blank".into(),
            created_at: 0,
            expires_at: 900,
            vnc_port: 5900,
            ssh_port: 2200,
            disk_path: PathBuf::new(),
            cloud_init_path: PathBuf::new(),
            monitor_socket_path: PathBuf::new(),
            log_path: PathBuf::new(),
            password: "x".into(),
        };
        let mut rec = VmRecord::new(identity);
        rec.advance(VmStage::CreatingDisk, 40);
        rec.advance(VmStage::Init, 10);
        assert_eq!(rec.progress, 40);
    }
}
