//! Control plane configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fixed constants from the external interface section. These are not configurable: they are
/// part of the contract the API and testable properties rely on.
pub const LIFETIME: Duration = Duration::from_secs(15 * 60);
pub const RAM_SIZE_MIB: u64 = 4096;
pub const DISK_SIZE_GIB: u64 = 50;
pub const VNC_PORT_BASE: u16 = 5900;
pub const SSH_PORT_BASE: u16 = 2200;
pub const WS_PORT_OFFSET: u16 = 1000;
pub const METRICS_CADENCE: Duration = Duration::from_secs(2);
pub const RETENTION_WINDOW: usize = 300;
pub const CREATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Top-level server configuration, loadable from TOML and overridable by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base directory for images/, disks/, logs/ (default `/var/lib/vps-service`).
    pub store_path: PathBuf,

    /// HTTP listen address.
    pub listen: String,

    /// Shared secret required on the `X-API-Key` header. Not serialized to disk.
    #[serde(skip)]
    pub api_key: String,

    pub qemu: QemuConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            listen: "0.0.0.0:8080".to_string(),
            api_key: String::new(),
            qemu: QemuConfig::default(),
        }
    }
}

/// QEMU-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QemuConfig {
    /// Path to the QEMU system binary; auto-detected (`qemu-system-x86_64`) if unset.
    pub binary_path: Option<String>,
    pub machine_type: String,
    pub cpu_type: String,
    pub enable_kvm: bool,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            machine_type: "pc".to_string(),
            cpu_type: "host".to_string(),
            enable_kvm: true,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file, falling back to defaults if it does not exist.
    ///
    /// The API key is never stored on disk; it is threaded in separately from the environment.
    pub fn load(path: &std::path::Path, api_key: String) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.api_key = api_key;
        Ok(config)
    }

    /// Saves configuration to a TOML file (the API key is omitted).
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn base_dir(&self) -> PathBuf {
        self.store_path.join("base")
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.store_path.join("disks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.store_path.join("logs")
    }

    pub fn instance_dir(&self, vm_id: &str) -> PathBuf {
        self.disks_dir().join(vm_id)
    }
}

/// Default base directory: `/var/lib/vps-service`.
pub fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/vps-service")
}
