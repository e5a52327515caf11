//! Lifecycle Controller: the VM record store, port allocator, client-address index and the
//! staged async creation/deletion/start/stop/restart orchestration.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use vps_common::config::{LIFETIME, SSH_PORT_BASE, VNC_PORT_BASE};
use vps_common::{
    Error, QemuConfig, Result, ServerConfig, Template, VmIdentity, VmRecord, VmStage, VmStatus,
};

use crate::image::ImageLibrary;
use crate::metrics::MetricsCollector;
use crate::vnc_bridge::VncBridgeController;
use crate::{cloudinit, image, supervisor};

struct PortAllocator {
    next_vnc: u16,
    next_ssh: u16,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            next_vnc: VNC_PORT_BASE,
            next_ssh: SSH_PORT_BASE,
        }
    }

    fn allocate(&mut self) -> (u16, u16) {
        let vnc = self.next_vnc;
        let ssh = self.next_ssh;
        self.next_vnc += 1;
        self.next_ssh += 1;
        (vnc, ssh)
    }
}

struct Store {
    records: HashMap<String, VmRecord>,
    client_index: HashMap<String, String>,
    ports: PortAllocator,
}

impl Store {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            client_index: HashMap::new(),
            ports: PortAllocator::new(),
        }
    }
}

/// Request parameters for creating a VM, as accepted from the HTTP surface.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub client_addr: String,
    pub name: String,
    pub hostname: String,
    pub image_id: String,
    pub template_id: String,
    pub password: String,
}

/// Owns all mutable VM state and orchestrates the lifecycle state machine. Cheaply cloneable;
/// every clone shares the same underlying store and collaborators.
#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<RwLock<Store>>,
    config: Arc<ServerConfig>,
    images: Arc<ImageLibrary>,
    templates: Arc<HashMap<String, Template>>,
    vnc: VncBridgeController,
    metrics: MetricsCollector,
}

impl LifecycleController {
    pub fn new(
        config: Arc<ServerConfig>,
        templates: Arc<HashMap<String, Template>>,
        vnc: VncBridgeController,
        metrics: MetricsCollector,
    ) -> Self {
        let images = Arc::new(ImageLibrary::new(config.base_dir()));
        Self {
            store: Arc::new(RwLock::new(Store::new())),
            config,
            images,
            templates,
            vnc,
            metrics,
        }
    }

    pub fn get(&self, vm_id: &str) -> Result<VmRecord> {
        self.store
            .read()
            .records
            .get(vm_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "vm".into(),
                id: vm_id.into(),
            })
    }

    pub fn list(&self) -> Vec<VmRecord> {
        self.store.read().records.values().cloned().collect()
    }

    /// Validates the request, registers a `creating` record under the controller's lock, and
    /// spawns the detached staged-creation task. Returns the initial record immediately.
    pub fn create(&self, req: CreateRequest) -> Result<VmRecord> {
        cloudinit::validate_hostname(&req.hostname)?;
        vps_common::OsFamily::from_image_id(&req.image_id)
            .ok_or_else(|| Error::InvalidInput(format!("unrecognized image id: {}", req.image_id)))?;
        let template = self
            .templates
            .get(&req.template_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown template id: {}", req.template_id)))?
            .clone();
        if !template.compatible_image_ids.iter().any(|id| id == &req.image_id) {
            return Err(Error::InvalidInput(format!(
                "template {} is not compatible with image {}",
                req.template_id, req.image_id
            )));
        }

        let record = {
            let mut store = self.store.write();
            if store.client_index.contains_key(&req.client_addr) {
                return Err(Error::ResourceConflict(format!(
                    "client {} already owns a VM",
                    req.client_addr
                )));
            }

            let (vnc_port, ssh_port) = store.ports.allocate();
            let id = uuid::Uuid::new_v4().to_string();
            let now = unix_time_secs();
            let instance_dir = self.config.instance_dir(&id);

            let identity = VmIdentity {
                id: id.clone(),
                name: req.name.clone(),
                hostname: req.hostname.clone(),
                image_id: req.image_id.clone(),
                template_id: req.template_id.clone(),
                created_at: now,
                expires_at: now + LIFETIME.as_secs() as i64,
                vnc_port,
                ssh_port,
                disk_path: instance_dir.join("disk.qcow2"),
                cloud_init_path: cloudinit::cloud_init_path(&instance_dir),
                monitor_socket_path: instance_dir.join("monitor.sock"),
                log_path: self.config.logs_dir().join(format!("{id}.log")),
                password: req.password.clone(),
            };

            let record = VmRecord::new(identity);
            store.records.insert(id.clone(), record.clone());
            store.client_index.insert(req.client_addr.clone(), id.clone());
            record
        };

        let controller = self.clone();
        let vm_id = record.id().to_string();
        let client_addr = req.client_addr.clone();
        let template_for_task = template;
        tokio::spawn(async move {
            controller.run_creation(vm_id, client_addr, template_for_task).await;
        });

        Ok(record)
    }

    async fn run_creation(&self, vm_id: String, _client_addr: String, template: Template) {
        // The client-address entry stays put on failure: the index is only cleared on explicit
        // delete or expiry, so a failed creation still occupies the client's one-VM slot until
        // they delete it (or it is deleted for them).
        if let Err(e) = self.create_stages(&vm_id, &template).await {
            error!(vm_id, error = %e, "VM creation failed");
            self.mark_failed(&vm_id, &e.to_string());
            return;
        }
        self.advance(&vm_id, VmStage::Completed, 100);
        self.set_status(&vm_id, VmStatus::Running);
        self.arm_expiry(vm_id);
    }

    async fn create_stages(&self, vm_id: &str, template: &Template) -> Result<()> {
        self.advance(vm_id, VmStage::Init, 10);
        let identity = self.identity_of(vm_id)?;

        self.advance(vm_id, VmStage::Init, 20);
        self.images.prepare(&identity.image_id).await.map_err(|e| {
            Error::ExternalTool(format!("image not available: {}: {e}", identity.image_id))
        })?;

        self.advance(vm_id, VmStage::CreatingDisk, 40);
        let base = self.images.base_path(&identity.image_id);
        image::create_overlay(&base, &identity.disk_path).await?;

        self.advance(vm_id, VmStage::PreparingCloudInit, 60);
        cloudinit::build_seed_iso(&identity, template, &identity.cloud_init_path).await?;

        self.advance(vm_id, VmStage::StartingQemu, 80);
        let pid = supervisor::spawn(&identity, &self.config.qemu).await?;
        self.set_pid(vm_id, pid);
        self.metrics.track(vm_id, pid, identity.monitor_socket_path.clone());

        self.advance(vm_id, VmStage::ConfiguringVnc, 90);
        if let Err(e) = self.vnc.start(identity.vnc_port).await {
            warn!(vm_id, error = %e, "vnc bridge failed to start, VM stays running without web console");
        }

        Ok(())
    }

    fn identity_of(&self, vm_id: &str) -> Result<VmIdentity> {
        self.get(vm_id).map(|r| r.identity)
    }

    fn advance(&self, vm_id: &str, stage: VmStage, progress: u8) {
        if let Some(record) = self.store.write().records.get_mut(vm_id) {
            record.advance(stage, progress);
        }
    }

    fn set_status(&self, vm_id: &str, status: VmStatus) {
        if let Some(record) = self.store.write().records.get_mut(vm_id) {
            record.status = status;
        }
    }

    fn set_pid(&self, vm_id: &str, pid: u32) {
        if let Some(record) = self.store.write().records.get_mut(vm_id) {
            record.qemu_pid = pid;
        }
    }

    fn mark_failed(&self, vm_id: &str, message: &str) {
        if let Some(record) = self.store.write().records.get_mut(vm_id) {
            record.fail(message.to_string());
        }
    }

    fn arm_expiry(&self, vm_id: String) {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LIFETIME).await;
            let _ = controller.delete(&vm_id).await;
        });
    }

    /// Tears a VM down: stops the VNC bridge, force-kills QEMU, removes the client index entry
    /// and the on-disk instance directory, then removes the record. Idempotent in the sense that
    /// repeated deletes never panic or double-act, but a VM already gone returns `NotFound` just
    /// as a `get` of the same id would.
    pub async fn delete(&self, vm_id: &str) -> Result<()> {
        let Some(record) = self.store.read().records.get(vm_id).cloned() else {
            return Err(Error::NotFound {
                kind: "vm".into(),
                id: vm_id.into(),
            });
        };

        self.vnc.stop(record.identity.vnc_port).await;
        self.metrics.untrack(vm_id);
        if record.qemu_pid > 0 {
            let _ = supervisor::kill(record.qemu_pid);
        }

        let instance_dir = self.config.instance_dir(vm_id);
        if let Err(e) = tokio::fs::remove_dir_all(&instance_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm_id, error = %e, "failed to remove instance directory");
            }
        }

        let mut store = self.store.write();
        store.records.remove(vm_id);
        store.client_index.retain(|_, v| v != vm_id);
        info!(vm_id, "VM deleted");
        Ok(())
    }

    /// Requires `status=running`. Issues QMP `system_powerdown` and waits for the process to
    /// exit or the timeout to force-kill it.
    pub async fn stop(&self, vm_id: &str) -> Result<()> {
        let record = self.get(vm_id)?;
        if record.status != VmStatus::Running {
            return Err(Error::ResourceConflict(format!(
                "VM {vm_id} is not running (status={})",
                record.status
            )));
        }
        self.set_status(vm_id, VmStatus::Stopping);
        supervisor::shutdown_graceful(&record.identity, record.qemu_pid).await?;
        self.set_status(vm_id, VmStatus::Stopped);
        Ok(())
    }

    /// Requires `status=stopped`. Removes any stale monitor socket and respawns QEMU.
    pub async fn start(&self, vm_id: &str) -> Result<()> {
        let record = self.get(vm_id)?;
        if record.status != VmStatus::Stopped {
            return Err(Error::ResourceConflict(format!(
                "VM {vm_id} is not stopped (status={})",
                record.status
            )));
        }
        self.set_status(vm_id, VmStatus::Starting);
        let _ = tokio::fs::remove_file(&record.identity.monitor_socket_path).await;
        let pid = supervisor::spawn(&record.identity, &self.config.qemu).await?;
        self.set_pid(vm_id, pid);
        self.metrics
            .track(vm_id, pid, record.identity.monitor_socket_path.clone());
        self.set_status(vm_id, VmStatus::Running);
        Ok(())
    }

    /// Requires `status=running`. QMP `system_reset` followed by a bounded settle delay.
    pub async fn restart(&self, vm_id: &str) -> Result<()> {
        let record = self.get(vm_id)?;
        if record.status != VmStatus::Running {
            return Err(Error::ResourceConflict(format!(
                "VM {vm_id} is not running (status={})",
                record.status
            )));
        }
        self.set_status(vm_id, VmStatus::Restarting);
        supervisor::reset(&record.identity).await?;
        self.set_status(vm_id, VmStatus::Running);
        Ok(())
    }

    pub fn metrics_history(&self, vm_id: &str) -> Vec<vps_common::ResourceSample> {
        self.metrics.history(vm_id)
    }

    pub fn templates(&self) -> Vec<Template> {
        self.templates.values().cloned().collect()
    }

    /// Enumerates every tracked VM and tears it down in parallel. Used on SIGINT/SIGTERM and
    /// from the panic hook so nothing is left running once the process exits.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.store.read().records.keys().cloned().collect();
        let tasks = ids.into_iter().map(|id| {
            let controller = self.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.delete(&id).await {
                    warn!(vm_id = %id, error = %e, "error during shutdown cleanup");
                }
            })
        });
        futures::future::join_all(tasks).await;
    }
}

fn unix_time_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocator_is_monotonic_and_never_reused() {
        let mut alloc = PortAllocator::new();
        let (v1, s1) = alloc.allocate();
        let (v2, s2) = alloc.allocate();
        assert_eq!(v1, VNC_PORT_BASE);
        assert_eq!(s1, SSH_PORT_BASE);
        assert_eq!(v2, v1 + 1);
        assert_eq!(s2, s1 + 1);
    }
}
