//! VM Supervisor: spawns and controls a single QEMU process and talks QMP to it.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vps_common::config::{GRACEFUL_SHUTDOWN_TIMEOUT, RAM_SIZE_MIB};
use vps_common::qmp::QmpClient;
use vps_common::{Error, QemuConfig, Result, VmIdentity};

const PIDFILE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PIDFILE_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_RETRIES: u32 = 3;
const VERIFY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Derives a deterministic, locally-administered MAC address from the VM id so the same VM
/// always gets the same guest network identity across restarts: `52:54:00:` followed by the
/// first three bytes of the id's hex digits, zero-padded if the id is short on hex characters.
pub fn mac_for_vm(vm_id: &str) -> String {
    let mut hex: String = vm_id.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    hex.truncate(6);
    while hex.len() < 6 {
        hex.push('0');
    }
    format!("52:54:00:{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6])
}

fn pidfile_path(identity: &VmIdentity) -> std::path::PathBuf {
    identity
        .monitor_socket_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}.pid", identity.id))
}

fn resolve_binary(config: &QemuConfig) -> String {
    config
        .binary_path
        .clone()
        .unwrap_or_else(|| "qemu-system-x86_64".to_string())
}

/// Builds the argv for the QEMU process per the supervisor's machine layout: KVM acceleration
/// (when enabled), 2 vCPUs across 2 sockets, 1 core, 1 thread, `RAM_SIZE_MIB` of RAM, the disk
/// and cloud-init ISO as separate drives, a user-mode virtio-net NIC with an SSH hostfwd rule, a
/// VNC display, a QMP control socket, a pidfile, and console logging to a file.
pub fn build_args(identity: &VmIdentity, config: &QemuConfig) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-name".into());
    args.push(format!("guest={},debug-threads=on", identity.id));

    if config.enable_kvm {
        args.push("-enable-kvm".into());
        args.push("-cpu".into());
        args.push(config.cpu_type.clone());
    } else {
        args.push("-cpu".into());
        args.push("qemu64".into());
    }

    args.push("-machine".into());
    args.push(config.machine_type.clone());

    args.push("-smp".into());
    args.push("cpus=2,sockets=2,cores=1,threads=1".into());

    args.push("-m".into());
    args.push(format!("{RAM_SIZE_MIB}"));

    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=qcow2",
        identity.disk_path.display()
    ));

    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=raw,readonly=on",
        identity.cloud_init_path.display()
    ));

    let mac = mac_for_vm(&identity.id);
    args.push("-netdev".into());
    args.push(format!(
        "user,id=net0,hostfwd=tcp::{}-:22",
        identity.ssh_port
    ));
    args.push("-device".into());
    args.push(format!("virtio-net-pci,netdev=net0,mac={mac}"));

    let vnc_display = identity.vnc_port - vps_common::config::VNC_PORT_BASE;
    args.push("-vnc".into());
    args.push(format!("0.0.0.0:{vnc_display}"));

    args.push("-qmp".into());
    args.push(format!(
        "unix:{},server,nowait",
        identity.monitor_socket_path.display()
    ));

    args.push("-pidfile".into());
    args.push(pidfile_path(identity).display().to_string());

    args.push("-daemonize".into());

    args.push("-D".into());
    args.push(identity.log_path.display().to_string());

    args
}

/// Spawns QEMU for `identity`, waits for its pidfile, then verifies the process is alive and
/// the right binary before handing back its pid.
pub async fn spawn(identity: &VmIdentity, config: &QemuConfig) -> Result<u32> {
    let binary = resolve_binary(config);
    let args = build_args(identity, config);

    info!(vm_id = %identity.id, binary = %binary, "spawning qemu");
    let status = Command::new(&binary)
        .args(&args)
        .status()
        .await
        .map_err(|e| Error::ExternalTool(format!("{binary} not found: {e}")))?;
    if !status.success() {
        return Err(Error::ExternalTool(format!(
            "{binary} exited immediately with {status}"
        )));
    }

    let pid = wait_for_pidfile(identity).await?;
    verify_with_retries(pid, &binary).await?;
    Ok(pid)
}

async fn wait_for_pidfile(identity: &VmIdentity) -> Result<u32> {
    let path = pidfile_path(identity);
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            if let Ok(pid) = content.trim().parse::<u32>() {
                return Ok(pid);
            }
        }
        if start.elapsed() > PIDFILE_POLL_TIMEOUT {
            return Err(Error::Timeout(format!(
                "pidfile {} did not appear within {:?}",
                path.display(),
                PIDFILE_POLL_TIMEOUT
            )));
        }
        tokio::time::sleep(PIDFILE_POLL_INTERVAL).await;
    }
}

async fn verify_with_retries(pid: u32, binary: &str) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..VERIFY_RETRIES {
        match verify(pid, binary).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(pid, attempt, error = %e, "qemu process verification failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(VERIFY_RETRY_INTERVAL).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("verify failed with no recorded error".into())))
}

/// Checks that `pid` is alive and its `/proc/{pid}/cmdline` mentions the QEMU binary tag.
pub async fn verify(pid: u32, binary: &str) -> Result<()> {
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
        return Err(Error::Preflight(format!("process {pid} is not running")));
    }

    let cmdline_path = format!("/proc/{pid}/cmdline");
    let cmdline = tokio::fs::read(&cmdline_path)
        .await
        .map_err(|e| Error::Preflight(format!("cannot read {cmdline_path}: {e}")))?;
    let cmdline_str = String::from_utf8_lossy(&cmdline);
    let binary_name = Path::new(binary)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(binary);
    if !cmdline_str.contains(binary_name) {
        return Err(Error::Preflight(format!(
            "process {pid} cmdline does not reference {binary_name}"
        )));
    }
    Ok(())
}

/// Requests a clean shutdown over QMP, then polls `query-status` every five seconds for up to
/// `GRACEFUL_SHUTDOWN_TIMEOUT` before escalating to a hard kill.
pub async fn shutdown_graceful(identity: &VmIdentity, pid: u32) -> Result<()> {
    let mut client = match QmpClient::connect(&identity.monitor_socket_path).await {
        Ok(c) => c,
        Err(e) => {
            warn!(vm_id = %identity.id, error = %e, "QMP unavailable for graceful shutdown, killing");
            return kill(pid);
        }
    };
    client.system_powerdown().await?;

    let start = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        match client.query_status().await {
            Ok(status) if !status.running => {
                debug!(vm_id = %identity.id, "guest powered down cleanly");
                return Ok(());
            }
            _ => {}
        }
        if start.elapsed() > GRACEFUL_SHUTDOWN_TIMEOUT {
            warn!(vm_id = %identity.id, "graceful shutdown timed out, killing");
            return kill(pid);
        }
    }
}

/// Issues a QMP `system_reset` and waits briefly for the guest to settle.
pub async fn reset(identity: &VmIdentity) -> Result<()> {
    let mut client = QmpClient::connect(&identity.monitor_socket_path).await?;
    client.system_reset().await?;
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(())
}

/// Sends SIGKILL to the QEMU process. Idempotent: a missing process is not an error.
pub fn kill(pid: u32) -> Result<()> {
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Internal(format!("kill({pid}) failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic_per_vm_id() {
        assert_eq!(mac_for_vm("vm-1"), mac_for_vm("vm-1"));
        assert_ne!(mac_for_vm("vm-1"), mac_for_vm("vm-2"));
    }

    #[test]
    fn mac_uses_locally_administered_prefix() {
        assert!(mac_for_vm("vm-1").starts_with("52:54:00:"));
    }

    #[test]
    fn args_include_vnc_ssh_and_qmp_socket() {
        let identity = VmIdentity {
            id: "vm-1".into(),
            name: "n".into(),
            hostname: "n.vps.local".into(),
            image_id: "ubuntu-22.04".into(),
            template_id: "blank".into(),
            created_at: 0,
            expires_at: 900,
            vnc_port: 5901,
            ssh_port: 2201,
            disk_path: "/tmp/disk.qcow2".into(),
            cloud_init_path: "/tmp/seed.iso".into(),
            monitor_socket_path: "/tmp/vm-1.qmp".into(),
            log_path: "/tmp/vm-1.log".into(),
            password: "x".into(),
        };
        let args = build_args(&identity, &QemuConfig::default());
        let joined = args.join(" ");
        assert!(joined.contains("0.0.0.0:1"));
        assert!(joined.contains("hostfwd=tcp::2201-:22"));
        assert!(joined.contains("unix:/tmp/vm-1.qmp"));
    }

    #[test]
    fn kill_is_idempotent_for_missing_process() {
        assert!(kill(999_999_999).is_ok());
    }
}
