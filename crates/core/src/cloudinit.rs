//! Cloud-Init Builder: renders NoCloud user-data/meta-data and seals them into an ISO9660 seed
//! image consumed by the guest's cloud-init service on first boot.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vps_common::{Error, OsFamily, Result, Template, VmIdentity};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Validates a hostname against the usual DNS label rules: overall length, per-label length, and
/// characters (`[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?`).
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return Err(Error::InvalidInput(format!(
            "hostname length must be 1..={MAX_HOSTNAME_LEN}, got {}",
            hostname.len()
        )));
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidInput(format!("invalid hostname label: {label}")));
        }
        let bytes = label.as_bytes();
        let valid_start_end = bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric();
        let valid_body = bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-');
        if !valid_start_end || !valid_body {
            return Err(Error::InvalidInput(format!("invalid hostname label: {label}")));
        }
    }
    Ok(())
}

/// Renders the `user-data` cloud-config for a VM, applying its template's per-OS-family packages
/// and commands in order: package installs happen before any templated command runs.
pub fn render_user_data(identity: &VmIdentity, template: &Template) -> Result<String> {
    validate_hostname(&identity.hostname)?;
    let family = OsFamily::from_image_id(&identity.image_id)
        .ok_or_else(|| Error::InvalidInput(format!("unrecognized image id: {}", identity.image_id)))?;

    let packages = template.packages.get(family.key()).cloned().unwrap_or_default();
    let commands = template.commands.get(family.key()).cloned().unwrap_or_default();

    let mut out = String::new();
    out.push_str("#cloud-config\n");
    out.push_str(&format!("hostname: {}\n", identity.hostname));
    out.push_str(&format!("fqdn: {}\n", identity.hostname));
    out.push_str("disable_root: false\n");
    out.push_str("ssh_pwauth: true\n");
    out.push_str("chpasswd:\n");
    out.push_str("  expire: false\n");
    out.push_str("  list: |\n");
    out.push_str(&format!("    root:{}\n", identity.password));
    out.push_str("package_update: true\n");
    out.push_str("package_upgrade: true\n");

    if !packages.is_empty() {
        out.push_str("packages:\n");
        for pkg in &packages {
            out.push_str(&format!("  - {pkg}\n"));
        }
    }

    out.push_str("write_files:\n");
    out.push_str("  - path: /etc/ssh/sshd_config.d/99-vps-forge.conf\n");
    out.push_str("    content: |\n");
    out.push_str("      PermitRootLogin yes\n");

    out.push_str("runcmd:\n");
    out.push_str("  - systemctl restart sshd || systemctl restart ssh\n");
    for cmd in &commands {
        out.push_str(&format!("  - {cmd}\n"));
    }

    Ok(out)
}

/// Renders the `meta-data` document: a fresh opaque instance id per VM, so cloud-init always
/// treats each created VM as a first boot even if the disk image is reused.
pub fn render_meta_data(identity: &VmIdentity) -> String {
    let instance_id = uuid::Uuid::new_v4();
    format!(
        "instance-id: {instance_id}\nlocal-hostname: {}\n",
        identity.hostname
    )
}

/// Builds the NoCloud seed ISO for `identity`/`template` at `dest` (an ISO9660 image with the
/// Joliet and Rock Ridge extensions, volume label `cidata`, containing `user-data`/`meta-data`).
pub async fn build_seed_iso(identity: &VmIdentity, template: &Template, dest: &Path) -> Result<()> {
    let user_data = render_user_data(identity, template)?;
    let meta_data = render_meta_data(identity);

    let tmp_dir = tempfile::tempdir()?;
    tokio::fs::write(tmp_dir.path().join("user-data"), user_data).await?;
    tokio::fs::write(tmp_dir.path().join("meta-data"), meta_data).await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    run_iso_tool(tmp_dir.path(), dest).await
}

async fn run_iso_tool(source_dir: &Path, dest: &Path) -> Result<()> {
    match run_genisoimage(source_dir, dest).await {
        Ok(()) => Ok(()),
        Err(primary_err) => {
            warn!(error = %primary_err, "genisoimage unavailable, falling back to mkisofs");
            run_mkisofs(source_dir, dest).await.map_err(|_| primary_err)
        }
    }
}

async fn run_genisoimage(source_dir: &Path, dest: &Path) -> Result<()> {
    run_iso_command("genisoimage", source_dir, dest).await
}

async fn run_mkisofs(source_dir: &Path, dest: &Path) -> Result<()> {
    run_iso_command("mkisofs", source_dir, dest).await
}

async fn run_iso_command(program: &str, source_dir: &Path, dest: &Path) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(["-output"])
        .arg(dest)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(source_dir)
        .output()
        .await
        .map_err(|e| Error::ExternalTool(format!("{program} not found: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(format!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    debug!(dest = %dest.display(), "seed ISO written");
    Ok(())
}

pub fn cloud_init_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join("seed.iso")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> VmIdentity {
        VmIdentity {
            id: "vm-1".into(),
            name: "dev-box".into(),
            hostname: "dev-box.vps.local".into(),
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
            password: "correcthorse".into(),
        }
    }

    fn blank_template() -> Template {
        Template {
            template_id: "blank".into(),
            name: "Blank".into(),
            packages: Default::default(),
            commands: Default::default(),
            compatible_image_ids: vec!["ubuntu-22.04".into()],
        }
    }

    #[test]
    fn hostname_accepts_valid_labels() {
        assert!(validate_hostname("dev-box.vps.local").is_ok());
    }

    #[test]
    fn hostname_rejects_leading_hyphen() {
        assert!(validate_hostname("-dev-box").is_err());
    }

    #[test]
    fn hostname_rejects_empty_label() {
        assert!(validate_hostname("dev..box").is_err());
    }

    #[test]
    fn user_data_includes_root_login_and_password() {
        let identity = sample_identity();
        let rendered = render_user_data(&identity, &blank_template()).unwrap();
        assert!(rendered.contains("root:correcthorse"));
        assert!(rendered.contains("PermitRootLogin yes"));
        assert!(!rendered.contains("packages:"));
    }

    #[test]
    fn user_data_rejects_unknown_image_family() {
        let mut identity = sample_identity();
        identity.image_id = "arch-linux".into();
        assert!(render_user_data(&identity, &blank_template()).is_err());
    }

    #[test]
    fn meta_data_has_fresh_instance_id_each_call() {
        let identity = sample_identity();
        let a = render_meta_data(&identity);
        let b = render_meta_data(&identity);
        assert_ne!(a, b);
    }
}
