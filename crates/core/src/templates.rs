//! The template table: immutable tagged variants keyed by id, constant for the process lifetime.
//!
//! Per DESIGN NOTES, templates are not dynamically typed — they are an enumerated table of
//! per-OS-family (packages, commands) built once at startup and looked up by id. Unknown ids are
//! rejected at validation time, before any VM work starts.

use std::collections::HashMap;
use vps_common::Template;

/// Builds the fixed template table available to this process.
///
/// `blank` contributes zero packages and zero commands for every OS family, as required by the
/// cloud-init builder's rendering rules.
pub fn builtin_templates() -> HashMap<String, Template> {
    let mut table = HashMap::new();

    table.insert(
        "blank".to_string(),
        Template {
            template_id: "blank".to_string(),
            name: "Blank".to_string(),
            packages: HashMap::new(),
            commands: HashMap::new(),
            compatible_image_ids: vec![
                "ubuntu-22.04".to_string(),
                "ubuntu-24.04".to_string(),
                "debian-12".to_string(),
                "fedora-40".to_string(),
                "rocky-9".to_string(),
                "almalinux-9".to_string(),
                "centos-9".to_string(),
            ],
        },
    );

    table.insert("docker".to_string(), docker_template());
    table.insert("web-dev".to_string(), web_dev_template());

    table
}

fn docker_template() -> Template {
    let mut packages = HashMap::new();
    packages.insert(
        "ubuntu".to_string(),
        vec!["ca-certificates".to_string(), "curl".to_string()],
    );
    packages.insert(
        "debian".to_string(),
        vec!["ca-certificates".to_string(), "curl".to_string()],
    );
    packages.insert("fedora".to_string(), vec!["dnf-plugins-core".to_string()]);
    packages.insert("rocky".to_string(), vec!["dnf-plugins-core".to_string()]);
    packages.insert("almalinux".to_string(), vec!["dnf-plugins-core".to_string()]);
    packages.insert("centos".to_string(), vec!["dnf-plugins-core".to_string()]);

    let mut commands = HashMap::new();
    commands.insert(
        "ubuntu".to_string(),
        vec![
            "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh".to_string(),
            "sh /tmp/get-docker.sh".to_string(),
            "systemctl enable --now docker".to_string(),
        ],
    );
    commands.insert("debian".to_string(), commands["ubuntu"].clone());
    commands.insert(
        "fedora".to_string(),
        vec![
            "dnf config-manager --add-repo https://download.docker.com/linux/fedora/docker-ce.repo".to_string(),
            "dnf install -y docker-ce docker-ce-cli containerd.io".to_string(),
            "systemctl enable --now docker".to_string(),
        ],
    );
    commands.insert("rocky".to_string(), commands["fedora"].clone());
    commands.insert("almalinux".to_string(), commands["fedora"].clone());
    commands.insert("centos".to_string(), commands["fedora"].clone());

    Template {
        template_id: "docker".to_string(),
        name: "Docker".to_string(),
        packages,
        commands,
        compatible_image_ids: vec![
            "ubuntu-22.04".to_string(),
            "ubuntu-24.04".to_string(),
            "debian-12".to_string(),
            "fedora-40".to_string(),
            "rocky-9".to_string(),
            "almalinux-9".to_string(),
            "centos-9".to_string(),
        ],
    }
}

fn web_dev_template() -> Template {
    let mut packages = HashMap::new();
    packages.insert(
        "ubuntu".to_string(),
        vec!["nodejs".to_string(), "npm".to_string(), "git".to_string()],
    );
    packages.insert("debian".to_string(), packages["ubuntu"].clone());
    packages.insert(
        "fedora".to_string(),
        vec!["nodejs".to_string(), "git".to_string()],
    );
    packages.insert("rocky".to_string(), packages["fedora"].clone());
    packages.insert("almalinux".to_string(), packages["fedora"].clone());
    packages.insert("centos".to_string(), packages["fedora"].clone());

    Template {
        template_id: "web-dev".to_string(),
        name: "Web Development".to_string(),
        packages,
        commands: HashMap::new(),
        compatible_image_ids: vec![
            "ubuntu-22.04".to_string(),
            "ubuntu-24.04".to_string(),
            "debian-12".to_string(),
            "fedora-40".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_has_no_packages_or_commands() {
        let table = builtin_templates();
        let blank = &table["blank"];
        assert!(blank.packages.is_empty());
        assert!(blank.commands.is_empty());
    }

    #[test]
    fn docker_has_per_family_commands() {
        let table = builtin_templates();
        let docker = &table["docker"];
        assert!(!docker.commands["ubuntu"].is_empty());
        assert!(!docker.commands["fedora"].is_empty());
    }
}
