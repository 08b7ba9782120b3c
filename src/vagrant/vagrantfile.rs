//! Rendering of the per-instance Vagrantfile.

use crate::plan::{InfrastructurePlan, NetworkMode, Provider};
use crate::record::PortBinding;

/// Renders the Vagrantfile for `plan` with the resolved `ports`.
///
/// Pure function of its inputs; the driver writes the result into the
/// instance's machine directory before every create.
#[must_use]
pub fn render(plan: &InfrastructurePlan, ports: &[PortBinding]) -> String {
    let resources = plan.resources();
    let provider = plan.provider().unwrap_or(Provider::Virtualbox);
    let mut lines = vec![
        format!("# Managed by berth for {}; regenerated on create.", plan.id()),
        String::from("Vagrant.configure(\"2\") do |config|"),
        format!("  config.vm.box = {}", ruby_str(plan.image())),
        format!("  config.vm.hostname = {}", ruby_str(plan.id().as_str())),
        String::from("  config.vm.synced_folder \".\", \"/vagrant\", disabled: true"),
    ];

    let networking = plan.networking();
    lines.push(match (networking.mode, networking.fixed_ip) {
        (NetworkMode::Bridge, None) => String::from("  config.vm.network \"public_network\""),
        (NetworkMode::Bridge, Some(ip)) => {
            format!("  config.vm.network \"public_network\", ip: \"{ip}\"")
        }
        (NetworkMode::Default, Some(ip)) => {
            format!("  config.vm.network \"private_network\", ip: \"{ip}\"")
        }
        (NetworkMode::Default, None) => {
            String::from("  config.vm.network \"private_network\", type: \"dhcp\"")
        }
    });
    for binding in ports {
        lines.push(format!(
            "  config.vm.network \"forwarded_port\", guest: {}, host: {}, protocol: \"{}\"",
            binding.guest, binding.host, binding.protocol
        ));
    }

    let ssh = plan.ssh();
    if ssh.user != "vagrant" {
        lines.push(format!("  config.ssh.username = {}", ruby_str(&ssh.user)));
    }
    if let Some(key) = &ssh.key_path {
        lines.push(format!("  config.ssh.private_key_path = {}", ruby_str(key.as_str())));
    }
    lines.push(String::from("  config.ssh.forward_agent = true"));

    let disk_gb = resources.disk_gb;
    if let Some(size) = disk_gb
        && !matches!(provider, Provider::Libvirt | Provider::Qemu)
    {
        lines.push(format!(
            "  config.vm.disk :disk, size: \"{size}GB\", primary: true"
        ));
    }

    lines.push(format!(
        "  config.vm.provider {} do |provider|",
        ruby_str(provider.as_str())
    ));
    lines.push(format!("    provider.memory = {}", resources.memory_mb));
    lines.push(format!("    provider.cpus = {}", resources.cpu_cores));
    match (provider, disk_gb) {
        (Provider::Libvirt, Some(size)) => {
            lines.push(format!("    provider.machine_virtual_size = {size}"));
        }
        (Provider::Qemu, Some(size)) => {
            lines.push(format!("    provider.disk_resize = \"{size}G\""));
        }
        _ => {}
    }
    lines.push(String::from("  end"));
    lines.push(String::from("end"));

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn ruby_str(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' | '\\' | '#' => {
                quoted.push('\\');
                quoted.push(ch);
            }
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Protocol;
    use crate::test_support::plan_from_pairs;

    fn plan(extra: &[(&str, &str)]) -> InfrastructurePlan {
        let mut pairs = vec![("INFRA_TYPE", "vm"), ("PROVIDER", "libvirt")];
        pairs.extend_from_slice(extra);
        plan_from_pairs("/projects/demo", &pairs).expect("valid plan")
    }

    #[test]
    fn renders_resources_network_and_ports() {
        let ports = [PortBinding {
            host: 8080,
            guest: 80,
            protocol: Protocol::Tcp,
            auto: false,
        }];

        let text = render(&plan(&[("MEMORY", "4G"), ("CPUS", "4")]), &ports);

        assert!(text.contains("config.vm.box = \"generic/alpine319\""), "{text}");
        assert!(text.contains("config.vm.hostname = \"demo\""));
        assert!(text.contains("config.vm.provider \"libvirt\" do |provider|"));
        assert!(text.contains("provider.memory = 4096"));
        assert!(text.contains("provider.cpus = 4"));
        assert!(text.contains("provider.machine_virtual_size = 20"));
        assert!(text.contains("\"private_network\", type: \"dhcp\""));
        assert!(text.contains(
            "\"forwarded_port\", guest: 80, host: 8080, protocol: \"tcp\""
        ));
        assert!(!text.contains("config.ssh.username"));
        assert!(text.ends_with("end\n"));
    }

    #[test]
    fn fixed_ip_uses_private_network_and_bridge_uses_public() {
        let private = render(&plan(&[("IP_ADDRESS", "192.168.56.10")]), &[]);
        assert!(private.contains("\"private_network\", ip: \"192.168.56.10\""));

        let bridged = render(&plan(&[("NETWORK_MODE", "bridge")]), &[]);
        assert!(bridged.contains("config.vm.network \"public_network\"\n"));
    }

    #[test]
    fn virtualbox_sizes_primary_disk() {
        let text = render(&plan(&[("PROVIDER", "virtualbox"), ("DISK_SIZE", "40G")]), &[]);
        assert!(text.contains("config.vm.disk :disk, size: \"40GB\", primary: true"));
        assert!(!text.contains("machine_virtual_size"));
    }

    #[test]
    fn custom_identity_and_hostile_strings_are_escaped() {
        let text = render(
            &plan(&[
                ("SSH_USER", "dev"),
                ("SSH_KEY", "/keys/id_ed25519"),
                ("BOX", "evil\"#{`rm -rf`}"),
            ]),
            &[],
        );
        assert!(text.contains("config.ssh.username = \"dev\""));
        assert!(text.contains("config.ssh.private_key_path = \"/keys/id_ed25519\""));
        assert!(text.contains("config.vm.box = \"evil\\\"\\#{`rm -rf`}\""), "{text}");
    }
}
