//! End-to-end provisioning runs against a fake hypervisor

use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::json;

use crate::{integration_test, workspace_root, Project, TEST_VERSION};

/// Nothing listens here; any download attempt fails fast
const UNREACHABLE_BASE_URL: &str = "http://127.0.0.1:9/builds";

fn base_config(arch: &str, instances: usize) -> serde_json::Value {
    json!({
        "vm": {
            "architecture": arch,
            "version": TEST_VERSION,
            "memory": "1G",
            "cpus": "2",
            "instances": instances,
            "imageBaseUrl": UNREACHABLE_BASE_URL
        },
        "debug": { "printIgnitionConfig": false }
    })
}

fn test_single_instance_foreground() -> Result<()> {
    let project = Project::new()?;
    project.write_config(base_config("x86_64", 1))?;
    project.seed_image("x86_64", b"x86_64 disk")?;
    project.install_fake_qemu("x86_64")?;

    let out = project.run_fcvk(&["--arch", "x86_64", "--version", TEST_VERSION])?;
    out.assert_success("fcvk run");

    let disk = project
        .root
        .join(format!("images/coreos-{TEST_VERSION}-qemu.x86_64.qcow2"));
    assert_eq!(std::fs::read(&disk)?, b"x86_64 disk");
    // Generated on first run
    let pem = std::fs::read_to_string(project.root.join("ssh_keys/coreos_rsa"))?;
    assert!(pem.contains("BEGIN RSA PRIVATE KEY"));
    let canonical = project.root.join("configs/ignition.json");
    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&canonical)?)?;
    assert_eq!(doc["ignition"]["version"], "3.4.0");

    let calls = project.invocations()?;
    assert_eq!(calls.len(), 1, "{calls:?}");
    let call = &calls[0];
    assert!(call.contains("hostfwd=tcp::2222-:22"), "{call}");
    assert!(call.contains("-serial stdio"), "{call}");
    assert!(call.contains("-m 1024"), "{call}");
    assert!(call.contains(&format!("file={canonical}")), "{call}");
    assert!(out.stdout.contains("ssh -p 2222 core@localhost"), "{}", out.stdout);
    Ok(())
}
integration_test!(test_single_instance_foreground);

fn test_three_instances() -> Result<()> {
    let project = Project::new()?;
    project.write_config(base_config("x86_64", 3))?;
    project.seed_image("x86_64", b"disk")?;
    project.seed_public_key()?;
    project.install_fake_qemu("x86_64")?;

    let out = project.run_fcvk(&[])?;
    out.assert_success("fcvk run");
    // Background instances may still be writing after fcvk returns
    let mut calls = project.wait_for_invocations(3, Duration::from_secs(10))?;
    calls.sort_by_key(|c| c.contains("-serial null"));

    assert!(calls[0].contains("-serial stdio"), "{}", calls[0]);
    let mut ssh_ports: Vec<u16> = calls
        .iter()
        .map(|c| -> Result<u16> {
            let start = c.find("hostfwd=tcp::").ok_or_else(|| eyre!("no hostfwd in {c}"))?;
            let rest = &c[start + "hostfwd=tcp::".len()..];
            let end = rest.find('-').ok_or_else(|| eyre!("malformed hostfwd in {c}"))?;
            Ok(rest[..end].parse()?)
        })
        .collect::<Result<_>>()?;
    ssh_ports.sort();
    assert_eq!(ssh_ports, [2222, 2223, 2224]);

    for n in 1..=3 {
        assert!(project
            .root
            .join(format!("configs/ignition-instance-{n}.json"))
            .exists());
    }
    assert!(out.stdout.contains("started in background (PID:"), "{}", out.stdout);
    Ok(())
}
integration_test!(test_three_instances);

fn test_invalid_port_rejected() -> Result<()> {
    let project = Project::new()?;
    let mut config = base_config("x86_64", 1);
    config["network"] = json!({ "sshPort": "not-a-port" });
    project.write_config(config)?;
    project.seed_image("x86_64", b"disk")?;
    project.seed_public_key()?;
    project.install_fake_qemu("x86_64")?;

    let out = project.run_fcvk(&[])?;
    assert!(!out.success, "fcvk unexpectedly succeeded");
    assert!(out.stderr.contains("network.sshPort"), "{}", out.stderr);
    assert!(project.invocations()?.is_empty());
    Ok(())
}
integration_test!(test_invalid_port_rejected);

fn test_unknown_architecture_fallback() -> Result<()> {
    let project = Project::new()?;
    project.write_config(base_config("aarch64", 1))?;
    project.seed_image("riscv64", b"riscv disk")?;
    project.seed_public_key()?;
    project.install_fake_qemu("riscv64")?;

    let out = project.run_fcvk(&["--arch", "riscv64"])?;
    out.assert_success("fcvk run");
    assert!(
        out.stdout.contains("architecture changed from aarch64 to riscv64"),
        "{}",
        out.stdout
    );

    let calls = project.invocations()?;
    assert_eq!(calls.len(), 1, "{calls:?}");
    let call = &calls[0];
    assert!(call.starts_with("-cpu host "), "{call}");
    assert!(call.contains("-M virt"), "{call}");
    assert!(!call.contains("-bios"), "{call}");
    assert!(!call.contains("kvm-pit"), "{call}");
    Ok(())
}
integration_test!(test_unknown_architecture_fallback);

fn test_relative_binary_paths_start_at_workspace_root() -> Result<()> {
    let manifest = std::fs::read_to_string(workspace_root().join("Cargo.toml"))?;
    assert!(manifest.contains("[workspace]"), "{manifest}");
    Ok(())
}
integration_test!(test_relative_binary_paths_start_at_workspace_root);
