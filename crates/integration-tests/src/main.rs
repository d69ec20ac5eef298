//! Integration tests for fcvk
//!
//! Each test runs the real `fcvk` binary inside a scratch project with a
//! pre-seeded image cache and a fake `qemu-system-*` on `PATH` that only
//! records its arguments.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use xshell::{cmd, Shell};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod provision;
}

pub(crate) const TEST_VERSION: &str = "42.0.0.0";

/// Root of the cargo workspace; `cargo test` runs us from the crate directory
pub(crate) fn workspace_root() -> Utf8PathBuf {
    Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Get the path to the fcvk binary, checking FCVK_PATH env var first, then falling back to "fcvk"
pub(crate) fn get_fcvk_command() -> Result<String> {
    if let Ok(path) = std::env::var("FCVK_PATH") {
        // Relative paths are taken from the workspace root
        let path = workspace_root().join(&path);
        let path = std::fs::canonicalize(&path)
            .with_context(|| format!("Resolving FCVK_PATH={path}"))?;
        return path
            .into_os_string()
            .into_string()
            .map_err(|p| eyre!("FCVK_PATH is not UTF-8: {p:?}"));
    }
    // Force the user to set this if we're running from the project dir
    let root = workspace_root();
    if let Some(path) = ["target/debug/fcvk", "target/release/fcvk"]
        .into_iter()
        .find(|p| root.join(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set FCVK_PATH={path} to run using this binary"
        ));
    }
    Ok("fcvk".to_owned())
}

/// Output of one fcvk invocation
pub(crate) struct CapturedOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn assert_success(&self, context: &str) {
        assert!(self.success, "{context} failed: {}", self.stderr);
    }
}

/// A scratch project directory wired up for a fake hypervisor.
pub(crate) struct Project {
    _td: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub qemu_log: Utf8PathBuf,
    bin_dir: Utf8PathBuf,
}

impl Project {
    pub fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path())
            .ok_or_else(|| eyre!("temporary directory is not UTF-8"))?
            .to_owned();
        let bin_dir = root.join("fake-bin");
        std::fs::create_dir_all(&bin_dir)?;
        Ok(Self {
            qemu_log: root.join("qemu-invocations.log"),
            bin_dir,
            root,
            _td: td,
        })
    }

    /// Write `container-host.config.json`
    pub fn write_config(&self, config: serde_json::Value) -> Result<()> {
        let path = self.root.join("container-host.config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&config)?)?;
        Ok(())
    }

    /// Install a fake `qemu-system-<arch>` that appends its arguments to the log
    pub fn install_fake_qemu(&self, arch: &str) -> Result<()> {
        let path = self.bin_dir.join(format!("qemu-system-{arch}"));
        std::fs::write(&path, "#!/bin/sh\necho \"$*\" >> \"$FCVK_QEMU_LOG\"\n")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Place an already-downloaded image in the cache so no network is needed
    pub fn seed_image(&self, arch: &str, disk: &[u8]) -> Result<()> {
        let vms = self.root.join("vms");
        std::fs::create_dir_all(&vms)?;
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(disk)?;
        std::fs::write(
            vms.join(format!("coreos-{TEST_VERSION}-{arch}.xz")),
            enc.finish()?,
        )?;
        Ok(())
    }

    /// Provide an existing public key, skipping key generation
    pub fn seed_public_key(&self) -> Result<()> {
        let dir = self.root.join("ssh_keys");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("coreos_rsa.pub"),
            "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC0 coreos@container-host\n",
        )?;
        Ok(())
    }

    pub fn run_fcvk(&self, args: &[&str]) -> Result<CapturedOutput> {
        let fcvk = get_fcvk_command()?;
        let sh = Shell::new()?;
        sh.change_dir(&self.root);
        let path = std::env::var("PATH").unwrap_or_default();
        sh.set_var("PATH", format!("{}:{path}", self.bin_dir));
        sh.set_var("FCVK_QEMU_LOG", &self.qemu_log);
        let output = cmd!(sh, "{fcvk} {args...}").ignore_status().output()?;
        Ok(CapturedOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Wait until the fake hypervisor has been invoked `count` times
    pub fn wait_for_invocations(&self, count: usize, timeout: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let lines = self.invocations()?;
            if lines.len() >= count {
                return Ok(lines);
            }
            if Instant::now() > deadline {
                return Err(eyre!(
                    "expected {count} hypervisor invocations, saw {}: {lines:?}",
                    lines.len()
                ));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn invocations(&self) -> Result<Vec<String>> {
        match std::fs::read_to_string(&self.qemu_log) {
            Ok(s) => Ok(s.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let f = test.f;
            Trial::test(test.name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
