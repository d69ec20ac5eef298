//! Configuration record and project layout.
//!
//! The configuration is read once from `container-host.config.json`, merged
//! with command-line overrides, and then passed around by reference; no
//! component reads ambient global state.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "container-host.config.json";

pub const DEFAULT_ARCHITECTURE: &str = "aarch64";
pub const DEFAULT_VERSION: &str = "42.20250803.3.0";
pub const DEFAULT_IMAGE_BASE_URL: &str =
    "https://builds.coreos.fedoraproject.org/prod/streams/stable/builds";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub vm: VmConfig,
    pub network: NetworkConfig,
    pub ssh: SshConfig,
    pub qemu: QemuConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmConfig {
    pub architecture: String,
    pub version: String,
    /// Per-instance memory (e.g. "4096", "4G"); bare numbers are MiB
    pub memory: String,
    pub cpus: String,
    pub instances: usize,
    pub image_base_url: String,
    /// Also place the compressed artifact next to the decompressed disk
    pub stage_compressed: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            architecture: DEFAULT_ARCHITECTURE.to_owned(),
            version: DEFAULT_VERSION.to_owned(),
            memory: "4096".to_owned(),
            cpus: "4".to_owned(),
            instances: 1,
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_owned(),
            stage_compressed: true,
        }
    }
}

/// Base host ports; instance `i` uses `base + i` for each category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    pub ssh_port: String,
    pub vnc_port: String,
    pub docker_port: String,
    pub http_port: String,
    pub kubernetes_port: String,
    pub k0s_port: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssh_port: "2222".to_owned(),
            vnc_port: "5900".to_owned(),
            docker_port: "2377".to_owned(),
            http_port: "80".to_owned(),
            kubernetes_port: "6443".to_owned(),
            k0s_port: "9443".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshConfig {
    pub public_key_path: Utf8PathBuf,
    pub private_key_path: Utf8PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            public_key_path: "ssh_keys/coreos_rsa.pub".into(),
            private_key_path: "ssh_keys/coreos_rsa".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QemuConfig {
    pub enable_acceleration: bool,
    /// Passed through verbatim after every generated argument
    pub custom_args: Vec<String>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            enable_acceleration: true,
            custom_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfig {
    pub print_ignition_config: bool,
    pub verbose: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            print_ignition_config: true,
            verbose: false,
        }
    }
}

/// Values supplied on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub architecture: Option<String>,
    pub version: Option<String>,
}

impl Config {
    /// Load the configuration file, falling back to defaults when it is absent.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config file {path} not found, using default values");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::fs("read config file", path, e)),
        };
        tracing::debug!("Read config file {path} ({} bytes)", data.len());
        serde_json::from_slice(&data)
            .map_err(|e| Error::config(path.as_str(), "<file contents>", e.to_string()))
    }

    /// Merge command-line overrides, producing the final immutable value.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(arch) = overrides
            .architecture
            .as_ref()
            .filter(|a| **a != self.vm.architecture)
        {
            println!(
                "Command-line override: architecture changed from {} to {}",
                self.vm.architecture, arch
            );
            self.vm.architecture = arch.clone();
        }
        if let Some(version) = overrides
            .version
            .as_ref()
            .filter(|v| **v != self.vm.version)
        {
            println!(
                "Command-line override: version changed from {} to {}",
                self.vm.version, version
            );
            self.vm.version = version.clone();
        }
        self
    }

    /// Print the resolved values in a human-readable form.
    pub fn print_summary(&self) {
        println!("Current configuration:");
        println!("  VM:");
        println!("    Architecture: {}", self.vm.architecture);
        println!("    Version: {}", self.vm.version);
        println!("    Memory: {}", self.vm.memory);
        println!("    CPUs: {}", self.vm.cpus);
        println!("    Instances: {}", self.vm.instances);
        println!("  Network:");
        println!("    SSH Port: {}", self.network.ssh_port);
        println!("    VNC Port: {}", self.network.vnc_port);
        println!("    Docker Port: {}", self.network.docker_port);
        println!("    HTTP Port: {}", self.network.http_port);
        println!("    Kubernetes Port: {}", self.network.kubernetes_port);
        println!("    K0s Port: {}", self.network.k0s_port);
        println!("  SSH:");
        println!("    Public Key Path: {}", self.ssh.public_key_path);
        println!("    Private Key Path: {}", self.ssh.private_key_path);
        println!("  QEMU:");
        println!("    Acceleration Enabled: {}", self.qemu.enable_acceleration);
        if !self.qemu.custom_args.is_empty() {
            println!("    Custom Args: {:?}", self.qemu.custom_args);
        }
    }
}

/// Directory layout of a project, rooted at the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: Utf8PathBuf,
    /// Download cache shared across runs
    pub cache_root: Utf8PathBuf,
    /// Staged compressed copy and decompressed disk images
    pub images_root: Utf8PathBuf,
    /// Per-instance provisioning documents
    pub configs_root: Utf8PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_root: root.join("vms"),
            images_root: root.join("images"),
            configs_root: root.join("configs"),
            root,
        }
    }

    pub fn from_current_dir() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::fs("determine working directory", ".", e))?;
        let lossy = cwd.to_string_lossy().into_owned();
        let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|_| {
            Error::fs(
                "use working directory",
                lossy.as_str(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "path is not valid UTF-8"),
            )
        })?;
        Ok(Self::new(cwd))
    }

    /// Resolve a configured path; relative paths are taken from the project root.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.root.join(path)
        }
    }
}
