//! The provisioning pipeline: image, identity, per-instance documents and
//! hypervisor processes.
//!
//! Shared prerequisites (image and SSH identity) are fully prepared before
//! any instance is touched. Instances are then started in index order;
//! instance 0 holds the terminal and blocks until QEMU exits, the others
//! are spawned detached.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{debug, info};

use crate::config::{Config, ProjectLayout};
use crate::decompress::Extractor;
use crate::error::{BoxError, Error, Result};
use crate::ignition;
use crate::images::{ImageCache, ImageSource, ImageSpec};
use crate::ports::{BasePorts, InstancePorts};
use crate::qemu::{profile_for_arch, HostOs, InstanceProfile, LaunchSpec, RunMode};
use crate::ssh;
use crate::utils::{parse_cpus, parse_memory_to_mb, Cancellation};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pipeline states, logged as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initializing,
    AcquiringImage,
    ProvisioningIdentity,
    SynthesizingConfig(usize),
    Spawning(usize),
    Running(usize),
    Exited(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Initializing => f.write_str("initializing"),
            Stage::AcquiringImage => f.write_str("acquiring image"),
            Stage::ProvisioningIdentity => f.write_str("provisioning identity"),
            Stage::SynthesizingConfig(i) => write!(f, "synthesizing config for instance {}", i + 1),
            Stage::Spawning(i) => write!(f, "spawning instance {}", i + 1),
            Stage::Running(i) => write!(f, "instance {} running", i + 1),
            Stage::Exited(i) => write!(f, "instance {} exited", i + 1),
        }
    }
}

/// One hypervisor process to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProcess {
    pub index: usize,
    pub args: Vec<String>,
    pub mode: RunMode,
}

/// Starts hypervisor processes.
pub trait Launcher {
    /// Locate `binary` on the host.
    fn resolve(&self, binary: &str) -> std::result::Result<PathBuf, BoxError>;

    /// Run to completion with the terminal attached. Returns `None` if the
    /// process was killed because of cancellation.
    fn run_foreground(
        &self,
        program: &Path,
        process: &InstanceProcess,
        cancel: &Cancellation,
    ) -> std::io::Result<Option<ExitStatus>>;

    /// Start detached and return the process ID.
    fn spawn_background(&self, program: &Path, process: &InstanceProcess) -> std::io::Result<u32>;
}

/// Launches real processes on this host.
#[derive(Debug, Default)]
pub struct HostLauncher;

impl Launcher for HostLauncher {
    fn resolve(&self, binary: &str) -> std::result::Result<PathBuf, BoxError> {
        Ok(which::which(binary)?)
    }

    fn run_foreground(
        &self,
        program: &Path,
        process: &InstanceProcess,
        cancel: &Cancellation,
    ) -> std::io::Result<Option<ExitStatus>> {
        let mut child = Command::new(program).args(&process.args).spawn()?;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(foreground_outcome(status, cancel));
            }
            if cancel.is_cancelled() {
                info!("Stopping instance {}", process.index + 1);
                child.kill()?;
                child.wait()?;
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn spawn_background(&self, program: &Path, process: &InstanceProcess) -> std::io::Result<u32> {
        let mut cmd = Command::new(program);
        cmd.args(&process.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Keep the instance alive when the terminal's process group gets SIGINT
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

/// A hypervisor sharing our process group usually dies from the same
/// Ctrl-C before we get to kill it; that exit counts as a cancellation.
fn foreground_outcome(status: ExitStatus, cancel: &Cancellation) -> Option<ExitStatus> {
    if !status.success() && cancel.is_cancelled() {
        return None;
    }
    Some(status)
}

/// An instance that was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub index: usize,
    pub mode: RunMode,
    /// Set for background instances
    pub pid: Option<u32>,
    pub ports: InstancePorts,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub instances: Vec<LaunchedInstance>,
}

/// Values validated before any work starts.
#[derive(Debug)]
struct Plan {
    memory_mb: u32,
    cpus: u32,
    ports: Vec<InstancePorts>,
    profile: InstanceProfile,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    layout: &'a ProjectLayout,
    source: &'a dyn ImageSource,
    launcher: &'a dyn Launcher,
    extractor: Extractor,
    host_os: HostOs,
    cancel: Cancellation,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        layout: &'a ProjectLayout,
        source: &'a dyn ImageSource,
        launcher: &'a dyn Launcher,
        cancel: Cancellation,
    ) -> Self {
        Self {
            config,
            layout,
            source,
            launcher,
            extractor: Extractor::default(),
            host_os: HostOs::current(),
            cancel,
        }
    }

    #[cfg(test)]
    pub fn extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    #[cfg(test)]
    pub fn host_os(mut self, host_os: HostOs) -> Self {
        self.host_os = host_os;
        self
    }

    fn enter(&self, stage: Stage) {
        debug!("state: {stage}");
    }

    pub fn run(&self) -> Result<RunReport> {
        self.enter(Stage::Initializing);
        let plan = self.preflight()?;

        self.enter(Stage::AcquiringImage);
        println!("Checking vm assets...");
        let spec = ImageSpec::new(&self.config.vm.version, &self.config.vm.architecture);
        let cache = ImageCache::new(
            &self.layout.cache_root,
            &self.layout.images_root,
            &self.config.vm.image_base_url,
        )
        .stage_compressed(self.config.vm.stage_compressed);
        let entry = cache.ensure_image(&spec, self.source, &self.extractor, &self.cancel)?;

        self.enter(Stage::ProvisioningIdentity);
        let public_key = ssh::ensure_keypair(
            &self.layout.resolve(&self.config.ssh.private_key_path),
            &self.layout.resolve(&self.config.ssh.public_key_path),
        )?;

        self.print_connection_details(&plan, &entry.decompressed_path);

        let program = self
            .launcher
            .resolve(&plan.profile.binary)
            .map_err(|source| Error::Spawn {
                index: 0,
                binary: plan.profile.binary.clone(),
                source,
            })?;
        let firmware = plan.profile.firmware();
        match firmware.as_deref() {
            Some(fw) => info!("Using firmware {fw}"),
            None => debug!("No firmware candidate found; using the QEMU default"),
        }

        let count = plan.ports.len();
        println!("Starting {count} VM instance(s)...");
        let mut report = RunReport::default();
        for (index, ports) in plan.ports.iter().copied().enumerate() {
            self.enter(Stage::SynthesizingConfig(index));
            let ignition_path = self.write_ignition(&public_key, index, count, ports)?;

            self.enter(Stage::Spawning(index));
            let mode = if index == 0 {
                RunMode::Foreground
            } else {
                RunMode::Background
            };
            let process = InstanceProcess {
                index,
                args: LaunchSpec {
                    profile: &plan.profile,
                    host_os: self.host_os,
                    accelerate: self.config.qemu.enable_acceleration,
                    cpus: plan.cpus,
                    memory_mb: plan.memory_mb,
                    disk: &entry.decompressed_path,
                    ports,
                    ignition_path: &ignition_path,
                    mode,
                    firmware: firmware.as_deref(),
                    custom_args: &self.config.qemu.custom_args,
                }
                .build_args()?,
                mode,
            };
            if self.config.debug.verbose && !self.config.qemu.custom_args.is_empty() {
                println!(
                    "Added custom QEMU args for instance {}: {:?}",
                    index + 1,
                    self.config.qemu.custom_args
                );
            }
            println!(
                "Starting instance {}: {} {}",
                index + 1,
                program.display(),
                process.args.join(" ")
            );

            let launched = match mode {
                RunMode::Foreground => self.run_foreground(&program, &process, ports)?,
                RunMode::Background => {
                    match self.launcher.spawn_background(&program, &process) {
                        Ok(pid) => {
                            self.enter(Stage::Running(index));
                            println!("Instance {} started in background (PID: {pid})", index + 1);
                            LaunchedInstance {
                                index,
                                mode,
                                pid: Some(pid),
                                ports,
                            }
                        }
                        Err(e) => {
                            report.print_partial();
                            return Err(Error::Spawn {
                                index,
                                binary: plan.profile.binary.clone(),
                                source: e.into(),
                            });
                        }
                    }
                }
            };
            report.instances.push(launched);
        }
        Ok(report)
    }

    fn run_foreground(
        &self,
        program: &Path,
        process: &InstanceProcess,
        ports: InstancePorts,
    ) -> Result<LaunchedInstance> {
        let index = process.index;
        self.enter(Stage::Running(index));
        let status = self
            .launcher
            .run_foreground(program, process, &self.cancel)
            .map_err(|e| Error::Spawn {
                index,
                binary: program.display().to_string(),
                source: e.into(),
            })?;
        self.enter(Stage::Exited(index));
        match status {
            None => Err(Error::Cancelled {
                during: "running the foreground instance",
            }),
            Some(status) if !status.success() => Err(Error::Runtime { index, status }),
            Some(_) => Ok(LaunchedInstance {
                index,
                mode: RunMode::Foreground,
                pid: None,
                ports,
            }),
        }
    }

    fn preflight(&self) -> Result<Plan> {
        let vm = &self.config.vm;
        if vm.instances == 0 {
            return Err(Error::config("vm.instances", "0", "at least one instance is required"));
        }
        let memory_mb = parse_memory_to_mb(&vm.memory)?;
        let cpus = parse_cpus(&vm.cpus)?;
        let ports = BasePorts::parse(&self.config.network)?.allocate(vm.instances)?;
        for p in &ports {
            p.vnc_display()?;
        }
        let profile = profile_for_arch(&vm.architecture);
        debug!(
            "Profile for {}: {} (machine {}, cpu {})",
            profile.architecture, profile.binary, profile.machine, profile.cpu
        );
        Ok(Plan {
            memory_mb,
            cpus,
            ports,
            profile,
        })
    }

    /// Render and persist the document of instance `index`, returning the
    /// path handed to the hypervisor.
    fn write_ignition(
        &self,
        public_key: &str,
        index: usize,
        count: usize,
        ports: InstancePorts,
    ) -> Result<Utf8PathBuf> {
        let doc = ignition::synthesize(public_key, ports.docker);
        let rendered = doc.render()?;

        if index == 0 && self.config.debug.print_ignition_config {
            println!("\n=== Debug: Generated Ignition Configuration ===");
            println!("{}", String::from_utf8_lossy(&rendered));
            println!("===============================================");
        }

        let configs = &self.layout.configs_root;
        let instance_path = configs.join(format!("ignition-instance-{}.json", index + 1));
        ignition::write_document(&instance_path, &rendered)?;
        let handed_off = if count == 1 {
            let canonical = configs.join("ignition.json");
            ignition::write_document(&canonical, &rendered)?;
            canonical
        } else {
            instance_path
        };
        println!(
            "Ignition config written to {handed_off} ({} bytes)",
            rendered.len()
        );
        Ok(handed_off)
    }

    fn print_connection_details(&self, plan: &Plan, disk: &Utf8Path) {
        println!("=== Fedora CoreOS VM Connection Details ===");
        println!("VM Image: {disk}");
        println!("Memory: {} MB per instance", plan.memory_mb);
        println!("CPUs: {} per instance", plan.cpus);
        println!("Number of instances: {}", plan.ports.len());

        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec![
            "INSTANCE",
            "SSH",
            "VNC",
            "HTTP",
            "DOCKER",
            "KUBERNETES",
            "K0S",
            "ACCESS",
        ]);
        for (i, p) in plan.ports.iter().enumerate() {
            table.add_row(vec![
                (i + 1).to_string(),
                p.ssh.to_string(),
                p.vnc.to_string(),
                p.http.to_string(),
                p.docker.to_string(),
                p.kubernetes.to_string(),
                p.k0s.to_string(),
                format!(
                    "ssh -p {} core@localhost\nexport DOCKER_HOST=tcp://localhost:{}",
                    p.ssh, p.docker
                ),
            ]);
        }
        println!("{table}");
        println!("Docker Engine: Will be enabled and started on first boot");
    }
}

impl RunReport {
    /// Tell the operator which instances are already up before bailing out.
    fn print_partial(&self) {
        if self.instances.is_empty() {
            return;
        }
        eprintln!("Instances already started:");
        for inst in &self.instances {
            match inst.pid {
                Some(pid) => eprintln!(
                    "  instance {} (PID {pid}, ssh port {})",
                    inst.index + 1,
                    inst.ports.ssh
                ),
                None => eprintln!("  instance {} ({}, exited)", inst.index + 1, inst.mode),
            }
        }
    }
}
