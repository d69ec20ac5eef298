//! QEMU invocation profiles and argument vectors.
//!
//! A profile is a pure function of the target architecture. The argument
//! vector is assembled in a fixed order, since later QEMU flags override
//! earlier ones:
//!
//! 1. `-cpu <model>` from the profile (omitted with Windows acceleration)
//! 2. machine, sizing, disk, network, console and provisioning flags
//! 3. accelerator flags
//! 4. `-bios <firmware>` when one was found
//! 5. user-supplied passthrough arguments

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;
use crate::ports::InstancePorts;
use crate::utils::find_first_existing;

/// Hyper-V enlightenments used together with WHPX.
const WHPX_CPU: &str = "host,hv_relaxed,hv_spinlocks=0x1fff,hv_vapic,hv_time";

/// fw_cfg key read by Ignition on the QEMU platform.
const IGNITION_FW_CFG_NAME: &str = "opt/com.coreos/config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfile {
    pub architecture: String,
    pub binary: String,
    pub machine: &'static str,
    pub cpu: &'static str,
    /// Firmware images in order of preference
    pub firmware_candidates: Vec<Utf8PathBuf>,
}

const AARCH64_FIRMWARE: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
];

const X86_64_FIRMWARE: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-x86_64-code.fd",
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
];

pub fn profile_for_arch(arch: &str) -> InstanceProfile {
    let (binary, machine, cpu, firmware) = match arch {
        "aarch64" => ("qemu-system-aarch64".to_owned(), "virt", "max", AARCH64_FIRMWARE),
        "x86_64" | "amd64" => ("qemu-system-x86_64".to_owned(), "q35", "max", X86_64_FIRMWARE),
        // QEMU names its system emulators qemu-system-<arch>
        other => (format!("qemu-system-{other}"), "virt", "host", &[][..]),
    };
    InstanceProfile {
        architecture: arch.to_owned(),
        binary,
        machine,
        cpu,
        firmware_candidates: firmware.iter().map(Utf8PathBuf::from).collect(),
    }
}

impl InstanceProfile {
    /// The first firmware candidate present on this host.
    pub fn firmware(&self) -> Option<Utf8PathBuf> {
        find_first_existing(&self.firmware_candidates)
    }

    fn is_x86_64(&self) -> bool {
        self.binary == "qemu-system-x86_64"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HostOs {
    #[strum(serialize = "linux")]
    Linux,
    #[strum(serialize = "macos")]
    MacOs,
    #[strum(serialize = "windows")]
    Windows,
    #[strum(serialize = "other")]
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }

    pub fn accelerator(self) -> Option<Accelerator> {
        match self {
            Self::Linux => Some(Accelerator::Kvm),
            Self::MacOs => Some(Accelerator::Hvf),
            Self::Windows => Some(Accelerator::Whpx),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Accelerator {
    Kvm,
    Hvf,
    Whpx,
}

/// Whether an instance holds the terminal or runs detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    Foreground,
    Background,
}

/// Everything needed to build one instance's argument vector.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub profile: &'a InstanceProfile,
    pub host_os: HostOs,
    pub accelerate: bool,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk: &'a Utf8Path,
    pub ports: InstancePorts,
    pub ignition_path: &'a Utf8Path,
    pub mode: RunMode,
    pub firmware: Option<&'a Utf8Path>,
    pub custom_args: &'a [String],
}

impl LaunchSpec<'_> {
    pub fn build_args(&self) -> Result<Vec<String>> {
        let accelerator = self
            .accelerate
            .then(|| self.host_os.accelerator())
            .flatten();
        let whpx = accelerator == Some(Accelerator::Whpx);

        let mut args: Vec<String> = Vec::new();
        if !whpx {
            args.extend(["-cpu".into(), self.profile.cpu.into()]);
        }

        args.extend([
            "-M".into(),
            self.profile.machine.into(),
            "-smp".into(),
            self.cpus.to_string(),
            "-m".into(),
            self.memory_mb.to_string(),
            "-drive".into(),
            format!("file={},format=qcow2,if=virtio", self.disk),
            "-netdev".into(),
            format!("user,id=net0,{}", self.ports.host_forwards()),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-device".into(),
            "virtio-rng-pci".into(),
            "-vnc".into(),
            format!(":{}", self.ports.vnc_display()?),
            "-fw_cfg".into(),
            format!("name={IGNITION_FW_CFG_NAME},file={}", self.ignition_path),
            "-rtc".into(),
            "base=utc,driftfix=slew".into(),
        ]);
        if self.profile.is_x86_64() {
            args.extend(["-global".into(), "kvm-pit.lost_tick_policy=discard".into()]);
        }
        let serial = match self.mode {
            RunMode::Foreground => "stdio",
            RunMode::Background => "null",
        };
        args.extend(["-serial".into(), serial.into()]);

        if let Some(accel) = accelerator {
            args.extend(["-accel".into(), accel.to_string()]);
            if whpx {
                args.extend(["-cpu".into(), WHPX_CPU.into()]);
            }
        }

        if let Some(firmware) = self.firmware {
            args.extend(["-bios".into(), firmware.to_string()]);
        }

        args.extend(self.custom_args.iter().cloned());
        Ok(args)
    }
}
