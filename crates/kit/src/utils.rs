use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Cooperative cancellation signal shared by every blocking stage.
///
/// Clones observe the same flag. Long-running operations poll
/// [`Cancellation::check`] at buffer boundaries or wait ticks.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation on Ctrl-C.
    pub fn install_ctrlc_handler(&self) -> color_eyre::Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            if flag.is_cancelled() {
                // Second Ctrl-C: give up on a graceful abort
                std::process::exit(130);
            }
            eprintln!("\nInterrupted, aborting...");
            flag.cancel();
        })?;
        Ok(())
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, during: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled { during });
        }
        Ok(())
    }
}

/// Convert a unit string to bytes multiplier
fn unit_to_bytes(unit: &str) -> Option<u128> {
    match unit {
        "B" | "bytes" => Some(1),
        "k" | "K" | "KiB" => Some(1024),
        "M" | "MiB" => Some(1024u128.pow(2)),
        "G" | "GiB" => Some(1024u128.pow(3)),
        "T" | "TiB" => Some(1024u128.pow(4)),
        _ => None,
    }
}

/// Parse a memory string (like "2G", "1024M", "4096") to megabytes
///
/// A bare number is taken as megabytes, matching what QEMU's `-m` expects.
pub fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let invalid = |reason: &str| Error::config("vm.memory", memory_str, reason);
    let trimmed = memory_str.trim();

    if trimmed.is_empty() {
        return Err(invalid("memory size cannot be empty"));
    }

    // Try to strip unit suffix, checking case-insensitively
    let (number_str, unit) = if let Some(num) = trimmed
        .strip_suffix('G')
        .or_else(|| trimmed.strip_suffix('g'))
    {
        (num, "GiB")
    } else if let Some(num) = trimmed
        .strip_suffix('M')
        .or_else(|| trimmed.strip_suffix('m'))
    {
        (num, "MiB")
    } else if let Some(num) = trimmed
        .strip_suffix('K')
        .or_else(|| trimmed.strip_suffix('k'))
    {
        (num, "KiB")
    } else {
        (trimmed, "MiB")
    };

    let number: f64 = number_str
        .trim()
        .parse()
        .map_err(|_| invalid("not a number"))?;
    if !number.is_finite() || number <= 0.0 {
        return Err(invalid("memory size must be positive"));
    }

    let bytes_per_unit = unit_to_bytes(unit).ok_or_else(|| invalid("unknown unit"))? as f64;

    let mib = 1024.0 * 1024.0;
    let total_mb = (number * bytes_per_unit) / mib;
    if total_mb < 1.0 || total_mb > u32::MAX as f64 {
        return Err(invalid("memory size out of range"));
    }

    Ok(total_mb as u32)
}

/// Parse the per-instance vCPU count
pub fn parse_cpus(cpus_str: &str) -> Result<u32> {
    match cpus_str.trim().parse::<u32>() {
        Ok(0) => Err(Error::config("vm.cpus", cpus_str, "must be at least 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(Error::config("vm.cpus", cpus_str, "not a number")),
    }
}

/// Return the first path that exists on the host, if any.
pub fn find_first_existing<P: AsRef<Utf8Path>>(candidates: &[P]) -> Option<Utf8PathBuf> {
    candidates
        .iter()
        .map(AsRef::<Utf8Path>::as_ref)
        .find(|p| p.exists())
        .map(|p| p.to_owned())
}

/// Create the parent directory of `path` (and its ancestors).
pub(crate) fn ensure_parent_dir(path: &Utf8Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;
    }
    Ok(())
}

/// Allocate a temporary file next to `target`, so that it can later be
/// renamed onto `target` without crossing filesystems.
pub(crate) fn staged_file_for(target: &Utf8Path) -> Result<NamedTempFile> {
    let dir = target
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let name = target.file_name().unwrap_or("staged");
    tempfile::Builder::new()
        .prefix(&format!(".{name}.tmp-"))
        .tempfile_in(dir)
        .map_err(|e| Error::fs("create temporary file in", dir, e))
}

/// Flush a staged file to stable storage and atomically rename it onto `target`.
///
/// Readers of `target` observe either the previous content or the complete
/// new content, never a partial write.
pub(crate) fn commit_staged(staged: NamedTempFile, target: &Utf8Path) -> Result<()> {
    staged
        .as_file()
        .sync_all()
        .map_err(|e| Error::fs("fsync", target, e))?;
    staged
        .persist(target)
        .map_err(|e| Error::fs("rename temporary file onto", target, e.error))?;
    Ok(())
}
