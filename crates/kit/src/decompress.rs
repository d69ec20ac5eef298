//! Produce the bootable disk image from the cached `.xz` artifact.
//!
//! External decompressors are tried first in the configured order, then the
//! in-process `xz2` decoder. Every strategy writes into a temporary file next
//! to the target, so the canonical path only ever holds a complete image.

use std::fs::File;
use std::io::BufReader;
use std::process::{Command, Stdio};

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use tracing::{debug, info, warn};

use crate::command_run::{CommandRun, ExitStatusExt};
use crate::error::{Error, Result};
use crate::progress::{copy_cancellable, ProgressWriter, COPY_BUFFER_SIZE};
use crate::utils::{commit_staged, ensure_parent_dir, staged_file_for, Cancellation};

/// Decompression strategy chain.
#[derive(Debug, Clone)]
pub struct Extractor {
    /// External binaries tried in order, resolved on `PATH` (or absolute)
    pub external: Vec<String>,
    /// Whether to fall back to the in-process decoder
    pub in_process: bool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            external: vec!["xz".to_owned(), "unxz".to_owned()],
            in_process: true,
        }
    }
}

impl Extractor {
    #[cfg(test)]
    pub fn in_process_only() -> Self {
        Self {
            external: Vec::new(),
            in_process: true,
        }
    }

    /// Decompress `src` into `target`, trying each strategy in turn.
    pub fn extract(&self, src: &Utf8Path, target: &Utf8Path, cancel: &Cancellation) -> Result<()> {
        ensure_parent_dir(target)?;
        let total = probe_uncompressed_size(src);
        let mut last_err = None;

        for name in &self.external {
            cancel.check("decompressing")?;
            let bin = match which::which(name) {
                Ok(bin) => bin,
                Err(e) => {
                    debug!("Decompressor {name} not available: {e}");
                    continue;
                }
            };
            match extract_external(&bin, src, target, total, cancel) {
                Ok(()) => {
                    debug!("Decompressed with {}", bin.display());
                    return Ok(());
                }
                Err(e) => {
                    cancel.check("decompressing")?;
                    warn!("{name} failed, trying next method: {e:#}");
                    last_err = Some(e);
                }
            }
        }

        if self.in_process {
            cancel.check("decompressing")?;
            info!("Using built-in xz decoder");
            match extract_in_process(src, target, total, cancel) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    cancel.check("decompressing")?;
                    warn!("Built-in decoder failed: {e:#}");
                    last_err = Some(e);
                }
            }
        }

        let source = last_err
            .unwrap_or_else(|| eyre!("no decompression method available"))
            .into();
        Err(Error::Decompression {
            src: src.to_owned(),
            source,
        })
    }
}

fn extract_external(
    bin: &std::path::Path,
    src: &Utf8Path,
    target: &Utf8Path,
    total: Option<u64>,
    cancel: &Cancellation,
) -> color_eyre::Result<()> {
    let mut staged = staged_file_for(target)?;
    let stderr = tempfile::tempfile()?;

    let mut child = Command::new(bin)
        .args(["-T0", "-dc"])
        .arg(src)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(stderr.try_clone()?)
        .spawn()
        .with_context(|| format!("Spawning {}", bin.display()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre!("child stdout was not captured"))?;

    let mut sink = ProgressWriter::new(staged.as_file_mut(), "Extracting", total);
    let copied = copy_cancellable(&mut stdout, &mut sink, cancel);
    if let Err(e) = copied {
        sink.abandon();
        // Unblock and reap the child; the staged file is dropped (and removed)
        let _ = child.kill();
        let _ = child.wait();
        return Err(e).context("Reading decompressor output");
    }
    sink.finish();
    drop(stdout);

    child.wait()?.check_status(stderr)?;
    commit_staged(staged, target)?;
    Ok(())
}

fn extract_in_process(
    src: &Utf8Path,
    target: &Utf8Path,
    total: Option<u64>,
    cancel: &Cancellation,
) -> color_eyre::Result<()> {
    let input = File::open(src).with_context(|| format!("Opening {src}"))?;
    let input = BufReader::with_capacity(COPY_BUFFER_SIZE, input);
    let mut decoder = xz2::read::XzDecoder::new_multi_decoder(input);

    let mut staged = staged_file_for(target)?;
    let mut sink = ProgressWriter::new(staged.as_file_mut(), "Extracting", total);
    match copy_cancellable(&mut decoder, &mut sink, cancel) {
        Ok(_) => {
            sink.finish();
        }
        Err(e) => {
            sink.abandon();
            return Err(e).with_context(|| format!("Decoding {src}"));
        }
    }
    commit_staged(staged, target)?;
    Ok(())
}

/// Ask `xz` for the uncompressed size of `src`, if it is installed.
fn probe_uncompressed_size(src: &Utf8Path) -> Option<u64> {
    let xz = which::which("xz").ok()?;
    let out = Command::new(xz)
        .args(["--robot", "--list"])
        .arg(src)
        .run_get_string()
        .map_err(|e| debug!("Unable to probe size of {src}: {e}"))
        .ok()?;
    parse_robot_list_size(&out)
}

/// Extract the uncompressed size from `xz --robot --list` output.
fn parse_robot_list_size(out: &str) -> Option<u64> {
    out.lines()
        .find(|l| l.starts_with("totals\t"))
        .and_then(|l| l.split('\t').nth(4))
        .and_then(|v| v.parse().ok())
}
