use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning an error carrying the tail of
    /// its stderr if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its output as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error.
    /// Note that we intentionally *don't* include the command string
    /// in the output; we leave it to the caller to add that if they want,
    /// as it may be verbose.
    fn check_status(&self, stderr: std::fs::File) -> Result<()>;
}

impl ExitStatusExt for std::process::ExitStatus {
    fn check_status(&self, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr_buf = last_utf8_content_from_file(stderr);
        Err(eyre!("Subprocess failed: {self:?}\n{stderr_buf}"))
    }
}

/// Read at most the trailing 1KiB of a captured stderr file.
pub(crate) fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i64);
    let mut stderr_buf = Vec::with_capacity(size.into());
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    r.trim_end().to_owned()
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        self.status()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?
            .check_status(stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }
}
