//! Byte-accounting write sink with a rate/percentage progress line.
//!
//! Shared by the download and decompression stages. The line is redrawn at
//! most every 200ms; with a known total it shows a percentage, otherwise
//! only the byte count and rate.

use std::io::{self, Read, Write};

use indicatif::{BinaryBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::utils::Cancellation;

/// Copy buffer size; bounds peak memory independent of image size.
pub const COPY_BUFFER_SIZE: usize = 1 << 20;

const REDRAW_HZ: u8 = 5;

pub struct ProgressWriter<W> {
    inner: W,
    label: String,
    bar: ProgressBar,
    processed: u64,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, label: &str, total: Option<u64>) -> Self {
        let bar = ProgressBar::with_draw_target(total, ProgressDrawTarget::stderr_with_hz(REDRAW_HZ));
        Self::with_bar(inner, label, total, bar)
    }

    /// Construct a sink that accounts bytes without rendering anything.
    #[cfg(test)]
    pub fn hidden(inner: W, label: &str, total: Option<u64>) -> Self {
        Self::with_bar(inner, label, total, ProgressBar::hidden())
    }

    fn with_bar(inner: W, label: &str, total: Option<u64>, bar: ProgressBar) -> Self {
        let template = if total.is_some() {
            "{msg}... {binary_bytes}/{binary_total_bytes} ({percent}%) {binary_bytes_per_sec}"
        } else {
            "{spinner} {msg}... {binary_bytes} {binary_bytes_per_sec}"
        };
        let style = ProgressStyle::with_template(template).unwrap_or_else(|e| {
            tracing::warn!("invalid progress template: {e}");
            ProgressStyle::default_bar()
        });
        bar.set_style(style);
        bar.set_message(label.to_owned());
        Self {
            inner,
            label: label.to_owned(),
            bar,
            processed: 0,
        }
    }

    /// Total number of bytes accepted by the inner writer so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Clear the progress line and hand back the inner writer.
    pub fn finish(self) -> W {
        self.bar.finish_and_clear();
        tracing::info!("{}: {} done", self.label, BinaryBytes(self.processed()));
        self.inner
    }

    /// Clear the progress line after a failure without logging completion.
    pub fn abandon(self) -> W {
        self.bar.finish_and_clear();
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.processed += n as u64;
        self.bar.inc(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Why [`copy_cancellable`] stopped early.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("reading input")]
    Read(#[source] io::Error),
    #[error("writing output")]
    Write(#[source] io::Error),
}

/// Stream `reader` into `writer`, checking for cancellation between chunks.
///
/// Returns the number of bytes copied. Failures on either side are kept
/// apart so callers can blame the network or the local disk.
pub fn copy_cancellable<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    cancel: &Cancellation,
) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        copied += n as u64;
    }
    writer.flush().map_err(CopyError::Write)?;
    Ok(copied)
}
