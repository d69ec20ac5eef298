//! Error taxonomy for the provisioning pipeline.
//!
//! Each variant corresponds to one failure class of the pipeline. Shared
//! prerequisites (image, identity) surface `Acquisition`, `Decompression`,
//! `Crypto` and `Filesystem`; per-instance work surfaces `Configuration`,
//! `Serialization`, `Spawn` and `Runtime`.

use std::process::ExitStatus;

use camino::{Utf8Path, Utf8PathBuf};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network failure or non-success HTTP status while fetching the image
    #[error("failed to download {url}")]
    Acquisition {
        url: String,
        #[source]
        source: BoxError,
    },

    /// Every decompression strategy failed
    #[error("failed to decompress {src} (all strategies exhausted)")]
    Decompression {
        src: Utf8PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("key generation failed: {context}")]
    Crypto {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to {op} {path}")]
    Filesystem {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provisioning document did not survive a serialize/parse round trip
    #[error("invalid provisioning document: {detail}")]
    Serialization { detail: String },

    #[error("invalid configuration value {field}={value:?}: {reason}")]
    Configuration {
        field: String,
        value: String,
        reason: String,
    },

    #[error("failed to start {binary} for instance {index}")]
    Spawn {
        index: usize,
        binary: String,
        #[source]
        source: BoxError,
    },

    #[error("instance {index} exited unsuccessfully: {status}")]
    Runtime { index: usize, status: ExitStatus },

    #[error("cancelled while {during}")]
    Cancelled { during: &'static str },
}

impl Error {
    pub(crate) fn fs(op: &'static str, path: impl AsRef<Utf8Path>, source: std::io::Error) -> Self {
        Error::Filesystem {
            op,
            path: path.as_ref().to_owned(),
            source,
        }
    }

    pub(crate) fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Configuration {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}
