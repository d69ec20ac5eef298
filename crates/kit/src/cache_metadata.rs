//! Sidecar metadata for cached image downloads
//!
//! Every completed download records where it came from and how large it was
//! in `<artifact>.meta.json`. A cached artifact whose size no longer matches
//! its sidecar is treated as damaged and fetched again. Artifacts without a
//! sidecar are trusted on existence.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version of the sidecar format for future compatibility
const METADATA_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    /// URL the artifact was fetched from
    pub url: String,
    /// Size in bytes of the completed download
    pub size: u64,
    pub format: u32,
}

impl DownloadMetadata {
    pub fn new(url: &str, size: u64) -> Self {
        Self {
            url: url.to_owned(),
            size,
            format: METADATA_FORMAT,
        }
    }

    pub fn sidecar_path(artifact: &Utf8Path) -> Utf8PathBuf {
        let mut name = artifact.file_name().unwrap_or_default().to_owned();
        name.push_str(".meta.json");
        artifact.with_file_name(name)
    }

    pub fn write_for(&self, artifact: &Utf8Path) -> Result<()> {
        let path = Self::sidecar_path(artifact);
        let parent = path.parent().unwrap_or(Utf8Path::new("."));
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .map_err(|e| Error::fs("open directory", parent, e))?;
        let buf = serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization {
            detail: format!("cache metadata: {e}"),
        })?;
        dir.atomic_write(path.file_name().unwrap_or_default(), buf)
            .map_err(|e| Error::fs("write", &path, e))?;
        tracing::debug!("Wrote cache metadata {path}");
        Ok(())
    }

    fn read_for(artifact: &Utf8Path) -> Option<Self> {
        let path = Self::sidecar_path(artifact);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache metadata {path}: {e}");
                None
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ValidationError {
    #[error("file is missing")]
    MissingFile,
    #[error("size mismatch: recorded {recorded} bytes, found {actual}")]
    SizeMismatch { recorded: u64, actual: u64 },
}

/// Check whether a cached artifact can be reused.
pub(crate) fn check_cached_artifact(path: &Utf8Path) -> Result<std::result::Result<(), ValidationError>> {
    let actual = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Cached artifact {path} does not exist");
            return Ok(Err(ValidationError::MissingFile));
        }
        Err(e) => return Err(Error::fs("stat", path, e)),
    };

    let Some(meta) = DownloadMetadata::read_for(path) else {
        tracing::debug!("No cache metadata for {path}, trusting existing file");
        return Ok(Ok(()));
    };

    if meta.size != actual {
        return Ok(Err(ValidationError::SizeMismatch {
            recorded: meta.size,
            actual,
        }));
    }
    tracing::debug!("Cached artifact {path} matches recorded size {actual}");
    Ok(Ok(()))
}
