//! Acquisition and caching of Fedora CoreOS disk images.
//!
//! Compressed artifacts live in a cache directory keyed by (version,
//! architecture) and are downloaded at most once. The bootable qcow2 image
//! is produced lazily from the cached artifact by [`crate::decompress`].
//!
//! ```text
//! vms/coreos-<version>-<arch>.xz              cached download (+ .meta.json)
//! images/coreos-<version>-<arch>.xz           staged hard link or copy
//! images/coreos-<version>-qemu.<arch>.qcow2   decompressed disk
//! ```

use std::fs::File;
use std::io::{Read, Write as _};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt as _;
use tracing::{debug, info, warn};

use crate::cache_metadata::{check_cached_artifact, DownloadMetadata, ValidationError};
use crate::decompress::Extractor;
use crate::error::{Error, Result};
use crate::progress::{copy_cancellable, CopyError, ProgressWriter};
use crate::utils::{commit_staged, staged_file_for, Cancellation};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies one upstream artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub version: String,
    pub architecture: String,
}

impl ImageSpec {
    pub fn new(version: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            architecture: architecture.into(),
        }
    }

    /// File name of the compressed artifact in the cache.
    pub fn compressed_name(&self) -> String {
        format!("coreos-{}-{}.xz", self.version, self.architecture)
    }

    /// File name of the bootable disk image.
    pub fn disk_name(&self) -> String {
        format!("coreos-{}-qemu.{}.qcow2", self.version, self.architecture)
    }

    fn lock_name(&self) -> String {
        format!(".coreos-{}-{}.lock", self.version, self.architecture)
    }

    /// Upstream URL of the compressed qcow2 image for this build.
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{version}/{arch}/fedora-coreos-{version}-qemu.{arch}.qcow2.xz",
            base_url.trim_end_matches('/'),
            version = self.version,
            arch = self.architecture,
        )
    }
}

/// Paths of one cached image; all derived from the [`ImageSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub compressed_path: Utf8PathBuf,
    pub staged_path: Option<Utf8PathBuf>,
    pub decompressed_path: Utf8PathBuf,
}

/// A response body ready to be streamed into the cache.
pub struct Download {
    pub reader: Box<dyn Read + Send>,
    pub content_length: Option<u64>,
}

/// Where compressed images come from.
pub trait ImageSource {
    fn open(&self, url: &str) -> Result<Download>;
}

/// Fetches images over HTTP(S).
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        // Images are several hundred MiB; only bound the connect phase
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::Acquisition {
                url: String::new(),
                source: e.into(),
            })?;
        Ok(Self { client })
    }
}

impl ImageSource for HttpSource {
    fn open(&self, url: &str) -> Result<Download> {
        let acquisition = |source: crate::error::BoxError| Error::Acquisition {
            url: url.to_owned(),
            source,
        };
        let response = self.client.get(url).send().map_err(|e| acquisition(e.into()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(acquisition(format!("bad HTTP status: {status}").into()));
        }
        let content_length = response.content_length();
        Ok(Download {
            reader: Box::new(response),
            content_length,
        })
    }
}

/// The shared image cache of a project.
#[derive(Debug, Clone)]
pub struct ImageCache {
    cache_root: Utf8PathBuf,
    images_root: Utf8PathBuf,
    base_url: String,
    stage_compressed: bool,
}

impl ImageCache {
    pub fn new(
        cache_root: impl Into<Utf8PathBuf>,
        images_root: impl Into<Utf8PathBuf>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            images_root: images_root.into(),
            base_url: base_url.into(),
            stage_compressed: true,
        }
    }

    pub fn stage_compressed(mut self, stage: bool) -> Self {
        self.stage_compressed = stage;
        self
    }

    pub fn entry(&self, spec: &ImageSpec) -> CacheEntry {
        CacheEntry {
            compressed_path: self.cache_root.join(spec.compressed_name()),
            staged_path: self
                .stage_compressed
                .then(|| self.images_root.join(spec.compressed_name())),
            decompressed_path: self.images_root.join(spec.disk_name()),
        }
    }

    /// Make sure the bootable disk for `spec` exists, downloading and
    /// decompressing as needed. Returns the cache entry describing it.
    pub fn ensure_image(
        &self,
        spec: &ImageSpec,
        source: &dyn ImageSource,
        extractor: &Extractor,
        cancel: &Cancellation,
    ) -> Result<CacheEntry> {
        for dir in [&self.cache_root, &self.images_root] {
            std::fs::create_dir_all(dir).map_err(|e| Error::fs("create directory", dir, e))?;
        }
        let entry = self.entry(spec);

        // Serializes concurrent first-time acquisitions of the same artifact
        let _lock = self.lock(spec)?;

        self.ensure_compressed(spec, &entry.compressed_path, source, cancel)?;

        if let Some(staged) = entry.staged_path.as_deref() {
            link_or_copy(&entry.compressed_path, staged)?;
            info!("Placed compressed image at: {staged}");
        }

        if entry.decompressed_path.exists() {
            info!("Extracted image already exists: {}", entry.decompressed_path);
        } else {
            info!(
                "Extracting {} -> {}",
                entry.compressed_path, entry.decompressed_path
            );
            extractor.extract(&entry.compressed_path, &entry.decompressed_path, cancel)?;
            info!("Extracted to: {}", entry.decompressed_path);
        }

        Ok(entry)
    }

    fn lock(&self, spec: &ImageSpec) -> Result<File> {
        let path = self.cache_root.join(spec.lock_name());
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::fs("open lock file", &path, e))?;
        if file.try_lock_exclusive().is_err() {
            info!("Waiting for another process to finish with {path}");
            file.lock_exclusive()
                .map_err(|e| Error::fs("lock", &path, e))?;
        }
        debug!("Acquired cache lock {path}");
        Ok(file)
    }

    fn ensure_compressed(
        &self,
        spec: &ImageSpec,
        path: &Utf8Path,
        source: &dyn ImageSource,
        cancel: &Cancellation,
    ) -> Result<()> {
        match check_cached_artifact(path)? {
            Ok(()) => {
                info!("Image already exists: {path}");
                return Ok(());
            }
            Err(ValidationError::MissingFile) => {}
            Err(e @ ValidationError::SizeMismatch { .. }) => {
                warn!("Discarding damaged cached image {path}: {e}");
                std::fs::remove_file(path).map_err(|e| Error::fs("remove", path, e))?;
            }
        }

        let url = spec.url(&self.base_url);
        info!("Downloading Fedora CoreOS image from {url}");
        let size = download_to(source, &url, path, cancel)?;
        DownloadMetadata::new(&url, size).write_for(path)?;
        info!("Downloaded to: {path}");
        Ok(())
    }
}

/// Stream `url` into `target` via a staged temp file, so an interrupted
/// download never leaves a truncated file at the canonical path.
fn download_to(
    source: &dyn ImageSource,
    url: &str,
    target: &Utf8Path,
    cancel: &Cancellation,
) -> Result<u64> {
    cancel.check("downloading")?;
    let mut download = source.open(url)?;
    let mut staged = staged_file_for(target)?;

    let mut sink = ProgressWriter::new(staged.as_file_mut(), "Downloading", download.content_length);
    let copied = copy_cancellable(&mut download.reader, &mut sink, cancel);
    let copied = match copied {
        Ok(n) => {
            sink.finish();
            n
        }
        Err(e) => {
            sink.abandon();
            cancel.check("downloading")?;
            return Err(copy_failure(e, url, target));
        }
    };

    if let Some(expected) = download.content_length {
        if copied != expected {
            return Err(Error::Acquisition {
                url: url.to_owned(),
                source: format!("truncated body: received {copied} of {expected} bytes").into(),
            });
        }
    }

    staged.flush().map_err(|e| Error::fs("write", target, e))?;
    commit_staged(staged, target)?;
    Ok(copied)
}

/// Failures reading the body are the network's; failures writing the staged
/// file are the local filesystem's.
fn copy_failure(e: CopyError, url: &str, target: &Utf8Path) -> Error {
    match e {
        CopyError::Write(e) => Error::fs("write", target, e),
        e => Error::Acquisition {
            url: url.to_owned(),
            source: e.into(),
        },
    }
}

/// Hard-link `src` to `dst`, falling back to a byte copy (e.g. across
/// devices). An existing `dst` of identical size is left untouched.
pub fn link_or_copy(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if let Ok(dst_meta) = std::fs::metadata(dst) {
        let src_meta = std::fs::metadata(src).map_err(|e| Error::fs("stat", src, e))?;
        if dst_meta.len() == src_meta.len() {
            debug!("{dst} already present with matching size");
            return Ok(());
        }
        std::fs::remove_file(dst).map_err(|e| Error::fs("remove", dst, e))?;
    }

    match std::fs::hard_link(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => debug!("Hard link {src} -> {dst} failed ({e}), copying instead"),
    }

    let mut staged = staged_file_for(dst)?;
    let mut input = File::open(src).map_err(|e| Error::fs("open", src, e))?;
    std::io::copy(&mut input, staged.as_file_mut()).map_err(|e| Error::fs("copy to", dst, e))?;
    commit_staged(staged, dst)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed payload and counts how often it was asked to.
    pub(crate) struct FakeSource {
        pub payload: Vec<u8>,
        pub advertised_length: Option<u64>,
        pub requests: AtomicUsize,
        /// Time spent in `open`, to widen race windows
        pub delay: Option<Duration>,
    }

    impl FakeSource {
        pub(crate) fn new(payload: Vec<u8>) -> Self {
            let len = payload.len() as u64;
            Self {
                payload,
                advertised_length: Some(len),
                requests: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub(crate) fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl ImageSource for FakeSource {
        fn open(&self, _url: &str) -> Result<Download> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(Download {
                reader: Box::new(Cursor::new(self.payload.clone())),
                content_length: self.advertised_length,
            })
        }
    }

    pub(crate) fn xz_compress(data: &[u8]) -> Vec<u8> {
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn scratch() -> (tempfile::TempDir, ImageCache) {
        scratch_with_url("https://example.test/builds")
    }

    fn scratch_with_url(base_url: &str) -> (tempfile::TempDir, ImageCache) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let cache = ImageCache::new(root.join("vms"), root.join("images"), base_url);
        (td, cache)
    }

    /// Answer a single HTTP request with `response` and return the base URL.
    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{addr}/builds")
    }

    #[test]
    fn test_spec_names_and_url() {
        let spec = ImageSpec::new("42.0.0.0", "x86_64");
        assert_eq!(spec.compressed_name(), "coreos-42.0.0.0-x86_64.xz");
        assert_eq!(spec.disk_name(), "coreos-42.0.0.0-qemu.x86_64.qcow2");
        assert_eq!(
            spec.url("https://builds.coreos.fedoraproject.org/prod/streams/stable/builds/"),
            "https://builds.coreos.fedoraproject.org/prod/streams/stable/builds/42.0.0.0/x86_64/fedora-coreos-42.0.0.0-qemu.x86_64.qcow2.xz"
        );
    }

    #[test]
    fn test_entry_paths() {
        let cache = ImageCache::new("/p/vms", "/p/images", "https://example.test");
        let entry = cache.entry(&ImageSpec::new("42.1", "aarch64"));
        assert_eq!(entry.compressed_path, "/p/vms/coreos-42.1-aarch64.xz");
        assert_eq!(
            entry.staged_path.as_deref(),
            Some(Utf8Path::new("/p/images/coreos-42.1-aarch64.xz"))
        );
        assert_eq!(entry.decompressed_path, "/p/images/coreos-42.1-qemu.aarch64.qcow2");

        let unstaged = cache.stage_compressed(false).entry(&ImageSpec::new("42.1", "aarch64"));
        assert_eq!(unstaged.staged_path, None);
    }

    #[test]
    fn test_acquisition_is_idempotent() {
        let (_td, cache) = scratch();
        let disk = b"qcow2 disk contents".repeat(1000);
        let source = FakeSource::new(xz_compress(&disk));
        let extractor = Extractor::in_process_only();
        let spec = ImageSpec::new("42.0.0.0", "x86_64");
        let cancel = Cancellation::new();

        let first = cache.ensure_image(&spec, &source, &extractor, &cancel).unwrap();
        let second = cache.ensure_image(&spec, &source, &extractor, &cancel).unwrap();

        assert_eq!(source.requests(), 1);
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first.decompressed_path).unwrap(), disk);
        assert_eq!(
            std::fs::read(first.staged_path.as_ref().unwrap()).unwrap(),
            source.payload
        );
        assert!(DownloadMetadata::sidecar_path(&first.compressed_path).exists());
    }

    #[test]
    fn test_damaged_cache_is_refetched() {
        let (_td, cache) = scratch();
        let source = FakeSource::new(xz_compress(b"disk"));
        let extractor = Extractor::in_process_only();
        let spec = ImageSpec::new("42.0.0.0", "x86_64");
        let cancel = Cancellation::new();

        let entry = cache.ensure_image(&spec, &source, &extractor, &cancel).unwrap();
        std::fs::write(&entry.compressed_path, b"trunc").unwrap();
        cache.ensure_image(&spec, &source, &extractor, &cancel).unwrap();

        assert_eq!(source.requests(), 2);
        assert_eq!(std::fs::read(&entry.compressed_path).unwrap(), source.payload);
    }

    #[test]
    fn test_truncated_download_leaves_no_artifact() {
        let (_td, cache) = scratch();
        let mut source = FakeSource::new(xz_compress(b"disk"));
        source.advertised_length = Some(source.payload.len() as u64 + 100);
        let spec = ImageSpec::new("42.0.0.0", "x86_64");

        let err = cache
            .ensure_image(&spec, &source, &Extractor::in_process_only(), &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, Error::Acquisition { .. }), "{err}");
        assert!(!cache.entry(&spec).compressed_path.exists());
    }

    #[test]
    fn test_cancelled_before_download() {
        let (_td, cache) = scratch();
        let source = FakeSource::new(xz_compress(b"disk"));
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = cache
            .ensure_image(&ImageSpec::new("42", "x86_64"), &source, &Extractor::in_process_only(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }), "{err}");
        assert_eq!(source.requests(), 0);
    }

    #[test]
    fn test_link_or_copy() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let src = root.join("src.xz");
        let dst = root.join("dst.xz");
        std::fs::write(&src, b"compressed").unwrap();

        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"compressed");

        // A same-sized destination is left as-is
        std::fs::remove_file(&dst).unwrap();
        std::fs::write(&dst, b"COMPRESSED").unwrap();
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"COMPRESSED");

        // A differently-sized one is replaced
        std::fs::remove_file(&dst).unwrap();
        std::fs::write(&dst, b"short").unwrap();
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"compressed");
    }

    #[test]
    fn test_http_error_status() {
        let base = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let (_td, cache) = scratch_with_url(&base);
        let spec = ImageSpec::new("42", "x86_64");

        let err = cache
            .ensure_image(
                &spec,
                &HttpSource::new().unwrap(),
                &Extractor::in_process_only(),
                &Cancellation::new(),
            )
            .unwrap_err();
        match &err {
            Error::Acquisition { url, source } => {
                assert_eq!(*url, spec.url(&base));
                assert!(source.to_string().contains("404"), "{source}");
            }
            other => panic!("expected an acquisition error, got {other:?}"),
        }
        let entry = cache.entry(&spec);
        assert!(!entry.compressed_path.exists());
        assert!(!DownloadMetadata::sidecar_path(&entry.compressed_path).exists());
    }

    #[test]
    fn test_http_connection_refused() {
        // Bind then release a port so nothing listens on it
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let (_td, cache) = scratch_with_url(&format!("http://{addr}/builds"));
        let spec = ImageSpec::new("42", "x86_64");

        let err = cache
            .ensure_image(
                &spec,
                &HttpSource::new().unwrap(),
                &Extractor::in_process_only(),
                &Cancellation::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Acquisition { .. }), "{err:?}");
        assert!(!cache.entry(&spec).compressed_path.exists());
    }

    #[test]
    fn test_concurrent_acquisitions_download_once() {
        let (_td, cache) = scratch();
        let mut source = FakeSource::new(xz_compress(b"shared disk"));
        source.delay = Some(Duration::from_millis(300));
        let extractor = Extractor::in_process_only();
        let spec = ImageSpec::new("42.0.0.0", "x86_64");
        let cancel = Cancellation::new();

        let entries: Vec<CacheEntry> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|_| s.spawn(|| cache.ensure_image(&spec, &source, &extractor, &cancel)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert_eq!(source.requests(), 1);
        for entry in &entries {
            assert_eq!(std::fs::read(&entry.decompressed_path).unwrap(), b"shared disk");
        }
    }

    #[test]
    fn test_write_failures_are_filesystem_errors() {
        let target = Utf8Path::new("/p/vms/coreos-42-x86_64.xz");
        let url = "https://example.test/builds/42";

        let err = copy_failure(CopyError::Write(std::io::Error::other("disk full")), url, target);
        match err {
            Error::Filesystem { op, path, .. } => {
                assert_eq!(op, "write");
                assert_eq!(path, target);
            }
            other => panic!("expected a filesystem error, got {other:?}"),
        }

        let err = copy_failure(
            CopyError::Read(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
            url,
            target,
        );
        assert!(matches!(err, Error::Acquisition { .. }), "{err:?}");
    }
}
