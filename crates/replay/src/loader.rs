//! Payload sources: a payload YAML document or an EEST fixtures release.
//!
//! Release archives are gzip compressed tarballs. Only the blockchain tests are
//! extracted, into a temporary directory that is removed once the fixtures are
//! converted.

use convert::{ConvertError, ConvertOptions, Converter};
use flate2::read::GzDecoder;
use payload::{Payload, PayloadError, PayloadFile};
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Largest file extracted from a fixtures archive.
pub const ARCHIVE_FILE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Interval between download progress lines.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

const BLOCKCHAIN_TESTS: &str = "blockchain_tests";

/// Errors loading payloads.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Payload document is invalid.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Download failed.
    #[error("failed to download {url}: {source}")]
    Download {
        /// Source URL.
        url: String,
        /// Cause.
        #[source]
        source: reqwest::Error,
    },
    /// Local file system error.
    #[error("{path}: {source}")]
    Io {
        /// File or directory.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },
    /// Archive could not be read.
    #[error("failed to read fixtures archive: {0}")]
    Archive(#[source] io::Error),
    /// Archive entry would land outside the extraction directory.
    #[error("archive entry {0} escapes the extraction directory")]
    UnsafePath(PathBuf),
    /// Neither `fixtures/blockchain_tests` nor `blockchain_tests` exists.
    #[error("no blockchain_tests directory in {0}")]
    MissingFixtureRoot(PathBuf),
    /// Fixtures could not be converted.
    #[error(transparent)]
    Convert(#[from] ConvertError),
    /// Blocking loader task failed.
    #[error("loader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The source holds no payloads.
    #[error("no payloads found")]
    Empty,
    /// The run was cancelled while loading.
    #[error("loading payloads was cancelled")]
    Cancelled,
}

/// Where payloads come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadSource {
    /// Payload YAML file path or URL.
    Payload(String),
    /// Fixtures release archive path or URL, or an extracted fixtures directory.
    Fixtures(String),
}

/// Whether `location` is fetched over HTTP.
pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Loads the payloads of `source`, converting fixtures with `convert`.
///
/// Downloads and archive extraction stop at the next read once `cancel` fires.
pub async fn load_payloads(
    source: &PayloadSource,
    convert: ConvertOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Payload>, LoadError> {
    let payloads = match source {
        PayloadSource::Payload(location) if is_url(location) => {
            info!(url = %location, "downloading payloads");
            let content = tokio::select! {
                _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                content = fetch_text(location) => content?,
            };
            PayloadFile::from_yaml(&content)?.payloads
        }
        PayloadSource::Payload(location) => PayloadFile::read(Path::new(location))?.payloads,
        PayloadSource::Fixtures(location) => {
            let location = location.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || load_fixtures(&location, convert, &cancel))
                .await??
        }
    };
    if payloads.is_empty() {
        return Err(LoadError::Empty);
    }
    info!(payloads = payloads.len(), "loaded payloads");
    Ok(payloads)
}

async fn fetch_text(url: &str) -> Result<String, LoadError> {
    let download = |source| LoadError::Download {
        url: url.to_string(),
        source,
    };
    reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(download)?
        .text()
        .await
        .map_err(download)
}

fn load_fixtures(
    location: &str,
    convert: ConvertOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Payload>, LoadError> {
    let converter = Converter::new(convert)?;
    let path = Path::new(location);
    if !is_url(location) && path.is_dir() {
        let root = fixture_root(path)?;
        return Ok(converter.convert_directory(&root)?.payloads);
    }

    let dir = tempfile::tempdir().map_err(|source| LoadError::Io {
        path: std::env::temp_dir(),
        source,
    })?;
    let extracted = if is_url(location) {
        info!(url = %location, "downloading fixtures");
        let response = reqwest::blocking::get(location)
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|source| LoadError::Download {
                url: location.to_string(),
                source,
            })?;
        let total = response.content_length();
        let reader = CancellableReader::new(ProgressReader::new(response, total), cancel);
        extract_blockchain_tests(reader, dir.path())
    } else {
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        extract_blockchain_tests(CancellableReader::new(file, cancel), dir.path())
    };
    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }
    let extracted = extracted?;
    info!(files = extracted, "extracted fixtures");

    let root = fixture_root(dir.path())?;
    Ok(converter.convert_directory(&root)?.payloads)
}

/// Locates the blockchain tests below an extracted release.
pub fn fixture_root(dir: &Path) -> Result<PathBuf, LoadError> {
    [
        dir.join("fixtures").join(BLOCKCHAIN_TESTS),
        dir.join(BLOCKCHAIN_TESTS),
    ]
    .into_iter()
    .find(|candidate| candidate.is_dir())
    .ok_or_else(|| LoadError::MissingFixtureRoot(dir.to_path_buf()))
}

/// Whether an archive entry belongs to the blockchain tests.
pub fn is_blockchain_test_entry(path: &Path) -> bool {
    let path = path.to_string_lossy();
    path.contains("blockchain_tests/") || path.trim_end_matches('/').ends_with(BLOCKCHAIN_TESTS)
}

/// Joins an archive entry path onto `dest`, rejecting absolute paths and `..`.
pub fn safe_join(dest: &Path, entry: &Path) -> Result<PathBuf, LoadError> {
    let mut out = dest.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(LoadError::UnsafePath(entry.to_path_buf()))
            }
        }
    }
    Ok(out)
}

/// Unpacks the blockchain tests of a gzip tarball into `dest`. Returns the number of
/// files written.
pub fn extract_blockchain_tests<R: Read>(reader: R, dest: &Path) -> Result<usize, LoadError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| LoadError::Io { path, source }
    };
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut files = 0;
    for entry in archive.entries().map_err(LoadError::Archive)? {
        let mut entry = entry.map_err(LoadError::Archive)?;
        let path = entry.path().map_err(LoadError::Archive)?.into_owned();
        if !is_blockchain_test_entry(&path) {
            continue;
        }
        let target = safe_join(dest, &path)?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            let mut file = File::create(&target).map_err(io_error(&target))?;
            io::copy(&mut (&mut entry).take(ARCHIVE_FILE_LIMIT), &mut file)
                .map_err(io_error(&target))?;
            files += 1;
        } else {
            debug!(path = %path.display(), "skipping archive entry");
        }
    }
    Ok(files)
}

/// Fails every read once the token fired, aborting a download or extraction midway.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R> CancellableReader<'a, R> {
    fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Logs download progress while the archive streams through.
struct ProgressReader<R> {
    inner: R,
    read: u64,
    total: Option<u64>,
    last_report: Instant,
}

impl<R> ProgressReader<R> {
    fn new(inner: R, total: Option<u64>) -> Self {
        Self {
            inner,
            read: 0,
            total,
            last_report: Instant::now(),
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.last_report.elapsed() >= PROGRESS_INTERVAL {
            self.last_report = Instant::now();
            match self.total {
                Some(total) if total > 0 => info!(
                    read = self.read,
                    total,
                    percent = self.read * 100 / total,
                    "downloading fixtures"
                ),
                _ => info!(read = self.read, "downloading fixtures"),
            }
        }
        Ok(n)
    }
}
