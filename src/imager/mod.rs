//! The image construction pipeline.
//!
//! One [`Builder`] takes a build from archive URL to finalized per-device
//! images across three sequential phases: download, extract-and-verify,
//! finalize. The builder owns the only shared mutable state in the crate:
//! the verified-image registry behind one coarse mutex, and the download
//! progress counters as lock-free atomics so a reporting thread can poll
//! them without ever touching the (possibly long-held) builder lock.

pub mod build;
pub mod download;
pub mod extract;
pub mod image;

pub use build::build;
pub use download::{CancelToken, DownloadError, DownloadProgress};
pub use extract::{ExtractError, EXT_ARCHIVE, EXT_IMG, EXT_MD5, EXT_SHA1};
pub use image::{BaseImage, FinalImage, VerifiedImage, VerifyError};

use crate::bootparams::{BootParams, CodecError};
use log::info;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// File name of the downloaded archive inside the base directory.
pub const ARCHIVE_FILE: &str = "download.tar.zst";

/// Errors surfaced by the builder, tagged with enough context (phase,
/// record index, path) to render a precise message. None are retried here;
/// retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum ImagerError {
    #[error("download failed")]
    Download(#[from] DownloadError),
    #[error("extraction failed")]
    Extract(#[from] ExtractError),
    #[error("no verified base image named '{0}'")]
    UnknownImage(String),
    #[error("failed to encode boot params [{index}]")]
    Encode {
        index: usize,
        #[source]
        source: CodecError,
    },
    #[error("failed to finalize output image {index} ('{}')", path.display())]
    Finalize {
        index: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ImagerError {
    /// Whether this failure is a user-initiated cancellation rather than a
    /// genuine error.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ImagerError::Download(DownloadError::Canceled))
    }
}

/// Where a build currently stands. Failure at any phase is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Downloading,
    Extracting,
    Finalizing,
    Done,
    Failed,
}

#[derive(Default)]
struct Inner {
    phase: Phase,
    images: BTreeMap<String, VerifiedImage>,
}

/// Orchestrates download, extraction, and per-device finalization.
pub struct Builder {
    base_dir: PathBuf,
    final_dir: PathBuf,
    progress: DownloadProgress,
    inner: Mutex<Inner>,
}

impl Builder {
    /// Create a builder with `base_dir` for download/extraction staging and
    /// `final_dir` for output images; both directories are created.
    pub fn new(base_dir: &Path, final_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(base_dir)?;
        fs::create_dir_all(final_dir)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            final_dir: final_dir.to_path_buf(),
            progress: DownloadProgress::new(),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Destination of the downloaded archive.
    pub fn download_path(&self) -> PathBuf {
        self.base_dir.join(ARCHIVE_FILE)
    }

    /// Declared size of the in-flight download; 0 when unknown.
    pub fn download_total(&self) -> u64 {
        self.progress.total()
    }

    /// Bytes downloaded so far.
    pub fn download_current(&self) -> u64 {
        self.progress.current()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Download the base-image archive. Holds the builder lock for the
    /// whole transfer, so one download per builder at a time; the progress
    /// counters stay readable throughout.
    pub fn download(&self, url: &str, cancel: &CancelToken) -> Result<(), ImagerError> {
        let mut inner = self.lock();
        inner.phase = Phase::Downloading;
        match download::download(url, &self.download_path(), &self.progress, cancel) {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.phase = Phase::Failed;
                Err(err.into())
            }
        }
    }

    /// Extract and verify the downloaded archive, replacing the builder's
    /// image registry with the verified survivors.
    pub fn extract_archive(&self) -> Result<(), ImagerError> {
        let mut inner = self.lock();
        inner.phase = Phase::Extracting;
        match extract::extract_archive(&self.download_path(), &self.base_dir) {
            Ok(images) => {
                inner.images = images;
                Ok(())
            }
            Err(err) => {
                inner.phase = Phase::Failed;
                Err(err.into())
            }
        }
    }

    /// Snapshot of the verified base-image names.
    pub fn images(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    /// Produce one final image per boot-param record from the named base
    /// image, returning the output paths in record order.
    ///
    /// Every record is encoded up front (errors carry the record's index),
    /// then the base image is read from disk exactly once and fanned out to
    /// all outputs, then each output is finalized independently. A finalize
    /// failure is attributed to its output; already-finalized siblings are
    /// left in place.
    pub fn make_final_images(
        &self,
        image_name: &str,
        records: &[BootParams],
    ) -> Result<Vec<PathBuf>, ImagerError> {
        let mut inner = self.lock();
        inner.phase = Phase::Finalizing;
        let result = Self::finalize_images(&inner, &self.final_dir, image_name, records);
        inner.phase = if result.is_ok() { Phase::Done } else { Phase::Failed };
        result
    }

    fn finalize_images(
        inner: &Inner,
        final_dir: &Path,
        image_name: &str,
        records: &[BootParams],
    ) -> Result<Vec<PathBuf>, ImagerError> {
        let base = inner
            .images
            .get(image_name)
            .ok_or_else(|| ImagerError::UnknownImage(image_name.to_string()))?;

        let mut finals = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let raw = record
                .encode()
                .map_err(|source| ImagerError::Encode { index, source })?;
            let path = final_dir.join(format!("image-{index}{EXT_IMG}"));
            let file = File::create(&path).map_err(|source| ImagerError::Finalize {
                index,
                path: path.clone(),
                source,
            })?;
            finals.push(FinalImage::new(path, file, raw));
        }

        // One read pass over the base image, duplicated to every output.
        let mut src = BufReader::new(File::open(&base.path)?);
        let mut fan_out = MultiWriter::new(finals.iter_mut().map(FinalImage::file_mut).collect());
        let n = io::copy(&mut src, &mut fan_out)?;
        drop(fan_out);
        info!(
            "copied {n} bytes of base image '{image_name}' to {} outputs",
            finals.len()
        );

        let mut outputs = Vec::with_capacity(finals.len());
        for (index, img) in finals.into_iter().enumerate() {
            let path = img.path().to_path_buf();
            img.finalize().map_err(|source| ImagerError::Finalize {
                index,
                path: path.clone(),
                source,
            })?;
            outputs.push(path);
        }
        Ok(outputs)
    }
}

/// Fan-out writer: every write is duplicated to all destinations, so N
/// outputs cost a single read of the source.
struct MultiWriter<'a> {
    writers: Vec<&'a mut File>,
}

impl<'a> MultiWriter<'a> {
    fn new(writers: Vec<&'a mut File>) -> Self {
        Self { writers }
    }
}

impl Write for MultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in &mut self.writers {
            w.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            w.flush()?;
        }
        Ok(())
    }
}
