//! Extracted base images and per-device final images.
//!
//! A [`BaseImage`] accumulates MD5 and SHA1 digests over every byte written
//! to it, so verification reflects exactly what landed on disk. Expected
//! digests arrive separately, parsed from the archive's sidecar entries,
//! possibly before the image bytes themselves.

use crate::bootparams::PARAMS_OFFSET;
use md5::{Digest, Md5};
use sha1::Sha1;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Byte length of an MD5 digest.
pub const MD5_LEN: usize = 16;
/// Byte length of a SHA1 digest.
pub const SHA1_LEN: usize = 20;

/// Why a base image failed its one-shot verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no image bytes were extracted")]
    Unextracted,
    #[error("archive carried no {0} sidecar for this image")]
    MissingDigest(&'static str),
    #[error("{algorithm} digest mismatch: expected {expected}, got {actual}")]
    Mismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
}

/// The open backing file plus its rolling digests.
struct ImageSink {
    path: PathBuf,
    file: File,
    md5: Md5,
    sha1: Sha1,
}

impl ImageSink {
    fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: File::create(path)?,
            md5: Md5::new(),
            sha1: Sha1::new(),
        })
    }
}

/// One base disk image being extracted from the archive.
///
/// Created as soon as any entry with this image's base name is seen; image
/// bytes and sidecar digests may arrive in either order.
#[derive(Default)]
pub struct BaseImage {
    name: String,
    sink: Option<ImageSink>,
    expected_md5: Option<[u8; MD5_LEN]>,
    expected_sha1: Option<[u8; SHA1_LEN]>,
}

impl BaseImage {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the backing file and start both digests. Idempotent: the second
    /// and later calls are no-ops, so sidecar/image entry order never
    /// re-creates the file.
    pub fn init(&mut self, path: &Path) -> io::Result<()> {
        if self.sink.is_none() {
            self.sink = Some(ImageSink::create(path)?);
        }
        Ok(())
    }

    /// Single sink for image bytes: writes to the backing file and feeds
    /// both digests. Errors if [`init`](Self::init) was never called.
    pub fn writer(&mut self) -> io::Result<ImageWriter<'_>> {
        let sink = self.sink.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "image was never initialized")
        })?;
        Ok(ImageWriter { sink })
    }

    pub fn set_expected_md5(&mut self, digest: [u8; MD5_LEN]) {
        self.expected_md5 = Some(digest);
    }

    pub fn set_expected_sha1(&mut self, digest: [u8; SHA1_LEN]) {
        self.expected_sha1 = Some(digest);
    }

    /// Drop this image without verifying, removing the partially-written
    /// backing file if one was created.
    pub fn discard(self) {
        if let Some(ImageSink { path, file, .. }) = self.sink {
            drop(file);
            let _ = fs::remove_file(&path);
        }
    }

    /// One-shot, terminal check of both digests against the sidecar values.
    ///
    /// On success the backing file is closed and handed over as a
    /// [`VerifiedImage`]. On failure the partially-written file is removed
    /// from disk; its contents cannot be trusted.
    pub fn verify(mut self) -> Result<VerifiedImage, VerifyError> {
        let sink = self.sink.take().ok_or(VerifyError::Unextracted)?;
        let ImageSink {
            path, file, md5, sha1, ..
        } = sink;
        drop(file);

        let outcome = check_digest("MD5", self.expected_md5, md5.finalize().into())
            .and_then(|()| check_digest("SHA1", self.expected_sha1, sha1.finalize().into()));

        match outcome {
            Ok(()) => Ok(VerifiedImage {
                name: self.name,
                path,
            }),
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }
}

fn check_digest<const N: usize>(
    algorithm: &'static str,
    expected: Option<[u8; N]>,
    actual: [u8; N],
) -> Result<(), VerifyError> {
    let expected = expected.ok_or(VerifyError::MissingDigest(algorithm))?;
    if expected != actual {
        return Err(VerifyError::Mismatch {
            algorithm,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

/// Tee writer feeding the backing file and both digest accumulators.
pub struct ImageWriter<'a> {
    sink: &'a mut ImageSink,
}

impl Write for ImageWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.file.write(buf)?;
        self.sink.md5.update(&buf[..n]);
        self.sink.sha1.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.file.flush()
    }
}

/// A base image whose digests matched its sidecars.
#[derive(Debug, Clone)]
pub struct VerifiedImage {
    pub name: String,
    pub path: PathBuf,
}

/// One output image awaiting its boot-param patch.
///
/// Holds the created output file and the pre-encoded record; the shared
/// base-image copy streams through [`file_mut`](Self::file_mut) first, then
/// [`finalize`](Self::finalize) patches the record in and closes the file.
pub struct FinalImage {
    path: PathBuf,
    file: File,
    record: Vec<u8>,
}

impl FinalImage {
    pub fn new(path: PathBuf, file: File, record: Vec<u8>) -> Self {
        Self { path, file, record }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Patch the encoded boot params in at the fixed offset and close the
    /// file. Each output is independently consistent once this returns.
    pub fn finalize(mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(PARAMS_OFFSET))?;
        self.file.write_all(&self.record)?;
        self.file.sync_all()?;
        Ok(())
    }
}
