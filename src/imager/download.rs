//! Streaming, cancellable archive download.
//!
//! The transfer streams into `<dst>.tmp` and only renames to the final path
//! on success, so a final file on disk always means a completed download.
//! Progress lives in a pair of atomics a reporting thread may read at any
//! time without touching any lock.

use log::debug;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Suffix of the in-flight temporary download file.
pub const EXT_TMP: &str = ".tmp";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Errors from a single download attempt.
///
/// Cancellation is its own variant, not an I/O failure: a caller aborting
/// the transfer is expected behavior and callers render it differently.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request failed")]
    Http(#[from] Box<ureq::Error>),
    #[error("download canceled")]
    Canceled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared download progress: bytes expected and bytes transferred so far.
///
/// Both values use atomic load/store so a reporter polling them never
/// observes a torn value and never blocks the transfer.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    total: AtomicU64,
    current: AtomicU64,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared content length; 0 while unset or when the server sent none.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes written so far; monotonically non-decreasing per transfer.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn add(&self, n: u64) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }
}

/// Cancellation handle for an in-flight download.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stream `url` to `dst`, reporting progress through `progress`.
///
/// On any failure (transport error, non-2xx status, cancellation) the
/// temporary file is removed and `dst` is never created.
pub fn download(
    url: &str,
    dst: &Path,
    progress: &DownloadProgress,
    cancel: &CancelToken,
) -> Result<(), DownloadError> {
    let tmp = tmp_path(dst);

    let response = ureq::get(url).call().map_err(Box::new)?;
    let total = response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    progress.set_total(total);
    debug!("GET {url}: {total} bytes declared");

    let mut body = response.into_reader();
    let mut file = File::create(&tmp)?;

    match copy_with_progress(&mut body, &mut file, progress, cancel) {
        Ok(copied) => {
            drop(file);
            fs::rename(&tmp, dst)?;
            debug!("downloaded {copied} bytes to '{}'", dst.display());
            Ok(())
        }
        Err(err) => {
            drop(file);
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

fn tmp_path(dst: &Path) -> PathBuf {
    let mut os = dst.as_os_str().to_os_string();
    os.push(EXT_TMP);
    PathBuf::from(os)
}

/// Chunked copy that bumps the progress counter per chunk and checks the
/// cancel token between chunks.
pub(crate) fn copy_with_progress<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    progress: &DownloadProgress,
    cancel: &CancelToken,
) -> Result<u64, DownloadError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_canceled() {
            return Err(DownloadError::Canceled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                writer.flush()?;
                return Ok(copied);
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buf[..n])?;
        progress.add(n as u64);
        copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn copy_counts_every_byte() {
        let payload = vec![0xa5u8; 3 * COPY_BUF_SIZE + 17];
        let progress = DownloadProgress::new();
        let cancel = CancelToken::new();
        let mut out = Vec::new();

        let copied =
            copy_with_progress(&mut Cursor::new(&payload), &mut out, &progress, &cancel).unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(progress.current(), payload.len() as u64);
        assert_eq!(out, payload);
    }

    #[test]
    fn cancel_before_first_chunk() {
        let progress = DownloadProgress::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();

        let err = copy_with_progress(&mut Cursor::new(b"data"), &mut out, &progress, &cancel)
            .unwrap_err();
        assert!(matches!(err, DownloadError::Canceled));
        assert!(out.is_empty());
    }

    /// Reader that trips the cancel token after serving its first chunk.
    struct CancelAfterFirstRead<'a> {
        chunks: Vec<&'a [u8]>,
        cancel: CancelToken,
    }

    impl Read for CancelAfterFirstRead<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop() {
                Some(chunk) => {
                    self.cancel.cancel();
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn cancel_mid_transfer_keeps_progress_consistent() {
        let progress = DownloadProgress::new();
        let cancel = CancelToken::new();
        let mut reader = CancelAfterFirstRead {
            chunks: vec![&b"more data"[..], &b"first"[..]],
            cancel: cancel.clone(),
        };
        let mut out = Vec::new();

        let err = copy_with_progress(&mut reader, &mut out, &progress, &cancel).unwrap_err();
        assert!(matches!(err, DownloadError::Canceled));
        // The chunk written before cancellation was observed is counted.
        assert_eq!(progress.current(), out.len() as u64);
    }

    /// One-shot HTTP server on a loopback port. Accepts a single connection,
    /// drains the request line and headers, then hands the stream to `handler`
    /// for the response.
    fn spawn_server<F>(handler: F) -> String
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/archive.tar.zst", listener.local_addr().unwrap());
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            handler(stream);
        });
        url
    }

    #[test]
    fn download_writes_dst_and_clears_the_tmp_file() {
        let body = vec![0x5au8; 3 * COPY_BUF_SIZE + 21];
        let expected = body.clone();
        let url = spawn_server(move |mut stream| {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
        });

        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("archive.tar.zst");
        let progress = DownloadProgress::new();

        download(&url, &dst, &progress, &CancelToken::new()).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), expected);
        assert!(!tmp_path(&dst).exists());
        assert_eq!(progress.total(), expected.len() as u64);
        assert_eq!(progress.current(), expected.len() as u64);
    }

    #[test]
    fn cancel_mid_download_removes_partial_files() {
        let (tx, rx) = mpsc::channel::<()>();
        let chunk = vec![0x11u8; COPY_BUF_SIZE];
        let url = spawn_server(move |mut stream| {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                2 * COPY_BUF_SIZE
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&chunk).unwrap();
            stream.flush().unwrap();
            // Hold the second half back until the client has been canceled.
            let _ = rx.recv();
            let _ = stream.write_all(&chunk);
        });

        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("archive.tar.zst");
        let progress = DownloadProgress::new();
        let cancel = CancelToken::new();

        let err = thread::scope(|s| {
            s.spawn(|| {
                while progress.current() == 0 {
                    thread::sleep(Duration::from_millis(5));
                }
                cancel.cancel();
                let _ = tx.send(());
            });
            download(&url, &dst, &progress, &cancel).unwrap_err()
        });

        assert!(matches!(err, DownloadError::Canceled));
        assert!(!dst.exists());
        assert!(!tmp_path(&dst).exists());
    }

    #[test]
    fn http_error_status_leaves_no_files_behind() {
        let url = spawn_server(|mut stream| {
            let _ = stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        });

        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("archive.tar.zst");

        let err =
            download(&url, &dst, &DownloadProgress::new(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DownloadError::Http(_)));
        assert!(!dst.exists());
        assert!(!tmp_path(&dst).exists());
    }
}
