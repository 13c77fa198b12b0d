//! End-to-end build: URL plus boot-param records in, final image paths out.

use crate::bootparams::BootParams;
use crate::imager::{Builder, CancelToken};
use anyhow::{bail, Context, Result};
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const README_TXT: &str = "These images are ready to be flashed to disk!

Use a tool such as balenaEtcher: https://www.balena.io/etcher/

Enjoy!
";

/// Run a whole build under `root`: download the archive from `url` into
/// `<root>/base`, extract and verify it, then write one final image per
/// record into `<root>/final`. Returns the output image paths.
///
/// A reporting thread logs download progress once per second; only the
/// download phase honors `cancel`.
pub fn build(
    root: &Path,
    url: &str,
    records: &[BootParams],
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let base_dir = root.join("base");
    let final_dir = root.join("final");

    info!("initializing builder under '{}'", root.display());
    let builder = Builder::new(&base_dir, &final_dir)
        .with_context(|| format!("initializing builder under '{}'", root.display()))?;

    info!("downloading base image archive from {url}");
    download_with_progress(&builder, url, cancel)
        .with_context(|| format!("downloading base image archive from {url}"))?;

    builder
        .extract_archive()
        .context("extracting base image archive")?;

    let images = builder.images();
    info!("obtained {} verified base image(s): {images:?}", images.len());
    let Some(base_name) = images.first() else {
        bail!("no verified base images in archive");
    };

    let outputs = builder
        .make_final_images(base_name, records)
        .context("making final images")?;
    info!("final images created under '{}'", final_dir.display());

    // Best-effort; a missing README does not fail the build.
    if let Err(err) = fs::write(final_dir.join("README.txt"), README_TXT) {
        error!("failed to write README.txt: {err}");
    }

    Ok(outputs)
}

/// Run the download on the calling thread while a scoped reporter thread
/// polls the builder's atomic counters once per second.
fn download_with_progress(builder: &Builder, url: &str, cancel: &CancelToken) -> Result<()> {
    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            let mut last_percent = u64::MAX;
            while !done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let total = builder.download_total();
                let current = builder.download_current();
                if total == 0 {
                    continue;
                }
                let percent = current * 100 / total;
                if percent != last_percent {
                    last_percent = percent;
                    info!("downloading base image: {percent}% ({current}/{total} bytes)");
                }
            }
        });

        let result = builder.download(url, cancel);
        done.store(true, Ordering::Relaxed);
        result
    })?;
    Ok(())
}
