//! Headless image-provisioning driver.
//!
//! Reads a JSON array of boot-param records from stdin, downloads and
//! verifies the base image archive, and prints the final image paths. The
//! interactive front-ends that assemble records live elsewhere; this binary
//! is the thin pipeline driver for scripted provisioning runs.
//!
//! ```text
//! bootforge --url https://example.com/images.tar.zst < records.json
//! ```

use anyhow::{bail, Context, Result};
use bootforge::bootparams::BootParams;
use bootforge::imager::{self, CancelToken};
use clap::Parser;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bootforge", version, about = "Build boot-param-patched images from a base image archive")]
struct Args {
    /// Root working directory; base/ and final/ are created beneath it.
    #[arg(long, default_value_os_t = default_root())]
    root: PathBuf,

    /// URL of the base image archive (.tar.zst).
    #[arg(long)]
    url: String,
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bootforge")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let records: Vec<BootParams> = serde_json::from_reader(io::stdin().lock())
        .context("reading boot-param records (JSON array) from stdin")?;
    if records.is_empty() {
        bail!("no boot-param records supplied on stdin");
    }

    let cancel = CancelToken::new();
    let outputs = imager::build(&args.root, &args.url, &records, &cancel)?;

    for path in &outputs {
        println!("{}", path.display());
    }
    Ok(())
}
