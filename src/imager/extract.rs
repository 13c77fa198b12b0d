//! Streaming extraction and verification of base-image archives.
//!
//! The archive is a zstd-compressed tar. One walk over the stream routes
//! every entry by suffix: image bytes go through the image's digesting
//! writer, checksum sidecars fill in the expected digests. Because the two
//! kinds of entry may appear in any order, verification only happens once
//! the whole archive has been consumed; failed images are dropped (and
//! their files deleted) rather than failing the extraction, which only
//! errors out when nothing trustworthy remains.

use crate::imager::image::{BaseImage, VerifiedImage, MD5_LEN, SHA1_LEN};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of a base disk image inside the archive.
pub const EXT_IMG: &str = ".img";
/// Suffix of the hex MD5 sidecar for an image.
pub const EXT_MD5: &str = ".img.md5";
/// Suffix of the hex SHA1 sidecar for an image.
pub const EXT_SHA1: &str = ".img.sha1";
/// Suffix of the archive container itself; nested containers are skipped.
pub const EXT_ARCHIVE: &str = ".tar.zst";

/// Sidecars are tiny hex text files; refuse to slurp anything bigger.
const SIDECAR_MAX_LEN: u64 = 4096;

/// Errors that abort the archive walk.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to open archive '{path}'")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to walk archive")]
    Walk(#[source] io::Error),
    #[error("failed to extract image '{name}'")]
    Image {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid {algorithm} sidecar for image '{name}'")]
    Sidecar {
        name: String,
        algorithm: &'static str,
        #[source]
        source: SidecarError,
    },
    #[error("archive contained no image that passed verification")]
    NoValidImages,
}

/// Why a checksum sidecar could not be parsed.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sidecar is empty")]
    Empty,
    #[error("sidecar is not valid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("digest is {got} bytes, expected {want}")]
    Length { want: usize, got: usize },
}

/// Walk `archive`, extracting every `.img` entry into `work_dir` and
/// verifying each against its sidecars once the walk completes.
///
/// Returns the verified images keyed by base name (the entry name with
/// `.img` stripped). At least one image must survive verification.
pub fn extract_archive(
    archive: &Path,
    work_dir: &Path,
) -> Result<BTreeMap<String, VerifiedImage>, ExtractError> {
    info!("extracting archive '{}'", archive.display());

    let file = File::open(archive).map_err(|source| ExtractError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let decoder = zstd::stream::Decoder::new(file).map_err(ExtractError::Walk)?;
    let mut tar = tar::Archive::new(decoder);

    let mut images: BTreeMap<String, BaseImage> = BTreeMap::new();
    if let Err(err) = walk_entries(&mut tar, work_dir, &mut images) {
        // An aborted walk leaves nothing trustworthy behind, including any
        // partially-extracted image files.
        for (_, img) in images {
            img.discard();
        }
        return Err(err);
    }

    // Explicit filter step: every discovered image is verified exactly
    // once; failures are dropped from the result and their files removed.
    let mut verified = BTreeMap::new();
    for (name, img) in images {
        match img.verify() {
            Ok(v) => {
                info!("image '{name}{EXT_IMG}' verified");
                verified.insert(name, v);
            }
            Err(err) => {
                error!("disregarding image '{name}{EXT_IMG}': {err}");
            }
        }
    }

    if verified.is_empty() {
        return Err(ExtractError::NoValidImages);
    }
    Ok(verified)
}

fn walk_entries<R: Read>(
    tar: &mut tar::Archive<R>,
    work_dir: &Path,
    images: &mut BTreeMap<String, BaseImage>,
) -> Result<(), ExtractError> {
    for entry in tar.entries().map_err(ExtractError::Walk)? {
        let mut entry = entry.map_err(ExtractError::Walk)?;
        if entry.header().entry_type().is_dir() {
            continue;
        }

        let Some(file_name) = entry_file_name(&entry) else {
            warn!("skipping archive entry with unreadable name");
            continue;
        };

        // Longest suffix first: `.img.md5` and `.img.sha1` also end in a
        // name that strips against `.img`.
        if let Some(name) = strip_suffix(&file_name, EXT_MD5) {
            let digest: [u8; MD5_LEN] =
                read_sidecar(&mut entry).map_err(|source| ExtractError::Sidecar {
                    name: name.clone(),
                    algorithm: "MD5",
                    source,
                })?;
            debug!("expected MD5 for '{name}{EXT_IMG}' is {}", hex::encode(digest));
            image_entry(images, name).set_expected_md5(digest);
        } else if let Some(name) = strip_suffix(&file_name, EXT_SHA1) {
            let digest: [u8; SHA1_LEN] =
                read_sidecar(&mut entry).map_err(|source| ExtractError::Sidecar {
                    name: name.clone(),
                    algorithm: "SHA1",
                    source,
                })?;
            debug!("expected SHA1 for '{name}{EXT_IMG}' is {}", hex::encode(digest));
            image_entry(images, name).set_expected_sha1(digest);
        } else if let Some(name) = strip_suffix(&file_name, EXT_IMG) {
            let dst = work_dir.join(&file_name);
            let img = image_entry(images, name.clone());
            let n = write_image_bytes(img, &dst, &mut entry)
                .map_err(|source| ExtractError::Image { name, source })?;
            info!("extracted {n} bytes to '{}'", dst.display());
        } else if file_name.ends_with(EXT_ARCHIVE) {
            debug!("skipping nested archive entry '{file_name}'");
        } else {
            warn!("skipping unexpected archive entry '{file_name}'");
        }
    }
    Ok(())
}

fn entry_file_name<R: Read>(entry: &tar::Entry<'_, R>) -> Option<String> {
    let path = entry.path().ok()?;
    Some(path.file_name()?.to_str()?.to_string())
}

fn strip_suffix(file_name: &str, suffix: &str) -> Option<String> {
    file_name
        .strip_suffix(suffix)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn image_entry(images: &mut BTreeMap<String, BaseImage>, name: String) -> &mut BaseImage {
    images
        .entry(name.clone())
        .or_insert_with(|| BaseImage::new(name))
}

fn write_image_bytes<R: Read>(
    img: &mut BaseImage,
    dst: &Path,
    entry: &mut R,
) -> io::Result<u64> {
    img.init(dst)?;
    io::copy(entry, &mut img.writer()?)
}

/// Parse a hex digest out of a sidecar entry. The digest is the first
/// whitespace-delimited token; `md5sum`-style sidecars append the file name.
fn read_sidecar<R: Read, const N: usize>(entry: &mut R) -> Result<[u8; N], SidecarError> {
    let mut text = String::new();
    entry.take(SIDECAR_MAX_LEN).read_to_string(&mut text)?;
    let token = text.split_whitespace().next().ok_or(SidecarError::Empty)?;
    let bytes = hex::decode(token)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| SidecarError::Length {
            want: N,
            got: v.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use md5::{Digest, Md5};
    use sha1::Sha1;
    use std::fs;
    use std::io::Write as _;

    /// Build a `.tar.zst` archive from (entry name, bytes) pairs.
    fn make_archive(dir: &Path, entries: &[(&str, Vec<u8>)]) -> PathBuf {
        let path = dir.join("download.tar.zst");
        let out = File::create(&path).unwrap();
        let encoder = zstd::stream::Encoder::new(out, 3).unwrap();
        let mut builder = tar::Builder::new(encoder);

        for (name, bytes) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, bytes.as_slice()).unwrap();
        }

        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap().flush().unwrap();
        path
    }

    fn image_payload(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    fn sidecars(name: &str, payload: &[u8]) -> [(String, Vec<u8>); 2] {
        [
            (
                format!("{name}{EXT_MD5}"),
                format!("{}  {name}{EXT_IMG}\n", hex::encode(Md5::digest(payload))).into_bytes(),
            ),
            (
                format!("{name}{EXT_SHA1}"),
                format!("{}  {name}{EXT_IMG}\n", hex::encode(Sha1::digest(payload))).into_bytes(),
            ),
        ]
    }

    #[test]
    fn extracts_and_verifies_one_image() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = image_payload(3, 4096);
        let [md5, sha1] = sidecars("alpha", &payload);
        let archive = make_archive(
            tmp.path(),
            &[
                ("alpha.img", payload.clone()),
                (&md5.0, md5.1.clone()),
                (&sha1.0, sha1.1.clone()),
                ("notes.txt", b"ignored".to_vec()),
            ],
        );

        let images = extract_archive(&archive, tmp.path()).unwrap();
        assert_eq!(images.len(), 1);
        let alpha = &images["alpha"];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(fs::read(&alpha.path).unwrap(), payload);
    }

    #[test]
    fn sidecars_may_precede_image_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = image_payload(7, 2048);
        let [md5, sha1] = sidecars("beta", &payload);
        let archive = make_archive(
            tmp.path(),
            &[
                (&md5.0, md5.1.clone()),
                (&sha1.0, sha1.1.clone()),
                ("beta.img", payload.clone()),
            ],
        );

        let images = extract_archive(&archive, tmp.path()).unwrap();
        assert!(images.contains_key("beta"));
    }

    #[test]
    fn sole_corrupt_image_fails_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = image_payload(5, 1024);
        let [_, sha1] = sidecars("gamma", &payload);
        let bad_md5 = format!("{}\n", hex::encode([0u8; MD5_LEN])).into_bytes();
        let archive = make_archive(
            tmp.path(),
            &[
                ("gamma.img", payload),
                (&format!("gamma{EXT_MD5}"), bad_md5),
                (&sha1.0, sha1.1.clone()),
            ],
        );

        let err = extract_archive(&archive, tmp.path()).unwrap_err();
        assert!(matches!(err, ExtractError::NoValidImages));
        // The untrusted file was removed.
        assert!(!tmp.path().join("gamma.img").exists());
    }

    #[test]
    fn corrupt_image_is_dropped_but_good_sibling_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let good = image_payload(9, 2048);
        let bad = image_payload(11, 2048);
        let [good_md5, good_sha1] = sidecars("good", &good);
        let [bad_md5, _] = sidecars("bad", &bad);
        let wrong_sha1 = format!("{}\n", hex::encode([0u8; SHA1_LEN])).into_bytes();
        let archive = make_archive(
            tmp.path(),
            &[
                ("good.img", good),
                (&good_md5.0, good_md5.1.clone()),
                (&good_sha1.0, good_sha1.1.clone()),
                ("bad.img", bad),
                (&bad_md5.0, bad_md5.1.clone()),
                (&format!("bad{EXT_SHA1}"), wrong_sha1),
            ],
        );

        let images = extract_archive(&archive, tmp.path()).unwrap();
        assert_eq!(images.len(), 1);
        assert!(images.contains_key("good"));
        assert!(!tmp.path().join("bad.img").exists());
    }

    #[test]
    fn image_with_no_sidecars_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let lonely = image_payload(13, 512);
        let trusted = image_payload(15, 512);
        let [md5, sha1] = sidecars("trusted", &trusted);
        let archive = make_archive(
            tmp.path(),
            &[
                ("lonely.img", lonely),
                ("trusted.img", trusted),
                (&md5.0, md5.1.clone()),
                (&sha1.0, sha1.1.clone()),
            ],
        );

        let images = extract_archive(&archive, tmp.path()).unwrap();
        assert_eq!(images.len(), 1);
        assert!(images.contains_key("trusted"));
    }

    #[test]
    fn malformed_sidecar_aborts_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = image_payload(17, 256);
        let archive = make_archive(
            tmp.path(),
            &[
                ("delta.img", payload),
                ("delta.img.md5", b"not hex at all\n".to_vec()),
            ],
        );

        let err = extract_archive(&archive, tmp.path()).unwrap_err();
        match err {
            ExtractError::Sidecar { name, algorithm, .. } => {
                assert_eq!(name, "delta");
                assert_eq!(algorithm, "MD5");
            }
            other => panic!("expected sidecar error, got {other:?}"),
        }
        assert!(!tmp.path().join("delta.img").exists());
    }
}
