//! Boot-parameter binary codec.
//!
//! A provisioned board reads its per-device configuration ("boot params")
//! straight out of its own disk image at a fixed byte offset, without
//! mounting or interpreting the filesystem. This module owns that binary
//! layout: a fixed-size record of fields joined by an ASCII unit separator,
//! zero-padded to [`RECORD_SIZE`] and stored at [`PARAMS_OFFSET`].
//!
//! The record lives in the empty space between the MBR and the first
//! partition. An earlier format revision used the MBR bootstrap area at
//! `(0xe0, 216)`; the two are mutually incompatible and this crate targets
//! only the post-MBR revision.
//!
//! Field order is fixed:
//!
//! ```text
//! [mode] [local_ip] [gateway_ip] [socks_passcode] [wifi_name]
//! [wifi_password] [dmsghttp_json] [secret_key | hv_pk1 | hv_pk2 | ...]
//! ```
//!
//! The trailing key blob has no separators: keys are fixed-width, and an
//! all-zero public key (or running out of bytes) terminates the list. Text
//! fields are raw UTF-8 with no escaping, so none of them may contain the
//! separator byte; the same goes for the raw IP fields, so an address with
//! an octet equal to 31 (0x1f) is not representable either. Both are
//! preconditions on the caller, kept for compatibility with images already
//! in the field.

mod dmsghttp;
mod keys;

pub use dmsghttp::DmsgHttpServers;
pub use keys::{KeyParseError, PublicKey, SecretKey, PUBLIC_KEY_LEN, SECRET_KEY_LEN};

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

/// Byte offset of the boot-param region inside a disk image.
pub const PARAMS_OFFSET: u64 = 0x1800;
/// Exact size of the encoded boot-param record.
pub const RECORD_SIZE: usize = 2048;
/// ASCII unit separator, joining the record's fields.
pub const SEPARATOR: u8 = 0x1f;

/// Number of separator-delimited fields in an encoded record.
const FIELD_COUNT: usize = 8;

/// Errors from encoding, decoding, or moving a record in and out of an image.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("boot params exceed the {RECORD_SIZE}-byte region")]
    TooLarge,
    #[error("malformed boot-param record: {0}")]
    Malformed(&'static str),
    #[error("no boot params present in region")]
    Absent,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The operating mode of a provisioned node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    Hypervisor,
    Visor,
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> u8 {
        match mode {
            Mode::Hypervisor => 0x00,
            Mode::Visor => 0x01,
        }
    }
}

/// Per-device boot parameters embedded into a final image.
///
/// `local_pk` is derived from `local_sk` by the collaborator that builds
/// these records; it is carried for display purposes only and is never
/// encoded, so a decoded record always has a null `local_pk`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BootParams {
    pub mode: Mode,
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wifi_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wifi_password: String,
    #[serde(default)]
    pub local_pk: PublicKey,
    #[serde(default)]
    pub local_sk: SecretKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dmsghttp_json: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypervisor_pks: Vec<PublicKey>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socks_passcode: String,
}

impl BootParams {
    /// Encode the record into exactly [`RECORD_SIZE`] bytes.
    ///
    /// Absent optional fields contribute zero bytes but keep their
    /// separator, so the field count is stable. The tail of the buffer is
    /// zero padding.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut key_blob =
            Vec::with_capacity(SECRET_KEY_LEN + self.hypervisor_pks.len() * PUBLIC_KEY_LEN);
        key_blob.extend_from_slice(self.local_sk.as_bytes());
        for pk in &self.hypervisor_pks {
            key_blob.extend_from_slice(pk.as_bytes());
        }

        fn ip_octets(octets: &Option<[u8; 4]>) -> &[u8] {
            match octets {
                Some(o) => o,
                None => &[],
            }
        }

        let mode = [u8::from(self.mode)];
        let local_ip = self.local_ip.map(|ip| ip.octets());
        let gateway_ip = self.gateway_ip.map(|ip| ip.octets());

        let fields: [&[u8]; FIELD_COUNT] = [
            &mode,
            ip_octets(&local_ip),
            ip_octets(&gateway_ip),
            self.socks_passcode.as_bytes(),
            self.wifi_name.as_bytes(),
            self.wifi_password.as_bytes(),
            self.dmsghttp_json.as_bytes(),
            &key_blob,
        ];

        let joined: usize = fields.iter().map(|f| f.len()).sum::<usize>() + (FIELD_COUNT - 1);
        if joined > RECORD_SIZE {
            return Err(CodecError::TooLarge);
        }

        let mut out = vec![0u8; RECORD_SIZE];
        let mut at = 0;
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out[at] = SEPARATOR;
                at += 1;
            }
            out[at..at + field.len()].copy_from_slice(field);
            at += field.len();
        }
        Ok(out)
    }

    /// Decode a record from the raw boot-param region.
    ///
    /// The split is limited to [`FIELD_COUNT`] pieces so separator bytes
    /// that happen to occur inside raw key material stay part of the key
    /// blob. An all-zero buffer does not split into enough fields and is
    /// rejected rather than decoded as a zeroed record.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let fields: Vec<&[u8]> = raw.splitn(FIELD_COUNT, |&b| b == SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(CodecError::Malformed("wrong field count"));
        }

        let mode = match fields[0] {
            [0x00] => Mode::Hypervisor,
            [0x01] => Mode::Visor,
            _ => return Err(CodecError::Malformed("unrecognized mode byte")),
        };

        let mut params = BootParams {
            mode,
            local_ip: parse_ip(fields[1])?,
            gateway_ip: parse_ip(fields[2])?,
            socks_passcode: parse_text(fields[3])?,
            wifi_name: parse_text(fields[4])?,
            wifi_password: parse_text(fields[5])?,
            dmsghttp_json: parse_text(fields[6])?,
            ..BootParams::default()
        };

        // Key blob: 32 secret-key bytes, then 33-byte public keys until an
        // all-zero key or the padding runs out. Short reads leave the
        // remainder of the key zeroed.
        let mut blob = fields[7];
        let mut sk = [0u8; SECRET_KEY_LEN];
        let take = blob.len().min(SECRET_KEY_LEN);
        sk[..take].copy_from_slice(&blob[..take]);
        blob = &blob[take..];
        params.local_sk = SecretKey::new(sk);

        loop {
            let mut pk = [0u8; PUBLIC_KEY_LEN];
            let take = blob.len().min(PUBLIC_KEY_LEN);
            pk[..take].copy_from_slice(&blob[..take]);
            blob = &blob[take..];
            let pk = PublicKey::new(pk);
            if pk.is_null() {
                break;
            }
            params.hypervisor_pks.push(pk);
        }

        Ok(params)
    }
}

fn parse_ip(field: &[u8]) -> Result<Option<Ipv4Addr>, CodecError> {
    match *field {
        [] => Ok(None),
        [a, b, c, d] => Ok(Some(Ipv4Addr::new(a, b, c, d))),
        _ => Err(CodecError::Malformed("IP field is not 4 bytes")),
    }
}

fn parse_text(field: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(field.to_vec()).map_err(|_| CodecError::Malformed("text field is not UTF-8"))
}

/// Write an encoded record into an already-open image file.
pub fn write_raw_region(file: &mut File, raw: &[u8]) -> Result<(), CodecError> {
    file.seek(SeekFrom::Start(PARAMS_OFFSET))?;
    file.write_all(raw)?;
    Ok(())
}

/// Read the raw boot-param region from an already-open image file.
///
/// An all-zero region means the image was never provisioned and yields
/// [`CodecError::Absent`].
pub fn read_raw_region(file: &mut File) -> Result<Vec<u8>, CodecError> {
    let mut raw = vec![0u8; RECORD_SIZE];
    file.seek(SeekFrom::Start(PARAMS_OFFSET))?;
    file.read_exact(&mut raw)?;
    if raw.iter().all(|&b| b == 0) {
        return Err(CodecError::Absent);
    }
    Ok(raw)
}

/// Encode `params` and patch them into the image at `path`.
pub fn write_params(path: &Path, params: &BootParams) -> Result<(), CodecError> {
    let raw = params.encode()?;
    let mut file = OpenOptions::new().write(true).open(path)?;
    write_raw_region(&mut file, &raw)
}

/// Read boot parameters back out of the image at `path`.
pub fn read_params(path: &Path) -> Result<BootParams, CodecError> {
    let mut file = File::open(path)?;
    let raw = read_raw_region(&mut file)?;
    BootParams::decode(&raw)
}

/// Next address in a provisioning sequence, skipping `.0` and `.255`.
pub fn next_ip(prev: Ipv4Addr) -> Ipv4Addr {
    let mut octets = prev.octets();
    loop {
        octets[3] = octets[3].wrapping_add(1);
        if octets[3] != 0 && octets[3] != 255 {
            return Ipv4Addr::from(octets);
        }
    }
}
