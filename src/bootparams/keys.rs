//! Fixed-width key newtypes carried in boot parameters.
//!
//! Keys are opaque to this crate: the secret key is 32 raw bytes and public
//! keys are 33 raw bytes (compressed-point width). Key generation and
//! derivation happen in the collaborator that supplies [`BootParams`]
//! records; here they are only moved around, hex-formatted, and compared
//! against the all-zero "no key" sentinel used by the binary record.
//!
//! [`BootParams`]: crate::bootparams::BootParams

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Byte length of a secret key.
pub const SECRET_KEY_LEN: usize = 32;
/// Byte length of a public key.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Errors from parsing a key out of its hex form.
#[derive(Debug, Error)]
pub enum KeyParseError {
    #[error("key is not valid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("key is {got} bytes, expected {want}")]
    Length { want: usize, got: usize },
}

macro_rules! key_newtype {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name([u8; $len]);

        impl $name {
            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Whether every byte is zero (the "no key present" sentinel).
            pub fn is_null(&self) -> bool {
                self.0.iter().all(|&b| b == 0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                let bytes: [u8; $len] = bytes
                    .try_into()
                    .map_err(|v: Vec<u8>| KeyParseError::Length {
                        want: $len,
                        got: v.len(),
                    })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

key_newtype!(SecretKey, SECRET_KEY_LEN, "A 32-byte secret key, hex-serialized.");
key_newtype!(PublicKey, PUBLIC_KEY_LEN, "A 33-byte public key, hex-serialized.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let sk = SecretKey::new([0xab; SECRET_KEY_LEN]);
        let parsed: SecretKey = sk.to_string().parse().unwrap();
        assert_eq!(sk, parsed);

        let pk = PublicKey::new([0x02; PUBLIC_KEY_LEN]);
        let parsed: PublicKey = pk.to_string().parse().unwrap();
        assert_eq!(pk, parsed);
    }

    #[test]
    fn wrong_length_rejected() {
        let err = "ab".repeat(SECRET_KEY_LEN + 1).parse::<SecretKey>();
        assert!(matches!(
            err,
            Err(KeyParseError::Length { want: SECRET_KEY_LEN, got: 33 })
        ));
    }

    #[test]
    fn null_sentinel() {
        assert!(PublicKey::default().is_null());
        assert!(!PublicKey::new([1; PUBLIC_KEY_LEN]).is_null());
    }

    #[test]
    fn serde_as_hex_string() {
        let pk = PublicKey::new([0x7f; PUBLIC_KEY_LEN]);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", "7f".repeat(PUBLIC_KEY_LEN)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, back);
    }
}
