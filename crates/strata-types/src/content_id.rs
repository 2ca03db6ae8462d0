use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StrataError};

type KeyedBlake2b256 = Blake2bMac<U32>;

/// Size of the fixed binary encoding: one prefix byte plus the 32-byte hash.
pub const CONTENT_ID_BINARY_LEN: usize = 33;

/// A content identifier: keyed BLAKE2b-256 of the payload with an optional
/// one-letter type prefix (`g`..=`z`).
///
/// The prefix byte is `0` for unprefixed contents, so unprefixed IDs sort
/// before prefixed ones.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId {
    prefix: u8,
    hash: [u8; 32],
}

impl ContentId {
    /// Compute a content ID using keyed BLAKE2b-256.
    pub fn compute(key: &[u8; 32], prefix: Option<char>, data: &[u8]) -> Result<Self> {
        let prefix = encode_prefix(prefix)?;
        let mut hasher =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut hasher, data);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize().into_bytes());
        Ok(Self { prefix, hash })
    }

    /// Build an ID from raw parts. Used by tests and by binary decoders.
    pub fn from_parts(prefix: Option<char>, hash: [u8; 32]) -> Result<Self> {
        Ok(Self {
            prefix: encode_prefix(prefix)?,
            hash,
        })
    }

    pub fn prefix(&self) -> Option<char> {
        if self.prefix == 0 {
            None
        } else {
            Some(self.prefix as char)
        }
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix != 0
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Fixed 33-byte encoding used inside pack records and V0 index blobs.
    pub fn to_bytes(&self) -> [u8; CONTENT_ID_BINARY_LEN] {
        let mut out = [0u8; CONTENT_ID_BINARY_LEN];
        out[0] = self.prefix;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONTENT_ID_BINARY_LEN {
            return Err(StrataError::InvalidContentId(format!(
                "expected {CONTENT_ID_BINARY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let prefix = bytes[0];
        if prefix != 0 && !is_valid_prefix(prefix) {
            return Err(StrataError::InvalidContentId(format!(
                "invalid prefix byte {prefix:#04x}"
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[1..]);
        Ok(Self { prefix, hash })
    }
}

fn is_valid_prefix(b: u8) -> bool {
    (b'g'..=b'z').contains(&b)
}

fn encode_prefix(prefix: Option<char>) -> Result<u8> {
    match prefix {
        None => Ok(0),
        Some(c) if c.is_ascii() && is_valid_prefix(c as u8) => Ok(c as u8),
        Some(c) => Err(StrataError::InvalidContentId(format!(
            "content prefix must be in g..=z, got '{c}'"
        ))),
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.prefix() {
            write!(f, "{p}")?;
        }
        write!(f, "{}", hex::encode(self.hash))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        let short = &s[..s.len().min(17)];
        write!(f, "ContentId({short})")
    }
}

impl FromStr for ContentId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, hex_part) = match s.len() {
            64 => (None, s),
            65 => {
                let c = s.chars().next().unwrap_or('0');
                (Some(c), &s[c.len_utf8()..])
            }
            _ => return Err(StrataError::InvalidContentId(s.to_string())),
        };
        let raw = hex::decode(hex_part).map_err(|_| StrataError::InvalidContentId(s.to_string()))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&raw);
        Self::from_parts(prefix, hash).map_err(|_| StrataError::InvalidContentId(s.to_string()))
    }
}
