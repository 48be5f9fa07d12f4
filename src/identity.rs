//! Content-addressed module identity.
//!
//! Two independent digests are derived from a candidate's source bytes:
//! 1. **Module id**: SHA3-256 truncated to 128 bits, hex encoded. Same bytes
//!    always give the same id.
//! 2. **Content hash**: full SHA-256, hex encoded. Used for integrity checks and
//!    as the message the approval signer attests to.
//!
//! The two come from different hash families (Keccak sponge vs. Merkle-Damgard),
//! so a collision on the identifier does not also forge the integrity hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tiny_keccak::{Hasher, Sha3};

/// Width of a module id in bytes (hex string is twice this).
pub const MODULE_ID_BYTES: usize = 16;

/// Width of a content hash in bytes.
pub const CONTENT_HASH_BYTES: usize = 32;

/// Stable identifier derived solely from module content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

/// Integrity digest of module content, independent of the id.
///
/// Only the canonical form (64 lowercase hex characters) parses, so two
/// hashes compare equal exactly when their digests do.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; CONTENT_HASH_BYTES]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseModuleIdError {
    #[error("module id must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("module id is not valid hex")]
    InvalidHex,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseContentHashError {
    #[error("content hash must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("content hash must be lowercase hex")]
    NotLowercaseHex,
}

impl ModuleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ContentHash {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_BYTES] {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl FromStr for ModuleId {
    type Err = ParseModuleIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let expected = MODULE_ID_BYTES * 2;
        if s.len() != expected {
            return Err(ParseModuleIdError::InvalidLength {
                expected,
                actual: s.len(),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseModuleIdError::InvalidHex);
        }
        Ok(Self(s))
    }
}

impl FromStr for ContentHash {
    type Err = ParseContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expected = CONTENT_HASH_BYTES * 2;
        if s.len() != expected {
            return Err(ParseContentHashError::InvalidLength {
                expected,
                actual: s.len(),
            });
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ParseContentHashError::NotLowercaseHex);
        }
        let mut digest = [0u8; CONTENT_HASH_BYTES];
        hex::decode_to_slice(s, &mut digest)
            .map_err(|_| ParseContentHashError::NotLowercaseHex)?;
        Ok(Self(digest))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ParseContentHashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// Derive the module id for `content`.
pub fn derive_id(content: &[u8]) -> ModuleId {
    let mut hasher = Sha3::v256();
    let mut output = [0u8; 32];
    hasher.update(content);
    hasher.finalize(&mut output);
    ModuleId(hex::encode(&output[..MODULE_ID_BYTES]))
}

/// Derive the integrity hash for `content`.
pub fn derive_hash(content: &[u8]) -> ContentHash {
    let mut digest = [0u8; CONTENT_HASH_BYTES];
    digest.copy_from_slice(&Sha256::digest(content));
    ContentHash(digest)
}
