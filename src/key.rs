//! # Store Keys
//!
//! Keys are opaque 16-byte fingerprints (an MD5 digest in the typical
//! deployment, but any 16 bytes work). Equality and hashing go by byte
//! content; there is no ordering semantics anywhere in the store — keys are
//! never range-scanned.
//!
//! The public API accepts `&[u8]` and validates the length at the boundary,
//! so malformed keys are rejected before any state changes.

use eyre::{ensure, Result};

/// Exact byte length of every key.
pub const KEY_BYTES: usize = 16;

/// An opaque 16-byte fingerprint key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey([u8; KEY_BYTES]);

impl StoreKey {
    pub fn new(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Validates and copies a key from a caller-supplied slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == KEY_BYTES,
            "key length must be {} bytes, got {}",
            KEY_BYTES,
            bytes.len()
        );

        let mut buf = [0u8; KEY_BYTES];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl AsRef<[u8]> for StoreKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; KEY_BYTES]> for StoreKey {
    fn from(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreKey(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
