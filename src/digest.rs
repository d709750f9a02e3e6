//! SHA-256 content digests.
//!
//! Every digest in this crate — file content hashes, DiffKeys, cache
//! digests, layer digests — is a 32-byte SHA-256 value with the
//! canonical string form `"sha256:<lowercase-hex>"`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A `{algorithm, raw-bytes}` content digest. `algorithm` is always
/// `"sha256"` in this crate; the type exists to keep call sites
/// expressive rather than to support multiple algorithms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(#[serde(with = "digest_hex")] pub [u8; 32]);

impl Digest {
    /// The all-zero digest used as a base-image lineage sentinel.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Wrap raw bytes as a digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a single byte slice in one shot.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding of the raw bytes (no `sha256:` prefix).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Canonical `"sha256:<hex>"` string form.
    pub fn to_string_value(&self) -> String {
        format!("sha256:{}", self.to_hex())
    }

    /// Parse a canonical `"sha256:<64-hex>"` string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidFormat(format!("digest missing sha256: prefix: {s}")))?;
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidFormat(format!("malformed digest: {s}")));
        }
        let bytes = hex::decode(hex_part)
            .map_err(|e| Error::InvalidFormat(format!("malformed digest hex: {e}")))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_value())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_string_value())
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

mod digest_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let mut out = [0u8; 32];
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("expected 32-byte digest"));
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Streaming SHA-256 hasher used by [`crate::diff::ContentHasher`] and
/// the Merkle leaf/tree computations in [`crate::diffkey`].
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    /// Start a new streaming hash.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Feed more bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and produce the digest.
    pub fn finalize(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let d = Digest::of(b"hello world");
        let s = d.to_string_value();
        assert_eq!(Digest::parse(&s).unwrap(), d);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(Digest::parse("sha256:short").is_err());
        assert!(Digest::parse("md5:".to_owned().as_str()).is_err());
        assert!(Digest::parse(&format!("sha256:{}", "Z".repeat(64))).is_err());
        assert!(Digest::parse(&format!("sha256:{}", "A".repeat(64))).is_err()); // uppercase hex rejected
    }

    #[test]
    fn empty_hash_matches_known_value() {
        let d = Digest::of(b"");
        assert_eq!(
            d.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }
}
