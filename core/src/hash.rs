//! Content identifiers.
//!
//! `Hash32` is the BLAKE3 identity of a chunk (or of a file's concatenated
//! chunk list); `Hash8` is the short fingerprint used for file-name-level
//! identities. Both order lexicographically and render as lowercase hex.

use crate::error::{Error, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 32-byte content identifier (64 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Hash32(bytes)
    }

    /// BLAKE3 over `data`.
    pub fn compute(data: &[u8]) -> Self {
        Hash32(*blake3::hash(data).as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Format(format!("expected 32 hash bytes, got {}", bytes.len())))?;
        Ok(Hash32(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Format(format!("invalid hex hash: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte of the hash, used to shard pack files by prefix.
    pub fn prefix_byte(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HexVisitor;
        impl Visitor<'_> for HexVisitor {
            type Value = Hash32;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 64-char lowercase hex string")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Hash32, E> {
                Hash32::from_hex(v).map_err(E::custom)
            }
        }
        deserializer.deserialize_str(HexVisitor)
    }
}

/// 8-byte short identifier (16 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash8([u8; 8]);

impl Hash8 {
    pub const LEN: usize = 8;

    pub fn new(bytes: [u8; 8]) -> Self {
        Hash8(bytes)
    }

    /// Truncated BLAKE3 over `data`.
    pub fn compute(data: &[u8]) -> Self {
        let full = blake3::hash(data);
        let mut short = [0u8; 8];
        short.copy_from_slice(&full.as_bytes()[..8]);
        Hash8(short)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Format(format!("expected 8 hash bytes, got {}", bytes.len())))?;
        Ok(Hash8(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Format(format!("invalid hex hash: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash8({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_identity_matches_known_vector() {
        let h = Hash32::compute(b"hello world");
        assert_eq!(
            h.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash32::compute(b"abc");
        let parsed = Hash32::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);

        let s = Hash8::compute(b"abc");
        assert_eq!(s, Hash8::from_hex(&s.to_hex()).unwrap());
        assert_eq!(s.to_hex().len(), 16);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Hash32::new([0u8; 32]);
        let mut high = [0u8; 32];
        high[0] = 1;
        let b = Hash32::new(high);
        assert!(a < b);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Hash32::from_slice(&[0u8; 31]).is_err());
        assert!(Hash32::from_hex("abcd").is_err());
        assert!(Hash8::from_slice(&[0u8; 9]).is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let h = Hash32::compute(b"serde");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
