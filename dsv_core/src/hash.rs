//! Block digests and dataset paths.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const DIGEST_SIZE: usize = 32;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm.
    ///
    /// Used as the object directory name and as the dataset path prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3" | "blake3-256" => Ok(Algorithm::Blake3),
            _ => Err(Error::invalid_digest(format!("unsupported algorithm: {}", s))),
        }
    }

    /// Returns the algorithm ID byte (for block headers).
    pub fn id(&self) -> u8 {
        match self {
            Algorithm::Blake3 => 1,
        }
    }

    /// Parse algorithm from ID byte.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Algorithm::Blake3),
            _ => Err(Error::invalid_digest(format!("unsupported algorithm ID {}", id))),
        }
    }
}

/// A 32-byte BLAKE3 content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Create a Digest from raw bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    /// Create a Digest from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != DIGEST_SIZE * 2 {
            return Err(Error::invalid_digest(format!(
                "expected {} hex characters, got {}",
                DIGEST_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_digest(format!("invalid hex: {}", e)))?;

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&bytes);
        Ok(Digest(digest))
    }

    /// Convert to hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 2 hex characters (directory shard).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remaining 62 hex characters (file name).
    pub fn suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }

    /// Abbreviated hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Digest raw bytes using BLAKE3.
    pub fn of(data: &[u8]) -> Self {
        Digest(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::from_hex(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Digest of the root block of one dataset version.
///
/// Rendered as `/blake3/<hex>`. Parsing also accepts a bare hex digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetPath(Digest);

impl DatasetPath {
    pub fn new(root: Digest) -> Self {
        DatasetPath(root)
    }

    /// The root block digest.
    pub fn digest(&self) -> Digest {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex_part = match trimmed.strip_prefix('/') {
            Some(rest) => {
                let (algo, hex_part) = rest
                    .split_once('/')
                    .ok_or_else(|| Error::invalid_digest(format!("malformed path: {}", s)))?;
                Algorithm::parse(algo)?;
                hex_part
            }
            None => trimmed,
        };
        Ok(DatasetPath(Digest::from_hex(hex_part)?))
    }
}

impl From<Digest> for DatasetPath {
    fn from(digest: Digest) -> Self {
        DatasetPath(digest)
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", Algorithm::Blake3.as_str(), self.0.to_hex())
    }
}

impl fmt::Debug for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatasetPath({})", self)
    }
}

impl FromStr for DatasetPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DatasetPath::parse(s)
    }
}

impl Serialize for DatasetPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DatasetPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DatasetPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
