//! On-disk block framing.
//!
//! A block file is a 16-byte header followed by the stored payload:
//!
//! ```text
//! 0x00  4   "DSVB"
//! 0x04  1   format version = 1
//! 0x05  1   digest algorithm id
//! 0x06  1   codec: 0=none, 1=zstd
//! 0x07  1   reserved, always 0
//! 0x08  8   stored payload length (u64 LE)
//! ```
//!
//! Digests cover the decoded payload, so the codec never changes a block's
//! address.

use crate::error::{Error, Result};
use crate::hash::Algorithm;

pub const MAGIC: &[u8; 4] = b"DSVB";
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;

const ZSTD_LEVEL: i32 = 3;

/// Payload codec of a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
}

impl CompressionType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            other => Err(Error::compression(format!("unknown block codec {}", other))),
        }
    }

    /// Codec for a payload of `len` bytes given the store's threshold.
    pub fn for_len(len: usize, threshold: usize) -> Self {
        if len >= threshold {
            CompressionType::Zstd
        } else {
            CompressionType::None
        }
    }

    /// Bytes to write for `payload`.
    pub fn encode(self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionType::None => Ok(payload.to_vec()),
            CompressionType::Zstd => zstd::encode_all(payload, ZSTD_LEVEL)
                .map_err(|e| Error::compression(format!("zstd compression failed: {}", e))),
        }
    }

    /// Payload recovered from stored bytes.
    pub fn decode(self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            CompressionType::None => Ok(stored),
            CompressionType::Zstd => zstd::decode_all(stored.as_slice())
                .map_err(|e| Error::compression(format!("zstd decompression failed: {}", e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub algorithm: Algorithm,
    pub compression: CompressionType,
    pub stored_len: u64,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.algorithm.id();
        buf[6] = self.compression as u8;
        buf[8..].copy_from_slice(&self.stored_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[..4] != MAGIC {
            return Err(Error::invalid_digest(format!(
                "not a block file (magic {:02x?})",
                &buf[..4]
            )));
        }
        if buf[4] != VERSION {
            return Err(Error::invalid_digest(format!(
                "unsupported block format version {}",
                buf[4]
            )));
        }
        if buf[7] != 0 {
            return Err(Error::invalid_digest("reserved header byte is set"));
        }

        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8..]);
        Ok(Self {
            algorithm: Algorithm::from_id(buf[5])?,
            compression: CompressionType::from_u8(buf[6])?,
            stored_len: u64::from_le_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            algorithm: Algorithm::Blake3,
            compression: CompressionType::Zstd,
            stored_len: 4242,
        }
    }

    #[test]
    fn test_header_layout() {
        let encoded = header().encode();
        assert_eq!(&encoded[..4], MAGIC);
        assert_eq!(encoded[6], 1);
        assert_eq!(&encoded[8..], &4242u64.to_le_bytes());
        assert_eq!(BlockHeader::decode(&encoded).unwrap(), header());
    }

    #[test]
    fn test_header_rejects_foreign_bytes() {
        let mut bad_magic = header().encode();
        bad_magic[0] = b'X';
        assert!(BlockHeader::decode(&bad_magic).is_err());

        let mut reserved = header().encode();
        reserved[7] = 1;
        assert!(BlockHeader::decode(&reserved).is_err());

        let mut codec = header().encode();
        codec[6] = 9;
        assert!(matches!(
            BlockHeader::decode(&codec),
            Err(Error::Compression { .. })
        ));
    }

    #[test]
    fn test_codec_threshold() {
        assert_eq!(CompressionType::for_len(10, 4096), CompressionType::None);
        assert_eq!(CompressionType::for_len(4096, 4096), CompressionType::Zstd);

        let payload = vec![3u8; 10_000];
        let stored = CompressionType::Zstd.encode(&payload).unwrap();
        assert!(stored.len() < payload.len());
        assert_eq!(CompressionType::Zstd.decode(stored).unwrap(), payload);
    }
}
