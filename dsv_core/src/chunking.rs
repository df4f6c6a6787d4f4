//! Content-defined chunking of dataset bodies using FastCDC.

use crate::error::{Error, Result};
use crate::hash::Digest;
use fastcdc::ronomon::{
    AVERAGE_MAX, AVERAGE_MIN, FastCDC, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
};
use serde::{Deserialize, Serialize};

/// Configuration for the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes.
    pub min_size: usize,
    /// Average (target) chunk size in bytes.
    pub avg_size: usize,
    /// Maximum chunk size in bytes.
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 64 * 1024,   // 64 KB
            avg_size: 256 * 1024,  // 256 KB
            max_size: 1024 * 1024, // 1 MB
        }
    }
}

impl ChunkerConfig {
    /// Check the sizes against the ranges FastCDC accepts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let bounds = [
            ("min_size", self.min_size, MINIMUM_MIN, MINIMUM_MAX),
            ("avg_size", self.avg_size, AVERAGE_MIN, AVERAGE_MAX),
            ("max_size", self.max_size, MAXIMUM_MIN, MAXIMUM_MAX),
        ];
        for (field, value, lo, hi) in bounds {
            if !(lo..=hi).contains(&value) {
                return Err(format!(
                    "chunker {} must be within {}..={} (got {})",
                    field, lo, hi, value
                ));
            }
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            return Err(format!(
                "chunker sizes must satisfy min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// A span of a body addressed by its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub size: usize,
    pub digest: Digest,
}

impl Chunk {
    /// The bytes of this chunk within `data`.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.offset + self.size]
    }
}

/// Split a body into content-defined chunks.
///
/// Identical regions across versions produce identical chunk digests, so a new
/// version only adds blocks for the regions that changed.
pub fn chunk_body(data: &[u8], config: &ChunkerConfig) -> Result<Vec<Chunk>> {
    config.validate().map_err(Error::config)?;

    let chunker = FastCDC::new(data, config.min_size, config.avg_size, config.max_size);

    Ok(chunker
        .map(|chunk| {
            let bytes = &data[chunk.offset..chunk.offset + chunk.length];
            Chunk {
                offset: chunk.offset,
                size: chunk.length,
                digest: Digest::of(bytes),
            }
        })
        .collect())
}
