//! Error types for dsv_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using dsv_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the store, the repo and the peer protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: config::ConfigError,
    },

    /// Block, dataset or reference does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Reference carries neither peername, name nor path.
    #[error("Empty dataset reference")]
    EmptyRef,

    /// Request is malformed or not permitted.
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// Reference string could not be parsed.
    #[error("Invalid reference '{input}': {reason}")]
    InvalidRef { input: String, reason: String },

    /// Target slot in the reference index is already occupied.
    #[error("Dataset already exists: {reference}")]
    Exists { reference: String },

    /// Save supplied nothing that differs from the current head.
    #[error("No changes to save")]
    NoChanges,

    /// Body failed structured-data validation.
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// No live connection to the peer after bounded attempts.
    #[error("Peer unreachable: {peer} (after {attempts} attempts)")]
    PeerUnreachable { peer: String, attempts: u32 },

    /// Single network exchange failed; retried by the fetch loop.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Manifest or block transfer failed after bounded retries.
    #[error("Transfer failed: {reason}")]
    TransferFailed { reason: String },

    /// Fetched block does not hash to its manifest entry.
    #[error("Block mismatch: expected {expected}, got {actual}")]
    BlockMismatch { expected: String, actual: String },

    /// Manifest is malformed or does not describe a closed DAG.
    #[error("Invalid manifest: {reason}")]
    ManifestInvalid { reason: String },

    /// Manifest exceeds the configured block-count or byte ceiling.
    #[error("Manifest too large: {blocks} blocks / {bytes} bytes (limit {max_blocks} blocks / {max_bytes} bytes)")]
    ManifestTooLarge {
        blocks: usize,
        bytes: u64,
        max_blocks: usize,
        max_bytes: u64,
    },

    /// Operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Registry rejected or failed a request.
    #[error("Registry error: {reason}")]
    Registry { reason: String },

    /// Reference index was closed.
    #[error("Reference index is closed")]
    IndexClosed,

    /// Stored block is corrupted.
    #[error("Corrupted block at {path}: {reason}")]
    CorruptedBlock { path: PathBuf, reason: String },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Store directory is missing or malformed.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create a BadRequest error.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Error::BadRequest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRef error.
    pub fn invalid_ref(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRef {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an Exists error.
    pub fn exists(reference: impl Into<String>) -> Self {
        Error::Exists {
            reference: reference.into(),
        }
    }

    /// Create a Validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    /// Create a PeerUnreachable error.
    pub fn peer_unreachable(peer: impl Into<String>, attempts: u32) -> Self {
        Error::PeerUnreachable {
            peer: peer.into(),
            attempts,
        }
    }

    /// Create a Transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Error::Transport {
            reason: reason.into(),
        }
    }

    /// Create a TransferFailed error.
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Error::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a BlockMismatch error.
    pub fn block_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::BlockMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a ManifestInvalid error.
    pub fn manifest_invalid(reason: impl Into<String>) -> Self {
        Error::ManifestInvalid {
            reason: reason.into(),
        }
    }

    /// Create a Registry error.
    pub fn registry(reason: impl Into<String>) -> Self {
        Error::Registry {
            reason: reason.into(),
        }
    }

    /// Create a CorruptedBlock error.
    pub fn corrupted_block(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedBlock {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            source: config::ConfigError::Message(message.into()),
        }
    }

    /// True for errors meaning "this thing does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for single-exchange network failures the fetch loop may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::EmptyRef.is_not_found());
        assert!(Error::transport("reset").is_transient());
        assert!(!Error::transfer_failed("gave up").is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::peer_unreachable("bob", 3);
        assert_eq!(err.to_string(), "Peer unreachable: bob (after 3 attempts)");
    }
}
