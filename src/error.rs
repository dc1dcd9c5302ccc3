//! Error types shared across the node core.
//!
//! Every per-packet failure is represented here so handlers can log a typed
//! reason and move on; the dispatcher never lets one bad packet take the
//! node down. Only queue teardown and I/O failures during startup surface
//! past the dispatch loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Frame or payload bytes do not match the declared layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// CRC32 over the payload does not match the header.
    #[error("checksum mismatch: header {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Handshake timestamp outside the allowed clock skew.
    #[error("handshake timestamp off by {skew_ms} ms")]
    StaleHandshake { skew_ms: u64 },

    /// Ed25519 signature did not verify against the stated key.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Onion payload too short or its relay header is inconsistent.
    #[error("malformed onion payload: {0}")]
    MalformedOnion(&'static str),

    /// AEAD authentication failed while opening a layer or blob.
    #[error("decryption failed to authenticate")]
    DecryptFailure,

    /// AEAD encryption failed (plaintext beyond the cipher's limit).
    #[error("encryption failed")]
    SealFailure,

    /// No blob stored under the requested digest.
    #[error("blob {0} not found")]
    BlobNotFound(String),

    /// Blob exceeds the configured transfer limit.
    #[error("blob of {size} bytes exceeds limit of {limit}")]
    BlobTooLarge { size: u64, limit: u64 },

    /// No response arrived for an outstanding request before its deadline.
    #[error("request {0} timed out")]
    RequestTimeout(u32),

    /// Manifest JSON could not be produced or understood.
    #[error("manifest error: {0}")]
    ManifestParseError(String),

    /// A chunk was found neither locally nor on any reachable holder.
    #[error("chunk {0} unavailable")]
    ChunkUnavailable(String),

    /// The incoming or outgoing queue was torn down (shutdown).
    #[error("queue closed")]
    QueueClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
