//! Node configuration.
//!
//! All tunables live in [`Settings`] with the protocol's defaults; the
//! binary overrides the handful of user-facing options from the command
//! line. Constants that peers must agree on (wire sizes, AEAD geometry)
//! are deliberately `pub const` rather than settings.

use std::path::PathBuf;
use std::time::Duration;

/// Kademlia bucket capacity and the fan-out of closest-node queries.
pub const DEFAULT_K: usize = 20;

/// Parallelism of each iterative lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// STORE replication factor for content chunks.
pub const DEFAULT_REPLICATION: usize = 3;

/// PUT_VALUE replication factor for mutable records.
pub const DEFAULT_RECORD_REPLICATION: usize = 5;

/// Chunk size for file ingestion (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Capacity of the incoming and outgoing packet queues.
pub const QUEUE_CAPACITY: usize = 2000;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Transport listening port, handed to the transport collaborator.
    pub port: u16,
    /// When set, a signed handshake is queued to `127.0.0.1:seed_port`
    /// at startup.
    pub seed_port: Option<u16>,
    /// Enables the interactive shell collaborator.
    pub debug: bool,
    /// Base directory for blobs and key material.
    pub data_dir: PathBuf,

    pub chunk_size: usize,
    pub k: usize,
    pub alpha: usize,
    pub replication: usize,
    pub record_replication: usize,

    /// Maximum tolerated handshake clock skew.
    pub handshake_clock_skew_ms: u64,
    /// Largest payload the dispatcher accepts on any frame.
    pub max_payload_bytes: usize,
    /// Largest plaintext served in a FETCH response.
    pub fetch_max_payload_bytes: u64,

    pub find_node_timeout: Duration,
    pub fetch_timeout: Duration,
    pub get_value_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 0,
            seed_port: None,
            debug: false,
            data_dir: PathBuf::from("."),
            chunk_size: DEFAULT_CHUNK_SIZE,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            replication: DEFAULT_REPLICATION,
            record_replication: DEFAULT_RECORD_REPLICATION,
            handshake_clock_skew_ms: 60_000,
            max_payload_bytes: 5 * 1024 * 1024,
            fetch_max_payload_bytes: 10 * 1024 * 1024,
            find_node_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(5),
            get_value_timeout: Duration::from_secs(3),
        }
    }
}

impl Settings {
    /// Directory holding encrypted blob files.
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Path of the persisted Ed25519 identity seed.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    /// Hex digest of the currently published profile manifest.
    pub fn profile_head_path(&self) -> PathBuf {
        self.data_dir.join("profile_head.txt")
    }

    /// ASCII decimal of the current profile sequence number.
    pub fn profile_seq_path(&self) -> PathBuf {
        self.data_dir.join("profile_seq.txt")
    }
}
