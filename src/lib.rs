//! # Haven - Decentralized Content-Hosting Node
//!
//! Haven hosts user content (messages, media, profile state) across an
//! untrusted overlay network. The crate is the protocol engine: it turns
//! wire bytes into verified, routed, stored state and back, while the
//! transport (QUIC), shell and profile tooling live outside as
//! collaborators attached through bounded queues.
//!
//! - **Identity**: a persisted Ed25519 signing key plus a per-lifetime
//!   X25519 onion key; the routing id is the SHA-256 of the onion key
//! - **Handshake**: signed binding of identity, onion key and timestamp
//! - **Onion**: nested ChaCha20-Poly1305 layers, one per hop, with
//!   per-layer session keys derived via X25519 + HKDF-SHA256
//! - **DHT**: Kademlia XOR-metric routing, iterative parallel lookup,
//!   signed mutable records for updatable pointers
//! - **Storage**: content-addressed blobs, AEAD-encrypted at rest,
//!   written atomically; files travel as 256 KiB chunks under a JSON
//!   manifest
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `dispatch` | Central packet dispatcher state machine |
//! | `dht` | DHT handlers, iterative lookup, record publication |
//! | `wire` | Frame header and payload codecs |
//! | `onion` | Layered encryption: peeling and building |
//! | `handshake` | Authenticated peer introduction |
//! | `store` | Encrypted content-addressed blob store |
//! | `files` | Chunking, manifests, reassembly |
//! | `record` | Signed sequence-numbered mutable records |
//! | `routing` | Kademlia k-bucket routing table |
//! | `peers` | Authenticated peer registry |
//! | `ledger` | Request/response correlation with timeouts |
//! | `buffer` | Shared byte-buffer pool |
//! | `packet` | Queue element types for the transport boundary |
//!
//! ## Concurrency Model
//!
//! One dispatcher task consumes the incoming queue strictly sequentially,
//! preserving per-source order. DHT lookups fan out in parallel tasks and
//! are the only ledger-tracked requesters. Shared state (peer table,
//! routing table, ledger, record store) is guarded by short-lived locks;
//! the blob store needs none because content-addressed rename is the
//! synchronization.

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod handshake;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod onion;
pub mod packet;
pub mod peers;
pub mod protocols;
pub mod record;
pub mod routing;
pub mod store;
pub mod wire;

pub use buffer::BufferPool;
pub use config::Settings;
pub use dispatch::TerminalMessage;
pub use error::NodeError;
pub use identity::{Contact, IdentityKeypair, NodeId, OnionKeypair};
pub use node::Node;
pub use onion::Hop;
pub use record::MutableRecord;
