//! # Node Identity
//!
//! Three pieces of key material define a node:
//!
//! - [`IdentityKeypair`]: long-lived Ed25519 keypair used only for signing
//!   (handshake bindings, mutable-record authorship). The 32-byte seed is
//!   persisted to disk on first run.
//! - [`OnionKeypair`]: X25519 keypair used to derive per-layer session keys.
//!   Fresh each node lifetime, so it is ephemeral from the network's view.
//! - [`NodeId`]: the 256-bit identifier peers route by, computed as
//!   SHA-256 of the onion public key. XOR distance over node ids drives all
//!   Kademlia routing decisions.
//!
//! A [`Contact`] pairs a node id with the endpoint it was last observed at.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as OnionPublicKey, StaticSecret};

use crate::crypto::sha256;
use crate::error::NodeError;

/// Current time as milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Node Id
// ============================================================================

/// 256-bit routing identifier.
///
/// Ordering is lexicographic over the raw bytes, which matches interpreting
/// the id as a big-endian 256-bit unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Identity of a peer as derived from its onion public key.
    pub fn from_onion_key(onion_key: &OnionPublicKey) -> Self {
        Self(sha256(onion_key.as_bytes()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bitwise XOR distance to `other`.
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(s).map_err(|_| NodeError::MalformedFrame("node id hex"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NodeError::MalformedFrame("node id length"))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Compare two XOR distances as 256-bit unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

// ============================================================================
// Identity keypair (Ed25519, persisted)
// ============================================================================

#[derive(Clone)]
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load the identity seed from `path`, generating and persisting a fresh
    /// one on first run.
    pub async fn load_or_generate(path: &Path) -> Result<Self, NodeError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| NodeError::MalformedFrame("identity key file length"))?;
                Ok(Self::from_seed(&seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                tokio::fs::write(path, keypair.seed()).await?;
                Ok(keypair)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Onion keypair (X25519, per lifetime)
// ============================================================================

pub struct OnionKeypair {
    secret: StaticSecret,
    public: OnionPublicKey,
}

impl OnionKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = OnionPublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> &OnionPublicKey {
        &self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Routing identity bound to this onion key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_onion_key(&self.public)
    }
}

impl std::fmt::Debug for OnionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Contact
// ============================================================================

/// A peer as known to the routing table: identity plus last observed endpoint.
#[derive(Clone, Debug)]
pub struct Contact {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(node_id: NodeId, endpoint: SocketAddr) -> Self {
        Self {
            node_id,
            endpoint,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}
