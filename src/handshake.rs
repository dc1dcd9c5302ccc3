//! # Handshake
//!
//! The authenticated introduction between peers. A handshake payload binds
//! a peer's long-lived Ed25519 identity to its current X25519 onion key
//! and a wall-clock timestamp:
//!
//! `identity_key(32) | onion_key(32) | timestamp_ms(8 BE) | signature(64)`
//!
//! The signature covers the 72-byte prefix and is produced by the identity
//! key, so nobody can advertise an onion key on someone else's behalf. A
//! valid handshake has no reply; its observable effect is the peer-table
//! entry and a routing-table contact for the sender.

use std::net::SocketAddr;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;
use x25519_dalek::PublicKey as OnionPublicKey;

use crate::error::NodeError;
use crate::identity::{now_ms, Contact, IdentityKeypair, NodeId};
use crate::peers::PeerTable;
use crate::routing::RoutingTable;

pub const HANDSHAKE_LEN: usize = 136;
/// Bytes covered by the signature: identity key, onion key, timestamp.
pub const SIGNED_PREFIX_LEN: usize = 72;

#[derive(Clone, Debug)]
pub struct HandshakePayload {
    pub identity_key: VerifyingKey,
    pub onion_key: OnionPublicKey,
    pub timestamp_ms: u64,
    pub signature: Signature,
}

impl HandshakePayload {
    /// Build and sign a handshake for this node at the current time.
    pub fn build(identity: &IdentityKeypair, onion_key: &OnionPublicKey) -> Self {
        Self::build_at(identity, onion_key, now_ms())
    }

    pub fn build_at(
        identity: &IdentityKeypair,
        onion_key: &OnionPublicKey,
        timestamp_ms: u64,
    ) -> Self {
        let mut prefix = [0u8; SIGNED_PREFIX_LEN];
        prefix[0..32].copy_from_slice(&identity.public_key_bytes());
        prefix[32..64].copy_from_slice(onion_key.as_bytes());
        prefix[64..72].copy_from_slice(&timestamp_ms.to_be_bytes());

        Self {
            identity_key: identity.public_key(),
            onion_key: *onion_key,
            timestamp_ms,
            signature: identity.sign(&prefix),
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0..32].copy_from_slice(self.identity_key.as_bytes());
        bytes[32..64].copy_from_slice(self.onion_key.as_bytes());
        bytes[64..72].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        bytes[72..136].copy_from_slice(&self.signature.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(NodeError::MalformedFrame("handshake payload length"));
        }
        let identity_key =
            VerifyingKey::from_bytes(bytes[0..32].try_into().expect("32-byte slice"))
                .map_err(|_| NodeError::MalformedFrame("handshake identity key"))?;
        let onion_bytes: [u8; 32] = bytes[32..64].try_into().expect("32-byte slice");
        let timestamp_ms = u64::from_be_bytes(bytes[64..72].try_into().expect("8-byte slice"));
        let signature = Signature::from_bytes(bytes[72..136].try_into().expect("64-byte slice"));

        Ok(Self {
            identity_key,
            onion_key: OnionPublicKey::from(onion_bytes),
            timestamp_ms,
            signature,
        })
    }

    /// Verify the signature over the signed prefix.
    pub fn verify(&self) -> Result<(), NodeError> {
        let bytes = self.to_bytes();
        self.identity_key
            .verify(&bytes[..SIGNED_PREFIX_LEN], &self.signature)
            .map_err(|_| NodeError::InvalidSignature)
    }
}

/// Validate an inbound handshake and register the sender.
///
/// Rejects timestamps further than `max_skew_ms` from local wall clock,
/// then checks the signature. On success the origin endpoint becomes an
/// authenticated peer and enters the routing table under the node id
/// derived from its onion key.
pub fn handle_handshake(
    peers: &PeerTable,
    routing: &RoutingTable,
    origin: SocketAddr,
    payload: &[u8],
    max_skew_ms: u64,
) -> Result<(), NodeError> {
    let handshake = HandshakePayload::from_bytes(payload)?;

    let now = now_ms();
    let skew = now.abs_diff(handshake.timestamp_ms);
    if skew > max_skew_ms {
        return Err(NodeError::StaleHandshake { skew_ms: skew });
    }

    handshake.verify()?;

    peers.register_handshake(origin, handshake.identity_key, handshake.onion_key);
    routing.add_contact(Contact::new(
        NodeId::from_onion_key(&handshake.onion_key),
        origin,
    ));

    debug!(
        peer = %origin,
        identity = %hex::encode(&handshake.identity_key.to_bytes()[..8]),
        "peer authenticated"
    );
    Ok(())
}
