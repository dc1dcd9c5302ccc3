//! # Onion Transport
//!
//! Source-routed layered encryption. The client wraps a message once per
//! hop, innermost first; every hop strips exactly one layer and learns
//! only the next endpoint, never the origin or final destination.
//!
//! On the wire an onion payload is:
//!
//! `sender_ephemeral(32) | nonce(12) | ciphertext | tag(16)`
//!
//! Each layer's plaintext starts with a command byte: `0x00` means the
//! rest is the delivered message (terminal), `0x01` means a relay header
//! `ip_len(1) | ip | port(2 BE)` followed by the next encrypted layer.
//!
//! One client ephemeral key serves every layer; a relaying node prepends
//! the ephemeral it observed on the incoming packet to the forwarded
//! payload, so the next hop can run the same key agreement. Session keys
//! are derived per layer and dropped as soon as the layer is processed.

use std::net::SocketAddr;

use x25519_dalek::{PublicKey as OnionPublicKey, StaticSecret};

use crate::crypto::{self, AEAD_OVERHEAD};
use crate::error::NodeError;
use crate::wire::{decode_endpoint, encode_endpoint};

/// Ephemeral key prefix plus one AEAD record: the smallest possible onion.
pub const MIN_ONION_PAYLOAD: usize = 32 + AEAD_OVERHEAD;

const CMD_TERMINAL: u8 = 0x00;
const CMD_RELAY: u8 = 0x01;

/// One hop of a source route.
#[derive(Clone, Debug)]
pub struct Hop {
    pub endpoint: SocketAddr,
    pub onion_key: OnionPublicKey,
}

/// Result of stripping one layer at this node.
#[derive(Debug)]
pub enum PeeledLayer {
    /// This node is the destination; the delivered message follows.
    Terminal(Vec<u8>),
    /// Forward `payload` (already carrying the ephemeral prefix) to
    /// `next_hop` as a fresh onion frame.
    Relay {
        next_hop: SocketAddr,
        payload: Vec<u8>,
    },
}

/// Strip one onion layer with this node's onion secret.
pub fn peel(onion_secret: &StaticSecret, payload: &[u8]) -> Result<PeeledLayer, NodeError> {
    if payload.len() < MIN_ONION_PAYLOAD {
        return Err(NodeError::MalformedOnion("payload below minimum size"));
    }

    let ephemeral_bytes: [u8; 32] = payload[..32].try_into().expect("32-byte slice");
    let ephemeral = OnionPublicKey::from(ephemeral_bytes);
    let layer = &payload[32..];

    let session_key = crypto::derive_session_key(&onion_secret.diffie_hellman(&ephemeral));
    let plaintext = crypto::open(&session_key, layer)?;

    match plaintext.split_first() {
        Some((&CMD_TERMINAL, message)) => Ok(PeeledLayer::Terminal(message.to_vec())),
        Some((&CMD_RELAY, rest)) => {
            let (next_hop, consumed) = decode_endpoint(rest)
                .map_err(|_| NodeError::MalformedOnion("relay header truncated"))?;
            let inner = &rest[consumed..];
            if inner.len() < AEAD_OVERHEAD {
                return Err(NodeError::MalformedOnion("inner layer below minimum size"));
            }

            // The next hop needs the same ephemeral to derive its key.
            let mut forwarded = Vec::with_capacity(32 + inner.len());
            forwarded.extend_from_slice(&ephemeral_bytes);
            forwarded.extend_from_slice(inner);
            Ok(PeeledLayer::Relay {
                next_hop,
                payload: forwarded,
            })
        }
        _ => Err(NodeError::MalformedOnion("unknown layer command")),
    }
}

/// Wrap `message` for a route, innermost layer first.
///
/// Returns the outermost encrypted layer without the ephemeral prefix;
/// [`build_onion_payload`] produces the complete frame payload.
pub fn build_onion(
    message: &[u8],
    hops: &[Hop],
    client_secret: &StaticSecret,
) -> Result<Vec<u8>, NodeError> {
    if hops.is_empty() {
        return Err(NodeError::MalformedOnion("empty route"));
    }

    let mut current = Vec::with_capacity(1 + message.len());
    current.push(CMD_TERMINAL);
    current.extend_from_slice(message);

    for (i, hop) in hops.iter().enumerate().rev() {
        let content = if i == hops.len() - 1 {
            current
        } else {
            // Intermediate layer: tell this hop where to forward the rest.
            let next = &hops[i + 1];
            let mut relay = Vec::with_capacity(1 + 1 + 16 + 2 + current.len());
            relay.push(CMD_RELAY);
            encode_endpoint(&next.endpoint, &mut relay);
            relay.extend_from_slice(&current);
            relay
        };

        let session_key =
            crypto::derive_session_key(&client_secret.diffie_hellman(&hop.onion_key));
        current = crypto::seal(&session_key, &content)?;
    }

    Ok(current)
}

/// The complete onion frame payload: `client_ephemeral(32) || layers`.
pub fn build_onion_payload(
    message: &[u8],
    hops: &[Hop],
    client_secret: &StaticSecret,
) -> Result<Vec<u8>, NodeError> {
    let layers = build_onion(message, hops, client_secret)?;
    let client_public = OnionPublicKey::from(client_secret);

    let mut payload = Vec::with_capacity(32 + layers.len());
    payload.extend_from_slice(client_public.as_bytes());
    payload.extend_from_slice(&layers);
    Ok(payload)
}
