//! # Peer Table
//!
//! Registry of remote endpoints, keyed by socket address. An entry only
//! carries key material once the peer has completed a valid signed
//! handshake; everything else in the node treats key-less entries as
//! unauthenticated traffic sources.
//!
//! Reputation starts at 50 on the first successful handshake and currently
//! never decays.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Instant;

use ed25519_dalek::VerifyingKey;
use x25519_dalek::PublicKey as OnionPublicKey;

use crate::identity::{Contact, NodeId};

/// Initial reputation granted by a valid handshake.
pub const INITIAL_REPUTATION: u8 = 50;

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub last_seen: Instant,
    /// 0-100.
    pub reputation: u8,
    pub onion_key: Option<OnionPublicKey>,
    pub identity_key: Option<VerifyingKey>,
}

impl PeerInfo {
    fn unauthenticated() -> Self {
        Self {
            last_seen: Instant::now(),
            reputation: 0,
            onion_key: None,
            identity_key: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.onion_key.is_some() && self.identity_key.is_some()
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    inner: RwLock<HashMap<SocketAddr, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from `endpoint`, creating an unauthenticated entry if
    /// none exists.
    pub fn observe(&self, endpoint: SocketAddr) {
        let mut table = self.inner.write().expect("peer table lock poisoned");
        table
            .entry(endpoint)
            .and_modify(|info| info.last_seen = Instant::now())
            .or_insert_with(PeerInfo::unauthenticated);
    }

    /// Upsert after a valid handshake: attach the asserted keys, grant the
    /// initial reputation to first-time peers, refresh `last_seen`.
    pub fn register_handshake(
        &self,
        endpoint: SocketAddr,
        identity_key: VerifyingKey,
        onion_key: OnionPublicKey,
    ) {
        let mut table = self.inner.write().expect("peer table lock poisoned");
        let info = table.entry(endpoint).or_insert_with(PeerInfo::unauthenticated);
        if info.reputation == 0 {
            info.reputation = INITIAL_REPUTATION;
        }
        info.identity_key = Some(identity_key);
        info.onion_key = Some(onion_key);
        info.last_seen = Instant::now();
    }

    /// Onion key of an authenticated peer, if any.
    pub fn peer_onion_key(&self, endpoint: &SocketAddr) -> Option<OnionPublicKey> {
        let table = self.inner.read().expect("peer table lock poisoned");
        table.get(endpoint).and_then(|info| info.onion_key)
    }

    pub fn is_authenticated(&self, endpoint: &SocketAddr) -> bool {
        let table = self.inner.read().expect("peer table lock poisoned");
        table
            .get(endpoint)
            .map(PeerInfo::is_authenticated)
            .unwrap_or(false)
    }

    /// Routing contact for an authenticated peer. The node id is derived
    /// from the handshaken onion key.
    pub fn contact_for(&self, endpoint: &SocketAddr) -> Option<Contact> {
        let onion_key = self.peer_onion_key(endpoint)?;
        Some(Contact::new(NodeId::from_onion_key(&onion_key), *endpoint))
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<PeerInfo> {
        let table = self.inner.read().expect("peer table lock poisoned");
        table.get(endpoint).cloned()
    }

    pub fn len(&self) -> usize {
        let table = self.inner.read().expect("peer table lock poisoned");
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
