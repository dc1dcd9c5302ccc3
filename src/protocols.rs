//! Protocol trait for outbound DHT requests.
//!
//! The DHT service is generic over this seam so the lookup and publication
//! logic can be exercised against an in-memory network in tests, while the
//! production implementation ([`crate::dht::Messenger`]) frames real
//! packets, registers request ids in the ledger, and pushes to the
//! outgoing queue.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::NodeError;
use crate::identity::{Contact, NodeId};
use crate::record::MutableRecord;
use crate::store::Digest;

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ask `to` for its closest contacts to `target`.
    async fn find_node(&self, to: SocketAddr, target: NodeId) -> Result<Vec<Contact>, NodeError>;

    /// Hand `to` a blob to hold. Fire-and-forget: no response is awaited.
    async fn store(&self, to: SocketAddr, blob: Vec<u8>) -> Result<(), NodeError>;

    /// Fetch the blob stored under `digest` from `to`.
    async fn fetch(&self, to: SocketAddr, digest: Digest) -> Result<Vec<u8>, NodeError>;

    /// Offer `to` a signed mutable record. Fire-and-forget.
    async fn put_value(&self, to: SocketAddr, record: &MutableRecord) -> Result<(), NodeError>;

    /// Ask `to` for its record under `owner`; `None` when it holds none.
    async fn get_value(
        &self,
        to: SocketAddr,
        owner: [u8; 32],
    ) -> Result<Option<MutableRecord>, NodeError>;
}
