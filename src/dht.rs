//! # DHT Service
//!
//! The Kademlia machinery on both sides of the wire:
//!
//! - **Inbound**: handlers for FIND_NODE, STORE, FETCH, PUT_VALUE and
//!   GET_VALUE frames, invoked by the dispatcher. Replies are framed into
//!   rented buffers and pushed onto the outgoing queue.
//! - **Outbound**: the iterative lookup, blob replication, record
//!   publication and bootstrap, built on the [`DhtRpc`] seam. The
//!   production implementation, [`Messenger`], correlates requests and
//!   responses through the request ledger; this service is the only
//!   component issuing ledger-tracked requests.
//!
//! Per-peer failures never fail a lookup: a candidate that times out or
//! returns garbage is simply not queried again. Fire-and-forget sends
//! (STORE replication, PUT_VALUE) carry request id 0 and never touch the
//! ledger.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::config::Settings;
use crate::crypto::sha256;
use crate::error::NodeError;
use crate::identity::{distance_cmp, Contact, NodeId};
use crate::ledger::RequestLedger;
use crate::packet::{OutboundMessage, OutboundSender};
use crate::peers::PeerTable;
use crate::protocols::DhtRpc;
use crate::record::{MutableRecord, RecordStore};
use crate::routing::RoutingTable;
use crate::store::{BlobStore, Digest};
use crate::wire::{decode_contacts, encode_contacts, MessageType};

/// Upper bound on lookup rounds, against pathological shortlists.
const MAX_LOOKUP_ROUNDS: usize = 20;

// ============================================================================
// Messenger: ledger-backed DhtRpc over the outgoing queue
// ============================================================================

#[derive(Clone)]
pub struct Messenger {
    outbound: OutboundSender,
    ledger: Arc<RequestLedger>,
    pool: BufferPool,
    find_node_timeout: Duration,
    fetch_timeout: Duration,
    get_value_timeout: Duration,
}

impl Messenger {
    pub fn new(
        outbound: OutboundSender,
        ledger: Arc<RequestLedger>,
        pool: BufferPool,
        settings: &Settings,
    ) -> Self {
        Self {
            outbound,
            ledger,
            pool,
            find_node_timeout: settings.find_node_timeout,
            fetch_timeout: settings.fetch_timeout,
            get_value_timeout: settings.get_value_timeout,
        }
    }

    /// Send a request frame and await its correlated response.
    async fn request(
        &self,
        to: SocketAddr,
        message_type: MessageType,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<crate::packet::ResponseFrame, NodeError> {
        let (id, rx) = self.ledger.register();
        let msg = OutboundMessage::frame(&self.pool, to, message_type, id, payload);
        if self.outbound.send(msg).await.is_err() {
            self.ledger.forget(id);
            return Err(NodeError::QueueClosed);
        }
        self.ledger.wait(id, rx, timeout).await
    }

    /// Send a frame with the reserved request id 0: no response expected.
    async fn fire_and_forget(
        &self,
        to: SocketAddr,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), NodeError> {
        let msg = OutboundMessage::frame(&self.pool, to, message_type, 0, payload);
        self.outbound
            .send(msg)
            .await
            .map_err(|_| NodeError::QueueClosed)
    }
}

#[async_trait]
impl DhtRpc for Messenger {
    async fn find_node(&self, to: SocketAddr, target: NodeId) -> Result<Vec<Contact>, NodeError> {
        let response = self
            .request(
                to,
                MessageType::FindNode,
                target.as_bytes(),
                self.find_node_timeout,
            )
            .await?;
        match response.message_type {
            MessageType::FindNodeRes => decode_contacts(&response.payload),
            _ => Err(NodeError::MalformedFrame("unexpected response type")),
        }
    }

    async fn store(&self, to: SocketAddr, blob: Vec<u8>) -> Result<(), NodeError> {
        self.fire_and_forget(to, MessageType::Store, &blob).await
    }

    async fn fetch(&self, to: SocketAddr, digest: Digest) -> Result<Vec<u8>, NodeError> {
        let response = self
            .request(to, MessageType::Fetch, &digest, self.fetch_timeout)
            .await?;
        match response.message_type {
            MessageType::FetchRes => Ok(response.payload),
            MessageType::FetchMiss => Err(NodeError::BlobNotFound(hex::encode(digest))),
            _ => Err(NodeError::MalformedFrame("unexpected response type")),
        }
    }

    async fn put_value(&self, to: SocketAddr, record: &MutableRecord) -> Result<(), NodeError> {
        self.fire_and_forget(to, MessageType::PutValue, &record.to_bytes())
            .await
    }

    async fn get_value(
        &self,
        to: SocketAddr,
        owner: [u8; 32],
    ) -> Result<Option<MutableRecord>, NodeError> {
        let response = self
            .request(to, MessageType::GetValue, &owner, self.get_value_timeout)
            .await?;
        match response.message_type {
            MessageType::GetValueRes if response.payload.is_empty() => Ok(None),
            MessageType::GetValueRes => Ok(Some(MutableRecord::decode(&response.payload)?)),
            _ => Err(NodeError::MalformedFrame("unexpected response type")),
        }
    }
}

// ============================================================================
// DHT service
// ============================================================================

pub struct DhtService<N: DhtRpc> {
    node_id: NodeId,
    k: usize,
    alpha: usize,
    replication: usize,
    record_replication: usize,
    fetch_max_bytes: u64,
    per_query_timeout: Duration,
    get_value_timeout: Duration,
    routing: Arc<RoutingTable>,
    peers: Arc<PeerTable>,
    store: Arc<BlobStore>,
    records: Arc<RecordStore>,
    rpc: N,
}

impl<N: DhtRpc + Clone> Clone for DhtService<N> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            k: self.k,
            alpha: self.alpha,
            replication: self.replication,
            record_replication: self.record_replication,
            fetch_max_bytes: self.fetch_max_bytes,
            per_query_timeout: self.per_query_timeout,
            get_value_timeout: self.get_value_timeout,
            routing: self.routing.clone(),
            peers: self.peers.clone(),
            store: self.store.clone(),
            records: self.records.clone(),
            rpc: self.rpc.clone(),
        }
    }
}

impl<N: DhtRpc + Clone> DhtService<N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        settings: &Settings,
        routing: Arc<RoutingTable>,
        peers: Arc<PeerTable>,
        store: Arc<BlobStore>,
        records: Arc<RecordStore>,
        rpc: N,
    ) -> Self {
        Self {
            node_id,
            k: settings.k,
            alpha: settings.alpha,
            replication: settings.replication,
            record_replication: settings.record_replication,
            fetch_max_bytes: settings.fetch_max_payload_bytes,
            per_query_timeout: settings.find_node_timeout,
            get_value_timeout: settings.get_value_timeout,
            routing,
            peers,
            store,
            records,
            rpc,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn rpc(&self) -> &N {
        &self.rpc
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    /// FIND_NODE: observe the (authenticated) origin, reply with the `k`
    /// closest contacts to the requested target.
    pub async fn handle_find_node(
        &self,
        origin: SocketAddr,
        request_id: u32,
        payload: &[u8],
        outbound: &OutboundSender,
        pool: &BufferPool,
    ) -> Result<(), NodeError> {
        let target = parse_node_id(payload)?;

        if let Some(contact) = self.peers.contact_for(&origin) {
            self.routing.add_contact(contact);
        }

        let closest = self.routing.find_closest(&target, self.k);
        let mut body = Vec::new();
        encode_contacts(&closest, &mut body);

        let msg = OutboundMessage::frame(pool, origin, MessageType::FindNodeRes, request_id, &body);
        outbound.send(msg).await.map_err(|_| NodeError::QueueClosed)
    }

    /// STORE: persist the payload as a blob, answer with its digest.
    pub async fn handle_store(
        &self,
        origin: SocketAddr,
        request_id: u32,
        payload: &[u8],
        outbound: &OutboundSender,
        pool: &BufferPool,
    ) -> Result<(), NodeError> {
        let digest = self.store.store(payload).await?;
        trace!(
            peer = %origin,
            digest = %hex::encode(&digest[..8]),
            size = payload.len(),
            "blob stored for peer"
        );

        let msg = OutboundMessage::frame(pool, origin, MessageType::StoreRes, request_id, &digest);
        outbound.send(msg).await.map_err(|_| NodeError::QueueClosed)
    }

    /// FETCH: serve the blob if held and within the size cap, otherwise a
    /// negative response naming the digest.
    pub async fn handle_fetch(
        &self,
        origin: SocketAddr,
        request_id: u32,
        payload: &[u8],
        outbound: &OutboundSender,
        pool: &BufferPool,
    ) -> Result<(), NodeError> {
        let digest = parse_digest(payload)?;

        if let Some(size) = self.store.blob_size(&digest).await {
            if size > self.fetch_max_bytes {
                return Err(NodeError::BlobTooLarge {
                    size,
                    limit: self.fetch_max_bytes,
                });
            }
            if let Some(plaintext) = self.store.retrieve_bytes(&digest).await {
                let msg = OutboundMessage::frame(
                    pool,
                    origin,
                    MessageType::FetchRes,
                    request_id,
                    &plaintext,
                );
                return outbound.send(msg).await.map_err(|_| NodeError::QueueClosed);
            }
        }

        let msg = OutboundMessage::frame(pool, origin, MessageType::FetchMiss, request_id, &digest);
        outbound.send(msg).await.map_err(|_| NodeError::QueueClosed)
    }

    /// PUT_VALUE: verify and keep the record if it advances the owner's
    /// sequence; anything else is dropped silently.
    pub fn handle_put_value(&self, origin: SocketAddr, payload: &[u8]) -> Result<(), NodeError> {
        let record = MutableRecord::decode(payload)?;
        if !self.records.insert(record) {
            trace!(peer = %origin, "put_value rejected (signature or sequence)");
        }
        Ok(())
    }

    /// GET_VALUE: reply with the held record for the owner, or an empty
    /// payload when none is held.
    pub async fn handle_get_value(
        &self,
        origin: SocketAddr,
        request_id: u32,
        payload: &[u8],
        outbound: &OutboundSender,
        pool: &BufferPool,
    ) -> Result<(), NodeError> {
        let owner = parse_digest(payload)?;
        let body = match self.records.get(&owner) {
            Some(record) => record.to_bytes(),
            None => Vec::new(),
        };
        let msg = OutboundMessage::frame(pool, origin, MessageType::GetValueRes, request_id, &body);
        outbound.send(msg).await.map_err(|_| NodeError::QueueClosed)
    }

    // ------------------------------------------------------------------
    // Iterative lookup and its clients
    // ------------------------------------------------------------------

    /// Iterative parallel lookup of the `k` closest contacts to `target`.
    ///
    /// Each round queries the `alpha` closest unvisited candidates in
    /// parallel, absorbs their answers into the shortlist, and stops when
    /// a round discovers nothing new or every candidate has been visited.
    pub async fn lookup(&self, target: NodeId) -> Vec<Contact> {
        let mut shortlist = self.routing.find_closest(&target, self.k);
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.node_id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();

        for _round in 0..MAX_LOOKUP_ROUNDS {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.node_id);
            }

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let rpc = self.rpc.clone();
                let timeout = self.per_query_timeout;
                join_set.spawn(async move {
                    let result =
                        tokio::time::timeout(timeout, rpc.find_node(contact.endpoint, target))
                            .await
                            .unwrap_or_else(|_| Err(NodeError::RequestTimeout(0)));
                    (contact, result)
                });
            }

            let mut discovered = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(contacts) => {
                        // The responder answered us directly; keep it routable.
                        self.routing.add_contact(contact.clone());
                        for found in contacts {
                            if found.node_id == self.node_id {
                                continue;
                            }
                            if seen.insert(found.node_id) {
                                shortlist.push(found);
                                discovered = true;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(peer = %contact.endpoint, error = %e, "lookup query failed");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.node_id.xor_distance(&target);
                let db = b.node_id.xor_distance(&target);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(self.k);

            if !discovered {
                break;
            }
        }

        shortlist
    }

    /// Populate the routing table by looking up our own id. Requires at
    /// least one externally injected contact.
    pub async fn bootstrap(&self) -> Vec<Contact> {
        let found = self.lookup(self.node_id).await;
        debug!(contacts = found.len(), "bootstrap lookup finished");
        found
    }

    /// Push a blob to the nodes closest to its digest. Fire-and-forget;
    /// individual failures are absorbed.
    pub async fn replicate_blob(&self, digest: &Digest, blob: &[u8]) {
        let target = NodeId::from_bytes(*digest);
        let holders = self.lookup(target).await;
        for contact in holders.iter().take(self.replication) {
            if let Err(e) = self.rpc.store(contact.endpoint, blob.to_vec()).await {
                debug!(peer = %contact.endpoint, error = %e, "store replication failed");
            }
        }
    }

    /// Publish a signed record to the nodes closest to its owner's key.
    pub async fn publish_record(&self, record: &MutableRecord) {
        let target = NodeId::from_bytes(sha256(&record.owner));
        let holders = self.lookup(target).await;
        for contact in holders.iter().take(self.record_replication) {
            if let Err(e) = self.rpc.put_value(contact.endpoint, record).await {
                debug!(peer = %contact.endpoint, error = %e, "record publication failed");
            }
        }
    }

    /// Resolve the freshest record for `owner`: query each candidate
    /// holder in turn and keep the highest validly-signed sequence.
    pub async fn resolve_record(&self, owner: &[u8; 32]) -> Option<MutableRecord> {
        let target = NodeId::from_bytes(sha256(owner));
        let holders = self.lookup(target).await;

        let mut best: Option<MutableRecord> = None;
        for contact in &holders {
            let result =
                tokio::time::timeout(self.get_value_timeout, self.rpc.get_value(contact.endpoint, *owner))
                    .await
                    .unwrap_or_else(|_| Err(NodeError::RequestTimeout(0)));
            match result {
                Ok(Some(record)) => {
                    if record.owner != *owner || !record.verify() {
                        warn!(peer = %contact.endpoint, "discarding invalid record from holder");
                        continue;
                    }
                    if best.as_ref().map_or(true, |b| record.sequence > b.sequence) {
                        best = Some(record);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(peer = %contact.endpoint, error = %e, "get_value failed");
                }
            }
        }
        best
    }

    /// Retrieve a blob from the network by walking the nodes closest to
    /// its digest. The plaintext is checked against the digest before it
    /// is accepted.
    pub async fn fetch_blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        let target = NodeId::from_bytes(*digest);
        let holders = self.lookup(target).await;

        for contact in &holders {
            match self.rpc.fetch(contact.endpoint, *digest).await {
                Ok(blob) => {
                    if sha256(&blob) != *digest {
                        warn!(peer = %contact.endpoint, "fetched blob fails digest check");
                        continue;
                    }
                    return Some(blob);
                }
                Err(e) => {
                    debug!(peer = %contact.endpoint, error = %e, "fetch failed");
                }
            }
        }
        None
    }
}

fn parse_node_id(payload: &[u8]) -> Result<NodeId, NodeError> {
    let bytes: [u8; 32] = payload
        .try_into()
        .map_err(|_| NodeError::MalformedFrame("expected 32-byte id"))?;
    Ok(NodeId::from_bytes(bytes))
}

fn parse_digest(payload: &[u8]) -> Result<[u8; 32], NodeError> {
    payload
        .try_into()
        .map_err(|_| NodeError::MalformedFrame("expected 32-byte digest"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricKey;
    use crate::identity::IdentityKeypair;
    use crate::packet::outgoing_queue;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn nid(bytes: [u8; 32]) -> NodeId {
        NodeId::from_bytes(bytes)
    }

    /// In-memory network: each simulated endpoint answers FIND_NODE with a
    /// fixed contact list and records every call.
    #[derive(Clone, Default)]
    struct MockNet {
        neighbors: Arc<Mutex<HashMap<SocketAddr, Vec<Contact>>>>,
        records: Arc<Mutex<HashMap<SocketAddr, MutableRecord>>>,
        blobs: Arc<Mutex<HashMap<SocketAddr, Vec<(Digest, Vec<u8>)>>>>,
        failing: Arc<Mutex<HashSet<SocketAddr>>>,
    }

    impl MockNet {
        fn add_node(&self, endpoint: SocketAddr, neighbors: Vec<Contact>) {
            self.neighbors
                .lock()
                .expect("lock")
                .insert(endpoint, neighbors);
        }

        fn fail(&self, endpoint: SocketAddr) {
            self.failing.lock().expect("lock").insert(endpoint);
        }
    }

    #[async_trait]
    impl DhtRpc for MockNet {
        async fn find_node(
            &self,
            to: SocketAddr,
            _target: NodeId,
        ) -> Result<Vec<Contact>, NodeError> {
            if self.failing.lock().expect("lock").contains(&to) {
                return Err(NodeError::RequestTimeout(0));
            }
            self.neighbors
                .lock()
                .expect("lock")
                .get(&to)
                .cloned()
                .ok_or(NodeError::RequestTimeout(0))
        }

        async fn store(&self, to: SocketAddr, blob: Vec<u8>) -> Result<(), NodeError> {
            let digest = sha256(&blob);
            self.blobs
                .lock()
                .expect("lock")
                .entry(to)
                .or_default()
                .push((digest, blob));
            Ok(())
        }

        async fn fetch(&self, to: SocketAddr, digest: Digest) -> Result<Vec<u8>, NodeError> {
            self.blobs
                .lock()
                .expect("lock")
                .get(&to)
                .and_then(|held| {
                    held.iter()
                        .find(|(d, _)| *d == digest)
                        .map(|(_, b)| b.clone())
                })
                .ok_or_else(|| NodeError::BlobNotFound(hex::encode(digest)))
        }

        async fn put_value(
            &self,
            to: SocketAddr,
            record: &MutableRecord,
        ) -> Result<(), NodeError> {
            self.records
                .lock()
                .expect("lock")
                .insert(to, record.clone());
            Ok(())
        }

        async fn get_value(
            &self,
            to: SocketAddr,
            owner: [u8; 32],
        ) -> Result<Option<MutableRecord>, NodeError> {
            Ok(self
                .records
                .lock()
                .expect("lock")
                .get(&to)
                .filter(|r| r.owner == owner)
                .cloned())
        }
    }

    async fn service(self_id: NodeId, net: MockNet, dir: &std::path::Path) -> DhtService<MockNet> {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let store = BlobStore::open(dir.join("blobs"), SymmetricKey::from_bytes(key))
            .await
            .expect("open store");
        let settings = Settings {
            find_node_timeout: Duration::from_millis(200),
            get_value_timeout: Duration::from_millis(200),
            ..Settings::default()
        };
        DhtService::new(
            self_id,
            &settings,
            Arc::new(RoutingTable::new(self_id, settings.k)),
            Arc::new(PeerTable::new()),
            Arc::new(store),
            Arc::new(RecordStore::new()),
            net,
        )
    }

    fn id_near(target: &NodeId, differing_byte: usize) -> NodeId {
        let mut bytes = *target.as_bytes();
        bytes[differing_byte] ^= 0x01;
        nid(bytes)
    }

    #[tokio::test]
    async fn lookup_walks_toward_the_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = nid([0xAB; 32]);

        // far -> mid -> near: each hop knows the next, closer one.
        let far = Contact::new(id_near(&target, 0), ep(9001));
        let mid = Contact::new(id_near(&target, 16), ep(9002));
        let near = Contact::new(id_near(&target, 31), ep(9003));

        let net = MockNet::default();
        net.add_node(far.endpoint, vec![mid.clone()]);
        net.add_node(mid.endpoint, vec![near.clone()]);
        net.add_node(near.endpoint, vec![]);

        let svc = service(nid([0x01; 32]), net, tmp.path()).await;
        svc.routing.add_contact(far.clone());

        let found = svc.lookup(target).await;
        let ids: Vec<NodeId> = found.iter().map(|c| c.node_id).collect();
        assert!(ids.contains(&near.node_id), "lookup must reach the closest node");
        assert_eq!(found[0].node_id, near.node_id, "results sorted by distance");

        // Responders entered the routing table.
        assert!(svc.routing.contains(&far.node_id));
        assert!(svc.routing.contains(&mid.node_id));
    }

    #[tokio::test]
    async fn lookup_survives_failing_peers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = nid([0x42; 32]);

        let good = Contact::new(id_near(&target, 30), ep(9101));
        let bad = Contact::new(id_near(&target, 1), ep(9102));

        let net = MockNet::default();
        net.add_node(good.endpoint, vec![]);
        net.fail(bad.endpoint);

        let svc = service(nid([0x01; 32]), net, tmp.path()).await;
        svc.routing.add_contact(good.clone());
        svc.routing.add_contact(bad.clone());

        let found = svc.lookup(target).await;
        assert!(found.iter().any(|c| c.node_id == good.node_id));
    }

    #[tokio::test]
    async fn find_node_handler_replies_with_closest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = service(nid([0x01; 32]), MockNet::default(), tmp.path()).await;

        let known = Contact::new(nid([0x77; 32]), ep(12_345));
        svc.routing.add_contact(known.clone());

        let (out_tx, mut out_rx) = outgoing_queue();
        let pool = BufferPool::default();
        let origin = ep(40_000);

        svc.handle_find_node(origin, 9, known.node_id.as_bytes(), &out_tx, &pool)
            .await
            .expect("handled");

        let reply = out_rx.try_recv().expect("reply queued");
        assert_eq!(reply.target, origin);
        let header = reply.header().expect("header");
        assert_eq!(header.message_type, MessageType::FindNodeRes);
        assert_eq!(header.request_id, 9);

        let contacts = decode_contacts(reply.payload()).expect("contacts");
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].node_id, known.node_id);
    }

    #[tokio::test]
    async fn store_and_fetch_handlers_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = service(nid([0x01; 32]), MockNet::default(), tmp.path()).await;
        let (out_tx, mut out_rx) = outgoing_queue();
        let pool = BufferPool::default();
        let origin = ep(41_000);

        svc.handle_store(origin, 3, b"replicated chunk", &out_tx, &pool)
            .await
            .expect("stored");
        let reply = out_rx.try_recv().expect("store reply");
        assert_eq!(reply.header().expect("header").message_type, MessageType::StoreRes);
        let digest: Digest = reply.payload().try_into().expect("32-byte digest");
        assert_eq!(digest, sha256(b"replicated chunk"));

        svc.handle_fetch(origin, 4, &digest, &out_tx, &pool)
            .await
            .expect("fetched");
        let reply = out_rx.try_recv().expect("fetch reply");
        assert_eq!(reply.header().expect("header").message_type, MessageType::FetchRes);
        assert_eq!(reply.payload(), b"replicated chunk");
    }

    #[tokio::test]
    async fn fetch_of_unknown_digest_is_a_miss() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = service(nid([0x01; 32]), MockNet::default(), tmp.path()).await;
        let (out_tx, mut out_rx) = outgoing_queue();
        let pool = BufferPool::default();

        let missing = sha256(b"never stored");
        svc.handle_fetch(ep(41_001), 5, &missing, &out_tx, &pool)
            .await
            .expect("handled");

        let reply = out_rx.try_recv().expect("miss reply");
        let header = reply.header().expect("header");
        assert_eq!(header.message_type, MessageType::FetchMiss);
        assert_eq!(reply.payload(), missing.as_slice());
    }

    #[tokio::test]
    async fn value_handlers_keep_highest_sequence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = service(nid([0x01; 32]), MockNet::default(), tmp.path()).await;
        let (out_tx, mut out_rx) = outgoing_queue();
        let pool = BufferPool::default();
        let origin = ep(42_000);

        let owner = IdentityKeypair::generate();
        let v1 = MutableRecord::sign(&owner, 1, b"head-1".to_vec());
        let v2 = MutableRecord::sign(&owner, 2, b"head-2".to_vec());

        svc.handle_put_value(origin, &v2.to_bytes()).expect("accepted");
        svc.handle_put_value(origin, &v1.to_bytes()).expect("stale, silently dropped");

        svc.handle_get_value(origin, 8, &owner.public_key_bytes(), &out_tx, &pool)
            .await
            .expect("handled");
        let reply = out_rx.try_recv().expect("value reply");
        assert_eq!(
            reply.header().expect("header").message_type,
            MessageType::GetValueRes
        );
        let held = MutableRecord::decode(reply.payload()).expect("record");
        assert_eq!(held.sequence, 2);
        assert_eq!(held.value, b"head-2");
    }

    #[tokio::test]
    async fn get_value_for_unknown_owner_replies_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = service(nid([0x01; 32]), MockNet::default(), tmp.path()).await;
        let (out_tx, mut out_rx) = outgoing_queue();
        let pool = BufferPool::default();

        svc.handle_get_value(ep(42_001), 8, &[0xEE; 32], &out_tx, &pool)
            .await
            .expect("handled");
        let reply = out_rx.try_recv().expect("reply");
        assert!(reply.payload().is_empty());
    }

    #[tokio::test]
    async fn resolve_record_prefers_highest_valid_sequence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let owner = IdentityKeypair::generate();
        let target = NodeId::from_bytes(sha256(&owner.public_key_bytes()));

        let holder_a = Contact::new(id_near(&target, 31), ep(9301));
        let holder_b = Contact::new(id_near(&target, 30), ep(9302));

        let net = MockNet::default();
        net.add_node(holder_a.endpoint, vec![]);
        net.add_node(holder_b.endpoint, vec![]);
        net.records.lock().expect("lock").insert(
            holder_a.endpoint,
            MutableRecord::sign(&owner, 4, b"older".to_vec()),
        );
        net.records.lock().expect("lock").insert(
            holder_b.endpoint,
            MutableRecord::sign(&owner, 9, b"newer".to_vec()),
        );

        let svc = service(nid([0x01; 32]), net, tmp.path()).await;
        svc.routing.add_contact(holder_a);
        svc.routing.add_contact(holder_b);

        let resolved = svc
            .resolve_record(&owner.public_key_bytes())
            .await
            .expect("a record resolves");
        assert_eq!(resolved.sequence, 9);
        assert_eq!(resolved.value, b"newer");
    }

    #[tokio::test]
    async fn fetch_blob_rejects_digest_mismatch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let digest = sha256(b"the real content");
        let target = NodeId::from_bytes(digest);

        let liar = Contact::new(id_near(&target, 31), ep(9401));
        let honest = Contact::new(id_near(&target, 29), ep(9402));

        let net = MockNet::default();
        net.add_node(liar.endpoint, vec![]);
        net.add_node(honest.endpoint, vec![]);
        net.blobs
            .lock()
            .expect("lock")
            .entry(liar.endpoint)
            .or_default()
            .push((digest, b"forged content!!".to_vec()));
        net.blobs
            .lock()
            .expect("lock")
            .entry(honest.endpoint)
            .or_default()
            .push((digest, b"the real content".to_vec()));

        let svc = service(nid([0x01; 32]), net, tmp.path()).await;
        svc.routing.add_contact(liar);
        svc.routing.add_contact(honest);

        let fetched = svc.fetch_blob(&digest).await.expect("fetched");
        assert_eq!(fetched, b"the real content");
    }

    #[tokio::test]
    async fn replicate_blob_targets_closest_holders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blob = b"chunk to spread".to_vec();
        let digest = sha256(&blob);
        let target = NodeId::from_bytes(digest);

        let net = MockNet::default();
        let mut holders = Vec::new();
        for (i, port) in (9501u16..9506).enumerate() {
            let contact = Contact::new(id_near(&target, 31 - i), ep(port));
            net.add_node(contact.endpoint, vec![]);
            holders.push(contact);
        }

        let svc = service(nid([0x01; 32]), net.clone(), tmp.path()).await;
        for h in &holders {
            svc.routing.add_contact(h.clone());
        }

        svc.replicate_blob(&digest, &blob).await;

        let stored = net.blobs.lock().expect("lock");
        let receivers: usize = stored.values().filter(|v| !v.is_empty()).count();
        assert_eq!(receivers, svc.replication, "replicated to exactly the configured fan-out");
    }
}
