//! # Packet Dispatcher
//!
//! The node's inbound state machine. A single task drains the incoming
//! queue and, for every packet: checks the declared payload length against
//! the bytes actually carried, verifies the CRC32, then routes by message
//! type. Response-typed frames are offered to the request ledger first;
//! everything else goes to its handler. The default branch logs and drops,
//! so unknown types degrade gracefully.
//!
//! Error containment is the core contract here: a handler failure is
//! logged with the packet type and origin and the loop moves on. One
//! malformed or malicious packet never terminates the node. The incoming
//! buffer is released back to the pool after the handler completes,
//! success or not; handlers that forward data rent fresh buffers.
//!
//! Packets are processed strictly sequentially, so per-source ordering is
//! preserved whenever the transport preserves it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config::Settings;
use crate::dht::DhtService;
use crate::error::NodeError;
use crate::handshake;
use crate::identity::OnionKeypair;
use crate::ledger::RequestLedger;
use crate::onion::{self, PeeledLayer};
use crate::packet::{InboundPacket, InboundReceiver, OutboundMessage, OutboundSender, ResponseFrame};
use crate::peers::PeerTable;
use crate::protocols::DhtRpc;
use crate::routing::RoutingTable;
use crate::wire::MessageType;

/// A message that terminated its onion route at this node, surfaced to the
/// upstream consumer.
#[derive(Debug)]
pub struct TerminalMessage {
    pub origin: SocketAddr,
    pub data: Vec<u8>,
}

pub struct Dispatcher<N: DhtRpc> {
    incoming: InboundReceiver,
    outbound: OutboundSender,
    pool: BufferPool,
    peers: Arc<PeerTable>,
    routing: Arc<RoutingTable>,
    ledger: Arc<RequestLedger>,
    dht: DhtService<N>,
    onion_keys: Arc<OnionKeypair>,
    terminal_tx: mpsc::Sender<TerminalMessage>,
    shutdown: watch::Receiver<bool>,
    max_payload_bytes: usize,
    handshake_clock_skew_ms: u64,
}

impl<N: DhtRpc + Clone> Dispatcher<N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        incoming: InboundReceiver,
        outbound: OutboundSender,
        pool: BufferPool,
        peers: Arc<PeerTable>,
        routing: Arc<RoutingTable>,
        ledger: Arc<RequestLedger>,
        dht: DhtService<N>,
        onion_keys: Arc<OnionKeypair>,
        terminal_tx: mpsc::Sender<TerminalMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            incoming,
            outbound,
            pool,
            peers,
            routing,
            ledger,
            dht,
            onion_keys,
            terminal_tx,
            shutdown,
            max_payload_bytes: settings.max_payload_bytes,
            handshake_clock_skew_ms: settings.handshake_clock_skew_ms,
        }
    }

    /// Drain the incoming queue until shutdown or queue teardown.
    pub async fn run(mut self) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                packet = self.incoming.recv() => {
                    let Some(packet) = packet else { break };
                    self.process(packet).await;
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Validate, route and release one packet.
    async fn process(&self, packet: InboundPacket) {
        let origin = packet.origin;
        let message_type = packet.header.message_type;

        let result = self.handle(&packet).await;
        if let Err(e) = result {
            warn!(
                peer = %origin,
                packet_type = ?message_type,
                error = %e,
                "packet handling failed"
            );
        }

        self.pool.release(packet.buffer);
    }

    async fn handle(&self, packet: &InboundPacket) -> Result<(), NodeError> {
        let header = &packet.header;

        if header.payload_length as usize != packet.payload_len {
            return Err(NodeError::MalformedFrame("declared length mismatch"));
        }
        if packet.payload_len > self.max_payload_bytes {
            return Err(NodeError::MalformedFrame("payload exceeds limit"));
        }
        let payload = packet.payload();
        header.verify_checksum(payload)?;

        self.peers.observe(packet.origin);

        if header.message_type.is_response() {
            return self.handle_response(packet, payload);
        }

        match header.message_type {
            MessageType::Handshake => handshake::handle_handshake(
                &self.peers,
                &self.routing,
                packet.origin,
                payload,
                self.handshake_clock_skew_ms,
            ),
            MessageType::Onion => self.handle_onion(packet.origin, payload).await,
            MessageType::FindNode => {
                self.dht
                    .handle_find_node(
                        packet.origin,
                        header.request_id,
                        payload,
                        &self.outbound,
                        &self.pool,
                    )
                    .await
            }
            MessageType::Store => {
                self.dht
                    .handle_store(
                        packet.origin,
                        header.request_id,
                        payload,
                        &self.outbound,
                        &self.pool,
                    )
                    .await
            }
            MessageType::Fetch => {
                self.dht
                    .handle_fetch(
                        packet.origin,
                        header.request_id,
                        payload,
                        &self.outbound,
                        &self.pool,
                    )
                    .await
            }
            MessageType::PutValue => self.dht.handle_put_value(packet.origin, payload),
            MessageType::GetValue => {
                self.dht
                    .handle_get_value(
                        packet.origin,
                        header.request_id,
                        payload,
                        &self.outbound,
                        &self.pool,
                    )
                    .await
            }
            other => {
                debug!(peer = %packet.origin, packet_type = ?other, "dropping unhandled packet type");
                Ok(())
            }
        }
    }

    /// Offer a response frame to the ledger; unmatched responses are
    /// logged and dropped.
    fn handle_response(&self, packet: &InboundPacket, payload: &[u8]) -> Result<(), NodeError> {
        let frame = ResponseFrame {
            origin: packet.origin,
            message_type: packet.header.message_type,
            payload: payload.to_vec(),
        };
        if !self.ledger.complete(packet.header.request_id, frame) {
            debug!(
                peer = %packet.origin,
                request_id = packet.header.request_id,
                packet_type = ?packet.header.message_type,
                "response matches no outstanding request"
            );
        }
        Ok(())
    }

    /// Peel one onion layer: deliver terminal messages upstream, forward
    /// relay layers to their next hop in a freshly rented buffer.
    async fn handle_onion(&self, origin: SocketAddr, payload: &[u8]) -> Result<(), NodeError> {
        match onion::peel(self.onion_keys.secret(), payload)? {
            PeeledLayer::Terminal(data) => {
                debug!(peer = %origin, bytes = data.len(), "onion terminated here");
                self.terminal_tx
                    .send(TerminalMessage { origin, data })
                    .await
                    .map_err(|_| NodeError::QueueClosed)
            }
            PeeledLayer::Relay { next_hop, payload } => {
                debug!(peer = %origin, next = %next_hop, "relaying onion layer");
                let msg =
                    OutboundMessage::frame(&self.pool, next_hop, MessageType::Onion, 0, &payload);
                self.outbound
                    .send(msg)
                    .await
                    .map_err(|_| NodeError::QueueClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::crypto::SymmetricKey;
    use crate::dht::Messenger;
    use crate::handshake::HandshakePayload;
    use crate::identity::{Contact, IdentityKeypair, NodeId};
    use crate::packet::{incoming_queue, outgoing_queue, InboundSender, OutboundReceiver};
    use crate::record::RecordStore;
    use crate::store::BlobStore;
    use crate::wire::FrameHeader;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use std::time::Duration;

    struct Harness {
        incoming_tx: InboundSender,
        outgoing_rx: OutboundReceiver,
        terminal_rx: mpsc::Receiver<TerminalMessage>,
        peers: Arc<PeerTable>,
        routing: Arc<RoutingTable>,
        ledger: Arc<RequestLedger>,
        pool: BufferPool,
        onion_keys: Arc<OnionKeypair>,
        shutdown_tx: watch::Sender<bool>,
        _tmp: tempfile::TempDir,
    }

    async fn start_node() -> Harness {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = Settings::default();

        let (incoming_tx, incoming_rx) = incoming_queue();
        let (outgoing_tx, outgoing_rx) = outgoing_queue();
        let (terminal_tx, terminal_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = BufferPool::default();
        let onion_keys = Arc::new(OnionKeypair::generate());
        let node_id = onion_keys.node_id();
        let peers = Arc::new(PeerTable::new());
        let routing = Arc::new(RoutingTable::new(node_id, settings.k));
        let ledger = Arc::new(RequestLedger::new());
        let records = Arc::new(RecordStore::new());

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let store = Arc::new(
            BlobStore::open(tmp.path().join("blobs"), SymmetricKey::from_bytes(key))
                .await
                .expect("open store"),
        );

        let rpc = Messenger::new(outgoing_tx.clone(), ledger.clone(), pool.clone(), &settings);
        let dht = DhtService::new(
            node_id,
            &settings,
            routing.clone(),
            peers.clone(),
            store,
            records,
            rpc,
        );

        let dispatcher = Dispatcher::new(
            &settings,
            incoming_rx,
            outgoing_tx,
            pool.clone(),
            peers.clone(),
            routing.clone(),
            ledger.clone(),
            dht,
            onion_keys.clone(),
            terminal_tx,
            shutdown_rx,
        );
        tokio::spawn(dispatcher.run());

        Harness {
            incoming_tx,
            outgoing_rx,
            terminal_rx,
            peers,
            routing,
            ledger,
            pool,
            onion_keys,
            shutdown_tx,
            _tmp: tmp,
        }
    }

    fn packet(
        pool: &BufferPool,
        origin: SocketAddr,
        message_type: MessageType,
        request_id: u32,
        payload: &[u8],
    ) -> InboundPacket {
        let header = FrameHeader::for_payload(message_type, request_id, payload);
        InboundPacket::from_payload(pool, origin, header, payload)
    }

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn recv_outgoing(rx: &mut OutboundReceiver) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply within deadline")
            .expect("queue open")
    }

    #[tokio::test]
    async fn handshake_packet_registers_peer() {
        let h = start_node().await;
        let identity = IdentityKeypair::generate();
        let remote_onion = OnionKeypair::generate();
        let origin = ep(40_321);

        let payload = HandshakePayload::build(&identity, remote_onion.public()).to_bytes();
        h.incoming_tx
            .send(packet(&h.pool, origin, MessageType::Handshake, 0, &payload))
            .await
            .expect("queued");

        // The dispatcher owns the packet from here; poll for the effect.
        for _ in 0..50 {
            if h.peers.is_authenticated(&origin) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.peers.is_authenticated(&origin));
        assert_eq!(
            h.peers
                .peer_onion_key(&origin)
                .expect("key registered")
                .as_bytes(),
            remote_onion.public().as_bytes()
        );
        h.shutdown_tx.send(true).expect("signal");
    }

    #[tokio::test]
    async fn find_node_elicits_typed_response() {
        let mut h = start_node().await;

        let contact = Contact::new(NodeId::from_bytes([0x5A; 32]), ep(12_345));
        h.routing.add_contact(contact.clone());

        h.incoming_tx
            .send(packet(
                &h.pool,
                ep(40_000),
                MessageType::FindNode,
                0,
                contact.node_id.as_bytes(),
            ))
            .await
            .expect("queued");

        let reply = recv_outgoing(&mut h.outgoing_rx).await;
        let header = reply.header().expect("header");
        assert_eq!(header.message_type, MessageType::FindNodeRes);
        assert_eq!(reply.target, ep(40_000));
    }

    #[tokio::test]
    async fn corrupted_checksum_is_dropped_without_side_effects() {
        let mut h = start_node().await;
        let origin = ep(40_500);

        let mut bad = packet(&h.pool, origin, MessageType::FindNode, 0, &[0x77; 32]);
        bad.header.checksum ^= 0xDEAD_BEEF;
        h.incoming_tx.send(bad).await.expect("queued");

        // A valid packet afterwards still gets served: the node survived.
        h.incoming_tx
            .send(packet(
                &h.pool,
                origin,
                MessageType::FindNode,
                1,
                &[0x77; 32],
            ))
            .await
            .expect("queued");

        let reply = recv_outgoing(&mut h.outgoing_rx).await;
        assert_eq!(reply.header().expect("header").request_id, 1);
    }

    #[tokio::test]
    async fn declared_length_mismatch_is_rejected() {
        let mut h = start_node().await;
        let origin = ep(40_501);

        let mut lying = packet(&h.pool, origin, MessageType::Store, 2, b"four");
        lying.header.payload_length = 9_999;
        h.incoming_tx.send(lying).await.expect("queued");

        h.incoming_tx
            .send(packet(&h.pool, origin, MessageType::Store, 3, b"honest"))
            .await
            .expect("queued");

        let reply = recv_outgoing(&mut h.outgoing_rx).await;
        assert_eq!(reply.header().expect("header").request_id, 3);
        assert_eq!(
            reply.header().expect("header").message_type,
            MessageType::StoreRes
        );
    }

    #[tokio::test]
    async fn store_reply_carries_content_digest() {
        let mut h = start_node().await;

        h.incoming_tx
            .send(packet(
                &h.pool,
                ep(40_600),
                MessageType::Store,
                7,
                b"hosted bytes",
            ))
            .await
            .expect("queued");

        let reply = recv_outgoing(&mut h.outgoing_rx).await;
        assert_eq!(
            reply.header().expect("header").message_type,
            MessageType::StoreRes
        );
        assert_eq!(reply.payload(), crate::crypto::sha256(b"hosted bytes").as_slice());
    }

    #[tokio::test]
    async fn response_frames_complete_the_ledger() {
        let h = start_node().await;
        let (id, rx) = h.ledger.register();

        h.incoming_tx
            .send(packet(
                &h.pool,
                ep(40_700),
                MessageType::FetchRes,
                id,
                b"fetched blob",
            ))
            .await
            .expect("queued");

        let frame = h
            .ledger
            .wait(id, rx, Duration::from_secs(2))
            .await
            .expect("completed");
        assert_eq!(frame.payload, b"fetched blob");
        assert_eq!(frame.message_type, MessageType::FetchRes);

        // An unsolicited response is silently dropped.
        h.incoming_tx
            .send(packet(
                &h.pool,
                ep(40_700),
                MessageType::FetchRes,
                0xDEAD,
                b"late",
            ))
            .await
            .expect("queued");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.ledger.outstanding(), 0);
        h.shutdown_tx.send(true).expect("signal");
    }

    #[tokio::test]
    async fn terminal_onion_surfaces_upstream() {
        let mut h = start_node().await;
        let client = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let hops = vec![crate::onion::Hop {
            endpoint: ep(1),
            onion_key: *h.onion_keys.public(),
        }];
        let payload =
            crate::onion::build_onion_payload(b"dm for this node", &hops, &client).expect("build");

        h.incoming_tx
            .send(packet(&h.pool, ep(40_800), MessageType::Onion, 0, &payload))
            .await
            .expect("queued");

        let delivered = tokio::time::timeout(Duration::from_secs(2), h.terminal_rx.recv())
            .await
            .expect("delivery within deadline")
            .expect("channel open");
        assert_eq!(delivered.data, b"dm for this node");
        assert_eq!(delivered.origin, ep(40_800));
    }

    #[tokio::test]
    async fn relay_onion_is_forwarded_with_ephemeral_prefix() {
        let mut h = start_node().await;
        let next_node = OnionKeypair::generate();
        let client = x25519_dalek::StaticSecret::random_from_rng(OsRng);

        let hops = vec![
            crate::onion::Hop {
                endpoint: ep(50_001),
                onion_key: *h.onion_keys.public(),
            },
            crate::onion::Hop {
                endpoint: ep(50_002),
                onion_key: *next_node.public(),
            },
        ];
        let payload =
            crate::onion::build_onion_payload(b"two hops deep", &hops, &client).expect("build");

        h.incoming_tx
            .send(packet(&h.pool, ep(40_900), MessageType::Onion, 0, &payload))
            .await
            .expect("queued");

        let forwarded = recv_outgoing(&mut h.outgoing_rx).await;
        let header = forwarded.header().expect("header");
        assert_eq!(header.message_type, MessageType::Onion);
        assert_eq!(header.request_id, 0);
        assert_eq!(forwarded.target, ep(50_002));

        // The next hop can terminate the forwarded layer.
        match crate::onion::peel(next_node.secret(), forwarded.payload()).expect("peel") {
            PeeledLayer::Terminal(data) => assert_eq!(data, b"two hops deep"),
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let mut h = start_node().await;
        let origin = ep(41_100);

        let mut odd = packet(&h.pool, origin, MessageType::Onion, 0, b"x");
        // Force an unrecognized code through the parsed header.
        odd.header.message_type = MessageType::Unknown;
        h.incoming_tx.send(odd).await.expect("queued");

        h.incoming_tx
            .send(packet(&h.pool, origin, MessageType::Store, 11, b"still alive"))
            .await
            .expect("queued");
        let reply = recv_outgoing(&mut h.outgoing_rx).await;
        assert_eq!(reply.header().expect("header").request_id, 11);
    }
}
