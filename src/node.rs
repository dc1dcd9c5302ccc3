//! # Node
//!
//! The composition root tying every subsystem together: key material,
//! blob store, peer/routing/ledger state, the DHT service and the
//! dispatcher task. A [`Node`] exposes the two bounded queues the
//! transport collaborator attaches to, plus the content and profile
//! operations the application layer drives.
//!
//! ```ignore
//! let node = Node::start(Settings::default()).await?;
//! let incoming = node.incoming_sender();          // transport -> core
//! let outgoing = node.take_outgoing().unwrap();   // core -> transport
//!
//! node.send_handshake(seed_endpoint).await?;
//! node.bootstrap().await;
//!
//! let manifest = node.ingest_file(&mut file, "pic.jpg", "image/jpeg").await?;
//! node.publish_profile(&manifest).await?;
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use crate::buffer::BufferPool;
use crate::config::Settings;
use crate::crypto::derive_storage_key;
use crate::dht::{DhtService, Messenger};
use crate::dispatch::{Dispatcher, TerminalMessage};
use crate::error::NodeError;
use crate::files::FileService;
use crate::handshake::HandshakePayload;
use crate::identity::{Contact, IdentityKeypair, NodeId, OnionKeypair};
use crate::ledger::RequestLedger;
use crate::onion::{build_onion_payload, Hop};
use crate::packet::{
    incoming_queue, outgoing_queue, InboundSender, OutboundMessage, OutboundReceiver,
    OutboundSender,
};
use crate::peers::PeerTable;
use crate::record::{MutableRecord, RecordStore};
use crate::routing::RoutingTable;
use crate::store::BlobStore;
use crate::wire::MessageType;

/// A receiver handed out exactly once to its single consumer.
type TakeOnce<T> = Mutex<Option<T>>;

pub struct Node {
    settings: Settings,
    identity: IdentityKeypair,
    onion_keys: Arc<OnionKeypair>,
    node_id: NodeId,
    peers: Arc<PeerTable>,
    routing: Arc<RoutingTable>,
    ledger: Arc<RequestLedger>,
    store: Arc<BlobStore>,
    records: Arc<RecordStore>,
    dht: DhtService<Messenger>,
    files: FileService<Messenger>,
    pool: BufferPool,
    incoming_tx: InboundSender,
    outgoing_tx: OutboundSender,
    outgoing_rx: TakeOnce<OutboundReceiver>,
    terminal_rx: TakeOnce<mpsc::Receiver<TerminalMessage>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Bring up a node: load or create the identity, open the blob store,
    /// and start the dispatcher. If `seed_port` is configured, a signed
    /// handshake to the local seed is queued immediately.
    pub async fn start(settings: Settings) -> Result<Self, NodeError> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;

        let identity = IdentityKeypair::load_or_generate(&settings.identity_path()).await?;
        let storage_key = derive_storage_key(&identity.seed());
        let store = Arc::new(BlobStore::open(settings.blob_dir(), storage_key).await?);

        let onion_keys = Arc::new(OnionKeypair::generate());
        let node_id = onion_keys.node_id();

        let peers = Arc::new(PeerTable::new());
        let routing = Arc::new(RoutingTable::new(node_id, settings.k));
        let ledger = Arc::new(RequestLedger::new());
        let records = Arc::new(RecordStore::new());
        let pool = BufferPool::default();

        let (incoming_tx, incoming_rx) = incoming_queue();
        let (outgoing_tx, outgoing_rx) = outgoing_queue();
        let (terminal_tx, terminal_rx) = mpsc::channel(QUEUE_DELIVERY_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let rpc = Messenger::new(outgoing_tx.clone(), ledger.clone(), pool.clone(), &settings);
        let dht = DhtService::new(
            node_id,
            &settings,
            routing.clone(),
            peers.clone(),
            store.clone(),
            records.clone(),
            rpc.clone(),
        );
        let files = FileService::new(store.clone(), dht.clone(), settings.chunk_size);

        let dispatcher = Dispatcher::new(
            &settings,
            incoming_rx,
            outgoing_tx.clone(),
            pool.clone(),
            peers.clone(),
            routing.clone(),
            ledger.clone(),
            dht.clone(),
            onion_keys.clone(),
            terminal_tx,
            shutdown_rx,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let node = Self {
            settings,
            identity,
            onion_keys,
            node_id,
            peers,
            routing,
            ledger,
            store,
            records,
            dht,
            files,
            pool,
            incoming_tx,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            terminal_rx: Mutex::new(Some(terminal_rx)),
            shutdown_tx,
            dispatcher,
        };

        info!(
            node_id = %node.node_id,
            identity = %hex::encode(&node.identity.public_key_bytes()[..8]),
            data_dir = %node.settings.data_dir.display(),
            "node started"
        );

        if let Some(seed_port) = node.settings.seed_port {
            let seed = SocketAddr::from(([127, 0, 0, 1], seed_port));
            if let Err(e) = node.send_handshake(seed).await {
                warn!(seed = %seed, error = %e, "seed handshake could not be queued");
            }
        }

        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn identity_public_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    pub fn onion_public_key(&self) -> [u8; 32] {
        *self.onion_keys.public().as_bytes()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Transport attachment points
    // ------------------------------------------------------------------

    /// Sender the transport uses to feed received frames into the core.
    pub fn incoming_sender(&self) -> InboundSender {
        self.incoming_tx.clone()
    }

    /// The outgoing-message queue; the single transport consumer takes it
    /// once and releases each message's buffer after transmission.
    pub fn take_outgoing(&self) -> Option<OutboundReceiver> {
        self.outgoing_rx.lock().expect("receiver lock poisoned").take()
    }

    /// Messages whose onion routes terminated at this node.
    pub fn take_terminal(&self) -> Option<mpsc::Receiver<TerminalMessage>> {
        self.terminal_rx.lock().expect("receiver lock poisoned").take()
    }

    /// Shared buffer pool, for transports that frame their own packets.
    pub fn buffer_pool(&self) -> BufferPool {
        self.pool.clone()
    }

    // ------------------------------------------------------------------
    // Peer and DHT operations
    // ------------------------------------------------------------------

    /// Queue a signed handshake introducing this node to `target`.
    pub async fn send_handshake(&self, target: SocketAddr) -> Result<(), NodeError> {
        let payload =
            HandshakePayload::build(&self.identity, self.onion_keys.public()).to_bytes();
        let msg = OutboundMessage::frame(
            &self.pool,
            target,
            MessageType::Handshake,
            0,
            &payload,
        );
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| NodeError::QueueClosed)
    }

    /// Inject a known contact, as a bootstrap list or operator would.
    pub fn add_contact(&self, contact: Contact) {
        self.routing.add_contact(contact);
    }

    /// Populate the routing table by looking up our own id through known
    /// contacts.
    pub async fn bootstrap(&self) -> Vec<Contact> {
        self.dht.bootstrap().await
    }

    /// Wrap `message` for the given route and queue it to the first hop.
    pub async fn send_onion(&self, hops: &[Hop], message: &[u8]) -> Result<(), NodeError> {
        let first = hops
            .first()
            .ok_or(NodeError::MalformedOnion("empty route"))?
            .endpoint;
        let client_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let payload = build_onion_payload(message, hops, &client_secret)?;

        let msg = OutboundMessage::frame(&self.pool, first, MessageType::Onion, 0, &payload);
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| NodeError::QueueClosed)
    }

    // ------------------------------------------------------------------
    // Content operations
    // ------------------------------------------------------------------

    /// Chunk, store and replicate a stream; returns the manifest digest.
    pub async fn ingest_file<R>(
        &self,
        reader: &mut R,
        file_name: &str,
        content_type: &str,
    ) -> Result<String, NodeError>
    where
        R: AsyncRead + Unpin,
    {
        self.files.ingest(reader, file_name, content_type).await
    }

    /// Stream a previously ingested file into `sink`, fetching missing
    /// chunks from the network.
    pub async fn reassemble_file<W>(&self, manifest_hex: &str, sink: &mut W) -> Result<(), NodeError>
    where
        W: AsyncWrite + Unpin,
    {
        self.files.reassemble(manifest_hex, sink).await
    }

    // ------------------------------------------------------------------
    // Profile publication
    // ------------------------------------------------------------------

    /// Publish `manifest_hex` as this identity's profile head: bump the
    /// persisted sequence, sign a mutable record pointing at the manifest,
    /// push it to the DHT and persist the head files. Returns the sequence
    /// used.
    pub async fn publish_profile(&self, manifest_hex: &str) -> Result<u64, NodeError> {
        let digest = hex::decode(manifest_hex)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or(NodeError::MalformedFrame("manifest digest hex"))?;

        let sequence = self.read_profile_sequence().await + 1;
        let record = MutableRecord::sign(&self.identity, sequence, digest.to_vec());

        // Keep our own head locally so we answer GET_VALUE for it too.
        self.records.insert(record.clone());
        self.dht.publish_record(&record).await;

        tokio::fs::write(self.settings.profile_seq_path(), sequence.to_string()).await?;
        tokio::fs::write(self.settings.profile_head_path(), manifest_hex).await?;

        let head_prefix = &manifest_hex[..16.min(manifest_hex.len())];
        info!(sequence, head = %head_prefix, "profile published");
        Ok(sequence)
    }

    /// Resolve another identity's current profile manifest digest.
    pub async fn resolve_profile(&self, owner: &[u8; 32]) -> Option<String> {
        let record = self.dht.resolve_record(owner).await?;
        if record.value.len() != 32 {
            warn!(
                owner = %hex::encode(&owner[..8]),
                "profile record value is not a digest"
            );
            return None;
        }
        Some(hex::encode(&record.value))
    }

    async fn read_profile_sequence(&self) -> u64 {
        match tokio::fs::read_to_string(self.settings.profile_seq_path()).await {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Signal the dispatcher to stop and wait for it to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.dispatcher.await;
        let outstanding = self.ledger.outstanding();
        if outstanding > 0 {
            warn!(outstanding, "shutdown with outstanding requests");
        }
        info!("node stopped");
    }
}

/// Capacity of the terminal-delivery channel to the upstream consumer.
const QUEUE_DELIVERY_CAPACITY: usize = 256;
