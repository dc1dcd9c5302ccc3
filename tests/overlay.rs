//! Multi-node flows with the outgoing queue of each node routed into the
//! incoming queue of its target, standing in for the transport
//! collaborator. Everything below the queues is the real protocol stack:
//! framing, checksums, handshakes, onion layers, DHT lookups, blob
//! replication and record publication.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use haven::buffer::BufferPool;
use haven::identity::Contact;
use haven::onion::Hop;
use haven::packet::{InboundPacket, InboundSender};
use haven::wire::{FrameHeader, HEADER_LEN};
use haven::{Node, Settings};
use x25519_dalek::PublicKey as OnionPublicKey;

/// Route one node's outgoing queue into the other nodes' incoming queues.
fn connect(node: &Node, endpoint: SocketAddr, network: HashMap<SocketAddr, InboundSender>) {
    let mut outgoing = node.take_outgoing().expect("outgoing queue untaken");
    let pool = node.buffer_pool();
    // Backs the receive side of the simulated wire.
    let transit = BufferPool::new(64 * 1024, 32);
    tokio::spawn(async move {
        while let Some(msg) = outgoing.recv().await {
            if let Some(tx) = network.get(&msg.target) {
                if let Ok(header) = FrameHeader::from_bytes(msg.framed()) {
                    let payload = &msg.framed()[HEADER_LEN..];
                    let packet = InboundPacket::from_payload(&transit, endpoint, header, payload);
                    let _ = tx.send(packet).await;
                }
            }
            pool.release(msg.buffer);
        }
    });
}

async fn start_node(dir: &std::path::Path, chunk_size: usize) -> Node {
    let settings = Settings {
        data_dir: dir.to_path_buf(),
        chunk_size,
        find_node_timeout: Duration::from_secs(2),
        fetch_timeout: Duration::from_secs(2),
        get_value_timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    Node::start(settings).await.expect("node starts")
}

struct Mesh {
    endpoints: Vec<SocketAddr>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Mesh {
    /// Start `n` nodes on loopback ports and wire their queues together.
    async fn start(n: usize, chunk_size: usize) -> (Vec<Node>, Mesh) {
        let mut nodes = Vec::with_capacity(n);
        let mut dirs = Vec::with_capacity(n);
        let mut endpoints = Vec::with_capacity(n);

        for i in 0..n {
            let dir = tempfile::tempdir().expect("tempdir");
            nodes.push(start_node(dir.path(), chunk_size).await);
            dirs.push(dir);
            endpoints.push(SocketAddr::from(([127, 0, 0, 1], 7_100 + i as u16)));
        }

        let network: HashMap<SocketAddr, InboundSender> = endpoints
            .iter()
            .zip(&nodes)
            .map(|(ep, node)| (*ep, node.incoming_sender()))
            .collect();

        for (node, endpoint) in nodes.iter().zip(&endpoints) {
            connect(node, *endpoint, network.clone());
        }

        (
            nodes,
            Mesh {
                endpoints,
                _dirs: dirs,
            },
        )
    }

    fn endpoint(&self, i: usize) -> SocketAddr {
        self.endpoints[i]
    }
}

/// Handshake `a` into `b` and wait until `b` has authenticated it.
async fn introduce(a: &Node, b: &Node, a_endpoint: SocketAddr, b_endpoint: SocketAddr) {
    a.send_handshake(b_endpoint).await.expect("handshake queued");
    for _ in 0..200 {
        if b.peers().is_authenticated(&a_endpoint) {
            // b also learned a as a routing contact; give a the same view.
            a.add_contact(Contact::new(b.node_id(), b_endpoint));
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handshake from {a_endpoint} never authenticated at {b_endpoint}");
}

#[tokio::test]
async fn handshake_authenticates_across_nodes() {
    let (nodes, mesh) = Mesh::start(2, 1024).await;

    nodes[0]
        .send_handshake(mesh.endpoint(1))
        .await
        .expect("handshake queued");

    let mut seen = false;
    for _ in 0..200 {
        if nodes[1].peers().is_authenticated(&mesh.endpoint(0)) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "receiving node authenticates the sender");
    assert_eq!(
        nodes[1]
            .peers()
            .peer_onion_key(&mesh.endpoint(0))
            .expect("onion key held")
            .as_bytes(),
        &nodes[0].onion_public_key()
    );
    assert!(nodes[1].routing().contains(&nodes[0].node_id()));
}

#[tokio::test]
async fn ingested_content_replicates_and_is_fetched_back() {
    let (nodes, mesh) = Mesh::start(2, 1024).await;
    introduce(&nodes[0], &nodes[1], mesh.endpoint(0), mesh.endpoint(1)).await;
    introduce(&nodes[1], &nodes[0], mesh.endpoint(1), mesh.endpoint(0)).await;

    // Several chunks at the reduced chunk size.
    let content: Vec<u8> = (0..5_000u32).map(|i| (i % 241) as u8).collect();
    let manifest_hex = nodes[0]
        .ingest_file(&mut content.as_slice(), "post.bin", "application/octet-stream")
        .await
        .expect("ingest");

    // Replication is fire-and-forget; wait for the chunks to land on the
    // second node.
    let manifest_digest: [u8; 32] = hex::decode(&manifest_hex)
        .expect("hex")
        .try_into()
        .expect("digest");
    let mut replicated = false;
    for _ in 0..300 {
        if nodes[1].blob_store().contains(&manifest_digest).await {
            replicated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(replicated, "manifest replicated to the peer");

    // Drop every local chunk on the ingesting node; reassembly must pull
    // them back over FETCH.
    let manifest_bytes = nodes[0]
        .blob_store()
        .retrieve_bytes(&manifest_digest)
        .await
        .expect("manifest local");
    let manifest: haven::files::Manifest =
        serde_json::from_slice(&manifest_bytes).expect("manifest json");
    for chunk_hex in &manifest.chunks {
        let digest: [u8; 32] = hex::decode(chunk_hex)
            .expect("hex")
            .try_into()
            .expect("digest");
        // Skip chunks the peer never got; the point is remote recovery.
        if nodes[1].blob_store().contains(&digest).await {
            let _ = tokio::fs::remove_file(nodes[0].blob_store().path_for(&digest)).await;
        }
    }

    let mut restored = Vec::new();
    nodes[0]
        .reassemble_file(&manifest_hex, &mut restored)
        .await
        .expect("reassemble via network");
    assert_eq!(restored, content);
}

#[tokio::test]
async fn published_profile_resolves_on_another_node() {
    let (nodes, mesh) = Mesh::start(2, 1024).await;
    introduce(&nodes[0], &nodes[1], mesh.endpoint(0), mesh.endpoint(1)).await;
    introduce(&nodes[1], &nodes[0], mesh.endpoint(1), mesh.endpoint(0)).await;

    let manifest_hex = hex::encode([0x5E; 32]);
    nodes[0]
        .publish_profile(&manifest_hex)
        .await
        .expect("publish");

    let resolved = nodes[1]
        .resolve_profile(&nodes[0].identity_public_key())
        .await
        .expect("record resolves");
    assert_eq!(resolved, manifest_hex);
}

#[tokio::test]
async fn onion_routes_through_an_intermediate_hop() {
    let (mut nodes, mesh) = Mesh::start(3, 1024).await;
    let exit = nodes.remove(2);
    let mut delivered_rx = exit.take_terminal().expect("terminal queue");

    let hops = vec![
        Hop {
            endpoint: mesh.endpoint(1),
            onion_key: OnionPublicKey::from(nodes[1].onion_public_key()),
        },
        Hop {
            endpoint: mesh.endpoint(2),
            onion_key: OnionPublicKey::from(exit.onion_public_key()),
        },
    ];

    nodes[0]
        .send_onion(&hops, b"whisper across the overlay")
        .await
        .expect("onion queued");

    let delivered = tokio::time::timeout(Duration::from_secs(3), delivered_rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(delivered.data, b"whisper across the overlay");
    // The exit only ever saw the middle hop.
    assert_eq!(delivered.origin, mesh.endpoint(1));
}
