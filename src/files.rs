//! # File Ingest and Reassembly
//!
//! Large content never travels as one payload: it is cut into 256 KiB
//! chunks, each stored and replicated as an ordinary content-addressed
//! blob, and described by a small JSON manifest listing the chunk digests
//! in order. The manifest's own digest is the handle callers keep (and
//! typically publish through a mutable record).
//!
//! Reassembly streams chunks into a sink in manifest order, preferring the
//! local store and falling back to a DHT fetch per missing chunk. A chunk
//! obtained from the network is cached locally before use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::dht::DhtService;
use crate::error::NodeError;
use crate::protocols::DhtRpc;
use crate::store::{BlobStore, Digest};

/// Manifest describing one logical file as an ordered chunk list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub file_name: String,
    pub content_type: String,
    pub total_size: u64,
    /// Hex SHA-256 digests; concatenating the chunks restores the file.
    pub chunks: Vec<String>,
}

pub struct FileService<N: DhtRpc> {
    store: Arc<BlobStore>,
    dht: DhtService<N>,
    chunk_size: usize,
}

impl<N: DhtRpc + Clone> FileService<N> {
    pub fn new(store: Arc<BlobStore>, dht: DhtService<N>, chunk_size: usize) -> Self {
        Self {
            store,
            dht,
            chunk_size,
        }
    }

    /// Ingest a stream: chunk, store, replicate, and return the hex digest
    /// of the stored manifest.
    pub async fn ingest<R>(
        &self,
        reader: &mut R,
        file_name: &str,
        content_type: &str,
    ) -> Result<String, NodeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut manifest = Manifest {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            total_size: 0,
            chunks: Vec::new(),
        };

        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let filled = read_up_to(reader, &mut chunk).await?;
            if filled == 0 {
                break;
            }
            let data = &chunk[..filled];
            let digest = self.store.store(data).await?;
            manifest.total_size += filled as u64;
            manifest.chunks.push(hex::encode(digest));

            self.dht.replicate_blob(&digest, data).await;

            if filled < self.chunk_size {
                break;
            }
        }

        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| NodeError::ManifestParseError(e.to_string()))?;
        let manifest_digest = self.store.store(&manifest_bytes).await?;
        self.dht.replicate_blob(&manifest_digest, &manifest_bytes).await;

        debug!(
            file = file_name,
            chunks = manifest.chunks.len(),
            size = manifest.total_size,
            manifest = %hex::encode(&manifest_digest[..8]),
            "file ingested"
        );
        Ok(hex::encode(manifest_digest))
    }

    /// Stream the file identified by `manifest_hex` into `sink`.
    pub async fn reassemble<W>(&self, manifest_hex: &str, sink: &mut W) -> Result<(), NodeError>
    where
        W: AsyncWrite + Unpin,
    {
        let manifest_digest = parse_hex_digest(manifest_hex)?;
        let manifest_bytes = self
            .store
            .retrieve_bytes(&manifest_digest)
            .await
            .ok_or_else(|| NodeError::BlobNotFound(manifest_hex.to_string()))?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| NodeError::ManifestParseError(e.to_string()))?;

        for chunk_hex in &manifest.chunks {
            let digest = parse_hex_digest(chunk_hex)?;

            if let Some(local) = self.store.retrieve_bytes(&digest).await {
                sink.write_all(&local).await?;
                continue;
            }

            let Some(fetched) = self.dht.fetch_blob(&digest).await else {
                warn!(chunk = %chunk_hex, "chunk unavailable locally and from the network");
                return Err(NodeError::ChunkUnavailable(chunk_hex.clone()));
            };
            // Cache before use so a re-read stays local.
            self.store.store(&fetched).await?;
            sink.write_all(&fetched).await?;
        }

        sink.flush().await?;
        Ok(())
    }
}

fn parse_hex_digest(s: &str) -> Result<Digest, NodeError> {
    let bytes =
        hex::decode(s).map_err(|e| NodeError::ManifestParseError(format!("digest hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::ManifestParseError("digest length".to_string()))
}

/// Fill `buf` as far as the stream allows; a short count means EOF.
async fn read_up_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, NodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
