//! # Blob Store
//!
//! Content-addressed local persistence. A blob lives at
//! `<data_dir>/blobs/<hex sha256(plaintext)>` as a single AEAD record
//! `nonce(12) | ciphertext | tag(16)` under the at-rest storage key.
//!
//! Addressing by the plaintext digest keeps storage deterministic and
//! deduplicating: the same content always lands at the same path, so a
//! second writer is a no-op. Files are written to a temporary path and
//! atomically renamed; a file bearing the final name is always complete
//! and authenticated. Read failures (absence, truncation, failed
//! authentication) surface as absence plus a warning, never as an error
//! to the caller.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::crypto::{self, SymmetricKey, AEAD_OVERHEAD};
use crate::error::NodeError;

pub type Digest = [u8; 32];

#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    key: SymmetricKey,
}

impl BlobStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>, key: SymmetricKey) -> Result<Self, NodeError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, key })
    }

    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.dir.join(hex::encode(digest))
    }

    /// Store `plaintext`, returning its SHA-256 digest.
    ///
    /// Idempotent and race-safe: if the final path already exists the
    /// content is identical by construction, and a lost rename race is
    /// tolerated for the same reason.
    pub async fn store(&self, plaintext: &[u8]) -> Result<Digest, NodeError> {
        let digest = crypto::sha256(plaintext);
        let path = self.path_for(&digest);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(digest);
        }

        let sealed = crypto::seal(&self.key, plaintext)?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&sealed).await?;
            file.flush().await?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(digest = %hex::encode(&digest[..8]), "lost store race, blob already present");
                let _ = tokio::fs::remove_file(&tmp).await;
            } else {
                return Err(e.into());
            }
        }
        Ok(digest)
    }

    /// Decrypt the whole blob into memory. Intended for small blobs such
    /// as manifests.
    pub async fn retrieve_bytes(&self, digest: &Digest) -> Option<Vec<u8>> {
        let sealed = match tokio::fs::read(self.path_for(digest)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(digest = %hex::encode(&digest[..8]), error = %e, "blob read failed");
                return None;
            }
        };
        match crypto::open(&self.key, &sealed) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                warn!(
                    digest = %hex::encode(&digest[..8]),
                    "blob failed authentication, treating as absent"
                );
                None
            }
        }
    }

    /// Decrypt the blob into `sink`, returning the plaintext size.
    pub async fn retrieve_to_writer<W>(&self, digest: &Digest, sink: &mut W) -> Result<u64, NodeError>
    where
        W: AsyncWrite + Unpin,
    {
        let plaintext = self
            .retrieve_bytes(digest)
            .await
            .ok_or_else(|| NodeError::BlobNotFound(hex::encode(digest)))?;
        sink.write_all(&plaintext).await?;
        Ok(plaintext.len() as u64)
    }

    /// Decrypt directly into `dest`; returns bytes written, or 0 on
    /// absence, authentication failure, or an undersized destination.
    pub async fn retrieve_to_buffer(&self, digest: &Digest, dest: &mut [u8]) -> usize {
        let Some(plaintext) = self.retrieve_bytes(digest).await else {
            return 0;
        };
        if dest.len() < plaintext.len() {
            warn!(
                digest = %hex::encode(&digest[..8]),
                needed = plaintext.len(),
                available = dest.len(),
                "destination buffer too small for blob"
            );
            return 0;
        }
        dest[..plaintext.len()].copy_from_slice(&plaintext);
        plaintext.len()
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        tokio::fs::try_exists(self.path_for(digest))
            .await
            .unwrap_or(false)
    }

    /// Plaintext size of a stored blob: file length minus AEAD overhead.
    pub async fn blob_size(&self, digest: &Digest) -> Option<u64> {
        let meta = tokio::fs::metadata(self.path_for(digest)).await.ok()?;
        meta.len().checked_sub(AEAD_OVERHEAD as u64)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
