//! # Cryptographic Primitives
//!
//! The small set of primitives every other module builds on:
//!
//! - **Content hashing**: SHA-256 for content-addressed storage and node ids
//! - **Key agreement**: X25519 shared secrets fed through HKDF-SHA256
//! - **AEAD**: ChaCha20-Poly1305 with a 12-byte nonce and 16-byte tag
//!
//! Session keys are derived per onion layer and dropped immediately after
//! use; the at-rest storage key lives for the node's lifetime. Both are
//! zeroized on drop.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::NodeError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added by one seal: nonce prefix plus authentication tag.
pub const AEAD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Domain label for deriving the at-rest storage key from the identity seed.
const STORAGE_KEY_DOMAIN: &[u8] = b"haven-storage-v1";

/// A 256-bit ChaCha20-Poly1305 key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive a per-layer session key from an X25519 shared secret.
///
/// HKDF-SHA256 with empty salt and empty info; both the layer builder and
/// the peeling node must agree on this exact derivation.
pub fn derive_session_key(shared: &SharedSecret) -> SymmetricKey {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(&[], &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SymmetricKey(okm)
}

/// Derive the at-rest storage key from the node's identity seed.
///
/// Deterministic so blobs written in one run stay readable in the next
/// without a second key file on disk.
pub fn derive_storage_key(identity_seed: &[u8; 32]) -> SymmetricKey {
    let hk = Hkdf::<Sha256>::new(None, identity_seed);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(STORAGE_KEY_DOMAIN, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SymmetricKey(okm)
}

/// Encrypt `plaintext`, returning `nonce || ciphertext || tag` with a fresh
/// random nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, NodeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| NodeError::SealFailure)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` record produced by [`seal`].
pub fn open(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, NodeError> {
    if sealed.len() < AEAD_OVERHEAD {
        return Err(NodeError::DecryptFailure);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| NodeError::DecryptFailure)
}
