//! # Mutable Records
//!
//! A mutable record is a signed, sequence-numbered value published under
//! its owner's Ed25519 key: the DHT's updatable pointer. The value usually
//! carries a manifest digest, so an owner can repoint followers at new
//! content without changing the key they look up.
//!
//! Wire layout: `owner(32) | sequence(8 BE) | signature(64) |
//! value_len(2 BE) | value`. The signature covers `sequence_be || value`.
//!
//! [`RecordStore`] keeps the highest validly-signed sequence per owner,
//! bounded so remote writers cannot grow it without limit.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lru::LruCache;
use tracing::trace;

use crate::error::NodeError;
use crate::identity::IdentityKeypair;

/// Fixed bytes in front of the variable-length value.
pub const RECORD_PREFIX_LEN: usize = 32 + 8 + 64 + 2;

/// Largest value a record can carry (bounded by the u16 length field).
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Owners tracked by a single node's record store.
const RECORD_STORE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutableRecord {
    pub owner: [u8; 32],
    pub sequence: u64,
    pub value: Vec<u8>,
    pub signature: [u8; 64],
}

impl MutableRecord {
    /// Sign `value` under `keypair` at the given sequence number.
    pub fn sign(keypair: &IdentityKeypair, sequence: u64, value: Vec<u8>) -> Self {
        let mut message = Vec::with_capacity(8 + value.len());
        message.extend_from_slice(&sequence.to_be_bytes());
        message.extend_from_slice(&value);
        let signature = keypair.sign(&message).to_bytes();
        Self {
            owner: keypair.public_key_bytes(),
            sequence,
            value,
            signature,
        }
    }

    /// Verify the signature against the declared owner key.
    pub fn verify(&self) -> bool {
        let Ok(owner) = VerifyingKey::from_bytes(&self.owner) else {
            return false;
        };
        let mut message = Vec::with_capacity(8 + self.value.len());
        message.extend_from_slice(&self.sequence.to_be_bytes());
        message.extend_from_slice(&self.value);
        owner
            .verify(&message, &Signature::from_bytes(&self.signature))
            .is_ok()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.value.len() <= MAX_VALUE_LEN, "record value exceeds u16 length field");
        out.reserve(RECORD_PREFIX_LEN + self.value.len());
        out.extend_from_slice(&self.owner);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() < RECORD_PREFIX_LEN {
            return Err(NodeError::MalformedFrame("record truncated"));
        }
        let owner: [u8; 32] = bytes[0..32].try_into().expect("32-byte slice");
        let sequence = u64::from_be_bytes(bytes[32..40].try_into().expect("8-byte slice"));
        let signature: [u8; 64] = bytes[40..104].try_into().expect("64-byte slice");
        let value_len =
            u16::from_be_bytes(bytes[104..106].try_into().expect("2-byte slice")) as usize;
        if bytes.len() != RECORD_PREFIX_LEN + value_len {
            return Err(NodeError::MalformedFrame("record value length"));
        }
        Ok(Self {
            owner,
            sequence,
            value: bytes[RECORD_PREFIX_LEN..].to_vec(),
            signature,
        })
    }
}

/// Bounded per-owner store keeping only the highest valid sequence.
#[derive(Debug)]
pub struct RecordStore {
    inner: Mutex<LruCache<String, MutableRecord>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECORD_STORE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Accept `record` if its signature verifies and its sequence advances
    /// past anything already held for the owner. Returns whether it was
    /// stored.
    pub fn insert(&self, record: MutableRecord) -> bool {
        if !record.verify() {
            trace!(
                owner = %hex::encode(&record.owner[..8]),
                "dropping record with bad signature"
            );
            return false;
        }
        let key = hex::encode(record.owner);
        let mut cache = self.inner.lock().expect("record store lock poisoned");
        if let Some(existing) = cache.peek(&key) {
            if existing.sequence >= record.sequence {
                trace!(
                    owner = %&key[..16],
                    held = existing.sequence,
                    offered = record.sequence,
                    "dropping record with stale sequence"
                );
                return false;
            }
        }
        cache.put(key, record);
        true
    }

    pub fn get(&self, owner: &[u8; 32]) -> Option<MutableRecord> {
        let mut cache = self.inner.lock().expect("record store lock poisoned");
        cache.get(&hex::encode(owner)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("record store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
