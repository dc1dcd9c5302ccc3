//! # Kademlia Routing Table
//!
//! 256 buckets over the XOR metric, indexed by the position of the highest
//! bit at which a contact's id differs from the local id. Each bucket holds
//! at most `k` contacts in least-recently-seen order: head is the oldest,
//! a freshly observed contact moves to the tail.
//!
//! When a bucket is full the new contact is discarded.
//! TODO: ping-head eviction once the dispatcher exposes a liveness probe.
//!
//! Invariants: a contact appears in exactly one bucket, the local id is
//! never inserted, and every contact in bucket `i` shares the first `i`
//! bits of the local id.
//!
//! Locking is per bucket; full-table walks take each bucket lock briefly
//! rather than freezing the table.

use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::identity::{distance_cmp, Contact, NodeId};

pub const BUCKET_COUNT: usize = 256;

#[derive(Debug, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

impl Bucket {
    /// Insert or refresh `contact`; returns false when a full bucket
    /// forced a discard.
    fn touch(&mut self, contact: Contact, k: usize) -> bool {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            let mut existing = self.contacts.remove(pos);
            existing.endpoint = contact.endpoint;
            existing.touch();
            self.contacts.push(existing);
            return true;
        }
        if self.contacts.len() < k {
            self.contacts.push(contact);
            return true;
        }
        false
    }
}

/// Index of the most significant differing bit, clamped to 255 (used for
/// ids equal to the local id, which callers filter out beforehand).
fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(Mutex::new(Bucket::default()));
        }
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Observe a contact. The local id is never inserted; a known contact
    /// is refreshed and moved to the tail of its bucket.
    pub fn add_contact(&self, contact: Contact) {
        if contact.node_id == self.self_id {
            return;
        }
        let idx = bucket_index(&self.self_id, &contact.node_id);
        let mut bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        if !bucket.touch(contact, self.k) {
            tracing::trace!(bucket = idx, "bucket full, discarding new contact");
        }
    }

    /// Up to `n` contacts closest to `target`, ascending by XOR distance.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        if n == 0 {
            return Vec::new();
        }

        #[derive(Debug)]
        struct Candidate {
            dist: [u8; 32],
            contact: Contact,
        }
        impl PartialEq for Candidate {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for Candidate {}
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap capped at n: the root is the farthest kept candidate.
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(n + 1);
        for slot in &self.buckets {
            let bucket = slot.lock().expect("bucket lock poisoned");
            for contact in &bucket.contacts {
                let dist = contact.node_id.xor_distance(target);
                if heap.len() < n {
                    heap.push(Candidate {
                        dist,
                        contact: contact.clone(),
                    });
                } else if let Some(farthest) = heap.peek() {
                    if distance_cmp(&dist, &farthest.dist) == std::cmp::Ordering::Less {
                        heap.push(Candidate {
                            dist,
                            contact: contact.clone(),
                        });
                        heap.pop();
                    }
                }
            }
        }

        let mut result: Vec<Candidate> = heap.into_iter().collect();
        result.sort_by(|a, b| distance_cmp(&a.dist, &b.dist));
        result.into_iter().map(|c| c.contact).collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        let bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        bucket.contacts.iter().any(|c| c.node_id == *id)
    }

    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("bucket lock poisoned").contacts.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
