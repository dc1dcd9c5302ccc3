//! # Request Ledger
//!
//! Correlates outstanding requests with the responses that eventually
//! arrive for them. Request ids come from an atomic counter and are never
//! zero; zero is reserved on the wire for fire-and-forget sends. Wraparound
//! is tolerated, collisions between concurrently outstanding requests are
//! statistically negligible at this scale.
//!
//! The dispatcher offers every response-typed frame here first; a frame
//! that matches no slot (late or duplicate) is dropped by the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::NodeError;
use crate::packet::ResponseFrame;

#[derive(Debug, Default)]
pub struct RequestLedger {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<ResponseFrame>>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next request id, skipping the reserved zero.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Open a response slot for a fresh request id.
    pub fn register(&self) -> (u32, oneshot::Receiver<ResponseFrame>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("ledger lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Fulfill the slot for `id`. Returns false when no such slot exists,
    /// in which case the response is the caller's to discard.
    pub fn complete(&self, id: u32, frame: ResponseFrame) -> bool {
        let slot = self
            .pending
            .lock()
            .expect("ledger lock poisoned")
            .remove(&id);
        match slot {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Await the response for `id`, failing the slot after `timeout`.
    pub async fn wait(
        &self,
        id: u32,
        rx: oneshot::Receiver<ResponseFrame>,
        timeout: Duration,
    ) -> Result<ResponseFrame, NodeError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                // Sender dropped without a response: shutdown.
                self.forget(id);
                Err(NodeError::QueueClosed)
            }
            Err(_) => {
                self.forget(id);
                Err(NodeError::RequestTimeout(id))
            }
        }
    }

    /// Drop the slot for `id`, if it is still open.
    pub fn forget(&self, id: u32) {
        self.pending
            .lock()
            .expect("ledger lock poisoned")
            .remove(&id);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("ledger lock poisoned").len()
    }
}
