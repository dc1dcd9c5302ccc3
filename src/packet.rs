//! Queue element types exchanged with the transport collaborator.
//!
//! The transport feeds [`InboundPacket`]s into the incoming queue (header
//! already split off, payload still in the rented receive buffer) and
//! drains [`OutboundMessage`]s from the outgoing queue, releasing each
//! message's buffer after transmission. Both queues are bounded and apply
//! backpressure by blocking the sender when full.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::buffer::BufferPool;
use crate::config::QUEUE_CAPACITY;
use crate::wire::{FrameHeader, MessageType, HEADER_LEN};

/// One received frame: origin, decoded header, and the payload at the front
/// of the rented backing buffer.
#[derive(Debug)]
pub struct InboundPacket {
    pub origin: SocketAddr,
    pub header: FrameHeader,
    /// Bytes of `buffer` actually occupied by the payload.
    pub payload_len: usize,
    pub buffer: Vec<u8>,
}

impl InboundPacket {
    /// Assemble a packet from a payload, as the transport does after
    /// splitting the frame header off the wire.
    pub fn from_payload(
        pool: &BufferPool,
        origin: SocketAddr,
        header: FrameHeader,
        payload: &[u8],
    ) -> Self {
        let mut buffer = pool.acquire(payload.len());
        buffer[..payload.len()].copy_from_slice(payload);
        Self {
            origin,
            header,
            payload_len: payload.len(),
            buffer,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.payload_len]
    }
}

/// One framed message awaiting transmission. The backing buffer holds
/// `header || payload` in its first `len` bytes and is returned to the pool
/// by whoever consumes the queue.
#[derive(Debug)]
pub struct OutboundMessage {
    pub target: SocketAddr,
    pub len: usize,
    pub buffer: Vec<u8>,
}

impl OutboundMessage {
    /// Frame `payload` for `target` into a freshly rented buffer.
    pub fn frame(
        pool: &BufferPool,
        target: SocketAddr,
        message_type: MessageType,
        request_id: u32,
        payload: &[u8],
    ) -> Self {
        let header = FrameHeader::for_payload(message_type, request_id, payload);
        let len = HEADER_LEN + payload.len();
        let mut buffer = pool.acquire(len);
        buffer[..HEADER_LEN].copy_from_slice(&header.to_bytes());
        buffer[HEADER_LEN..len].copy_from_slice(payload);
        Self {
            target,
            len,
            buffer,
        }
    }

    /// The framed bytes: header followed by payload.
    pub fn framed(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn header(&self) -> Result<FrameHeader, crate::error::NodeError> {
        FrameHeader::from_bytes(self.framed())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_LEN..self.len]
    }
}

/// A response frame copied out of its pooled buffer for delivery to the
/// task awaiting it in the request ledger.
#[derive(Debug)]
pub struct ResponseFrame {
    pub origin: SocketAddr,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

pub type InboundSender = mpsc::Sender<InboundPacket>;
pub type InboundReceiver = mpsc::Receiver<InboundPacket>;
pub type OutboundSender = mpsc::Sender<OutboundMessage>;
pub type OutboundReceiver = mpsc::Receiver<OutboundMessage>;

/// The bounded incoming-packet queue.
pub fn incoming_queue() -> (InboundSender, InboundReceiver) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// The bounded outgoing-message queue.
pub fn outgoing_queue() -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(QUEUE_CAPACITY)
}
