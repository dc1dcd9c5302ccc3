//! # Wire Framing
//!
//! Binary codecs for everything that crosses the network:
//!
//! - the fixed 16-byte [`FrameHeader`] carried in front of every payload
//! - [`MessageType`] dispatch codes
//! - endpoint and contact-list encodings used by FIND_NODE responses
//!
//! All multi-byte integers are big-endian. Encoders write deterministically;
//! decoders fail with `MalformedFrame` on truncated input or implausible
//! declared lengths rather than panicking. Unknown message-type bytes decode
//! to [`MessageType::Unknown`] so future codes degrade to a logged drop
//! instead of a hard error.

use std::net::{IpAddr, SocketAddr};

use crate::error::NodeError;
use crate::identity::{Contact, NodeId};

pub const HEADER_LEN: usize = 16;
pub const PROTOCOL_VERSION: u8 = 1;

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    Onion = 0x02,
    FindNode = 0x03,
    FindNodeRes = 0x04,
    Store = 0x05,
    StoreRes = 0x06,
    Fetch = 0x07,
    FetchRes = 0x08,
    /// Negative FETCH response: the requested digest is not held here.
    FetchMiss = 0x09,
    PutValue = 0x10,
    GetValue = 0x11,
    GetValueRes = 0x12,
    Unknown = 0xFF,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => MessageType::Handshake,
            0x02 => MessageType::Onion,
            0x03 => MessageType::FindNode,
            0x04 => MessageType::FindNodeRes,
            0x05 => MessageType::Store,
            0x06 => MessageType::StoreRes,
            0x07 => MessageType::Fetch,
            0x08 => MessageType::FetchRes,
            0x09 => MessageType::FetchMiss,
            0x10 => MessageType::PutValue,
            0x11 => MessageType::GetValue,
            0x12 => MessageType::GetValueRes,
            _ => MessageType::Unknown,
        }
    }
}

impl MessageType {
    /// Whether frames of this type answer an outstanding request and are
    /// offered to the request ledger before any handler.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::FindNodeRes
                | MessageType::StoreRes
                | MessageType::FetchRes
                | MessageType::FetchMiss
                | MessageType::GetValueRes
        )
    }
}

// ============================================================================
// Fixed header
// ============================================================================

/// The 16-byte frame header:
/// `version | flags | type | reserved | request_id(4) | payload_len(4) | crc32(4)`.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub message_type: MessageType,
    pub reserved: u8,
    pub request_id: u32,
    pub payload_length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Build a header for `payload`, computing its CRC32.
    pub fn for_payload(message_type: MessageType, request_id: u32, payload: &[u8]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            message_type,
            reserved: 0,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.flags;
        bytes[2] = self.message_type as u8;
        bytes[3] = self.reserved;
        bytes[4..8].copy_from_slice(&self.request_id.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(NodeError::MalformedFrame("header truncated"));
        }
        Ok(Self {
            version: bytes[0],
            flags: bytes[1],
            message_type: MessageType::from(bytes[2]),
            reserved: bytes[3],
            request_id: u32::from_be_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            payload_length: u32::from_be_bytes(bytes[8..12].try_into().expect("4-byte slice")),
            checksum: u32::from_be_bytes(bytes[12..16].try_into().expect("4-byte slice")),
        })
    }

    /// Check the recorded CRC32 against the actual payload bytes.
    pub fn verify_checksum(&self, payload: &[u8]) -> Result<(), NodeError> {
        let computed = crc32fast::hash(payload);
        if computed != self.checksum {
            return Err(NodeError::ChecksumMismatch {
                expected: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Endpoint and contact-list codecs
// ============================================================================

/// Append `ip_len(1) | ip | port(2 BE)` for `endpoint`.
pub fn encode_endpoint(endpoint: &SocketAddr, out: &mut Vec<u8>) {
    match endpoint.ip() {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&endpoint.port().to_be_bytes());
}

/// Decode one endpoint from the front of `bytes`, returning it together with
/// the number of bytes consumed.
pub fn decode_endpoint(bytes: &[u8]) -> Result<(SocketAddr, usize), NodeError> {
    let ip_len = *bytes
        .first()
        .ok_or(NodeError::MalformedFrame("endpoint truncated"))? as usize;
    if ip_len != 4 && ip_len != 16 {
        return Err(NodeError::MalformedFrame("endpoint ip length"));
    }
    let needed = 1 + ip_len + 2;
    if bytes.len() < needed {
        return Err(NodeError::MalformedFrame("endpoint truncated"));
    }

    let ip = if ip_len == 4 {
        let octets: [u8; 4] = bytes[1..5].try_into().expect("4-byte slice");
        IpAddr::from(octets)
    } else {
        let octets: [u8; 16] = bytes[1..17].try_into().expect("16-byte slice");
        IpAddr::from(octets)
    };
    let port = u16::from_be_bytes(bytes[1 + ip_len..needed].try_into().expect("2-byte slice"));
    Ok((SocketAddr::new(ip, port), needed))
}

/// Encode a FIND_NODE response:
/// `count(1) | count x { node_id(32) | ip_len(1) | ip | port(2 BE) }`.
///
/// At most 255 contacts fit in the count byte; callers pass at most `k`.
pub fn encode_contacts(contacts: &[Contact], out: &mut Vec<u8>) {
    let count = contacts.len().min(u8::MAX as usize);
    out.push(count as u8);
    for contact in &contacts[..count] {
        out.extend_from_slice(contact.node_id.as_bytes());
        encode_endpoint(&contact.endpoint, out);
    }
}

pub fn decode_contacts(bytes: &[u8]) -> Result<Vec<Contact>, NodeError> {
    let count = *bytes
        .first()
        .ok_or(NodeError::MalformedFrame("contact list truncated"))? as usize;
    let mut offset = 1;
    let mut contacts = Vec::with_capacity(count);

    for _ in 0..count {
        if bytes.len() < offset + 32 {
            return Err(NodeError::MalformedFrame("contact list truncated"));
        }
        let id_bytes: [u8; 32] = bytes[offset..offset + 32]
            .try_into()
            .expect("32-byte slice");
        offset += 32;

        let (endpoint, consumed) = decode_endpoint(&bytes[offset..])?;
        offset += consumed;

        contacts.push(Contact::new(NodeId::from_bytes(id_bytes), endpoint));
    }
    Ok(contacts)
}
