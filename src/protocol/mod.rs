//! Core protocol types shared across the session engine
//!
//! This module defines the peer identifier used as a routing handle by the
//! transport layer and the routed packet framing consumed by packet signing.

use crate::error::{Error, Result};

/// Length of the canonical routing identifier used in signed payloads
pub const ROUTING_ID_LEN: usize = 8;

/// Short routing handle assigned by the transport layer.
///
/// Peer ids are ephemeral; the stable identity of a peer is the fingerprint
/// of its static key. In memory the id is a short string (typically 16 hex
/// chars); in canonical signing it is packed into an 8-byte routing id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Pack the id into its canonical 8-byte routing form.
    ///
    /// Hex ids decode to their raw bytes, other ids use their UTF-8 bytes.
    /// Longer ids keep their leading bytes; shorter ids are zero-padded on
    /// the right.
    pub fn routing_bytes(&self) -> [u8; ROUTING_ID_LEN] {
        let raw = if self.0.len() % 2 == 0 && !self.0.is_empty() {
            hex::decode(&self.0).unwrap_or_else(|_| self.0.as_bytes().to_vec())
        } else {
            self.0.as_bytes().to_vec()
        };

        let mut packed = [0u8; ROUTING_ID_LEN];
        let take = raw.len().min(ROUTING_ID_LEN);
        packed[..take].copy_from_slice(&raw[..take]);
        packed
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

/// Packet flags
const FLAG_HAS_RECIPIENT: u8 = 0x01;

/// A routed packet as delivered by the mesh transport.
///
/// The binary layout is owned by the transport; the session core only
/// consumes it through [`RoutedPacket::canonical_bytes_for_signing`], which
/// serializes the packet with the signature field zeroed so signatures cover
/// every header field without self-reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPacket {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: [u8; ROUTING_ID_LEN],
    pub recipient_id: Option<[u8; ROUTING_ID_LEN]>,
    pub payload: Vec<u8>,
    /// Detached Ed25519 signature; empty until signed
    pub signature: Vec<u8>,
}

impl RoutedPacket {
    pub fn new(
        packet_type: u8,
        ttl: u8,
        timestamp_ms: u64,
        sender: &PeerId,
        recipient: Option<&PeerId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 1,
            packet_type,
            ttl,
            timestamp_ms,
            sender_id: sender.routing_bytes(),
            recipient_id: recipient.map(PeerId::routing_bytes),
            payload,
            signature: Vec::new(),
        }
    }

    fn serialize(&self, zero_signature: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.payload.len() + self.signature.len());
        out.push(self.version);
        out.push(self.packet_type);
        out.push(self.ttl);

        let mut flags = 0u8;
        if self.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        out.push(flags);

        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.sender_id);
        if let Some(recipient) = &self.recipient_id {
            out.extend_from_slice(recipient);
        }

        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);

        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        if zero_signature {
            out.resize(out.len() + self.signature.len(), 0);
        } else {
            out.extend_from_slice(&self.signature);
        }
        out
    }

    /// Full wire serialization including the signature field
    pub fn to_bytes(&self) -> Vec<u8> {
        self.serialize(false)
    }

    /// Canonical serialization for signing: the signature field is replaced
    /// with zero bytes of its declared length.
    pub fn canonical_bytes_for_signing(&self) -> Vec<u8> {
        self.serialize(true)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        fn take<'a>(data: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8]> {
            if data.len() - *cursor < n {
                return Err(Error::Crypto("Truncated packet".to_string()));
            }
            let slice = &data[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        }

        let mut cursor = 0usize;
        let header = take(data, &mut cursor, 4)?;
        let (version, packet_type, ttl, flags) = (header[0], header[1], header[2], header[3]);

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(take(data, &mut cursor, 8)?);

        let mut sender_id = [0u8; ROUTING_ID_LEN];
        sender_id.copy_from_slice(take(data, &mut cursor, ROUTING_ID_LEN)?);

        let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
            let mut recipient = [0u8; ROUTING_ID_LEN];
            recipient.copy_from_slice(take(data, &mut cursor, ROUTING_ID_LEN)?);
            Some(recipient)
        } else {
            None
        };

        let mut payload_len = [0u8; 4];
        payload_len.copy_from_slice(take(data, &mut cursor, 4)?);
        let payload = take(data, &mut cursor, u32::from_be_bytes(payload_len) as usize)?.to_vec();

        let mut sig_len = [0u8; 2];
        sig_len.copy_from_slice(take(data, &mut cursor, 2)?);
        let signature = take(data, &mut cursor, u16::from_be_bytes(sig_len) as usize)?.to_vec();

        Ok(Self {
            version,
            packet_type,
            ttl,
            timestamp_ms: u64::from_be_bytes(timestamp),
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }
}
