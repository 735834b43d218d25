//! Binary peer-to-peer protocol.
//!
//! This module defines the messages peers exchange and their wire format.
//! Every frame is a protocol version byte, a message type byte, a 24-bit
//! big-endian payload length and the bincode-encoded message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::document::{AcknowledgeDto, DocumentDto, UpdateDto};
use super::hash::ContentHash;
use super::{DocumentId, HostAddress, MemberName, RevisionId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size; the 24-bit length field caps payloads just under 16MB
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame header
const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Discovery
    FindDocument = 0x01,
    OpenDocument = 0x02,

    // Revision stream
    UpdateRequest = 0x10,
    AckRequest = 0x11,

    // Ownership & recovery
    OwnershipChanged = 0x20,
    Reload = 0x21,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::FindDocument),
            0x02 => Ok(MessageType::OpenDocument),
            0x10 => Ok(MessageType::UpdateRequest),
            0x11 => Ok(MessageType::AckRequest),
            0x20 => Ok(MessageType::OwnershipChanged),
            0x21 => Ok(MessageType::Reload),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Message type mismatch: header says {0:?}, payload is {1:?}")]
    TypeMismatch(MessageType, MessageType),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Ask the mesh who owns a document
    FindDocument {
        host: HostAddress,
        document_id: DocumentId,
        member_name: MemberName,
    },

    /// Owner's answer to FindDocument with the full current state
    OpenDocument(DocumentDto),

    /// A proposal to the owner, or an accepted revision from the owner
    UpdateRequest(UpdateDto),

    /// Owner's confirmation of a proposal
    AckRequest(AcknowledgeDto),

    /// A peer took over a document
    OwnershipChanged {
        document_id: DocumentId,
        owner: MemberName,
        owner_host: HostAddress,
        revision_id: RevisionId,
        hash: ContentHash,
    },

    /// Owner could not place a proposal, or no longer holds the document;
    /// the proposer must reopen
    Reload {
        document_id: DocumentId,
        /// Host of the peer sending it
        host: HostAddress,
    },
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::FindDocument { .. } => MessageType::FindDocument,
            PeerMessage::OpenDocument(_) => MessageType::OpenDocument,
            PeerMessage::UpdateRequest(_) => MessageType::UpdateRequest,
            PeerMessage::AckRequest(_) => MessageType::AckRequest,
            PeerMessage::OwnershipChanged { .. } => MessageType::OwnershipChanged,
            PeerMessage::Reload { .. } => MessageType::Reload,
        }
    }

    /// Document the message is about
    pub fn document_id(&self) -> &str {
        match self {
            PeerMessage::FindDocument { document_id, .. } => document_id,
            PeerMessage::OpenDocument(dto) => &dto.document_id,
            PeerMessage::UpdateRequest(dto) => &dto.document_id,
            PeerMessage::AckRequest(ack) => &ack.document_id,
            PeerMessage::OwnershipChanged { document_id, .. } => document_id,
            PeerMessage::Reload { document_id, .. } => document_id,
        }
    }
}

/// Where an outgoing message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A single peer
    Host(HostAddress),
    /// Every known peer except ourselves
    Mesh,
}

/// An outgoing message and its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: Destination,
    pub message: PeerMessage,
}

impl Envelope {
    pub fn to(host: impl Into<String>, message: PeerMessage) -> Self {
        Self {
            destination: Destination::Host(host.into()),
            message,
        }
    }

    pub fn mesh(message: PeerMessage) -> Self {
        Self {
            destination: Destination::Mesh,
            message,
        }
    }
}

/// A message that could not be delivered to `host`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub host: HostAddress,
    pub message: PeerMessage,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a peer message to bytes
    pub fn encode(msg: &PeerMessage) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg.message_type() as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a peer message from bytes
    pub fn decode(data: &[u8]) -> Result<PeerMessage, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        let msg: PeerMessage = bincode::deserialize(payload)?;

        if msg.message_type() != msg_type {
            return Err(ProtocolError::TypeMismatch(msg_type, msg.message_type()));
        }

        Ok(msg)
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch;

    fn update() -> UpdateDto {
        UpdateDto {
            document_id: "doc-123".to_string(),
            member_name: "anna".to_string(),
            member_host: "http://10.0.0.2:9000".to_string(),
            previous_revision_id: 4,
            previous_hash: ContentHash::of("test"),
            new_revision_id: 5,
            new_hash: ContentHash::of("tests"),
            patch: patch::make("test", "tests"),
            editor_count: 3,
        }
    }

    #[test]
    fn test_encode_decode_update_request() {
        let msg = PeerMessage::UpdateRequest(update());

        let encoded = SyncProtocol::encode(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::UpdateRequest as u8);

        let decoded = SyncProtocol::decode(&encoded).unwrap();
        match decoded {
            PeerMessage::UpdateRequest(dto) => {
                assert_eq!(dto.document_id, "doc-123");
                assert_eq!(dto.previous_revision_id, 4);
                assert_eq!(patch::apply(&dto.patch, "test").text, "tests");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_encode_decode_find_document() {
        let msg = PeerMessage::FindDocument {
            host: "http://10.0.0.3:9000".to_string(),
            document_id: "notes".to_string(),
            member_name: "bob".to_string(),
        };

        let encoded = SyncProtocol::encode(&msg).unwrap();
        let decoded = SyncProtocol::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.document_id(), "notes");
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode(&PeerMessage::Reload {
            document_id: "notes".to_string(),
            host: "http://a".to_string(),
        })
        .unwrap();
        // Corrupt version
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_type_byte_must_match_payload() {
        let data = SyncProtocol::encode(&PeerMessage::Reload {
            document_id: "notes".to_string(),
            host: "http://a".to_string(),
        })
        .unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::AckRequest as u8;

        let result = SyncProtocol::decode(&bytes);
        assert!(matches!(
            result,
            Err(ProtocolError::TypeMismatch(
                MessageType::AckRequest,
                MessageType::Reload
            ))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let data = SyncProtocol::encode(&PeerMessage::UpdateRequest(update())).unwrap();
        let result = SyncProtocol::decode(&data[..data.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(matches!(
            SyncProtocol::decode(&[PROTOCOL_VERSION, 0x01]),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::FindDocument);
        assert_eq!(MessageType::try_from(0x11).unwrap(), MessageType::AckRequest);
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_envelope_constructors() {
        let msg = PeerMessage::Reload {
            document_id: "notes".to_string(),
            host: "http://a".to_string(),
        };
        assert_eq!(
            Envelope::to("http://a", msg.clone()).destination,
            Destination::Host("http://a".to_string())
        );
        assert_eq!(Envelope::mesh(msg).destination, Destination::Mesh);
    }
}
