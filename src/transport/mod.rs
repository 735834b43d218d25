//! Delivery of peer messages between hosts.
//!
//! This module handles:
//! - The [`Communication`] trait the runtime sends through
//! - HTTP delivery of binary frames to `<host>/sync`
//! - An in-process network for tests

mod http;
mod memory;

pub use http::HttpCommunication;
pub use memory::MemoryNetwork;

use async_trait::async_trait;
use thiserror::Error;

use crate::sync::protocol::{PeerMessage, ProtocolError};
use crate::sync::HostAddress;

/// Errors that can occur while delivering a message
#[derive(Error, Debug)]
pub enum CommunicationError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(HostAddress),

    #[error("Peer {host} rejected the message with status {status}")]
    Rejected { host: HostAddress, status: u16 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Client error: {0}")]
    Client(String),
}

impl CommunicationError {
    /// Whether the peer could not be reached at all, as opposed to having
    /// refused the message
    pub fn is_unreachable(&self) -> bool {
        matches!(self, CommunicationError::PeerUnreachable(_))
    }
}

/// Sends a message to a single peer.
#[async_trait]
pub trait Communication: Send + Sync {
    /// Resolves once the peer has accepted the message.
    async fn send(&self, host: &str, message: &PeerMessage) -> Result<(), CommunicationError>;
}

/// Receiving end of a peer: where decoded inbound messages are handed over.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: PeerMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_peers_count_as_failures() {
        assert!(CommunicationError::PeerUnreachable("http://a".to_string()).is_unreachable());
        assert!(!CommunicationError::Rejected {
            host: "http://a".to_string(),
            status: 413,
        }
        .is_unreachable());
        assert!(!CommunicationError::Client("builder".to_string()).is_unreachable());
    }
}
