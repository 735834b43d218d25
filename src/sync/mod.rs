//! Document synchronization between peers.
//!
//! Every shared document has one owner peer that serializes concurrent edits
//! into a linear revision history. All other peers hold replicas that apply
//! the owner's patches and reconcile them with their own in-flight edit.
//! It provides:
//! - The document aggregate (revisions, buffers, editor set)
//! - The owner-side sequencer and the replica-side merger
//! - A controller routing peer messages and editor commands per document
//! - A binary framing for peer messages and the async runtime around it

pub mod controller;
pub mod document;
pub mod hash;
pub mod merger;
pub mod protocol;
pub mod sequencer;
pub mod server;

pub use controller::SyncController;
pub use document::{AcknowledgeDto, Document, UpdateDto};
pub use hash::ContentHash;
pub use server::{SyncNode, SyncNodeHandles};

/// Unique identifier for a shared document
pub type DocumentId = String;

/// Name a peer goes by in the mesh
pub type MemberName = String;

/// Address other peers use to reach a peer (e.g. `http://10.0.0.2:9000`)
pub type HostAddress = String;

/// Position of a revision in a document's history
pub type RevisionId = i64;

/// Id of the synthetic revision a document starts from
pub const FIRST_REVISION_ID: RevisionId = 0;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A revision the update builds on is unknown
    RevisionNotFound(RevisionId),
    /// The base revision fell out of the reactive window
    OutsideWindow {
        base: RevisionId,
        current: RevisionId,
    },
    /// A patch could not be located in the text it was applied to
    PatchFailed(String),
    /// Content hash differs from the one the owner announced
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    /// A second message arrived while the single buffer slot was taken
    OutOfSyncOverflow,
    /// Document exceeds the configured size
    DocumentTooLarge(usize, usize),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::RevisionNotFound(id) => write!(f, "Revision not found: {}", id),
            SyncError::OutsideWindow { base, current } => write!(
                f,
                "Revision {} is too old to merge against revision {}",
                base, current
            ),
            SyncError::PatchFailed(what) => write!(f, "Patch failed: {}", what),
            SyncError::HashMismatch { expected, actual } => {
                write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
            }
            SyncError::OutOfSyncOverflow => write!(f, "Too many out-of-sync messages"),
            SyncError::DocumentTooLarge(size, max) => {
                write!(f, "Document too large: {} bytes (max: {})", size, max)
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<document::DocumentError> for SyncError {
    fn from(err: document::DocumentError) -> Self {
        match err {
            document::DocumentError::RevisionNotFound(id) => SyncError::RevisionNotFound(id),
            document::DocumentError::HashMismatch { expected, actual } => {
                SyncError::HashMismatch { expected, actual }
            }
            document::DocumentError::TooLarge(size, max) => SyncError::DocumentTooLarge(size, max),
        }
    }
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many revisions behind the current one a proposal may be based on
    /// and still be merged by replay
    pub reactive_window: usize,
    /// Maximum document size in bytes
    pub max_document_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reactive_window: 20,
            max_document_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::DocumentTooLarge(20, 8);
        assert_eq!(err.to_string(), "Document too large: 20 bytes (max: 8)");

        let err = SyncError::OutsideWindow { base: 2, current: 40 };
        assert_eq!(
            err.to_string(),
            "Revision 2 is too old to merge against revision 40"
        );
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.reactive_window, 20);
        assert_eq!(config.max_document_size, 16 * 1024 * 1024);
    }
}
