//! Peer-to-peer shared text editing.
//!
//! Each document has an owner peer that orders every edit into a linear
//! revision history; other peers keep replicas in step by exchanging patches
//! with it. See [`sync`] for the core, [`patch`] for the diff/patch
//! primitive, [`transport`] for delivery and [`editor`] for the view port.

pub mod config;
pub mod editor;
pub mod patch;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, NodeConfig};
pub use editor::{EditorCommand, EditorView, HeadlessEditor};
pub use sync::{SyncConfig, SyncController, SyncError, SyncNode, SyncResult};
