//! Editor port.
//!
//! The sync core never talks to a UI directly. It reads and writes the
//! on-screen text through [`EditorView`] and receives the user's intents as
//! [`EditorCommand`]s.

mod headless;

pub use headless::HeadlessEditor;

use serde::{Deserialize, Serialize};

use crate::sync::DocumentId;

/// What the sync core needs from the view of open documents.
///
/// Implementations are shared between document workers and must be
/// callable through a shared reference.
pub trait EditorView: Send + Sync {
    /// Text currently on screen, if the document is open in the view.
    fn get_text(&self, id: &str) -> Option<String>;

    /// Replace the on-screen text.
    fn update_text(&self, id: &str, text: &str);

    /// The document is being fetched again from its owner.
    fn reload_document(&self, id: &str);

    /// Drop whatever the view shows for the document.
    fn close_document(&self, id: &str);

    /// The owner of the document could not be reached.
    fn server_unreachable(&self, id: &str);

    fn update_number_of_editors(&self, id: &str, count: usize);
}

/// User intents forwarded to the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorCommand {
    /// Share the text currently open under `id`, becoming its owner
    CreateDocument { id: DocumentId },
    /// The user changed the text
    UpdateDocument { id: DocumentId, new_text: String },
    RemoveDocument { id: DocumentId },
    /// Ask the mesh for a document owned elsewhere
    FindDocumentRequest { id: DocumentId },
    TakeOwnership { id: DocumentId },
}

impl EditorCommand {
    pub fn document_id(&self) -> &str {
        match self {
            EditorCommand::CreateDocument { id }
            | EditorCommand::UpdateDocument { id, .. }
            | EditorCommand::RemoveDocument { id }
            | EditorCommand::FindDocumentRequest { id }
            | EditorCommand::TakeOwnership { id } => id,
        }
    }
}
