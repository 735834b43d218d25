//! In-memory editor used by the binary and by tests.

use dashmap::DashMap;
use tracing::{debug, warn};

use super::EditorView;
use crate::sync::DocumentId;

#[derive(Debug, Default, Clone)]
struct Tab {
    text: String,
    /// Every text the tab has shown, oldest first
    history: Vec<String>,
    editor_count: usize,
    unreachable: bool,
    reloading: bool,
}

impl Tab {
    fn show(&mut self, text: &str) {
        self.text = text.to_string();
        self.history.push(self.text.clone());
    }
}

/// A view without a screen: one text buffer per open document.
#[derive(Debug, Default)]
pub struct HeadlessEditor {
    tabs: DashMap<DocumentId, Tab>,
}

impl HeadlessEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tab showing `text`, replacing any existing one.
    pub fn open(&self, id: &str, text: &str) {
        let mut tab = Tab::default();
        tab.show(text);
        self.tabs.insert(id.to_string(), tab);
    }

    /// Simulate the user typing until the screen shows `text`.
    pub fn type_text(&self, id: &str, text: &str) {
        self.tabs.entry(id.to_string()).or_default().show(text);
    }

    pub fn history(&self, id: &str) -> Vec<String> {
        self.tabs
            .get(id)
            .map(|tab| tab.history.clone())
            .unwrap_or_default()
    }

    pub fn editor_count(&self, id: &str) -> Option<usize> {
        self.tabs.get(id).map(|tab| tab.editor_count)
    }

    pub fn is_unreachable(&self, id: &str) -> bool {
        self.tabs.get(id).is_some_and(|tab| tab.unreachable)
    }

    /// Whether the tab is waiting for the document to arrive again.
    pub fn is_reloading(&self, id: &str) -> bool {
        self.tabs.get(id).is_some_and(|tab| tab.reloading)
    }

    pub fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.tabs.iter().map(|tab| tab.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl EditorView for HeadlessEditor {
    fn get_text(&self, id: &str) -> Option<String> {
        self.tabs.get(id).map(|tab| tab.text.clone())
    }

    fn update_text(&self, id: &str, text: &str) {
        let mut tab = self.tabs.entry(id.to_string()).or_default();
        tab.show(text);
        tab.reloading = false;
        tab.unreachable = false;
    }

    fn reload_document(&self, id: &str) {
        debug!("Reloading {}", id);
        self.tabs.entry(id.to_string()).or_default().reloading = true;
    }

    fn close_document(&self, id: &str) {
        self.tabs.remove(id);
    }

    fn server_unreachable(&self, id: &str) {
        warn!("Owner of {} is unreachable", id);
        if let Some(mut tab) = self.tabs.get_mut(id) {
            tab.unreachable = true;
        }
    }

    fn update_number_of_editors(&self, id: &str, count: usize) {
        if let Some(mut tab) = self.tabs.get_mut(id) {
            tab.editor_count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_records_every_text() {
        let editor = HeadlessEditor::new();
        editor.open("notes", "a");
        editor.type_text("notes", "ab");
        editor.update_text("notes", "abc");

        assert_eq!(editor.get_text("notes").as_deref(), Some("abc"));
        assert_eq!(editor.history("notes"), vec!["a", "ab", "abc"]);
    }

    #[test]
    fn test_close_and_reload() {
        let editor = HeadlessEditor::new();
        editor.open("notes", "stale");
        editor.close_document("notes");
        assert!(editor.get_text("notes").is_none());

        editor.reload_document("notes");
        assert!(editor.is_reloading("notes"));

        editor.update_text("notes", "fresh");
        assert!(!editor.is_reloading("notes"));
        assert_eq!(editor.history("notes"), vec!["fresh"]);
    }

    #[test]
    fn test_unreachable_and_counts() {
        let editor = HeadlessEditor::new();
        editor.open("notes", "");
        editor.server_unreachable("notes");
        editor.update_number_of_editors("notes", 3);

        assert!(editor.is_unreachable("notes"));
        assert_eq!(editor.editor_count("notes"), Some(3));
        assert!(!editor.is_unreachable("other"));
        assert_eq!(editor.open_documents(), vec!["notes".to_string()]);
    }
}
