//! Per-peer document registry and message routing.
//!
//! The controller holds every document this peer knows about and decides,
//! per message, whether the owner sequencer or the replica merger handles
//! it. It never does I/O itself: outgoing messages are queued on an outbox
//! channel that the runtime drains.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::document::{Document, DocumentDto, UpdateDto};
use super::merger::ReplicaMerger;
use super::protocol::{DeliveryFailure, Envelope, PeerMessage};
use super::sequencer::OwnerSequencer;
use super::{ContentHash, DocumentId, HostAddress, MemberName, RevisionId, SyncConfig, SyncResult};
use crate::editor::{EditorCommand, EditorView};

/// What a handler may touch besides the document: the local identity, the
/// view, and a buffer for the messages it wants sent.
pub struct PeerContext<'a> {
    pub member: &'a str,
    pub host: &'a str,
    pub editor: &'a dyn EditorView,
    outgoing: Vec<Envelope>,
}

impl<'a> PeerContext<'a> {
    pub fn new(member: &'a str, host: &'a str, editor: &'a dyn EditorView) -> Self {
        Self {
            member,
            host,
            editor,
            outgoing: Vec::new(),
        }
    }

    pub fn send_to(&mut self, host: &str, message: PeerMessage) {
        self.outgoing.push(Envelope::to(host, message));
    }

    pub fn into_outgoing(self) -> Vec<Envelope> {
        self.outgoing
    }
}

/// Behaviour of a peer toward one document, depending on whether it owns it.
pub trait DocumentRole: Send + Sync {
    /// An update arrived from another peer.
    fn on_update(&self, doc: &mut Document, dto: UpdateDto, ctx: &mut PeerContext<'_>) -> SyncResult<()>;

    /// The local user changed the text to `text`.
    fn on_local_edit(&self, doc: &mut Document, text: &str, ctx: &mut PeerContext<'_>) -> SyncResult<()>;
}

/// Read-only view of a registered document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub owner: MemberName,
    pub owner_host: HostAddress,
    pub is_owner: bool,
    pub revision_id: RevisionId,
    pub hash: String,
    pub content: String,
    pub editor_count: usize,
    pub has_pending_update: bool,
    pub created_at: DateTime<Utc>,
}

/// Controller statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub owned_documents: usize,
    pub replica_documents: usize,
    pub pending_requests: usize,
}

pub struct SyncController {
    member: MemberName,
    host: HostAddress,
    config: SyncConfig,
    documents: DashMap<DocumentId, Arc<Mutex<Document>>>,
    /// Documents we asked the mesh for, and since when
    pending_requests: DashMap<DocumentId, DateTime<Utc>>,
    sequencer: OwnerSequencer,
    merger: ReplicaMerger,
    editor: Arc<dyn EditorView>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl SyncController {
    pub fn new(
        member: impl Into<String>,
        host: impl Into<String>,
        config: SyncConfig,
        editor: Arc<dyn EditorView>,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let sequencer = OwnerSequencer::new(config.reactive_window);
        Self {
            member: member.into(),
            host: host.into(),
            config,
            documents: DashMap::new(),
            pending_requests: DashMap::new(),
            sequencer,
            merger: ReplicaMerger::new(),
            editor,
            outbox,
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Handle a message from another peer
    pub fn handle_message(&self, message: PeerMessage) {
        match message {
            PeerMessage::FindDocument {
                host,
                document_id,
                member_name,
            } => self.on_find_document(&host, &document_id, &member_name),
            PeerMessage::OpenDocument(dto) => self.on_open_document(dto),
            PeerMessage::UpdateRequest(dto) => {
                let id = dto.document_id.clone();
                if !self.documents.contains_key(&id) {
                    self.on_update_for_unknown(dto);
                    return;
                }
                self.with_document(&id, |doc, ctx| self.role_for(doc).on_update(doc, dto, ctx));
            }
            PeerMessage::AckRequest(ack) => {
                let id = ack.document_id.clone();
                self.with_document(&id, |doc, ctx| {
                    if doc.is_owned_by(&self.member) {
                        debug!("Ignoring ack for owned document {}", doc.id);
                        return Ok(());
                    }
                    self.merger.acknowledge(doc, ack, ctx)
                });
            }
            PeerMessage::OwnershipChanged {
                document_id,
                owner,
                owner_host,
                revision_id,
                hash,
            } => self.on_ownership_changed(&document_id, owner, owner_host, revision_id, hash),
            PeerMessage::Reload { document_id, host } => {
                let from_owner = self.document(&document_id).is_some_and(|doc| {
                    let doc = doc.lock();
                    !doc.is_owned_by(&self.member) && doc.owner_host == host
                });
                if from_owner {
                    self.reopen(&document_id, "owner rejected our update");
                } else {
                    debug!("Ignoring reload of {} from {}", document_id, host);
                }
            }
        }
    }

    /// Handle an intent of the local user
    pub fn handle_command(&self, command: EditorCommand) {
        match command {
            EditorCommand::CreateDocument { id } => self.create_document(&id),
            EditorCommand::UpdateDocument { id, new_text } => self.local_edit(&id, &new_text),
            EditorCommand::RemoveDocument { id } => self.remove_document(&id),
            EditorCommand::FindDocumentRequest { id } => self.request_document(&id),
            EditorCommand::TakeOwnership { id } => self.take_ownership(&id),
        }
    }

    /// Handle a message the runtime could not deliver
    pub fn handle_delivery_failure(&self, failure: DeliveryFailure) {
        let DeliveryFailure { host, message } = failure;
        let id = message.document_id().to_string();
        let Some(entry) = self.document(&id) else {
            debug!("Delivery to {} failed for unknown document {}", host, id);
            return;
        };

        let mut doc = entry.lock();
        if doc.is_owned_by(&self.member) {
            let pruned = doc.prune_host(&host);
            if pruned > 0 {
                let count = doc.editor_count();
                drop(doc);
                warn!("Removed {} unreachable editor(s) at {} from {}", pruned, host, id);
                self.editor.update_number_of_editors(&id, count);
            }
        } else if doc.owner_host == host {
            drop(doc);
            warn!("Owner of {} at {} is unreachable", id, host);
            self.editor.server_unreachable(&id);
        } else {
            debug!("Delivery to {} failed for {}", host, id);
        }
    }

    /// Throw away local state for a document and fetch it again from its
    /// owner.
    pub fn reopen(&self, id: &str, reason: &str) {
        warn!("Reopening {}: {}", id, reason);
        self.documents.remove(id);
        self.pending_requests.insert(id.to_string(), Utc::now());
        self.editor.close_document(id);
        self.editor.reload_document(id);
        self.send(Envelope::mesh(self.find_document(id)));
    }

    pub fn snapshot(&self, id: &str) -> Option<DocumentSnapshot> {
        self.document(id).map(|entry| self.summarize(&entry.lock()))
    }

    pub fn list(&self) -> Vec<DocumentSnapshot> {
        let mut snapshots: Vec<_> = self
            .documents
            .iter()
            .map(|entry| self.summarize(&entry.value().lock()))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn has_pending_request(&self, id: &str) -> bool {
        self.pending_requests.contains_key(id)
    }

    /// Whether the document is registered or has been asked for
    pub fn tracks(&self, id: &str) -> bool {
        self.documents.contains_key(id) || self.has_pending_request(id)
    }

    /// Get controller statistics
    pub fn stats(&self) -> ControllerStats {
        let owned = self
            .documents
            .iter()
            .filter(|entry| entry.value().lock().is_owned_by(&self.member))
            .count();
        ControllerStats {
            owned_documents: owned,
            replica_documents: self.documents.len() - owned,
            pending_requests: self.pending_requests.len(),
        }
    }

    fn role_for(&self, doc: &Document) -> &dyn DocumentRole {
        if doc.is_owned_by(&self.member) {
            &self.sequencer
        } else {
            &self.merger
        }
    }

    fn document(&self, id: &str) -> Option<Arc<Mutex<Document>>> {
        self.documents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Run `f` on a registered document and ship whatever it sent. A replica
    /// that fails is reopened.
    fn with_document<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut Document, &mut PeerContext<'_>) -> SyncResult<()>,
    {
        let Some(entry) = self.document(id) else {
            debug!("Ignoring message for unknown document {}", id);
            return;
        };

        let mut ctx = PeerContext::new(&self.member, &self.host, self.editor.as_ref());
        let (owned, result) = {
            let mut doc = entry.lock();
            let result = f(&mut *doc, &mut ctx);
            (doc.is_owned_by(&self.member), result)
        };
        for envelope in ctx.into_outgoing() {
            self.send(envelope);
        }

        if let Err(e) = result {
            if owned {
                error!("Owned document {} failed to update: {}", id, e);
            } else {
                self.reopen(id, &e.to_string());
            }
        }
    }

    fn check_size(&self, text: &str) -> SyncResult<()> {
        Ok(Document::check_size(text, self.config.max_document_size)?)
    }

    fn send(&self, envelope: Envelope) {
        if self.outbox.send(envelope).is_err() {
            warn!("Outbox closed, dropping message");
        }
    }

    fn find_document(&self, id: &str) -> PeerMessage {
        PeerMessage::FindDocument {
            host: self.host.clone(),
            document_id: id.to_string(),
            member_name: self.member.clone(),
        }
    }

    fn summarize(&self, doc: &Document) -> DocumentSnapshot {
        DocumentSnapshot {
            id: doc.id.clone(),
            owner: doc.owner.clone(),
            owner_host: doc.owner_host.clone(),
            is_owner: doc.is_owned_by(&self.member),
            revision_id: doc.current_revision_id,
            hash: doc.current_hash.to_string(),
            content: doc.content.clone(),
            editor_count: doc.editor_count(),
            has_pending_update: doc.pending_update.is_some(),
            created_at: doc.created_at,
        }
    }

    fn on_find_document(&self, host: &str, id: &str, member: &str) {
        if host == self.host {
            return;
        }
        let Some(entry) = self.document(id) else {
            return;
        };

        let (dto, count) = {
            let mut doc = entry.lock();
            if !doc.is_owned_by(&self.member) {
                return;
            }
            let count = doc.register_editor(member, host);
            (doc.to_dto(), count)
        };

        info!("{} at {} opened {} ({} editors)", member, host, id, count);
        self.send(Envelope::to(host, PeerMessage::OpenDocument(dto)));
        self.editor.update_number_of_editors(id, count);
    }

    /// A proposal for a document we do not hold, most likely because we
    /// owned it and closed it. The proposer would wait forever for an ack.
    fn on_update_for_unknown(&self, dto: UpdateDto) {
        let id = dto.document_id;
        if self.has_pending_request(&id) || dto.member_host == self.host {
            debug!("Ignoring update for {} while it is not open", id);
            return;
        }
        debug!("Update from {} for unknown document {}", dto.member_name, id);
        self.send(Envelope::to(
            &dto.member_host,
            PeerMessage::Reload {
                document_id: id,
                host: self.host.clone(),
            },
        ));
    }

    fn on_open_document(&self, dto: DocumentDto) {
        let id = dto.document_id.clone();
        if self.pending_requests.remove(&id).is_none() {
            debug!("Ignoring unrequested document {}", id);
            return;
        }

        self.documents
            .insert(id.clone(), Arc::new(Mutex::new(Document::open(&dto))));
        self.editor.update_text(&id, &dto.content);
        self.editor.update_number_of_editors(&id, dto.editor_count);
        info!(
            "Opened {} at revision {} from {}",
            id, dto.revision_id, dto.owner
        );
    }

    fn on_ownership_changed(
        &self,
        id: &str,
        owner: MemberName,
        owner_host: HostAddress,
        revision_id: RevisionId,
        hash: ContentHash,
    ) {
        let Some(entry) = self.document(id) else {
            return;
        };
        {
            let mut doc = entry.lock();
            if doc.owner == owner {
                return;
            }
            info!(
                "{} now owns {} (revision {}, {:?})",
                owner, id, revision_id, hash
            );
            doc.owner = owner;
            doc.owner_host = owner_host;
        }
        self.reopen(id, "ownership changed");
    }

    fn create_document(&self, id: &str) {
        let content = self.editor.get_text(id).unwrap_or_default();
        if let Err(e) = self.check_size(&content) {
            warn!("Not sharing {}: {}", id, e);
            return;
        }

        match self.documents.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Document {} already exists", id);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let doc = Document::create(id, self.member.as_str(), self.host.as_str(), content);
                slot.insert(Arc::new(Mutex::new(doc)));
                self.editor.update_number_of_editors(id, 1);
                info!("Created document {}", id);
            }
        }
    }

    fn local_edit(&self, id: &str, text: &str) {
        if let Err(e) = self.check_size(text) {
            warn!("Ignoring edit of {}: {}", id, e);
            return;
        }
        self.with_document(id, |doc, ctx| self.role_for(doc).on_local_edit(doc, text, ctx));
    }

    fn remove_document(&self, id: &str) {
        self.pending_requests.remove(id);
        if self.documents.remove(id).is_some() {
            info!("Removed document {}", id);
        }
    }

    fn request_document(&self, id: &str) {
        if self.documents.contains_key(id) {
            debug!("Document {} is already open", id);
            return;
        }
        self.pending_requests.insert(id.to_string(), Utc::now());
        self.send(Envelope::mesh(self.find_document(id)));
    }

    fn take_ownership(&self, id: &str) {
        let Some(entry) = self.document(id) else {
            warn!("Cannot take ownership of unknown document {}", id);
            return;
        };

        let announcement = {
            let mut doc = entry.lock();
            if doc.is_owned_by(&self.member) {
                return;
            }
            doc.take_ownership(&self.member, &self.host);
            PeerMessage::OwnershipChanged {
                document_id: id.to_string(),
                owner: self.member.clone(),
                owner_host: self.host.clone(),
                revision_id: doc.current_revision_id,
                hash: doc.current_hash,
            }
        };
        info!("Took ownership of {}", id);
        self.send(Envelope::mesh(announcement));
        self.editor.update_number_of_editors(id, 1);

        // Edits made while the old owner was gone become the first revision
        if let Some(screen) = self.editor.get_text(id) {
            self.local_edit(id, &screen);
        }
    }
}
