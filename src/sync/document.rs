//! Shared document model.
//!
//! A [`Document`] is the aggregate both roles work on: the current text and
//! its hash, the append-only revision history, the owner's editor set and
//! the replica's single-slot buffers. Nothing outside the aggregate holds a
//! reference into it; the registry owns it behind a per-document lock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::ContentHash;
use super::{DocumentId, HostAddress, MemberName, RevisionId, FIRST_REVISION_ID};
use crate::patch::{self, Patch};

/// Errors that can occur during document operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Revision not found: {0}")]
    RevisionNotFound(RevisionId),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Document too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A patch proposal, and once the owner accepts it, the record of how a
/// revision was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDto {
    pub document_id: DocumentId,
    /// Member that proposed the edit
    pub member_name: MemberName,
    pub member_host: HostAddress,
    /// Revision the patch was made against
    pub previous_revision_id: RevisionId,
    pub previous_hash: ContentHash,
    /// Revision the owner assigned; equal to the previous one until accepted
    pub new_revision_id: RevisionId,
    pub new_hash: ContentHash,
    pub patch: Vec<Patch>,
    /// Number of peers viewing the document, as known to the owner
    pub editor_count: usize,
}

impl UpdateDto {
    /// Whether the update was made against the given revision.
    pub fn is_based_on(&self, revision_id: RevisionId, hash: &ContentHash) -> bool {
        self.previous_revision_id == revision_id && self.previous_hash == *hash
    }

    /// Whether the update produced the given revision.
    pub fn produced(&self, revision_id: RevisionId, hash: &ContentHash) -> bool {
        self.new_revision_id == revision_id && self.new_hash == *hash
    }

    /// Move the update's base to the revision another update produced.
    pub fn rebase_onto(&mut self, other: &UpdateDto) {
        self.previous_revision_id = other.new_revision_id;
        self.previous_hash = other.new_hash;
    }
}

/// Owner's confirmation that a replica's proposal became a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeDto {
    pub document_id: DocumentId,
    pub previous_revision_id: RevisionId,
    pub previous_hash: ContentHash,
    pub new_revision_id: RevisionId,
    pub new_hash: ContentHash,
}

/// Full document state the owner hands to a peer opening the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDto {
    pub document_id: DocumentId,
    pub content: String,
    pub revision_id: RevisionId,
    pub owner: MemberName,
    pub owner_host: HostAddress,
    pub editor_count: usize,
}

/// Immutable snapshot of the text after an update.
#[derive(Debug, Clone)]
pub struct Revision {
    pub id: RevisionId,
    pub content: String,
    pub update: UpdateDto,
    pub created_at: DateTime<Utc>,
}

/// Whether an update by `earlier` is ordered before a concurrent update by
/// `later` on the same base. The owner always goes first; everyone else is
/// ordered by name.
pub fn orders_before(owner: &str, earlier: &str, later: &str) -> bool {
    earlier == owner || earlier < later
}

/// One collaboratively edited text, as held by either its owner or a replica.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub owner: MemberName,
    pub owner_host: HostAddress,
    pub content: String,
    pub current_hash: ContentHash,
    pub current_revision_id: RevisionId,
    revisions: BTreeMap<RevisionId, Revision>,
    /// Owner side: peers viewing the document
    editors: HashMap<MemberName, HostAddress>,
    editor_count: usize,
    /// Replica side: own proposal awaiting the owner's ack
    pub pending_update: Option<UpdateDto>,
    pub out_of_sync_update: Option<UpdateDto>,
    pub out_of_sync_ack: Option<AcknowledgeDto>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Author a new document owned by `owner`.
    pub fn create(
        id: impl Into<String>,
        owner: impl Into<String>,
        owner_host: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::seeded(
            id.into(),
            owner.into(),
            owner_host.into(),
            content.into(),
            FIRST_REVISION_ID,
            1,
        )
    }

    /// Materialize a replica from the state its owner sent.
    pub fn open(dto: &DocumentDto) -> Self {
        Self::seeded(
            dto.document_id.clone(),
            dto.owner.clone(),
            dto.owner_host.clone(),
            dto.content.clone(),
            dto.revision_id,
            dto.editor_count,
        )
    }

    fn seeded(
        id: DocumentId,
        owner: MemberName,
        owner_host: HostAddress,
        content: String,
        revision_id: RevisionId,
        editor_count: usize,
    ) -> Self {
        let hash = ContentHash::of(&content);
        let mut doc = Self {
            id,
            owner,
            owner_host,
            content,
            current_hash: hash,
            current_revision_id: revision_id,
            revisions: BTreeMap::new(),
            editors: HashMap::new(),
            editor_count,
            pending_update: None,
            out_of_sync_update: None,
            out_of_sync_ack: None,
            created_at: Utc::now(),
        };
        doc.seed_history();
        doc
    }

    /// Replace the history with one synthetic revision at the current state.
    fn seed_history(&mut self) {
        let update = UpdateDto {
            document_id: self.id.clone(),
            member_name: self.owner.clone(),
            member_host: self.owner_host.clone(),
            previous_revision_id: self.current_revision_id - 1,
            previous_hash: self.current_hash,
            new_revision_id: self.current_revision_id,
            new_hash: self.current_hash,
            patch: Vec::new(),
            editor_count: self.editor_count,
        };
        self.revisions.clear();
        self.revisions.insert(
            self.current_revision_id,
            Revision {
                id: self.current_revision_id,
                content: self.content.clone(),
                update,
                created_at: Utc::now(),
            },
        );
    }

    pub fn is_owned_by(&self, member: &str) -> bool {
        self.owner == member
    }

    pub fn current_revision(&self) -> DocumentResult<&Revision> {
        self.revision(self.current_revision_id)
    }

    pub fn revision(&self, id: RevisionId) -> DocumentResult<&Revision> {
        self.revisions
            .get(&id)
            .ok_or(DocumentError::RevisionNotFound(id))
    }

    /// Oldest revision still held.
    pub fn first_revision_id(&self) -> RevisionId {
        self.revisions
            .keys()
            .next()
            .copied()
            .unwrap_or(self.current_revision_id)
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.len()
    }

    /// Whether the document currently sits at the given revision.
    pub fn is_at(&self, revision_id: RevisionId, hash: &ContentHash) -> bool {
        self.current_revision_id == revision_id && self.current_hash == *hash
    }

    /// Append the next revision and make it current.
    ///
    /// `update` is stored as the producing update with its new revision id and
    /// hash filled in; the stored copy is returned.
    pub fn push_revision(&mut self, content: String, mut update: UpdateDto) -> &UpdateDto {
        let id = self.current_revision_id + 1;
        let hash = ContentHash::of(&content);
        update.new_revision_id = id;
        update.new_hash = hash;

        self.content = content.clone();
        self.current_hash = hash;
        self.current_revision_id = id;

        self.revisions.insert(
            id,
            Revision {
                id,
                content,
                update,
                created_at: Utc::now(),
            },
        );
        &self.revisions[&id].update
    }

    /// Check the invariant `hash(content) == current_hash`.
    pub fn verify_hash(&self) -> DocumentResult<()> {
        let actual = ContentHash::of(&self.content);
        if actual != self.current_hash {
            return Err(DocumentError::HashMismatch {
                expected: self.current_hash,
                actual,
            });
        }
        Ok(())
    }

    /// Whether `text` may become a document's content
    pub fn check_size(text: &str, max: usize) -> DocumentResult<()> {
        if text.len() > max {
            return Err(DocumentError::TooLarge(text.len(), max));
        }
        Ok(())
    }

    /// Build a proposal turning the current content into `text`.
    pub fn propose(&self, member: &str, host: &str, text: &str) -> UpdateDto {
        UpdateDto {
            document_id: self.id.clone(),
            member_name: member.to_string(),
            member_host: host.to_string(),
            previous_revision_id: self.current_revision_id,
            previous_hash: self.current_hash,
            new_revision_id: self.current_revision_id,
            new_hash: self.current_hash,
            patch: patch::make(&self.content, text),
            editor_count: self.editor_count,
        }
    }

    /// State handed to a peer opening the document.
    pub fn to_dto(&self) -> DocumentDto {
        DocumentDto {
            document_id: self.id.clone(),
            content: self.content.clone(),
            revision_id: self.current_revision_id,
            owner: self.owner.clone(),
            owner_host: self.owner_host.clone(),
            editor_count: self.editor_count,
        }
    }

    /// Peers viewing the document, including its owner.
    pub fn editor_count(&self) -> usize {
        self.editor_count
    }

    pub fn set_editor_count(&mut self, count: usize) {
        self.editor_count = count;
    }

    /// Register a viewing peer; returns the new editor count.
    pub fn register_editor(&mut self, member: &str, host: &str) -> usize {
        self.editors.insert(member.to_string(), host.to_string());
        self.editor_count = self.editors.len() + 1;
        self.editor_count
    }

    /// Drop every editor registered at `host`; returns how many were dropped.
    pub fn prune_host(&mut self, host: &str) -> usize {
        let before = self.editors.len();
        self.editors.retain(|_, editor_host| editor_host != host);
        self.editor_count = self.editors.len() + 1;
        before - self.editors.len()
    }

    /// Editors to fan an update out to, leaving out its proposer.
    pub fn editors_except(&self, member: &str) -> Vec<(MemberName, HostAddress)> {
        let mut editors: Vec<_> = self
            .editors
            .iter()
            .filter(|(name, _)| name.as_str() != member)
            .map(|(name, host)| (name.clone(), host.clone()))
            .collect();
        editors.sort();
        editors
    }

    pub fn has_editor(&self, member: &str) -> bool {
        self.editors.contains_key(member)
    }

    /// Become the owner of the document.
    ///
    /// History restarts from the current state, buffered messages are
    /// discarded and no peer is known to be viewing yet.
    pub fn take_ownership(&mut self, owner: &str, owner_host: &str) {
        self.owner = owner.to_string();
        self.owner_host = owner_host.to_string();
        self.pending_update = None;
        self.out_of_sync_update = None;
        self.out_of_sync_ack = None;
        self.editors.clear();
        self.editor_count = 1;
        self.seed_history();
    }
}
