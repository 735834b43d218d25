//! Owner-side serialization of concurrent proposals.
//!
//! The owner is the only peer that decides where a proposal lands in a
//! document's history. A proposal made against an older revision is slotted
//! in after every concurrent revision that orders before it (see
//! [`orders_before`]) and the revisions after that point are replayed on top,
//! so every replica ends up with the same linear history.

use tracing::{debug, info, warn};

use super::controller::{DocumentRole, PeerContext};
use super::document::{orders_before, AcknowledgeDto, Document, UpdateDto};
use super::protocol::PeerMessage;
use super::{ContentHash, RevisionId, SyncError, SyncResult};
use crate::patch::{self, Patch};

/// Outcome of accepting a proposal.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub revision_id: RevisionId,
    pub hash: ContentHash,
    /// Patch from the previous current content to the new one
    pub patch: Vec<Patch>,
    /// Confirmation for the proposer, unless the owner proposed it
    pub ack: Option<AcknowledgeDto>,
    /// Rewritten update for every other editor
    pub broadcast: UpdateDto,
}

#[derive(Debug, Clone)]
pub struct OwnerSequencer {
    window: usize,
}

impl OwnerSequencer {
    /// `window` is how many revisions behind the current one a proposal may
    /// be based on.
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// Slot `dto` into the document's history and make it the new current
    /// revision.
    pub fn accept_proposal(&self, doc: &mut Document, dto: UpdateDto) -> SyncResult<Accepted> {
        let current = doc.current_revision()?;
        let current_id = current.id;
        let current_content = current.content.clone();
        let current_hash = current.update.new_hash;

        let insertion = self.insertion_point(doc, &dto)?;
        let content = Self::replay(doc, insertion, &dto)?;

        let patch = if insertion == current_id {
            dto.patch.clone()
        } else {
            patch::make(&current_content, &content)
        };

        let proposer = dto.member_name.clone();
        let proposer_is_owner = doc.is_owned_by(&proposer);
        let editor_count = doc.editor_count();
        let stored = doc
            .push_revision(
                content,
                UpdateDto {
                    patch: patch.clone(),
                    editor_count,
                    ..dto
                },
            )
            .clone();

        info!(
            "Accepted update from {} on {}: revision {} (inserted after {})",
            proposer, stored.document_id, stored.new_revision_id, insertion
        );

        let ack = (!proposer_is_owner).then(|| AcknowledgeDto {
            document_id: stored.document_id.clone(),
            previous_revision_id: current_id,
            previous_hash: current_hash,
            new_revision_id: stored.new_revision_id,
            new_hash: stored.new_hash,
        });

        let broadcast = UpdateDto {
            previous_revision_id: current_id,
            previous_hash: current_hash,
            ..stored.clone()
        };

        Ok(Accepted {
            revision_id: stored.new_revision_id,
            hash: stored.new_hash,
            patch,
            ack,
            broadcast,
        })
    }

    /// Revision after which `dto` belongs.
    fn insertion_point(&self, doc: &Document, dto: &UpdateDto) -> SyncResult<RevisionId> {
        let current = doc.current_revision()?;
        let last = &current.update;

        // Based on the current revision
        if dto.is_based_on(last.new_revision_id, &last.new_hash) {
            return Ok(current.id);
        }

        // Based on the revision before, whose successor orders first
        if let Ok(before) = doc.revision(current.id - 1) {
            let second_last = &before.update;
            if dto.is_based_on(second_last.new_revision_id, &second_last.new_hash)
                && orders_before(&doc.owner, &last.member_name, &dto.member_name)
            {
                debug!(
                    "Update from {} reordered after concurrent update from {}",
                    dto.member_name, last.member_name
                );
                return Ok(current.id);
            }
        }

        let base = doc
            .revision(dto.previous_revision_id)
            .map_err(|_| SyncError::RevisionNotFound(dto.previous_revision_id))?;
        if base.update.new_hash != dto.previous_hash {
            return Err(SyncError::RevisionNotFound(dto.previous_revision_id));
        }
        if base.id + (self.window as RevisionId) < current.id {
            return Err(SyncError::OutsideWindow {
                base: base.id,
                current: current.id,
            });
        }

        // Skip concurrent revisions that order before the proposal
        let mut insertion = base.id;
        while insertion < current.id {
            let next = &doc.revision(insertion + 1)?.update;
            let concurrent = next.is_based_on(dto.previous_revision_id, &dto.previous_hash);
            if !(concurrent && orders_before(&doc.owner, &next.member_name, &dto.member_name)) {
                break;
            }
            insertion += 1;
        }
        Ok(insertion)
    }

    /// Content after applying `dto` at `insertion` and replaying every later
    /// revision on top of it.
    fn replay(doc: &Document, insertion: RevisionId, dto: &UpdateDto) -> SyncResult<String> {
        let base = doc.revision(insertion)?;
        let applied = patch::apply(&dto.patch, &base.content);
        if !applied.is_clean() {
            return Err(SyncError::PatchFailed(format!(
                "update from {} does not fit revision {}",
                dto.member_name, insertion
            )));
        }

        let mut content = applied.text;
        for id in insertion + 1..=doc.current_revision_id {
            let revision = doc.revision(id)?;
            let replayed = patch::apply(&revision.update.patch, &content);
            if !replayed.is_clean() {
                return Err(SyncError::PatchFailed(format!(
                    "revision {} cannot be replayed after update from {}",
                    id, dto.member_name
                )));
            }
            content = replayed.text;
        }
        Ok(content)
    }
}

impl DocumentRole for OwnerSequencer {
    fn on_update(&self, doc: &mut Document, dto: UpdateDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        let proposer_host = dto.member_host.clone();
        let proposer = dto.member_name.clone();
        let local = doc.is_owned_by(&proposer);

        let accepted = match self.accept_proposal(doc, dto) {
            Ok(accepted) => accepted,
            Err(e) if local => {
                warn!("Local edit on {} abandoned: {}", doc.id, e);
                return Ok(());
            }
            Err(e) => {
                warn!("Rejected update from {} on {}: {}", proposer, doc.id, e);
                ctx.send_to(
                    &proposer_host,
                    PeerMessage::Reload {
                        document_id: doc.id.clone(),
                        host: ctx.host.to_string(),
                    },
                );
                return Ok(());
            }
        };

        if !local {
            // The owner's screen only learns about remote edits here
            let screen = ctx.editor.get_text(&doc.id).unwrap_or_default();
            let merged = patch::apply(&accepted.patch, &screen);
            let text = if merged.is_clean() {
                merged.text
            } else {
                warn!("Screen of {} diverged, resetting it to the document", doc.id);
                doc.content.clone()
            };
            ctx.editor.update_text(&doc.id, &text);
        }

        if let Some(ack) = accepted.ack {
            ctx.send_to(&proposer_host, PeerMessage::AckRequest(ack));
        }
        for (_, host) in doc.editors_except(&proposer) {
            ctx.send_to(&host, PeerMessage::UpdateRequest(accepted.broadcast.clone()));
        }
        Ok(())
    }

    fn on_local_edit(&self, doc: &mut Document, text: &str, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        if text == doc.content {
            return Ok(());
        }
        let proposal = doc.propose(ctx.member, ctx.host, text);
        self.on_update(doc, proposal, ctx)
    }
}
