//! Replica-side reconciliation.
//!
//! A replica applies the owner's updates strictly in revision order while at
//! most one of its own proposals is in flight. When an update and the pending
//! proposal are concurrent, the replica orders them the same way the owner
//! will (see [`orders_before`]) so that the eventual ack lands on identical
//! text. Anything it cannot reconcile surfaces as an error, which the
//! controller turns into a full reload.

use tracing::debug;

use super::controller::{DocumentRole, PeerContext};
use super::document::{orders_before, AcknowledgeDto, Document, UpdateDto};
use super::protocol::PeerMessage;
use super::{SyncError, SyncResult};
use crate::patch::{self, Applied};

#[derive(Debug, Clone, Default)]
pub struct ReplicaMerger;

fn checked(applied: Applied, what: &str) -> SyncResult<String> {
    if applied.is_clean() {
        Ok(applied.text)
    } else {
        Err(SyncError::PatchFailed(what.to_string()))
    }
}

impl ReplicaMerger {
    pub fn new() -> Self {
        Self
    }

    /// Apply an update from the owner, or park it if an earlier one is
    /// still missing.
    pub fn apply_update(&self, doc: &mut Document, dto: UpdateDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        if dto.is_based_on(doc.current_revision_id, &doc.current_hash) {
            self.merge_update(doc, dto, ctx)
        } else if doc.out_of_sync_update.is_none() {
            debug!(
                "Buffering update {} -> {} for {} (at revision {})",
                dto.previous_revision_id, dto.new_revision_id, doc.id, doc.current_revision_id
            );
            doc.out_of_sync_update = Some(dto);
            Ok(())
        } else {
            Err(SyncError::OutOfSyncOverflow)
        }
    }

    fn merge_update(&self, doc: &mut Document, dto: UpdateDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        let content = checked(patch::apply(&dto.patch, &doc.content), "owner update")?;

        match doc.pending_update.as_mut() {
            None => ctx.editor.update_text(&doc.id, &content),
            Some(pending) if orders_before(&doc.owner, &dto.member_name, &pending.member_name) => {
                // Our proposal lands after the update, so it applies to the
                // new revision as it is
                pending.rebase_onto(&dto);
                let screen = ctx.editor.get_text(&doc.id).unwrap_or_default();
                let text = checked(patch::apply(&dto.patch, &screen), "update on screen")?;
                ctx.editor.update_text(&doc.id, &text);
            }
            Some(pending) => {
                // Our proposal lands first: recompute it against the
                // update's result so the ack reproduces the owner's text
                pending.rebase_onto(&dto);
                let own = checked(patch::apply(&pending.patch, &doc.content), "pending update")?;
                let both = checked(patch::apply(&dto.patch, &own), "update after pending")?;
                pending.patch = patch::make(&content, &both);

                let screen = ctx.editor.get_text(&doc.id).unwrap_or_default();
                let typed = patch::make(&own, &screen);
                let text = checked(patch::apply(&typed, &both), "screen after update")?;
                ctx.editor.update_text(&doc.id, &text);
            }
        }

        doc.content = content;
        doc.current_revision_id = dto.new_revision_id;
        doc.current_hash = dto.new_hash;
        if doc.editor_count() != dto.editor_count {
            doc.set_editor_count(dto.editor_count);
            ctx.editor.update_number_of_editors(&doc.id, dto.editor_count);
        }
        doc.verify_hash()?;

        self.drain_buffers(doc, ctx)
    }

    /// Handle the owner's confirmation of our pending proposal.
    pub fn acknowledge(&self, doc: &mut Document, ack: AcknowledgeDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        let matches = doc
            .pending_update
            .as_ref()
            .map(|pending| pending.is_based_on(ack.previous_revision_id, &ack.previous_hash));

        match matches {
            None => {
                debug!("Ignoring ack for {} without a pending update", doc.id);
                Ok(())
            }
            Some(true) => self.complete_pending(doc, ack, ctx),
            Some(false) if doc.out_of_sync_ack.is_none() => {
                debug!(
                    "Buffering ack {} -> {} for {}",
                    ack.previous_revision_id, ack.new_revision_id, doc.id
                );
                doc.out_of_sync_ack = Some(ack);
                Ok(())
            }
            Some(false) => Err(SyncError::OutOfSyncOverflow),
        }
    }

    fn complete_pending(&self, doc: &mut Document, ack: AcknowledgeDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        let Some(pending) = doc.pending_update.take() else {
            return Ok(());
        };
        doc.content = checked(patch::apply(&pending.patch, &doc.content), "acknowledged update")?;
        doc.current_revision_id = ack.new_revision_id;
        doc.current_hash = ack.new_hash;
        doc.verify_hash()?;

        // Whatever was typed while waiting goes out as the next proposal
        if let Some(screen) = ctx.editor.get_text(&doc.id) {
            if screen != doc.content {
                let next = doc.propose(&pending.member_name, &pending.member_host, &screen);
                let owner_host = doc.owner_host.clone();
                ctx.send_to(&owner_host, PeerMessage::UpdateRequest(next.clone()));
                doc.pending_update = Some(next);
            }
        }

        self.drain_buffers(doc, ctx)
    }

    /// Process a buffered update or ack whose prerequisite has arrived.
    fn drain_buffers(&self, doc: &mut Document, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        if let Some(next) = doc.out_of_sync_update.take() {
            if next.is_based_on(doc.current_revision_id, &doc.current_hash) {
                return self.merge_update(doc, next, ctx);
            }
            doc.out_of_sync_update = Some(next);
        }

        if let Some(ack) = doc.out_of_sync_ack.take() {
            let ready = doc
                .pending_update
                .as_ref()
                .is_some_and(|pending| pending.is_based_on(ack.previous_revision_id, &ack.previous_hash));
            if ready {
                return self.complete_pending(doc, ack, ctx);
            }
            doc.out_of_sync_ack = Some(ack);
        }
        Ok(())
    }
}

impl DocumentRole for ReplicaMerger {
    fn on_update(&self, doc: &mut Document, dto: UpdateDto, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        self.apply_update(doc, dto, ctx)
    }

    fn on_local_edit(&self, doc: &mut Document, text: &str, ctx: &mut PeerContext<'_>) -> SyncResult<()> {
        if doc.pending_update.is_some() {
            // Picked up when the pending proposal is acknowledged
            return Ok(());
        }
        if text == doc.content {
            return Ok(());
        }
        let proposal = doc.propose(ctx.member, ctx.host, text);
        let owner_host = doc.owner_host.clone();
        ctx.send_to(&owner_host, PeerMessage::UpdateRequest(proposal.clone()));
        doc.pending_update = Some(proposal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{EditorView, HeadlessEditor};
    use crate::sync::document::DocumentDto;
    use crate::sync::protocol::Destination;
    use crate::sync::{ContentHash, RevisionId};

    const OWNER_HOST: &str = "http://max";

    fn replica(content: &str, revision_id: RevisionId) -> Document {
        Document::open(&DocumentDto {
            document_id: "doc".to_string(),
            content: content.to_string(),
            revision_id,
            owner: "max".to_string(),
            owner_host: OWNER_HOST.to_string(),
            editor_count: 3,
        })
    }

    fn update(member: &str, from: (RevisionId, &str), to: (RevisionId, &str)) -> UpdateDto {
        UpdateDto {
            document_id: "doc".to_string(),
            member_name: member.to_string(),
            member_host: format!("http://{}", member),
            previous_revision_id: from.0,
            previous_hash: ContentHash::of(from.1),
            new_revision_id: to.0,
            new_hash: ContentHash::of(to.1),
            patch: patch::make(from.1, to.1),
            editor_count: 3,
        }
    }

    fn ack(from: (RevisionId, &str), to: (RevisionId, &str)) -> AcknowledgeDto {
        AcknowledgeDto {
            document_id: "doc".to_string(),
            previous_revision_id: from.0,
            previous_hash: ContentHash::of(from.1),
            new_revision_id: to.0,
            new_hash: ContentHash::of(to.1),
        }
    }

    /// Make a local edit on the replica through the screen.
    fn type_text(
        merger: &ReplicaMerger,
        doc: &mut Document,
        editor: &HeadlessEditor,
        member: &str,
        text: &str,
    ) -> Vec<crate::sync::protocol::Envelope> {
        editor.type_text("doc", text);
        let host = format!("http://{}", member);
        let mut ctx = PeerContext::new(member, &host, editor);
        merger.on_local_edit(doc, text, &mut ctx).unwrap();
        ctx.into_outgoing()
    }

    #[test]
    fn test_clean_update_without_pending() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "test");
        let mut doc = replica("test", 0);
        let mut ctx = PeerContext::new("2", "http://2", &editor);

        merger
            .apply_update(&mut doc, update("1", (0, "test"), (1, "tests")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "tests");
        assert_eq!(doc.current_revision_id, 1);
        assert!(doc.verify_hash().is_ok());
        assert_eq!(editor.get_text("doc").as_deref(), Some("tests"));
        assert!(ctx.into_outgoing().is_empty());
    }

    #[test]
    fn test_out_of_order_update_is_buffered_then_applied() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "a");
        let mut doc = replica("a", 0);
        let mut ctx = PeerContext::new("2", "http://2", &editor);

        merger
            .apply_update(&mut doc, update("1", (1, "ab"), (2, "abc")), &mut ctx)
            .unwrap();
        assert_eq!(doc.current_revision_id, 0);
        assert!(doc.out_of_sync_update.is_some());

        merger
            .apply_update(&mut doc, update("1", (0, "a"), (1, "ab")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "abc");
        assert_eq!(doc.current_revision_id, 2);
        assert!(doc.out_of_sync_update.is_none());
        assert_eq!(editor.history("doc"), vec!["a", "ab", "abc"]);
    }

    #[test]
    fn test_second_out_of_order_update_overflows() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        let mut doc = replica("a", 0);
        let mut ctx = PeerContext::new("2", "http://2", &editor);

        merger
            .apply_update(&mut doc, update("1", (1, "ab"), (2, "abc")), &mut ctx)
            .unwrap();
        let err = merger
            .apply_update(&mut doc, update("1", (2, "abc"), (3, "abcd")), &mut ctx)
            .unwrap_err();
        assert_eq!(err, SyncError::OutOfSyncOverflow);
    }

    #[test]
    fn test_hash_mismatch_is_reported() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        let mut doc = replica("test", 0);
        let mut ctx = PeerContext::new("2", "http://2", &editor);

        let mut dto = update("1", (0, "test"), (1, "tests"));
        dto.new_hash = ContentHash::of("something else");
        assert!(matches!(
            merger.apply_update(&mut doc, dto, &mut ctx),
            Err(SyncError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_local_edit_becomes_pending() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "test");
        let mut doc = replica("test", 0);

        let sent = type_text(&merger, &mut doc, &editor, "2", "testi");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Destination::Host(OWNER_HOST.to_string()));
        let pending = doc.pending_update.clone().unwrap();
        assert!(pending.is_based_on(0, &ContentHash::of("test")));

        // A second edit waits for the ack
        let sent = type_text(&merger, &mut doc, &editor, "2", "testin");
        assert!(sent.is_empty());
        assert_eq!(doc.pending_update, Some(pending));
    }

    #[test]
    fn test_pending_lands_after_update() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "one two three four");
        let mut doc = replica("one two three four", 0);
        type_text(&merger, &mut doc, &editor, "2", "one two three four five");

        let mut ctx = PeerContext::new("2", "http://2", &editor);
        merger
            .apply_update(
                &mut doc,
                update("1", (0, "one two three four"), (1, "One two three four")),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(doc.content, "One two three four");
        assert_eq!(
            editor.get_text("doc").as_deref(),
            Some("One two three four five")
        );
        let pending = doc.pending_update.as_ref().unwrap();
        assert!(pending.is_based_on(1, &ContentHash::of("One two three four")));

        merger
            .acknowledge(
                &mut doc,
                ack((1, "One two three four"), (2, "One two three four five")),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(doc.content, "One two three four five");
        assert_eq!(doc.current_revision_id, 2);
        assert!(doc.pending_update.is_none());
        assert!(ctx.into_outgoing().is_empty());
    }

    #[test]
    fn test_pending_lands_before_update() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "test");
        let mut doc = replica("test", 0);
        type_text(&merger, &mut doc, &editor, "1", "tests");

        let mut ctx = PeerContext::new("1", "http://1", &editor);
        merger
            .apply_update(&mut doc, update("2", (0, "test"), (1, "testi")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "testi");
        assert_eq!(editor.get_text("doc").as_deref(), Some("testsi"));

        merger
            .acknowledge(&mut doc, ack((1, "testi"), (2, "testsi")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "testsi");
        assert!(doc.verify_hash().is_ok());
        assert!(doc.pending_update.is_none());
    }

    #[test]
    fn test_ack_proposes_edits_typed_meanwhile() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "test");
        let mut doc = replica("test", 0);
        type_text(&merger, &mut doc, &editor, "2", "tests");
        type_text(&merger, &mut doc, &editor, "2", "tests!");

        let mut ctx = PeerContext::new("2", "http://2", &editor);
        merger
            .acknowledge(&mut doc, ack((0, "test"), (1, "tests")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "tests");

        let next = doc.pending_update.clone().unwrap();
        assert!(next.is_based_on(1, &ContentHash::of("tests")));
        let sent = ctx.into_outgoing();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].message, PeerMessage::UpdateRequest(dto) if *dto == next));
    }

    #[test]
    fn test_unmatched_acks() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        editor.open("doc", "one two three four");
        let mut doc = replica("one two three four", 0);
        type_text(&merger, &mut doc, &editor, "2", "one two three four five");

        let mut ctx = PeerContext::new("2", "http://2", &editor);
        merger
            .acknowledge(
                &mut doc,
                ack((1, "One two three four"), (2, "One two three four five")),
                &mut ctx,
            )
            .unwrap();
        assert!(doc.out_of_sync_ack.is_some());

        // The missing update arrives and releases the buffered ack
        merger
            .apply_update(
                &mut doc,
                update("1", (0, "one two three four"), (1, "One two three four")),
                &mut ctx,
            )
            .unwrap();
        assert!(doc.out_of_sync_ack.is_none());
        assert!(doc.pending_update.is_none());
        assert_eq!(doc.content, "One two three four five");
        assert_eq!(doc.current_revision_id, 2);

        type_text(&merger, &mut doc, &editor, "2", "One two three four five?");
        let mut ctx = PeerContext::new("2", "http://2", &editor);
        merger
            .acknowledge(&mut doc, ack((7, "x"), (8, "y")), &mut ctx)
            .unwrap();
        assert_eq!(
            merger
                .acknowledge(&mut doc, ack((8, "y"), (9, "z")), &mut ctx)
                .unwrap_err(),
            SyncError::OutOfSyncOverflow
        );
    }

    #[test]
    fn test_ack_without_pending_is_ignored() {
        let merger = ReplicaMerger::new();
        let editor = HeadlessEditor::new();
        let mut doc = replica("test", 0);
        let mut ctx = PeerContext::new("2", "http://2", &editor);
        merger
            .acknowledge(&mut doc, ack((0, "test"), (1, "tests")), &mut ctx)
            .unwrap();
        assert_eq!(doc.content, "test");
        assert!(doc.out_of_sync_ack.is_none());
    }
}
