use uuid::Uuid;

use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{Message, MessageId, UserRef},
};

/// How close a server echo's timestamp must be to a pending entry's for a
/// best-effort content match, in milliseconds.
pub const SUPERSESSION_WINDOW_MS: u64 = 2_000;

/// Result of merging one realtime `new_message` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Duplicate delivery or wrong conversation; nothing changed.
    Ignored,
    /// The message was appended at the end of the list.
    Appended,
    /// The server echo replaced a pending optimistic entry in place.
    Superseded {
        /// Local id of the pending entry that was replaced.
        local_id: String,
    },
}

/// Rollback data captured by `begin_edit`, replayed by `revert_edit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRollback {
    /// Body before the optimistic edit.
    pub previous_body: String,
    /// Edited flag before the optimistic edit.
    pub previously_edited: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
}

/// Single source-of-truth ordered message list for one conversation.
///
/// Merges three input streams (REST snapshots, realtime push events, and
/// optimistic local commands) without duplicating or losing entries. At most
/// one entry per server id exists at any time; ordering is by `created_at_ms`
/// ascending with ties broken by arrival order. Malformed or out-of-order
/// events degrade to an ignore; the next snapshot refresh is the recovery
/// path.
#[derive(Debug, Clone)]
pub struct MessageLog {
    conversation_id: String,
    entries: Vec<Entry>,
    next_arrival: u64,
}

impl MessageLog {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Vec::new(),
            next_arrival: 0,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// All entries in display order, deleted ones included.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Entries the view should render (deleted ones filtered out).
    pub fn visible(&self) -> impl Iterator<Item = &Message> {
        self.messages().filter(|message| !message.deleted)
    }

    /// Cloned list for a `MessagesReset` event.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any optimistic entry is still awaiting server confirmation.
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|entry| entry.message.id.is_local())
    }

    /// Look up a confirmed message by server id.
    pub fn get(&self, server_id: &str) -> Option<&Message> {
        self.position_of_server(server_id)
            .map(|idx| &self.entries[idx].message)
    }

    /// Merge a REST snapshot into the list.
    ///
    /// With no pending entries the snapshot replaces the list wholesale.
    /// Otherwise pending entries whose content the snapshot does not yet
    /// contain are retained, so a message sent just before the fetch is not
    /// visually dropped. Either way the result is re-sorted to restore the
    /// ordering invariant.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Message>) {
        let retained: Vec<Entry> = self
            .entries
            .drain(..)
            .filter(|entry| {
                entry.message.id.is_local()
                    && !snapshot
                        .iter()
                        .any(|incoming| content_matches(&entry.message, incoming))
            })
            .collect();

        for message in snapshot {
            if message.conversation_id != self.conversation_id {
                continue;
            }
            let arrival = self.bump_arrival();
            self.entries.push(Entry { message, arrival });
        }
        self.entries.extend(retained);
        self.resort();
    }

    /// Apply a realtime `new_message` event.
    pub fn apply_new_message(&mut self, incoming: Message) -> MergeOutcome {
        if incoming.conversation_id != self.conversation_id {
            return MergeOutcome::Ignored;
        }
        let MessageId::Server(server_id) = incoming.id.clone() else {
            return MergeOutcome::Ignored;
        };
        // Duplicate delivery is expected under reconnection.
        if self.position_of_server(&server_id).is_some() {
            return MergeOutcome::Ignored;
        }

        if let Some(idx) = self
            .entries
            .iter()
            .position(|entry| content_matches(&entry.message, &incoming))
        {
            let local_id = self.entries[idx].message.id.as_str().to_owned();
            self.entries[idx].message = incoming;
            return MergeOutcome::Superseded { local_id };
        }

        let arrival = self.bump_arrival();
        self.entries.push(Entry {
            message: incoming,
            arrival,
        });
        MergeOutcome::Appended
    }

    /// Apply a realtime `message_updated` event.
    ///
    /// An update for an unknown id is dropped; it raced ahead of its create
    /// event and the next snapshot refresh will pick it up.
    pub fn apply_update(&mut self, incoming: &Message) -> bool {
        if incoming.conversation_id != self.conversation_id {
            return false;
        }
        let MessageId::Server(server_id) = &incoming.id else {
            return false;
        };
        let Some(idx) = self.position_of_server(server_id) else {
            return false;
        };

        let message = &mut self.entries[idx].message;
        message.body = incoming.body.clone();
        message.attachments = incoming.attachments.clone();
        message.edited = true;
        true
    }

    /// Apply a realtime `message_deleted` event; unknown ids are a no-op.
    pub fn apply_delete(&mut self, server_id: &str) -> bool {
        let Some(idx) = self.position_of_server(server_id) else {
            return false;
        };
        let message = &mut self.entries[idx].message;
        if message.deleted {
            return false;
        }
        message.deleted = true;
        true
    }

    /// Union seers into a message's seen-by set; unknown ids are a no-op.
    pub fn apply_seen(&mut self, server_id: &str, seen_by: &[String]) -> bool {
        let Some(idx) = self.position_of_server(server_id) else {
            return false;
        };
        let message = &mut self.entries[idx].message;
        let mut changed = false;
        for seer in seen_by {
            if !message.seen_by.contains(seer) {
                message.seen_by.push(seer.clone());
                changed = true;
            }
        }
        changed
    }

    /// Append an optimistic pending entry for a local send.
    pub fn begin_send(
        &mut self,
        sender: Option<UserRef>,
        text: &str,
        attachments: Vec<String>,
        now_ms: u64,
    ) -> Result<Message, ChatError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Validation,
                "empty_message",
                "message needs text or at least one attachment",
            ));
        }

        let message = Message {
            id: MessageId::Local(Uuid::new_v4().to_string()),
            conversation_id: self.conversation_id.clone(),
            sender,
            body: text.to_owned(),
            attachments,
            created_at_ms: now_ms,
            edited: false,
            deleted: false,
            seen_by: Vec::new(),
        };

        let arrival = self.bump_arrival();
        self.entries.push(Entry {
            message: message.clone(),
            arrival,
        });
        Ok(message)
    }

    /// Replace a pending entry in place with the authoritative server copy.
    ///
    /// Returns `false` when the pending entry is gone (already superseded by
    /// a content-matched push event, or rolled back).
    pub fn confirm_send(&mut self, local_id: &str, authoritative: Message) -> bool {
        if authoritative.conversation_id != self.conversation_id
            || !matches!(authoritative.id, MessageId::Server(_))
        {
            return false;
        }
        let Some(idx) = self.position_of_local(local_id) else {
            return false;
        };
        self.entries[idx].message = authoritative;
        true
    }

    /// Remove a pending entry after a failed send.
    pub fn fail_send(&mut self, local_id: &str) -> bool {
        let Some(idx) = self.position_of_local(local_id) else {
            return false;
        };
        self.entries.remove(idx);
        true
    }

    /// Apply an optimistic edit, returning the data needed to revert it.
    ///
    /// Only the sender may edit, and only while the message is not deleted.
    pub fn begin_edit(
        &mut self,
        server_id: &str,
        new_text: &str,
        editor_user_id: &str,
    ) -> Result<EditRollback, ChatError> {
        if new_text.trim().is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Validation,
                "empty_message",
                "edited body must not be empty",
            ));
        }
        let Some(idx) = self.position_of_server(server_id) else {
            return Err(ChatError::new(
                ChatErrorCategory::Conflict,
                "message_not_found",
                format!("no message with server id '{server_id}'"),
            ));
        };

        let message = &mut self.entries[idx].message;
        if message.deleted {
            return Err(ChatError::new(
                ChatErrorCategory::Conflict,
                "message_deleted",
                "cannot edit a deleted message",
            ));
        }
        if message.sender.as_ref().map(|user| user.id.as_str()) != Some(editor_user_id) {
            return Err(ChatError::new(
                ChatErrorCategory::Validation,
                "edit_forbidden",
                "only the sender may edit a message",
            ));
        }

        let rollback = EditRollback {
            previous_body: message.body.clone(),
            previously_edited: message.edited,
        };
        message.body = new_text.to_owned();
        message.edited = true;
        Ok(rollback)
    }

    /// Undo an optimistic edit after a failed REST call.
    pub fn revert_edit(&mut self, server_id: &str, rollback: EditRollback) -> bool {
        let Some(idx) = self.position_of_server(server_id) else {
            return false;
        };
        let message = &mut self.entries[idx].message;
        message.body = rollback.previous_body;
        message.edited = rollback.previously_edited;
        true
    }

    /// Optimistically flag a message deleted. Deleting an already-deleted
    /// message is idempotent.
    pub fn begin_delete(
        &mut self,
        server_id: &str,
        requester_user_id: &str,
    ) -> Result<(), ChatError> {
        let Some(idx) = self.position_of_server(server_id) else {
            return Err(ChatError::new(
                ChatErrorCategory::Conflict,
                "message_not_found",
                format!("no message with server id '{server_id}'"),
            ));
        };

        let message = &mut self.entries[idx].message;
        if message.sender.as_ref().map(|user| user.id.as_str()) != Some(requester_user_id) {
            return Err(ChatError::new(
                ChatErrorCategory::Validation,
                "delete_forbidden",
                "only the sender may delete a message",
            ));
        }
        message.deleted = true;
        Ok(())
    }

    /// Undo an optimistic delete after a failed REST call.
    pub fn revert_delete(&mut self, server_id: &str) -> bool {
        let Some(idx) = self.position_of_server(server_id) else {
            return false;
        };
        let message = &mut self.entries[idx].message;
        if !message.deleted {
            return false;
        }
        message.deleted = false;
        true
    }

    fn position_of_server(&self, server_id: &str) -> Option<usize> {
        self.entries.iter().position(
            |entry| matches!(&entry.message.id, MessageId::Server(id) if id == server_id),
        )
    }

    fn position_of_local(&self, local_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| matches!(&entry.message.id, MessageId::Local(id) if id == local_id))
    }

    fn bump_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }

    fn resort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .created_at_ms
                .cmp(&b.message.created_at_ms)
                .then(a.arrival.cmp(&b.arrival))
        });
    }
}

/// Best-effort equality between a pending entry and a server message: same
/// conversation, same sender, same body, timestamps within the supersession
/// window.
fn content_matches(pending: &Message, incoming: &Message) -> bool {
    if !pending.id.is_local() {
        return false;
    }
    let sender_id = |message: &Message| {
        message
            .sender
            .as_ref()
            .map(|user| user.id.clone())
    };
    pending.conversation_id == incoming.conversation_id
        && sender_id(pending) == sender_id(incoming)
        && pending.body == incoming.body
        && pending.created_at_ms.abs_diff(incoming.created_at_ms) <= SUPERSESSION_WINDOW_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Option<UserRef> {
        Some(UserRef {
            id: "u-alice".into(),
            display_name: "Alice".into(),
        })
    }

    fn bob() -> Option<UserRef> {
        Some(UserRef {
            id: "u-bob".into(),
            display_name: "Bob".into(),
        })
    }

    fn server_message(id: &str, body: &str, created_at_ms: u64) -> Message {
        Message {
            id: MessageId::Server(id.into()),
            conversation_id: "conv-1".into(),
            sender: bob(),
            body: body.into(),
            attachments: Vec::new(),
            created_at_ms,
            edited: false,
            deleted: false,
            seen_by: Vec::new(),
        }
    }

    #[test]
    fn duplicate_new_message_delivery_is_idempotent() {
        let mut log = MessageLog::new("conv-1");
        assert_eq!(
            log.apply_new_message(server_message("srv-1", "hello", 10)),
            MergeOutcome::Appended
        );
        assert_eq!(
            log.apply_new_message(server_message("srv-1", "hello", 10)),
            MergeOutcome::Ignored
        );
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn event_for_another_conversation_is_ignored() {
        let mut log = MessageLog::new("conv-1");
        let mut foreign = server_message("srv-9", "wrong room", 10);
        foreign.conversation_id = "conv-2".into();

        assert_eq!(log.apply_new_message(foreign), MergeOutcome::Ignored);
        assert!(log.is_empty());
    }

    #[test]
    fn server_echo_supersedes_pending_entry_in_place() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "earlier", 5));
        let pending = log
            .begin_send(alice(), "Hi", Vec::new(), 100)
            .expect("send should validate");

        let mut echo = server_message("srv-42", "Hi", 101);
        echo.sender = alice();
        let outcome = log.apply_new_message(echo);

        assert_eq!(
            outcome,
            MergeOutcome::Superseded {
                local_id: pending.id.as_str().to_owned()
            }
        );
        assert_eq!(log.len(), 2);
        assert!(!log.has_pending());
        let last = log.messages().last().expect("list is non-empty");
        assert_eq!(last.id, MessageId::Server("srv-42".into()));
        assert_eq!(last.body, "Hi");
    }

    #[test]
    fn echo_outside_time_window_appends_instead_of_superseding() {
        let mut log = MessageLog::new("conv-1");
        log.begin_send(alice(), "Hi", Vec::new(), 100)
            .expect("send should validate");

        let mut late = server_message("srv-42", "Hi", 100 + SUPERSESSION_WINDOW_MS + 1);
        late.sender = alice();
        assert_eq!(log.apply_new_message(late), MergeOutcome::Appended);
        assert_eq!(log.len(), 2);
        assert!(log.has_pending());
    }

    #[test]
    fn snapshot_replaces_wholesale_without_pending_entries() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "old view", 10));

        log.apply_snapshot(vec![
            server_message("srv-2", "two", 20),
            server_message("srv-3", "three", 30),
        ]);

        let ids: Vec<&str> = log.messages().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-2", "srv-3"]);
    }

    #[test]
    fn snapshot_drops_messages_from_other_conversations() {
        let mut log = MessageLog::new("conv-1");
        let mut foreign = server_message("srv-2", "wrong room", 20);
        foreign.conversation_id = "conv-2".into();

        log.apply_snapshot(vec![server_message("srv-1", "right room", 10), foreign]);

        let ids: Vec<&str> = log.messages().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-1"]);
    }

    #[test]
    fn snapshot_merge_retains_unconfirmed_pending_entry() {
        let mut log = MessageLog::new("conv-1");
        log.begin_send(alice(), "just sent", Vec::new(), 100)
            .expect("send should validate");

        log.apply_snapshot(vec![server_message("srv-1", "from server", 50)]);

        assert_eq!(log.len(), 2);
        assert!(log.has_pending());
        let bodies: Vec<&str> = log.messages().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["from server", "just sent"]);
    }

    #[test]
    fn snapshot_merge_drops_pending_entry_already_echoed() {
        let mut log = MessageLog::new("conv-1");
        log.begin_send(alice(), "just sent", Vec::new(), 100)
            .expect("send should validate");

        let mut echoed = server_message("srv-7", "just sent", 101);
        echoed.sender = alice();
        log.apply_snapshot(vec![echoed]);

        assert_eq!(log.len(), 1);
        assert!(!log.has_pending());
        assert_eq!(
            log.messages().next().map(|m| m.id.clone()),
            Some(MessageId::Server("srv-7".into()))
        );
    }

    #[test]
    fn snapshot_merge_restores_created_at_ordering() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-5", "late", 500));

        log.apply_snapshot(vec![
            server_message("srv-3", "c", 300),
            server_message("srv-1", "a", 100),
            server_message("srv-2", "b", 200),
        ]);

        let stamps: Vec<u64> = log.messages().map(|m| m.created_at_ms).collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn update_for_unknown_id_is_dropped() {
        let mut log = MessageLog::new("conv-1");
        assert!(!log.apply_update(&server_message("srv-404", "edited", 10)));
        assert!(log.is_empty());
    }

    #[test]
    fn update_replaces_body_and_flags_edited() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "original", 10));

        assert!(log.apply_update(&server_message("srv-1", "fixed", 10)));
        let message = log.get("srv-1").expect("message exists");
        assert_eq!(message.body, "fixed");
        assert!(message.edited);
    }

    #[test]
    fn delete_for_unknown_id_is_a_noop() {
        let mut log = MessageLog::new("conv-1");
        assert!(!log.apply_delete("srv-404"));
        assert!(log.is_empty());
    }

    #[test]
    fn deleted_messages_are_retained_but_not_visible() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "hello", 10));

        assert!(log.apply_delete("srv-1"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.visible().count(), 0);
    }

    #[test]
    fn seen_union_ignores_known_seers() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "hello", 10));

        assert!(log.apply_seen("srv-1", &["u-alice".into()]));
        assert!(!log.apply_seen("srv-1", &["u-alice".into()]));
        assert!(log.apply_seen("srv-1", &["u-alice".into(), "u-carol".into()]));

        let message = log.get("srv-1").expect("message exists");
        assert_eq!(message.seen_by, vec!["u-alice", "u-carol"]);
    }

    #[test]
    fn rejects_send_with_no_text_and_no_attachments() {
        let mut log = MessageLog::new("conv-1");
        let err = log
            .begin_send(alice(), "   ", Vec::new(), 100)
            .expect_err("empty send must fail");
        assert_eq!(err.code, "empty_message");
        assert_eq!(err.category, ChatErrorCategory::Validation);
    }

    #[test]
    fn attachment_only_send_is_valid() {
        let mut log = MessageLog::new("conv-1");
        log.begin_send(alice(), "", vec!["https://cdn.example/p.jpg".into()], 100)
            .expect("attachment-only send should validate");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn failed_send_removes_pending_entry_entirely() {
        let mut log = MessageLog::new("conv-1");
        let pending = log
            .begin_send(alice(), "Hi", Vec::new(), 100)
            .expect("send should validate");

        assert!(log.fail_send(pending.id.as_str()));
        assert!(log.is_empty());
    }

    #[test]
    fn rest_confirmation_replaces_pending_entry() {
        let mut log = MessageLog::new("conv-1");
        let pending = log
            .begin_send(alice(), "Hi", Vec::new(), 100)
            .expect("send should validate");

        let mut confirmed = server_message("srv-9", "Hi", 102);
        confirmed.sender = alice();
        assert!(log.confirm_send(pending.id.as_str(), confirmed));
        assert_eq!(log.len(), 1);
        assert!(!log.has_pending());
    }

    #[test]
    fn failed_edit_restores_exact_previous_body() {
        let mut log = MessageLog::new("conv-1");
        let mut own = server_message("srv-1", "original text", 10);
        own.sender = alice();
        log.apply_new_message(own);

        let rollback = log
            .begin_edit("srv-1", "edited text", "u-alice")
            .expect("edit should apply");
        assert_eq!(log.get("srv-1").expect("exists").body, "edited text");

        assert!(log.revert_edit("srv-1", rollback));
        let message = log.get("srv-1").expect("exists");
        assert_eq!(message.body, "original text");
        assert!(!message.edited);
    }

    #[test]
    fn edit_by_non_sender_is_forbidden() {
        let mut log = MessageLog::new("conv-1");
        log.apply_new_message(server_message("srv-1", "hello", 10));

        let err = log
            .begin_edit("srv-1", "hijacked", "u-alice")
            .expect_err("editing another user's message must fail");
        assert_eq!(err.code, "edit_forbidden");
    }

    #[test]
    fn delete_rollback_restores_visibility() {
        let mut log = MessageLog::new("conv-1");
        let mut own = server_message("srv-1", "hello", 10);
        own.sender = alice();
        log.apply_new_message(own);

        log.begin_delete("srv-1", "u-alice").expect("delete applies");
        assert_eq!(log.visible().count(), 0);

        assert!(log.revert_delete("srv-1"));
        assert_eq!(log.visible().count(), 1);
    }
}
