use serde::{Deserialize, Serialize};

/// Realtime connection state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No realtime channel; REST polling is the only update source.
    Disconnected,
    /// Initial handshake with the gateway is in flight.
    Connecting,
    /// Realtime channel is live and delivering push events.
    Connected,
    /// Transient loss; a bounded reconnect loop is running.
    Reconnecting,
}

/// Message identity, tagged by whether the server has confirmed the entry.
///
/// A `Local` id names an optimistic entry created on send; it is superseded
/// by a `Server` id when the authoritative echo arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    /// Client-assigned id for an unconfirmed optimistic entry.
    Local(String),
    /// Server-assigned authoritative id.
    Server(String),
}

impl MessageId {
    /// Raw id string regardless of tag.
    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Local(id) | MessageId::Server(id) => id,
        }
    }

    /// Whether this entry is still awaiting server confirmation.
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

/// Reference to a chat participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    /// Stable user id.
    pub id: String,
    /// Display name shown in typing/presence surfaces.
    pub display_name: String,
}

/// Server-side conversation status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationStatus {
    Open,
    Resolved,
    Closed,
}

/// Support or buyer-seller thread metadata for the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Stable conversation id.
    pub id: String,
    /// Optional subject line.
    pub subject: Option<String>,
    /// Server-owned status; the client never mutates it.
    pub status: ConversationStatus,
    /// Participants known to the server.
    pub participants: Vec<UserRef>,
    /// Denormalized preview of the latest message.
    pub last_message: Option<String>,
    /// Timestamp of the latest message in milliseconds since Unix epoch.
    pub last_message_at: Option<u64>,
}

/// Unit of communication within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Tagged identity; `Local` until the server confirms the entry.
    pub id: MessageId,
    /// Owning conversation id.
    pub conversation_id: String,
    /// Sender, or `None` for bot/system messages.
    pub sender: Option<UserRef>,
    /// Message body text.
    pub body: String,
    /// Ordered attachment URLs.
    pub attachments: Vec<String>,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Set when the body was edited after creation.
    pub edited: bool,
    /// Set when the message was deleted; deleted entries are retained and
    /// filtered out of the visible view.
    pub deleted: bool,
    /// Ids of users who have observed the message.
    pub seen_by: Vec<String>,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Establish the realtime channel using the injected session token.
    ///
    /// A missing/empty token degrades to polling-only mode instead of failing.
    Open,
    /// Make a conversation active; idempotent for the already-active id.
    JoinConversation {
        /// Target conversation id.
        conversation_id: String,
    },
    /// Clear the active conversation without tearing the channel down.
    LeaveConversation,
    /// Emit the latest conversation list snapshot.
    ListConversations,
    /// Re-fetch the active conversation's message snapshot.
    RefreshMessages,
    /// Send a message into the active conversation.
    SendMessage {
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
        /// Message body.
        text: String,
        /// Ordered attachment URLs.
        attachments: Vec<String>,
    },
    /// Edit an own, non-deleted message.
    EditMessage {
        /// Server id of the message being edited.
        message_id: String,
        /// Replacement body.
        new_text: String,
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
    },
    /// Delete an own message (retained with a deleted flag).
    DeleteMessage {
        /// Server id of the message being deleted.
        message_id: String,
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
    },
    /// Report a local keystroke; emission is throttled by the core.
    NotifyTyping,
    /// Mark a message as seen by the current user.
    MarkSeen {
        /// Server id of the observed message.
        message_id: String,
    },
    /// Report the viewport's distance from the bottom in pixels.
    ObserveScroll {
        /// Distance from the bottom edge, in pixels.
        distance_from_bottom_px: u32,
    },
    /// Tear the channel down deterministically.
    Close,
}

/// Acknowledgement for send/edit commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original frontend transaction id.
    pub client_txn_id: String,
    /// Server message id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Realtime connection transition.
    ConnectionChanged {
        /// New connection state.
        state: ConnectionState,
    },
    /// Full conversation list replacement.
    ConversationListUpdated {
        /// Latest conversation metadata.
        conversations: Vec<Conversation>,
    },
    /// Full message list replacement after a snapshot merge.
    MessagesReset {
        /// Owning conversation id.
        conversation_id: String,
        /// Merged messages in display order.
        messages: Vec<Message>,
    },
    /// A message was appended at the end of the list.
    MessageAppended {
        /// Owning conversation id.
        conversation_id: String,
        /// Appended message.
        message: Message,
    },
    /// An existing entry was replaced in place (supersession, edit, delete
    /// flag, seen update).
    MessageReplaced {
        /// Owning conversation id.
        conversation_id: String,
        /// Identity of the entry that was replaced.
        replaced: MessageId,
        /// Authoritative entry now at that position.
        message: Message,
    },
    /// An entry was removed (failed optimistic send).
    MessageRemoved {
        /// Owning conversation id.
        conversation_id: String,
        /// Identity of the removed entry.
        removed: MessageId,
    },
    /// Send/edit acknowledgement.
    SendAck(SendAck),
    /// The set of remote users typing in the active conversation changed.
    TypingChanged {
        /// Owning conversation id.
        conversation_id: String,
        /// Display names currently typing.
        user_names: Vec<String>,
    },
    /// Seen-by set changed for a message.
    SeenChanged {
        /// Server id of the observed message.
        message_id: String,
        /// Updated set of observer user ids.
        seen_by: Vec<String>,
    },
    /// The view should scroll to the bottom (viewport was pinned before the
    /// triggering mutation).
    AutoScroll {
        /// Owning conversation id.
        conversation_id: String,
    },
    /// Fatal runtime error.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
