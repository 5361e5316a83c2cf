//! Wire representations shared by the REST client and the realtime gateway.
//!
//! The backend speaks camelCase JSON with kebab-case event tags; optional
//! fields may be absent and default to empty values rather than failing
//! deserialization.

use chat_core::{Conversation, ConversationStatus, Message, MessageId, UserRef};
use serde::{Deserialize, Serialize};

/// Participant reference as the backend serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

impl WireUser {
    fn into_user(self) -> UserRef {
        UserRef {
            id: self.id,
            display_name: self.display_name,
        }
    }
}

/// Message payload as the backend serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub sender: Option<WireUser>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub seen_by: Vec<String>,
}

impl WireMessage {
    /// Convert into the core model; the wire id is always server-assigned.
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::Server(self.id),
            conversation_id: self.conversation_id,
            sender: self.sender.map(WireUser::into_user),
            body: self.text,
            attachments: self.attachments,
            created_at_ms: self.created_at,
            edited: self.edited,
            deleted: self.deleted,
            seen_by: self.seen_by,
        }
    }
}

/// Conversation status string; unrecognized values degrade to `Open`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    #[default]
    Open,
    Resolved,
    Closed,
    #[serde(other)]
    Unknown,
}

impl WireStatus {
    fn into_status(self) -> ConversationStatus {
        match self {
            WireStatus::Open | WireStatus::Unknown => ConversationStatus::Open,
            WireStatus::Resolved => ConversationStatus::Resolved,
            WireStatus::Closed => ConversationStatus::Closed,
        }
    }
}

/// Conversation metadata as the backend serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub status: WireStatus,
    #[serde(default)]
    pub participants: Vec<WireUser>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<u64>,
}

impl WireConversation {
    pub fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            subject: self.subject,
            status: self.status.into_status(),
            participants: self
                .participants
                .into_iter()
                .map(WireUser::into_user)
                .collect(),
            last_message: self.last_message,
            last_message_at: self.last_message_at,
        }
    }
}

/// Events emitted by the client over the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Subscribe to conversation-list updates.
    JoinChats,
    /// Subscribe to one conversation's room.
    JoinChat { conversation_id: String },
    /// Send a message; `client_txn_id` is echoed back for correlation.
    SendMessage {
        conversation_id: String,
        client_txn_id: String,
        text: String,
        attachments: Vec<String>,
    },
    /// Typing start/stop signal.
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    /// Read receipt.
    MessageSeen {
        message_id: String,
        conversation_id: String,
    },
    /// Delete request over the socket (the runtime prefers the REST path).
    DeleteMessage {
        message_id: String,
        conversation_id: String,
    },
}

/// Events pushed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    NewMessage {
        conversation_id: String,
        message: WireMessage,
        #[serde(default)]
        client_txn_id: Option<String>,
    },
    MessageUpdated {
        conversation_id: String,
        message: WireMessage,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    Typing {
        conversation_id: String,
        user_names: Vec<String>,
    },
    MessageSeen {
        message_id: String,
        seen_by: Vec<String>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        client_txn_id: Option<String>,
    },
    /// Unrecognized event types are tolerated and dropped.
    #[serde(other)]
    Unknown,
}
