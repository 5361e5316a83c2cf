use crate::{
    error::ChatError,
    types::{ChatEvent, Message, MessageId, SendAck},
};

/// Internal helper describing a send/edit outcome before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The command succeeded and produced an authoritative message.
    Success { message: Message },
    /// The command failed with chat error details.
    Failure { error: ChatError },
}

/// Convert a send/edit outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(client_txn_id: impl Into<String>, outcome: SendOutcome) -> ChatEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: match &message.id {
                MessageId::Server(id) => Some(id.clone()),
                MessageId::Local(_) => None,
            },
            error_code: None,
        }),
        SendOutcome::Failure { error } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `FatalError` chat event.
pub fn normalize_fatal_error(error: ChatError, recoverable: bool) -> ChatEvent {
    ChatEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;
    use crate::types::UserRef;

    fn confirmed_message(server_id: &str) -> Message {
        Message {
            id: MessageId::Server(server_id.into()),
            conversation_id: "conv-1".into(),
            sender: Some(UserRef {
                id: "u-alice".into(),
                display_name: "Alice".into(),
            }),
            body: "hello".into(),
            attachments: Vec::new(),
            created_at_ms: 1_000,
            edited: false,
            deleted: false,
            seen_by: Vec::new(),
        }
    }

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            "txn-1",
            SendOutcome::Success {
                message: confirmed_message("srv-42"),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id.as_deref(), Some("srv-42"));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Failure {
                error: ChatError::new(
                    ChatErrorCategory::Network,
                    "send_failed",
                    "connection reset",
                ),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-2");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("send_failed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
