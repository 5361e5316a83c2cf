//! REST client for the chat API.
//!
//! Thin wrapper over `reqwest` that attaches the session bearer token,
//! converts transport/status failures into classified [`ChatError`]s, and
//! maps wire payloads into core types.

use std::sync::Arc;

use chat_core::{ChatError, ChatErrorCategory, Conversation, Message, classify_http_status};
use chat_session::{SessionError, SessionProvider};
use serde::Serialize;
use url::Url;

use crate::wire::{WireConversation, WireMessage};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    text: &'a str,
    attachments: &'a [String],
}

#[derive(Debug, Serialize)]
struct EditMessageBody<'a> {
    text: &'a str,
}

/// Authenticated chat REST API client.
#[derive(Clone)]
pub struct ChatRestClient {
    http: reqwest::Client,
    base_url: Url,
    session: Arc<dyn SessionProvider>,
}

impl ChatRestClient {
    pub fn new(base_url: Url, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            session,
        }
    }

    /// `GET /chats`
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let url = self.endpoint(&["chats"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(map_transport_error)?;
        let wire: Vec<WireConversation> = decode(check_status(response)?).await?;
        Ok(wire
            .into_iter()
            .map(WireConversation::into_conversation)
            .collect())
    }

    /// `GET /chats/{id}/messages`
    pub async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let url = self.endpoint(&["chats", conversation_id, "messages"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(map_transport_error)?;
        let wire: Vec<WireMessage> = decode(check_status(response)?).await?;
        Ok(wire.into_iter().map(WireMessage::into_message).collect())
    }

    /// `POST /chats/{id}/messages`
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: &[String],
    ) -> Result<Message, ChatError> {
        let url = self.endpoint(&["chats", conversation_id, "messages"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(&SendMessageBody { text, attachments })
            .send()
            .await
            .map_err(map_transport_error)?;
        let wire: WireMessage = decode(check_status(response)?).await?;
        Ok(wire.into_message())
    }

    /// `PUT /messages/{id}`
    pub async fn edit_message(&self, message_id: &str, text: &str) -> Result<Message, ChatError> {
        let url = self.endpoint(&["messages", message_id])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(self.token()?)
            .json(&EditMessageBody { text })
            .send()
            .await
            .map_err(map_transport_error)?;
        let wire: WireMessage = decode(check_status(response)?).await?;
        Ok(wire.into_message())
    }

    /// `DELETE /messages/{id}`
    pub async fn delete_message(&self, message_id: &str) -> Result<(), ChatError> {
        let url = self.endpoint(&["messages", message_id])?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response)?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChatError::new(
                    ChatErrorCategory::Internal,
                    "invalid_base_url",
                    format!("base url '{}' cannot carry a path", self.base_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn token(&self) -> Result<String, ChatError> {
        self.session.bearer_token().map_err(map_session_error)
    }
}

fn map_session_error(err: SessionError) -> ChatError {
    match err {
        SessionError::NotAuthenticated => ChatError::new(
            ChatErrorCategory::Auth,
            "not_authenticated",
            "no session token available for the chat API",
        ),
        SessionError::Unavailable(message) => ChatError::new(
            ChatErrorCategory::Internal,
            "session_unavailable",
            message,
        ),
    }
}

fn map_transport_error(err: reqwest::Error) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Network,
        "rest_transport_error",
        err.to_string(),
    )
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(|seconds| seconds.saturating_mul(1_000));

    let mut error = ChatError::new(
        classify_http_status(status.as_u16()),
        "rest_http_error",
        format!("chat API responded with HTTP {status}"),
    );
    error.retry_after_ms = retry_after_ms;
    Err(error)
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ChatError> {
    response.json::<T>().await.map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "rest_decode_error",
            err.to_string(),
        )
    })
}
