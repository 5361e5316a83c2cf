use crate::{
    error::ChatError,
    types::ConnectionState,
};

/// Result of an `open` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Handshake started; the gateway task should connect.
    Connecting,
    /// No usable session token; stay on REST polling only.
    PollingOnly,
}

/// Result of a `join_conversation` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The active conversation changed; stale async work is invalidated.
    Switched {
        /// Generation that in-flight work must match to be applied.
        generation: u64,
    },
    /// Rejoining the already-active conversation is a no-op.
    AlreadyActive,
}

/// Connection lifecycle state machine.
///
/// Owns the realtime channel state, the active conversation id, and the
/// generation counter that invalidates async callbacks after a conversation
/// switch. The reconciliation engine never mutates this; it only reacts to
/// events the runtime derives from it.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    current_conversation: Option<String>,
    generation: u64,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            current_conversation: None,
            generation: 0,
        }
    }
}

impl ConnectionLifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_conversation(&self) -> Option<&str> {
        self.current_conversation.as_deref()
    }

    /// Whether an inbound event tagged with `conversation_id` targets the
    /// active conversation.
    pub fn accepts(&self, conversation_id: &str) -> bool {
        self.current_conversation.as_deref() == Some(conversation_id)
    }

    /// Whether an async result captured at `generation` is still current.
    pub fn accepts_generation(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Begin the realtime handshake.
    ///
    /// An empty session token cannot authenticate the handshake; the panel
    /// stays live in polling-only mode instead of erroring.
    pub fn open(&mut self, session_token: &str) -> Result<OpenOutcome, ChatError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ChatError::invalid_state(self.state, "open"));
        }
        if session_token.trim().is_empty() {
            return Ok(OpenOutcome::PollingOnly);
        }
        self.state = ConnectionState::Connecting;
        Ok(OpenOutcome::Connecting)
    }

    /// The gateway finished its handshake.
    pub fn mark_connected(&mut self) -> Result<(), ChatError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            other => Err(ChatError::invalid_state(other, "mark_connected")),
        }
    }

    /// The gateway lost the connection and is retrying.
    pub fn mark_reconnecting(&mut self) -> Result<(), ChatError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.state = ConnectionState::Reconnecting;
                Ok(())
            }
            other => Err(ChatError::invalid_state(other, "mark_reconnecting")),
        }
    }

    /// The gateway loop ended (auth rejection or attempts exhausted).
    ///
    /// The active conversation is kept; REST polling continues to serve it.
    pub fn mark_stopped(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Explicit teardown: panel close or conversation-panel destruction.
    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.current_conversation = None;
        self.generation += 1;
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Idempotent for the already-active id. Switching bumps the generation
    /// counter so events and REST responses for the old conversation are
    /// discarded by the `accepts*` guards.
    pub fn join_conversation(&mut self, conversation_id: &str) -> JoinOutcome {
        if self.current_conversation.as_deref() == Some(conversation_id) {
            return JoinOutcome::AlreadyActive;
        }
        self.current_conversation = Some(conversation_id.to_owned());
        self.generation += 1;
        JoinOutcome::Switched {
            generation: self.generation,
        }
    }

    /// Clear the active conversation, invalidating in-flight work for it.
    pub fn leave_conversation(&mut self) -> u64 {
        self.current_conversation = None;
        self.generation += 1;
        self.generation
    }
}
