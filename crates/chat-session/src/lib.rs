//! Session/identity access for the chat client.
//!
//! The runtime never reads ambient global auth state; it receives a
//! [`SessionProvider`] explicitly at construction time and asks it for the
//! current user and bearer token whenever it opens a connection or issues a
//! REST call.

use std::sync::{Arc, RwLock};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// The authenticated user as the chat core needs to know them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
    pub display_name: String,
}

/// Synchronous access to the current identity and bearer token.
pub trait SessionProvider: Send + Sync {
    fn current_user(&self) -> Result<SessionUser, SessionError>;

    fn bearer_token(&self) -> Result<String, SessionError>;
}

#[derive(Debug, Clone)]
struct SessionState {
    user: SessionUser,
    token: String,
}

/// In-memory session holder, updatable by the host application's auth flow.
#[derive(Clone, Default)]
pub struct InMemorySession {
    state: Arc<RwLock<Option<SessionState>>>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for an already-signed-in session.
    pub fn signed_in(user: SessionUser, token: impl Into<String>) -> Self {
        let session = Self::new();
        session.sign_in(user, token);
        session
    }

    pub fn sign_in(&self, user: SessionUser, token: impl Into<String>) {
        if let Ok(mut state) = self.state.write() {
            *state = Some(SessionState {
                user,
                token: token.into(),
            });
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = None;
        }
    }
}

impl SessionProvider for InMemorySession {
    fn current_user(&self) -> Result<SessionUser, SessionError> {
        let state = self
            .state
            .read()
            .map_err(|_| SessionError::Unavailable("poisoned lock".to_owned()))?;
        state
            .as_ref()
            .map(|session| session.user.clone())
            .ok_or(SessionError::NotAuthenticated)
    }

    fn bearer_token(&self) -> Result<String, SessionError> {
        let state = self
            .state
            .read()
            .map_err(|_| SessionError::Unavailable("poisoned lock".to_owned()))?;
        state
            .as_ref()
            .map(|session| session.token.clone())
            .ok_or(SessionError::NotAuthenticated)
    }
}
