//! Core chat synchronization contract shared between runtime and frontend consumers.
//!
//! This crate defines the command/event protocol, connection lifecycle model,
//! message reconciliation engine, typing/scroll policies, and common
//! error/channel abstractions. It performs no I/O; the `chat-client` crate
//! drives it against real collaborators.

/// Async command/event channel primitives.
pub mod channel;
/// Connection lifecycle state machine and conversation generation guard.
pub mod connection;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Event normalization helpers (for example send acknowledgements).
pub mod normalization;
/// Message reconciliation engine (snapshot merge + optimistic supersession).
pub mod reconcile;
/// Bounded reconnect policy used by the gateway retry loop.
pub mod retry;
/// Scroll/viewport auto-scroll policy.
pub mod scroll;
/// Typing/presence tracker with throttle and expiry.
pub mod typing;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannels, EventStream};
pub use connection::{ConnectionLifecycle, JoinOutcome, OpenOutcome};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{SendOutcome, normalize_fatal_error, normalize_send_outcome};
pub use reconcile::{EditRollback, MergeOutcome, MessageLog, SUPERSESSION_WINDOW_MS};
pub use retry::{ReconnectDecision, ReconnectPolicy, StopReason};
pub use scroll::ScrollPolicy;
pub use typing::TypingTracker;
pub use types::{
    ChatCommand, ChatEvent, ConnectionState, Conversation, ConversationStatus, Message, MessageId,
    SendAck, UserRef,
};
