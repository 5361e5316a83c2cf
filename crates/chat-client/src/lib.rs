//! Chat runtime adapter.
//!
//! Connects the pure synchronization core in `chat-core` to real
//! collaborators: the chat REST API, the realtime WebSocket gateway, and the
//! session layer. The entry point is [`spawn_runtime`], which starts the
//! command loop and hands back a [`ChatRuntimeHandle`] for the frontend
//! bridge.

pub mod gateway;
pub mod rest;
pub mod runtime;
pub mod wire;

pub use gateway::{GatewayHandle, GatewayNotice, spawn_gateway};
pub use rest::ChatRestClient;
pub use runtime::{ChatRuntimeConfig, ChatRuntimeHandle, spawn_runtime};
pub use wire::{ClientFrame, ServerFrame, WireConversation, WireMessage, WireUser};
