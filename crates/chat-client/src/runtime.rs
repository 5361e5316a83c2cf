//! Chat runtime: the single-threaded command loop that owns the core state
//! (lifecycle, message log, typing set, scroll policy) and drives it from
//! four input sources: frontend commands, gateway notices, the periodic
//! REST refresh, and the housekeeping tick.
//!
//! Every asynchronous completion re-validates the conversation generation
//! before touching shared state; a response that resolves after the user
//! switched conversations is dropped.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chat_core::{
    ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvent,
    ConnectionLifecycle, ConnectionState, Conversation, EditRollback, EventStream, JoinOutcome,
    MergeOutcome, Message, MessageId, MessageLog, OpenOutcome, ReconnectPolicy, ScrollPolicy,
    SendAck, SendOutcome, TypingTracker, UserRef, normalize_fatal_error, normalize_send_outcome,
};
use chat_session::SessionProvider;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    gateway::{GatewayHandle, GatewayNotice, spawn_gateway},
    rest::ChatRestClient,
    wire::{ClientFrame, ServerFrame},
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const NOTICE_BUFFER: usize = 256;
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(250);

/// Runtime construction parameters.
#[derive(Debug, Clone)]
pub struct ChatRuntimeConfig {
    /// Base URL of the chat REST API.
    pub rest_base_url: Url,
    /// WebSocket URL of the realtime gateway.
    pub gateway_url: Url,
    /// Interval of the periodic snapshot re-fetch for the active
    /// conversation.
    pub refresh_interval: Duration,
    /// Bounded reconnect policy for the gateway.
    pub reconnect: ReconnectPolicy,
}

impl ChatRuntimeConfig {
    pub fn new(rest_base_url: Url, gateway_url: Url) -> Self {
        Self {
            rest_base_url,
            gateway_url,
            refresh_interval: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Cloneable handle for issuing commands and subscribing to events.
#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the runtime task and return its handle.
pub fn spawn_runtime(
    config: ChatRuntimeConfig,
    session: Arc<dyn SessionProvider>,
) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = ChatRuntime::new(config, session, channels.clone(), command_rx);
    tokio::spawn(runtime.run());
    ChatRuntimeHandle { channels }
}

/// Completions fed back into the runtime loop by spawned I/O tasks.
enum RuntimeNotice {
    Gateway {
        epoch: u64,
        notice: GatewayNotice,
    },
    ConversationsLoaded {
        result: Result<Vec<Conversation>, ChatError>,
    },
    SnapshotLoaded {
        conversation_id: String,
        generation: u64,
        result: Result<Vec<Message>, ChatError>,
    },
    SendCompleted {
        generation: u64,
        client_txn_id: String,
        local_id: String,
        result: Result<Message, ChatError>,
    },
    EditCompleted {
        generation: u64,
        client_txn_id: String,
        message_id: String,
        rollback: EditRollback,
        result: Result<Message, ChatError>,
    },
    DeleteCompleted {
        generation: u64,
        client_txn_id: String,
        message_id: String,
        result: Result<(), ChatError>,
    },
}

struct ChatRuntime {
    config: ChatRuntimeConfig,
    session: Arc<dyn SessionProvider>,
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    notice_tx: mpsc::Sender<RuntimeNotice>,
    notice_rx: mpsc::Receiver<RuntimeNotice>,
    rest: ChatRestClient,
    lifecycle: ConnectionLifecycle,
    log: Option<MessageLog>,
    typing: TypingTracker,
    scroll: ScrollPolicy,
    gateway: Option<GatewayHandle>,
    gateway_epoch: u64,
    pending_txns: HashMap<String, String>,
}

impl ChatRuntime {
    fn new(
        config: ChatRuntimeConfig,
        session: Arc<dyn SessionProvider>,
        channels: ChatChannels,
        command_rx: mpsc::Receiver<ChatCommand>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_BUFFER);
        let rest = ChatRestClient::new(config.rest_base_url.clone(), Arc::clone(&session));
        Self {
            config,
            session,
            channels,
            command_rx,
            notice_tx,
            notice_rx,
            rest,
            lifecycle: ConnectionLifecycle::default(),
            log: None,
            typing: TypingTracker::new(),
            scroll: ScrollPolicy::default(),
            gateway: None,
            gateway_epoch: 0,
            pending_txns: HashMap::new(),
        }
    }

    async fn run(mut self) {
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_TICK);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(notice) = self.notice_rx.recv() => {
                    self.handle_notice(notice).await;
                }
                _ = refresh.tick() => self.refresh_active_conversation(),
                _ = housekeeping.tick() => self.tick_housekeeping().await,
            }
        }

        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown();
        }
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Open => self.handle_open(),
            ChatCommand::JoinConversation { conversation_id } => {
                self.handle_join(conversation_id).await
            }
            ChatCommand::LeaveConversation => self.handle_leave(),
            ChatCommand::ListConversations => self.spawn_conversation_list_fetch(),
            ChatCommand::RefreshMessages => self.refresh_active_conversation(),
            ChatCommand::SendMessage {
                client_txn_id,
                text,
                attachments,
            } => self.handle_send(client_txn_id, text, attachments).await,
            ChatCommand::EditMessage {
                message_id,
                new_text,
                client_txn_id,
            } => self.handle_edit(message_id, new_text, client_txn_id),
            ChatCommand::DeleteMessage {
                message_id,
                client_txn_id,
            } => self.handle_delete(message_id, client_txn_id),
            ChatCommand::NotifyTyping => self.handle_typing().await,
            ChatCommand::MarkSeen { message_id } => self.handle_mark_seen(message_id).await,
            ChatCommand::ObserveScroll {
                distance_from_bottom_px,
            } => self.scroll.observe(distance_from_bottom_px),
            ChatCommand::Close => self.handle_close(),
        }
    }

    fn handle_open(&mut self) {
        let token = self.session.bearer_token().unwrap_or_default();
        match self.lifecycle.open(&token) {
            Ok(OpenOutcome::Connecting) => {
                self.emit_connection();
                self.spawn_gateway_task(token);
            }
            Ok(OpenOutcome::PollingOnly) => {
                tracing::info!("no session token; realtime channel stays down, REST polling only");
            }
            Err(error) => {
                let recoverable = error.is_transient();
                self.channels.emit(normalize_fatal_error(error, recoverable));
            }
        }
    }

    fn spawn_gateway_task(&mut self, token: String) {
        self.gateway_epoch += 1;
        let epoch = self.gateway_epoch;

        let (gateway_tx, mut gateway_rx) = mpsc::channel(64);
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            while let Some(notice) = gateway_rx.recv().await {
                if notice_tx
                    .send(RuntimeNotice::Gateway { epoch, notice })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        self.gateway = Some(spawn_gateway(
            self.config.gateway_url.clone(),
            token,
            self.config.reconnect,
            gateway_tx,
        ));
    }

    async fn handle_join(&mut self, conversation_id: String) {
        match self.lifecycle.join_conversation(&conversation_id) {
            JoinOutcome::AlreadyActive => {}
            JoinOutcome::Switched { generation } => {
                self.typing.clear();
                self.scroll.reset();
                self.pending_txns.clear();
                self.log = Some(MessageLog::new(conversation_id.clone()));
                self.channels.emit(ChatEvent::MessagesReset {
                    conversation_id: conversation_id.clone(),
                    messages: Vec::new(),
                });

                if self.lifecycle.state() == ConnectionState::Connected
                    && let Some(gateway) = self.gateway.clone()
                {
                    let _ = gateway
                        .send(ClientFrame::JoinChat {
                            conversation_id: conversation_id.clone(),
                        })
                        .await;
                }
                self.spawn_snapshot_fetch(conversation_id, generation);
            }
        }
    }

    fn handle_leave(&mut self) {
        self.lifecycle.leave_conversation();
        self.log = None;
        self.typing.clear();
        self.pending_txns.clear();
    }

    fn handle_close(&mut self) {
        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown();
        }
        self.lifecycle.close();
        self.log = None;
        self.typing.clear();
        self.pending_txns.clear();
        self.emit_connection();
    }

    async fn handle_send(&mut self, client_txn_id: String, text: String, attachments: Vec<String>) {
        let sender = self.current_user_ref();
        let now = now_ms();

        let Some(log) = self.log.as_mut() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Failure {
                    error: no_active_conversation(),
                },
            ));
            return;
        };
        let pending = match log.begin_send(sender, &text, attachments.clone(), now) {
            Ok(pending) => pending,
            Err(error) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
                return;
            }
        };
        let conversation_id = log.conversation_id().to_owned();

        self.channels.emit(ChatEvent::MessageAppended {
            conversation_id: conversation_id.clone(),
            message: pending.clone(),
        });
        self.maybe_autoscroll(&conversation_id);

        if self.lifecycle.state() == ConnectionState::Connected
            && let Some(gateway) = self.gateway.clone()
        {
            // The server echo (push event) supersedes the pending entry and
            // resolves the ack; failures come back as an error frame.
            self.pending_txns
                .insert(client_txn_id.clone(), pending.id.as_str().to_owned());
            let accepted = gateway
                .send(ClientFrame::SendMessage {
                    conversation_id: conversation_id.clone(),
                    client_txn_id: client_txn_id.clone(),
                    text: text.clone(),
                    attachments: attachments.clone(),
                })
                .await;
            if accepted {
                return;
            }
            // The gateway task died before taking the frame; no echo or
            // error frame will ever resolve this txn. Send over REST instead.
            tracing::debug!(%client_txn_id, "gateway dropped send frame, using REST");
            self.pending_txns.remove(&client_txn_id);
        }

        // REST fallback while the realtime channel is down.
        let generation = self.lifecycle.generation();
        let local_id = pending.id.as_str().to_owned();
        let rest = self.rest.clone();
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            let result = rest.send_message(&conversation_id, &text, &attachments).await;
            let _ = notice_tx
                .send(RuntimeNotice::SendCompleted {
                    generation,
                    client_txn_id,
                    local_id,
                    result,
                })
                .await;
        });
    }

    fn handle_edit(&mut self, message_id: String, new_text: String, client_txn_id: String) {
        let Some(user_id) = self.current_user_id() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Failure {
                    error: not_authenticated(),
                },
            ));
            return;
        };
        let Some(log) = self.log.as_mut() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Failure {
                    error: no_active_conversation(),
                },
            ));
            return;
        };

        match log.begin_edit(&message_id, &new_text, &user_id) {
            Ok(rollback) => {
                let conversation_id = log.conversation_id().to_owned();
                let updated = log.get(&message_id).cloned();
                if let Some(message) = updated {
                    self.channels.emit(ChatEvent::MessageReplaced {
                        conversation_id,
                        replaced: MessageId::Server(message_id.clone()),
                        message,
                    });
                }

                let generation = self.lifecycle.generation();
                let rest = self.rest.clone();
                let notice_tx = self.notice_tx.clone();
                tokio::spawn(async move {
                    let result = rest.edit_message(&message_id, &new_text).await;
                    let _ = notice_tx
                        .send(RuntimeNotice::EditCompleted {
                            generation,
                            client_txn_id,
                            message_id,
                            rollback,
                            result,
                        })
                        .await;
                });
            }
            Err(error) if error.category == ChatErrorCategory::Conflict => {
                // Target already gone on this client; the next snapshot
                // refresh settles the view.
                tracing::debug!(%message_id, code = %error.code, "edit target missing, ignoring");
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    client_txn_id,
                    message_id: Some(message_id),
                    error_code: None,
                }));
            }
            Err(error) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    fn handle_delete(&mut self, message_id: String, client_txn_id: String) {
        let Some(user_id) = self.current_user_id() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Failure {
                    error: not_authenticated(),
                },
            ));
            return;
        };
        let Some(log) = self.log.as_mut() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Failure {
                    error: no_active_conversation(),
                },
            ));
            return;
        };

        match log.begin_delete(&message_id, &user_id) {
            Ok(()) => {
                let conversation_id = log.conversation_id().to_owned();
                let updated = log.get(&message_id).cloned();
                if let Some(message) = updated {
                    self.channels.emit(ChatEvent::MessageReplaced {
                        conversation_id,
                        replaced: MessageId::Server(message_id.clone()),
                        message,
                    });
                }

                let generation = self.lifecycle.generation();
                let rest = self.rest.clone();
                let notice_tx = self.notice_tx.clone();
                tokio::spawn(async move {
                    let result = rest.delete_message(&message_id).await;
                    let _ = notice_tx
                        .send(RuntimeNotice::DeleteCompleted {
                            generation,
                            client_txn_id,
                            message_id,
                            result,
                        })
                        .await;
                });
            }
            Err(error) if error.category == ChatErrorCategory::Conflict => {
                tracing::debug!(%message_id, code = %error.code, "delete target missing, ignoring");
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    client_txn_id,
                    message_id: Some(message_id),
                    error_code: None,
                }));
            }
            Err(error) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    async fn handle_typing(&mut self) {
        let Some(conversation_id) = self
            .lifecycle
            .current_conversation()
            .map(ToOwned::to_owned)
        else {
            return;
        };
        if !self.typing.notify_local_typing(Instant::now()) {
            return;
        }
        if self.lifecycle.state() == ConnectionState::Connected
            && let Some(gateway) = self.gateway.clone()
        {
            let _ = gateway
                .send(ClientFrame::Typing {
                    conversation_id,
                    is_typing: true,
                })
                .await;
        }
    }

    async fn handle_mark_seen(&mut self, message_id: String) {
        let Some(user_id) = self.current_user_id() else {
            return;
        };

        let mut conversation_id = None;
        let mut updated_seen = None;
        if let Some(log) = self.log.as_mut() {
            conversation_id = Some(log.conversation_id().to_owned());
            if log.apply_seen(&message_id, std::slice::from_ref(&user_id)) {
                updated_seen = log.get(&message_id).map(|message| message.seen_by.clone());
            }
        }

        if let Some(seen_by) = updated_seen {
            self.channels.emit(ChatEvent::SeenChanged {
                message_id: message_id.clone(),
                seen_by,
            });
        }

        if let Some(conversation_id) = conversation_id
            && self.lifecycle.state() == ConnectionState::Connected
            && let Some(gateway) = self.gateway.clone()
        {
            let _ = gateway
                .send(ClientFrame::MessageSeen {
                    message_id,
                    conversation_id,
                })
                .await;
        }
    }

    async fn handle_notice(&mut self, notice: RuntimeNotice) {
        match notice {
            RuntimeNotice::Gateway { epoch, notice } => {
                if epoch != self.gateway_epoch {
                    tracing::debug!(epoch, "dropping notice from stale gateway task");
                    return;
                }
                self.handle_gateway_notice(notice).await;
            }
            RuntimeNotice::ConversationsLoaded { result } => match result {
                Ok(conversations) => {
                    self.channels
                        .emit(ChatEvent::ConversationListUpdated { conversations });
                }
                Err(error) => {
                    let recoverable = error.is_transient();
                    self.channels.emit(normalize_fatal_error(error, recoverable));
                }
            },
            RuntimeNotice::SnapshotLoaded {
                conversation_id,
                generation,
                result,
            } => self.apply_snapshot_result(conversation_id, generation, result),
            RuntimeNotice::SendCompleted {
                generation,
                client_txn_id,
                local_id,
                result,
            } => self.apply_send_result(generation, client_txn_id, local_id, result),
            RuntimeNotice::EditCompleted {
                generation,
                client_txn_id,
                message_id,
                rollback,
                result,
            } => self.apply_edit_result(generation, client_txn_id, message_id, rollback, result),
            RuntimeNotice::DeleteCompleted {
                generation,
                client_txn_id,
                message_id,
                result,
            } => self.apply_delete_result(generation, client_txn_id, message_id, result),
        }
    }

    async fn handle_gateway_notice(&mut self, notice: GatewayNotice) {
        match notice {
            GatewayNotice::Connected => {
                if self.lifecycle.mark_connected().is_err() {
                    return;
                }
                self.emit_connection();
                let Some(gateway) = self.gateway.clone() else {
                    return;
                };
                let _ = gateway.send(ClientFrame::JoinChats).await;
                if let Some(conversation_id) = self
                    .lifecycle
                    .current_conversation()
                    .map(ToOwned::to_owned)
                {
                    let _ = gateway
                        .send(ClientFrame::JoinChat {
                            conversation_id: conversation_id.clone(),
                        })
                        .await;
                    self.spawn_snapshot_fetch(conversation_id, self.lifecycle.generation());
                }
            }
            GatewayNotice::Reconnecting { attempt } => {
                if self.lifecycle.mark_reconnecting().is_ok() {
                    tracing::debug!(attempt, "gateway reconnect in progress");
                    self.emit_connection();
                }
            }
            GatewayNotice::Stopped { error } => {
                self.gateway = None;
                let was_connected = self.lifecycle.state() != ConnectionState::Disconnected;
                self.lifecycle.mark_stopped();
                if was_connected {
                    self.emit_connection();
                }
                if let Some(error) = error {
                    let recoverable = error.is_transient();
                    self.channels.emit(normalize_fatal_error(error, recoverable));
                }
            }
            GatewayNotice::Frame(frame) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::NewMessage {
                conversation_id,
                message,
                client_txn_id,
            } => {
                if !self.lifecycle.accepts(&conversation_id) {
                    return;
                }
                self.merge_new_message(conversation_id, message.into_message(), client_txn_id)
                    .await;
            }
            ServerFrame::MessageUpdated {
                conversation_id,
                message,
            } => {
                if !self.lifecycle.accepts(&conversation_id) {
                    return;
                }
                let incoming = message.into_message();
                let updated = self.log.as_mut().and_then(|log| {
                    if log.apply_update(&incoming) {
                        log.get(incoming.id.as_str()).cloned()
                    } else {
                        None
                    }
                });
                if let Some(message) = updated {
                    self.channels.emit(ChatEvent::MessageReplaced {
                        conversation_id: conversation_id.clone(),
                        replaced: message.id.clone(),
                        message,
                    });
                    self.maybe_autoscroll(&conversation_id);
                }
            }
            ServerFrame::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                if !self.lifecycle.accepts(&conversation_id) {
                    return;
                }
                let updated = self.log.as_mut().and_then(|log| {
                    if log.apply_delete(&message_id) {
                        log.get(&message_id).cloned()
                    } else {
                        None
                    }
                });
                if let Some(message) = updated {
                    self.channels.emit(ChatEvent::MessageReplaced {
                        conversation_id,
                        replaced: message.id.clone(),
                        message,
                    });
                }
            }
            ServerFrame::Typing {
                conversation_id,
                user_names,
            } => {
                if !self.lifecycle.accepts(&conversation_id) {
                    return;
                }
                let me = self.current_user_name();
                let remote: Vec<String> = user_names
                    .into_iter()
                    .filter(|name| Some(name.as_str()) != me.as_deref())
                    .collect();
                if self.typing.apply_remote(&remote, Instant::now()) {
                    self.channels.emit(ChatEvent::TypingChanged {
                        conversation_id,
                        user_names: self.typing.names(),
                    });
                }
            }
            ServerFrame::MessageSeen {
                message_id,
                seen_by,
            } => {
                let updated = self.log.as_mut().and_then(|log| {
                    if log.apply_seen(&message_id, &seen_by) {
                        log.get(&message_id).map(|message| message.seen_by.clone())
                    } else {
                        None
                    }
                });
                if let Some(seen_by) = updated {
                    self.channels.emit(ChatEvent::SeenChanged {
                        message_id,
                        seen_by,
                    });
                }
            }
            ServerFrame::Error {
                code,
                message,
                client_txn_id,
            } => self.handle_gateway_error(code, message, client_txn_id),
            ServerFrame::Unknown => {}
        }
    }

    async fn merge_new_message(
        &mut self,
        conversation_id: String,
        incoming: Message,
        client_txn_id: Option<String>,
    ) {
        // Direct txn correlation first; content matching is the fallback for
        // echoes that lost the txn id.
        if let Some(txn) = client_txn_id
            && let Some(local_id) = self.pending_txns.remove(&txn)
        {
            let confirmed = self
                .log
                .as_mut()
                .map(|log| log.confirm_send(&local_id, incoming.clone()))
                .unwrap_or(false);
            self.channels.emit(normalize_send_outcome(
                txn,
                SendOutcome::Success {
                    message: incoming.clone(),
                },
            ));
            if confirmed {
                self.channels.emit(ChatEvent::MessageReplaced {
                    conversation_id: conversation_id.clone(),
                    replaced: MessageId::Local(local_id),
                    message: incoming,
                });
                self.maybe_autoscroll(&conversation_id);
                return;
            }
            // Pending entry already superseded or rolled back; fall through
            // so the duplicate guard settles the list.
        }

        let Some(log) = self.log.as_mut() else {
            return;
        };
        match log.apply_new_message(incoming.clone()) {
            MergeOutcome::Ignored => {}
            MergeOutcome::Appended => {
                self.channels.emit(ChatEvent::MessageAppended {
                    conversation_id: conversation_id.clone(),
                    message: incoming.clone(),
                });
                self.maybe_autoscroll(&conversation_id);
                self.maybe_mark_seen(&conversation_id, &incoming).await;
            }
            MergeOutcome::Superseded { local_id } => {
                let txn = self
                    .pending_txns
                    .iter()
                    .find(|(_, local)| **local == local_id)
                    .map(|(txn, _)| txn.clone());
                if let Some(txn) = txn {
                    self.pending_txns.remove(&txn);
                    self.channels.emit(normalize_send_outcome(
                        txn,
                        SendOutcome::Success {
                            message: incoming.clone(),
                        },
                    ));
                }
                self.channels.emit(ChatEvent::MessageReplaced {
                    conversation_id,
                    replaced: MessageId::Local(local_id),
                    message: incoming,
                });
            }
        }
    }

    /// Auto-acknowledge an inbound message when the viewport is pinned to the
    /// bottom, so the sender's read receipt updates without an explicit
    /// `MarkSeen`.
    async fn maybe_mark_seen(&mut self, conversation_id: &str, incoming: &Message) {
        if !self.scroll.should_autoscroll() {
            return;
        }
        let Some(user_id) = self.current_user_id() else {
            return;
        };
        if incoming.sender.as_ref().map(|sender| sender.id.as_str()) == Some(user_id.as_str()) {
            return;
        }
        let MessageId::Server(message_id) = &incoming.id else {
            return;
        };
        if self.lifecycle.state() == ConnectionState::Connected
            && let Some(gateway) = self.gateway.clone()
        {
            let _ = gateway
                .send(ClientFrame::MessageSeen {
                    message_id: message_id.clone(),
                    conversation_id: conversation_id.to_owned(),
                })
                .await;
        }
    }

    fn handle_gateway_error(&mut self, code: String, message: String, client_txn_id: Option<String>) {
        if let Some(txn) = client_txn_id {
            let Some(local_id) = self.pending_txns.remove(&txn) else {
                return;
            };
            let removed = self
                .log
                .as_mut()
                .map(|log| log.fail_send(&local_id))
                .unwrap_or(false);
            if removed
                && let Some(conversation_id) = self
                    .lifecycle
                    .current_conversation()
                    .map(ToOwned::to_owned)
            {
                self.channels.emit(ChatEvent::MessageRemoved {
                    conversation_id,
                    removed: MessageId::Local(local_id),
                });
            }
            self.channels.emit(ChatEvent::SendAck(SendAck {
                client_txn_id: txn,
                message_id: None,
                error_code: Some(code),
            }));
            return;
        }

        let auth = matches!(
            code.as_str(),
            "unauthorized" | "auth_rejected" | "token_expired"
        );
        if auth {
            // Terminal: do not let the reconnect loop mask a bad session.
            if let Some(gateway) = self.gateway.take() {
                gateway.shutdown();
            }
            self.channels.emit(ChatEvent::FatalError {
                code,
                message,
                recoverable: false,
            });
        } else {
            self.channels.emit(ChatEvent::FatalError {
                code,
                message,
                recoverable: true,
            });
        }
    }

    fn apply_snapshot_result(
        &mut self,
        conversation_id: String,
        generation: u64,
        result: Result<Vec<Message>, ChatError>,
    ) {
        if !self.lifecycle.accepts_generation(generation) || !self.lifecycle.accepts(&conversation_id)
        {
            tracing::debug!(%conversation_id, "dropping snapshot for stale conversation");
            return;
        }

        match result {
            Ok(messages) => {
                let merged = self.log.as_mut().map(|log| {
                    log.apply_snapshot(messages);
                    log.snapshot()
                });
                if let Some(messages) = merged {
                    self.channels.emit(ChatEvent::MessagesReset {
                        conversation_id: conversation_id.clone(),
                        messages,
                    });
                    self.maybe_autoscroll(&conversation_id);
                }
            }
            Err(error) => {
                if error.is_transient() {
                    tracing::warn!(error = %error, "snapshot refresh failed, retrying on next interval");
                } else {
                    self.channels.emit(normalize_fatal_error(error, false));
                }
            }
        }
    }

    fn apply_send_result(
        &mut self,
        generation: u64,
        client_txn_id: String,
        local_id: String,
        result: Result<Message, ChatError>,
    ) {
        match result {
            Ok(message) => {
                if self.lifecycle.accepts_generation(generation) {
                    let replaced = self
                        .log
                        .as_mut()
                        .map(|log| log.confirm_send(&local_id, message.clone()))
                        .unwrap_or(false);
                    if replaced {
                        self.channels.emit(ChatEvent::MessageReplaced {
                            conversation_id: message.conversation_id.clone(),
                            replaced: MessageId::Local(local_id),
                            message: message.clone(),
                        });
                    }
                }
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Success { message },
                ));
            }
            Err(error) => {
                if self.lifecycle.accepts_generation(generation) {
                    let removed = self
                        .log
                        .as_mut()
                        .map(|log| log.fail_send(&local_id))
                        .unwrap_or(false);
                    if removed
                        && let Some(conversation_id) = self
                            .lifecycle
                            .current_conversation()
                            .map(ToOwned::to_owned)
                    {
                        self.channels.emit(ChatEvent::MessageRemoved {
                            conversation_id,
                            removed: MessageId::Local(local_id),
                        });
                    }
                }
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    fn apply_edit_result(
        &mut self,
        generation: u64,
        client_txn_id: String,
        message_id: String,
        rollback: EditRollback,
        result: Result<Message, ChatError>,
    ) {
        match result {
            Ok(message) => {
                if self.lifecycle.accepts_generation(generation) {
                    let updated = self.log.as_mut().and_then(|log| {
                        if log.apply_update(&message) {
                            log.get(&message_id).cloned()
                        } else {
                            None
                        }
                    });
                    if let Some(message) = updated {
                        self.channels.emit(ChatEvent::MessageReplaced {
                            conversation_id: message.conversation_id.clone(),
                            replaced: MessageId::Server(message_id.clone()),
                            message,
                        });
                    }
                }
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Success { message },
                ));
            }
            Err(error) if error.category == ChatErrorCategory::Conflict => {
                tracing::debug!(%message_id, "edit target gone server-side, ignoring");
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    client_txn_id,
                    message_id: Some(message_id),
                    error_code: None,
                }));
            }
            Err(error) => {
                if self.lifecycle.accepts_generation(generation) {
                    let reverted = self.log.as_mut().and_then(|log| {
                        if log.revert_edit(&message_id, rollback) {
                            log.get(&message_id).cloned()
                        } else {
                            None
                        }
                    });
                    if let Some(message) = reverted {
                        self.channels.emit(ChatEvent::MessageReplaced {
                            conversation_id: message.conversation_id.clone(),
                            replaced: MessageId::Server(message_id.clone()),
                            message,
                        });
                    }
                }
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    fn apply_delete_result(
        &mut self,
        generation: u64,
        client_txn_id: String,
        message_id: String,
        result: Result<(), ChatError>,
    ) {
        match result {
            Ok(()) => {
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    client_txn_id,
                    message_id: Some(message_id),
                    error_code: None,
                }));
            }
            Err(error) if error.category == ChatErrorCategory::Conflict => {
                tracing::debug!(%message_id, "delete target gone server-side, ignoring");
                self.channels.emit(ChatEvent::SendAck(SendAck {
                    client_txn_id,
                    message_id: Some(message_id),
                    error_code: None,
                }));
            }
            Err(error) => {
                if self.lifecycle.accepts_generation(generation) {
                    let restored = self.log.as_mut().and_then(|log| {
                        if log.revert_delete(&message_id) {
                            log.get(&message_id).cloned()
                        } else {
                            None
                        }
                    });
                    if let Some(message) = restored {
                        self.channels.emit(ChatEvent::MessageReplaced {
                            conversation_id: message.conversation_id.clone(),
                            replaced: MessageId::Server(message_id.clone()),
                            message,
                        });
                    }
                }
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    fn spawn_conversation_list_fetch(&self) {
        let rest = self.rest.clone();
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            let result = rest.list_conversations().await;
            let _ = notice_tx
                .send(RuntimeNotice::ConversationsLoaded { result })
                .await;
        });
    }

    fn refresh_active_conversation(&self) {
        let Some(conversation_id) = self
            .lifecycle
            .current_conversation()
            .map(ToOwned::to_owned)
        else {
            return;
        };
        self.spawn_snapshot_fetch(conversation_id, self.lifecycle.generation());
    }

    fn spawn_snapshot_fetch(&self, conversation_id: String, generation: u64) {
        let rest = self.rest.clone();
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            let result = rest.fetch_messages(&conversation_id).await;
            let _ = notice_tx
                .send(RuntimeNotice::SnapshotLoaded {
                    conversation_id,
                    generation,
                    result,
                })
                .await;
        });
    }

    async fn tick_housekeeping(&mut self) {
        let now = Instant::now();

        if self.typing.local_stop_due(now)
            && self.lifecycle.state() == ConnectionState::Connected
            && let Some(conversation_id) = self
                .lifecycle
                .current_conversation()
                .map(ToOwned::to_owned)
            && let Some(gateway) = self.gateway.clone()
        {
            let _ = gateway
                .send(ClientFrame::Typing {
                    conversation_id,
                    is_typing: false,
                })
                .await;
        }

        if self.typing.expire(now)
            && let Some(conversation_id) = self
                .lifecycle
                .current_conversation()
                .map(ToOwned::to_owned)
        {
            self.channels.emit(ChatEvent::TypingChanged {
                conversation_id,
                user_names: self.typing.names(),
            });
        }
    }

    fn current_user_ref(&self) -> Option<UserRef> {
        self.session.current_user().ok().map(|user| UserRef {
            id: user.id,
            display_name: user.display_name,
        })
    }

    fn current_user_id(&self) -> Option<String> {
        self.session.current_user().ok().map(|user| user.id)
    }

    fn current_user_name(&self) -> Option<String> {
        self.session
            .current_user()
            .ok()
            .map(|user| user.display_name)
    }

    fn emit_connection(&self) {
        self.channels.emit(ChatEvent::ConnectionChanged {
            state: self.lifecycle.state(),
        });
    }

    fn maybe_autoscroll(&self, conversation_id: &str) {
        if self.scroll.should_autoscroll() {
            self.channels.emit(ChatEvent::AutoScroll {
                conversation_id: conversation_id.to_owned(),
            });
        }
    }
}

fn no_active_conversation() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Validation,
        "no_active_conversation",
        "join a conversation before issuing message commands",
    )
}

fn not_authenticated() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Auth,
        "not_authenticated",
        "no authenticated user for this command",
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_session::{InMemorySession, SessionUser};
    use tokio::time::timeout;

    fn test_config() -> ChatRuntimeConfig {
        // Port 9 (discard) refuses connections immediately; no test below
        // depends on a live backend.
        ChatRuntimeConfig::new(
            Url::parse("http://127.0.0.1:9/api").expect("rest url parses"),
            Url::parse("ws://127.0.0.1:9/socket").expect("gateway url parses"),
        )
    }

    fn signed_in_session() -> Arc<InMemorySession> {
        Arc::new(InMemorySession::signed_in(
            SessionUser {
                id: "u-alice".into(),
                display_name: "Alice".into(),
            },
            "token-1",
        ))
    }

    fn server_message(id: &str, conversation_id: &str) -> Message {
        Message {
            id: MessageId::Server(id.into()),
            conversation_id: conversation_id.into(),
            sender: None,
            body: "hello".into(),
            attachments: Vec::new(),
            created_at_ms: 1_000,
            edited: false,
            deleted: false,
            seen_by: Vec::new(),
        }
    }

    /// A gateway handle whose task has already given up and exited, so
    /// `send` returns `false`.
    async fn dead_gateway() -> GatewayHandle {
        let (notice_tx, mut notice_rx) = mpsc::channel(16);
        let handle = spawn_gateway(
            Url::parse("ws://127.0.0.1:9/socket").expect("gateway url parses"),
            "token-1".into(),
            ReconnectPolicy::new(1, 1, 1),
            notice_tx,
        );
        loop {
            let notice = notice_rx.recv().await.expect("gateway must report stop");
            if matches!(notice, GatewayNotice::Stopped { .. }) {
                break;
            }
        }
        while handle.send(ClientFrame::JoinChats).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle
    }

    async fn next_send_ack(events: &mut EventStream) -> SendAck {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            if let ChatEvent::SendAck(ack) = event {
                return ack;
            }
        }
    }

    #[tokio::test]
    async fn send_without_active_conversation_emits_failed_ack() {
        let handle = spawn_runtime(test_config(), signed_in_session());
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::SendMessage {
                client_txn_id: "tx-1".into(),
                text: "hello".into(),
                attachments: Vec::new(),
            })
            .await
            .expect("command should enqueue");

        let ack = next_send_ack(&mut events).await;
        assert_eq!(ack.client_txn_id, "tx-1");
        assert_eq!(ack.message_id, None);
        assert_eq!(ack.error_code.as_deref(), Some("no_active_conversation"));
    }

    #[tokio::test]
    async fn empty_send_is_rejected_before_any_network_call() {
        let handle = spawn_runtime(test_config(), signed_in_session());
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::JoinConversation {
                conversation_id: "conv-1".into(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ChatCommand::SendMessage {
                client_txn_id: "tx-2".into(),
                text: "   ".into(),
                attachments: Vec::new(),
            })
            .await
            .expect("command should enqueue");

        let ack = next_send_ack(&mut events).await;
        assert_eq!(ack.client_txn_id, "tx-2");
        assert_eq!(ack.error_code.as_deref(), Some("empty_message"));
    }

    #[tokio::test]
    async fn signed_out_session_fails_rest_fallback_send_and_rolls_back() {
        let handle = spawn_runtime(test_config(), Arc::new(InMemorySession::new()));
        let mut events = handle.subscribe();

        // Open degrades to polling-only with no token; the send then takes
        // the REST fallback and fails at the auth boundary.
        handle
            .send(ChatCommand::Open)
            .await
            .expect("command should enqueue");
        handle
            .send(ChatCommand::JoinConversation {
                conversation_id: "conv-1".into(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ChatCommand::SendMessage {
                client_txn_id: "tx-3".into(),
                text: "hello".into(),
                attachments: Vec::new(),
            })
            .await
            .expect("command should enqueue");

        let mut saw_append = false;
        let mut saw_removed = false;
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            match event {
                ChatEvent::MessageAppended { message, .. } => {
                    assert!(message.id.is_local());
                    saw_append = true;
                }
                ChatEvent::MessageRemoved { removed, .. } => {
                    assert!(removed.is_local());
                    saw_removed = true;
                }
                ChatEvent::SendAck(ack) => {
                    assert_eq!(ack.client_txn_id, "tx-3");
                    assert_eq!(ack.error_code.as_deref(), Some("not_authenticated"));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_append, "optimistic append must be visible");
        assert!(saw_removed, "failed send must remove the pending entry");
    }

    #[tokio::test]
    async fn send_frame_lost_to_dead_gateway_falls_back_to_rest() {
        let (channels, command_rx) = ChatChannels::new(8, 64);
        let mut runtime = ChatRuntime::new(
            test_config(),
            signed_in_session(),
            channels.clone(),
            command_rx,
        );
        let mut events = channels.subscribe();

        // The lifecycle still reads Connected, but the gateway task is gone:
        // a frame handed to it would never produce an echo or error frame.
        runtime
            .lifecycle
            .open("token-1")
            .expect("open should start connecting");
        runtime
            .lifecycle
            .mark_connected()
            .expect("connect should work");
        runtime.gateway = Some(dead_gateway().await);

        runtime.handle_join("conv-1".into()).await;
        runtime
            .handle_send("tx-9".into(), "hello".into(), Vec::new())
            .await;

        assert!(
            runtime.pending_txns.is_empty(),
            "a frame the gateway never took must not leave a txn waiting for an echo"
        );

        // Pump completions until the REST fallback resolves the ack; nothing
        // listens on the test port, so the send fails and rolls back.
        let ack = 'ack: loop {
            while let Ok(event) = events.try_recv() {
                if let ChatEvent::SendAck(ack) = event {
                    break 'ack ack;
                }
            }
            let notice = timeout(Duration::from_secs(2), runtime.notice_rx.recv())
                .await
                .expect("notice timeout")
                .expect("notice receive");
            runtime.handle_notice(notice).await;
        };
        assert_eq!(ack.client_txn_id, "tx-9");
        assert!(ack.error_code.is_some());
        assert!(
            !runtime.log.as_ref().expect("log exists").has_pending(),
            "the failed fallback must remove the pending entry"
        );
    }

    #[tokio::test]
    async fn snapshot_for_previous_conversation_is_discarded_after_switch() {
        let (channels, command_rx) = ChatChannels::new(8, 64);
        let mut runtime = ChatRuntime::new(
            test_config(),
            signed_in_session(),
            channels.clone(),
            command_rx,
        );

        runtime.handle_join("conv-a".into()).await;
        let stale_generation = runtime.lifecycle.generation();
        runtime.handle_join("conv-b".into()).await;

        let mut events = channels.subscribe();
        runtime.apply_snapshot_result(
            "conv-a".into(),
            stale_generation,
            Ok(vec![server_message("srv-1", "conv-a")]),
        );

        assert!(
            events.try_recv().is_err(),
            "a snapshot that resolved after the switch must emit nothing"
        );
        let log = runtime.log.as_ref().expect("active log exists");
        assert_eq!(log.conversation_id(), "conv-b");
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn rejoining_active_conversation_does_not_reset_the_list() {
        let handle = spawn_runtime(test_config(), signed_in_session());
        let mut events = handle.subscribe();

        handle
            .send(ChatCommand::JoinConversation {
                conversation_id: "conv-1".into(),
            })
            .await
            .expect("command should enqueue");

        // First join resets the (empty) list.
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive");
        assert!(matches!(event, ChatEvent::MessagesReset { .. }));

        handle
            .send(ChatCommand::JoinConversation {
                conversation_id: "conv-1".into(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ChatCommand::SendMessage {
                client_txn_id: "tx-4".into(),
                text: "".into(),
                attachments: Vec::new(),
            })
            .await
            .expect("command should enqueue");

        // The idempotent rejoin emits nothing; the next event is the ack for
        // the follow-up send.
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive");
        match event {
            ChatEvent::SendAck(ack) => assert_eq!(ack.client_txn_id, "tx-4"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
