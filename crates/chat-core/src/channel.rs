use tokio::sync::{broadcast, mpsc};

use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{ChatCommand, ChatEvent},
};

/// Event receiver handed to frontend subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// The two channels that connect a frontend bridge to the runtime: commands
/// flow in over a bounded mpsc queue, events fan out over broadcast.
///
/// Cloning is cheap; every clone feeds the same runtime.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create the channel pair; the command receiver goes to the runtime
    /// loop, everything else stays with the handle.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn command_sender(&self) -> mpsc::Sender<ChatCommand> {
        self.command_tx.clone()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ChatEvent> {
        self.event_tx.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue one command for the runtime.
    ///
    /// Fails with `command_channel_closed` once the runtime loop has exited
    /// and dropped its receiver.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatError> {
        self.command_tx.send(command).await.map_err(|_| {
            ChatError::new(
                ChatErrorCategory::Internal,
                "command_channel_closed",
                "chat runtime is no longer accepting commands",
            )
        })
    }

    /// Emit an event to all current subscribers. Emission never blocks and
    /// never fails; with zero subscribers the event is simply dropped.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}
