use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::event::Availability;

/// Intents issued by the presentation layer to one account session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[non_exhaustive]
pub enum Command {
    Connect,
    Disconnect,
    SendMessage {
        to: String,
        body: String,
    },
    SendPresence {
        availability: Availability,
        status: Option<String>,
    },
    FetchRoster,
    AddContact {
        jid: String,
        name: Option<String>,
        groups: Vec<String>,
    },
    RemoveContact {
        jid: String,
    },
    RespondSubscription {
        jid: String,
        accept: bool,
    },
    JoinRoom {
        room: String,
        nick: Option<String>,
        auto_join: bool,
    },
    LeaveRoom {
        room: String,
    },
    SendRoomMessage {
        room: String,
        body: String,
    },
    MarkDisplayed {
        peer: String,
        id: String,
    },
    FetchHistory {
        with: Option<String>,
        since: Option<DateTime<Utc>>,
    },
    StartFileTransfer {
        to: String,
        path: PathBuf,
    },
    AcceptFileTransfer {
        id: String,
    },
    RejectFileTransfer {
        id: String,
    },
    CancelFileTransfer {
        id: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::SendMessage { .. } => "send_message",
            Command::SendPresence { .. } => "send_presence",
            Command::FetchRoster => "fetch_roster",
            Command::AddContact { .. } => "add_contact",
            Command::RemoveContact { .. } => "remove_contact",
            Command::RespondSubscription { .. } => "respond_subscription",
            Command::JoinRoom { .. } => "join_room",
            Command::LeaveRoom { .. } => "leave_room",
            Command::SendRoomMessage { .. } => "send_room_message",
            Command::MarkDisplayed { .. } => "mark_displayed",
            Command::FetchHistory { .. } => "fetch_history",
            Command::StartFileTransfer { .. } => "start_file_transfer",
            Command::AcceptFileTransfer { .. } => "accept_file_transfer",
            Command::RejectFileTransfer { .. } => "reject_file_transfer",
            Command::CancelFileTransfer { .. } => "cancel_file_transfer",
        }
    }
}

/// A command tagged with the id that resulting events carry as
/// `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: Uuid,
    pub command: Command,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
        }
    }
}

/// Producer half of a session's command stream. Cheap to clone.
#[derive(Clone)]
pub struct CommandSender {
    inner: mpsc::Sender<CommandEnvelope>,
}

impl CommandSender {
    /// Queue a command, returning the id its events will be correlated with.
    pub async fn send(&self, command: Command) -> std::result::Result<Uuid, EventBusError> {
        let envelope = CommandEnvelope::new(command);
        let id = envelope.id;
        self.inner
            .send(envelope)
            .await
            .map_err(|_| EventBusError::SessionClosed)?;
        Ok(id)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer half, owned by the session actor.
pub struct CommandReceiver {
    inner: mpsc::Receiver<CommandEnvelope>,
}

impl CommandReceiver {
    /// `None` once every sender has been dropped.
    pub async fn recv(&mut self) -> Option<CommandEnvelope> {
        self.inner.recv().await
    }
}

pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandSender { inner: tx }, CommandReceiver { inner: rx })
}
