use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, EventBusError};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let domain = name.split('.').next().unwrap_or_default();
        Self::DOMAINS.contains(&domain)
    }

    pub const DOMAINS: &'static [&'static str] = &[
        "connection",
        "message",
        "roster",
        "presence",
        "muc",
        "transfer",
        "system",
    ];

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn known(name: &'static str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "message.received")
    pub channel: Channel,

    /// Bare JID of the account session that emitted this event
    pub account: String,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Id of the command that caused this event, if any
    pub correlation_id: Option<Uuid>,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event; the channel is derived from the payload.
    pub fn new(account: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            channel: Channel::known(payload.channel_name()),
            account: account.into(),
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            payload,
        }
    }

    /// Create a new event caused by the command with `correlation_id`.
    pub fn with_correlation(
        account: impl Into<String>,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(account, payload)
        }
    }
}

/// Every state-change notification the core can emit.
///
/// Front ends must ignore variants they do not recognise; new variants are
/// added without a major version bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[non_exhaustive]
pub enum EventPayload {
    // ── Connection lifecycle ───────────────────────────────────────
    ConnectionStateChanged {
        state: ConnectionState,
    },
    Connected {
        jid: String,
    },
    Disconnected {
        reason: String,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
        delay_ms: Option<u64>,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    ReconnectExhausted {
        attempts: u32,
    },

    // ── One-to-one messages ───────────────────────────────────────
    MessageReceived {
        message: ChatMessage,
    },
    MessageSent {
        message: ChatMessage,
    },
    MessageDelivered {
        id: String,
        peer: String,
        delivered_at: DateTime<Utc>,
    },
    MessageDisplayed {
        id: String,
        peer: String,
        displayed_at: DateTime<Utc>,
    },
    HistorySynced {
        count: u64,
        complete: bool,
    },

    // ── Roster ────────────────────────────────────────────────────
    RosterUpdated {
        upserted: Vec<RosterItem>,
        removed: Vec<String>,
    },
    SubscriptionRequested {
        from: String,
    },

    // ── Presence ──────────────────────────────────────────────────
    PresenceUpdated {
        presence: EffectivePresence,
    },

    // ── Multi-user chat ───────────────────────────────────────────
    RoomJoined {
        room: String,
        nick: String,
    },
    RoomLeft {
        room: String,
    },
    RoomOccupantChanged {
        occupant: MucOccupant,
        change: OccupantChange,
    },
    RoomMessageReceived {
        message: RoomMessage,
    },
    RoomSubjectChanged {
        room: String,
        subject: String,
    },

    // ── File transfer ─────────────────────────────────────────────
    FileTransferOffered {
        transfer: FileTransfer,
    },
    FileTransferProgress {
        id: String,
        state: TransferState,
        progress: f64,
        reason: Option<String>,
    },

    // ── Errors ────────────────────────────────────────────────────
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

impl EventPayload {
    pub fn channel_name(&self) -> &'static str {
        match self {
            EventPayload::ConnectionStateChanged { .. } => "connection.state",
            EventPayload::Connected { .. } => "connection.online",
            EventPayload::Disconnected { .. } => "connection.offline",
            EventPayload::ConnectionLost { .. } => "connection.lost",
            EventPayload::Reconnecting { .. } => "connection.reconnecting",
            EventPayload::ReconnectExhausted { .. } => "connection.exhausted",
            EventPayload::MessageReceived { .. } => "message.received",
            EventPayload::MessageSent { .. } => "message.sent",
            EventPayload::MessageDelivered { .. } => "message.delivered",
            EventPayload::MessageDisplayed { .. } => "message.displayed",
            EventPayload::HistorySynced { .. } => "message.history",
            EventPayload::RosterUpdated { .. } => "roster.updated",
            EventPayload::SubscriptionRequested { .. } => "roster.subscription",
            EventPayload::PresenceUpdated { .. } => "presence.updated",
            EventPayload::RoomJoined { .. } => "muc.joined",
            EventPayload::RoomLeft { .. } => "muc.left",
            EventPayload::RoomOccupantChanged { .. } => "muc.occupant",
            EventPayload::RoomMessageReceived { .. } => "muc.message",
            EventPayload::RoomSubjectChanged { .. } => "muc.subject",
            EventPayload::FileTransferOffered { .. } => "transfer.offered",
            EventPayload::FileTransferProgress { .. } => "transfer.progress",
            EventPayload::Error { .. } => "system.error",
        }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        EventPayload::Error {
            kind,
            detail: detail.into(),
        }
    }
}

/// Session lifecycle states of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    NegotiatingFeatures,
    Bound,
    Online,
    Reconnecting { attempt: u32 },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::NegotiatingFeatures => f.write_str("negotiating-features"),
            ConnectionState::Bound => f.write_str("bound"),
            ConnectionState::Online => f.write_str("online"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
        }
    }
}

/// A single entry in the XMPP roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterItem {
    /// The contact's bare JID (e.g., "alice@example.com")
    pub jid: String,

    /// Display name set by the user, if any
    pub name: Option<String>,

    /// Roster subscription state
    pub subscription: Subscription,

    /// An outbound subscription request is awaiting the contact's answer
    pub pending: bool,

    /// Subscription pre-approved for the contact
    pub approved: bool,

    /// User-defined groups this contact belongs to
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            _ => Subscription::None,
        })
    }
}

/// A one-to-one chat message as stored and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Stanza id: client-generated for outbound, sender-chosen for inbound
    pub id: String,

    /// Bare JID of the sender
    pub from: String,

    /// Bare JID of the recipient
    pub to: String,

    /// Plain-text message body
    pub body: String,

    pub message_type: MessageType,

    /// Thread ID for conversation threading, if present
    pub thread: Option<String>,

    /// Origin time for archived messages, arrival time otherwise
    pub sent_at: DateTime<Utc>,

    pub delivered_at: Option<DateTime<Utc>>,

    pub displayed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Chat,
    Normal,
    Headline,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Normal => "normal",
            MessageType::Headline => "headline",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "normal" => MessageType::Normal,
            "headline" => MessageType::Headline,
            _ => MessageType::Chat,
        })
    }
}

/// XMPP availability levels (RFC 6121 section 4.7.2.1), plus offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    /// Available (no <show/> element -- the default)
    Available,
    /// Free for chat
    Chat,
    /// Away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
    /// Unavailable (offline)
    Unavailable,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Chat => "chat",
            Availability::Away => "away",
            Availability::Xa => "xa",
            Availability::Dnd => "dnd",
            Availability::Unavailable => "unavailable",
        }
    }
}

impl std::str::FromStr for Availability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "available" => Availability::Available,
            "chat" => Availability::Chat,
            "away" => Availability::Away,
            "xa" => Availability::Xa,
            "dnd" => Availability::Dnd,
            _ => Availability::Unavailable,
        })
    }
}

/// The single presence shown for a contact across all of its resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePresence {
    /// Bare JID of the contact
    pub jid: String,

    /// Resource whose row won, `None` when offline
    pub resource: Option<String>,

    pub availability: Availability,

    pub status: Option<String>,

    pub priority: i8,

    pub updated_at: DateTime<Utc>,
}

impl EffectivePresence {
    pub fn offline(jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            resource: None,
            availability: Availability::Unavailable,
            status: None,
            priority: 0,
            updated_at: Utc::now(),
        }
    }

    /// Equality on everything but the update time.
    pub fn same_value(&self, other: &Self) -> bool {
        self.jid == other.jid
            && self.resource == other.resource
            && self.availability == other.availability
            && self.status == other.status
            && self.priority == other.priority
    }
}

/// An occupant in a MUC room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MucOccupant {
    /// Bare JID of the room
    pub room: String,

    /// Stable identity: real bare JID, occupant-id, or `room/nick`
    pub occupant_id: String,

    /// The occupant's current room nick
    pub nick: String,

    /// The occupant's real JID, if visible
    pub real_jid: Option<String>,

    pub role: MucRole,

    pub affiliation: MucAffiliation,

    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MucAffiliation {
    Owner,
    Admin,
    Member,
    Outcast,
    None,
}

impl MucAffiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MucAffiliation::Owner => "owner",
            MucAffiliation::Admin => "admin",
            MucAffiliation::Member => "member",
            MucAffiliation::Outcast => "outcast",
            MucAffiliation::None => "none",
        }
    }
}

impl std::str::FromStr for MucAffiliation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "owner" => MucAffiliation::Owner,
            "admin" => MucAffiliation::Admin,
            "member" => MucAffiliation::Member,
            "outcast" => MucAffiliation::Outcast,
            _ => MucAffiliation::None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MucRole {
    Moderator,
    Participant,
    Visitor,
    None,
}

impl MucRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MucRole::Moderator => "moderator",
            MucRole::Participant => "participant",
            MucRole::Visitor => "visitor",
            MucRole::None => "none",
        }
    }
}

impl std::str::FromStr for MucRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "moderator" => MucRole::Moderator,
            "participant" => MucRole::Participant,
            "visitor" => MucRole::Visitor,
            _ => MucRole::None,
        })
    }
}

/// What happened to an occupant in a `RoomOccupantChanged` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OccupantChange {
    Joined,
    Updated,
    NickChanged { old_nick: String },
    Left,
}

/// A groupchat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    /// Bare JID of the room
    pub room: String,

    /// Stanza id, when the sender supplied one
    pub id: Option<String>,

    /// Occupant address (`room/nick`)
    pub sender: String,

    pub nick: String,

    pub body: String,

    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Outbound => "outbound",
            TransferDirection::Inbound => "inbound",
        }
    }
}

impl std::str::FromStr for TransferDirection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "inbound" => TransferDirection::Inbound,
            _ => TransferDirection::Outbound,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Pending,
    Negotiating,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Negotiating => "negotiating",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferState::Pending),
            "negotiating" => Ok(TransferState::Negotiating),
            "transferring" => Ok(TransferState::Transferring),
            "completed" => Ok(TransferState::Completed),
            "failed" => Ok(TransferState::Failed),
            "cancelled" => Ok(TransferState::Cancelled),
            other => Err(format!("unknown transfer state '{other}'")),
        }
    }
}

/// A file transfer as stored and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub id: String,
    pub direction: TransferDirection,
    /// Full JID of the other party
    pub peer: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub local_path: String,
    pub state: TransferState,
    /// Fraction in [0, 1]
    pub progress: f64,
    /// Failure reason for `Failed`
    pub error: Option<String>,
}
