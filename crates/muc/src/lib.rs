use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use xmpp_parsers::{
    message::Message,
    muc::user::{Affiliation, MucUser, Role, Status},
    presence::{Presence, Type as PresenceType},
};

use rookery_core::{
    Emitter, EventPayload,
    event::{MucAffiliation, MucOccupant, MucRole, OccupantChange, RoomMessage},
    jid::{bare_jid, new_message_id, resource_part},
};
use rookery_storage::{Database, FromRow, Row, Statement, StorageError};
use rookery_xmpp::{OutboundError, ProtocolError, Stanza, outbound, router::NS_STANZAS};

const NS_OCCUPANT_ID: &str = "urn:xmpp:occupant-id:0";
const NS_DELAY: &str = "urn:xmpp:delay";

#[derive(Debug, thiserror::Error)]
pub enum MucError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("room {0} is not joined")]
    UnknownRoom(String),

    #[error("joining {room} failed: {condition}")]
    JoinFailed { room: String, condition: String },
}

/// A stored room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub room: String,
    pub nickname: String,
    pub subject: Option<String>,
    pub auto_join: bool,
    pub joined: bool,
    pub last_joined: Option<DateTime<Utc>>,
}

impl FromRow for Room {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Room {
            room: row.text(0, "room_jid")?,
            nickname: row.text(1, "nickname")?,
            subject: row.opt_text(2),
            auto_join: row.flag(3, "auto_join")?,
            joined: row.flag(4, "joined")?,
            last_joined: row.opt_timestamp(5)?,
        })
    }
}

struct OccupantRow(MucOccupant);

impl FromRow for OccupantRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let Ok(role) = row.text(4, "role")?.parse::<MucRole>();
        let Ok(affiliation) = row.text(5, "affiliation")?.parse::<MucAffiliation>();
        Ok(OccupantRow(MucOccupant {
            room: row.text(0, "room_jid")?,
            occupant_id: row.text(1, "occupant_id")?,
            nick: row.text(2, "nick")?,
            real_jid: row.opt_text(3),
            role,
            affiliation,
            online: row.flag(6, "online")?,
        }))
    }
}

struct RoomMessageRow(RoomMessage);

impl FromRow for RoomMessageRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(RoomMessageRow(RoomMessage {
            room: row.text(0, "room_jid")?,
            id: row.opt_text(1),
            sender: row.text(2, "sender")?,
            nick: row.text(3, "nick")?,
            body: row.text(4, "body")?,
            sent_at: row.timestamp(5, "sent_at")?,
        }))
    }
}

fn role(role: &Role) -> MucRole {
    match role {
        Role::Moderator => MucRole::Moderator,
        Role::Participant => MucRole::Participant,
        Role::Visitor => MucRole::Visitor,
        Role::None => MucRole::None,
    }
}

fn affiliation(affiliation: &Affiliation) -> MucAffiliation {
    match affiliation {
        Affiliation::Owner => MucAffiliation::Owner,
        Affiliation::Admin => MucAffiliation::Admin,
        Affiliation::Member => MucAffiliation::Member,
        Affiliation::Outcast => MucAffiliation::Outcast,
        Affiliation::None => MucAffiliation::None,
    }
}

/// The old half of a nick change, waiting for the new nick's presence.
#[derive(Debug, Clone)]
struct ParkedNick {
    occupant_id: String,
    old_nick: String,
}

#[derive(Debug, Clone)]
struct ActiveRoom {
    nick: String,
    joined: bool,
}

/// Room membership, occupants and room messages for one account.
pub struct MucManager<D: Database> {
    db: Arc<D>,
    emitter: Emitter,
    account: String,
    default_nick: String,
    /// Rooms joined or being joined.
    active: HashMap<String, ActiveRoom>,
    /// Keys of `active`, in the shape the stanza router wants.
    routes: HashSet<String>,
    /// Keyed by (room, new nick).
    parked: HashMap<(String, String), ParkedNick>,
}

impl<D: Database> MucManager<D> {
    pub fn new(db: Arc<D>, emitter: Emitter, default_nick: impl Into<String>) -> Self {
        Self {
            account: emitter.account().to_string(),
            db,
            emitter,
            default_nick: default_nick.into(),
            active: HashMap::new(),
            routes: HashSet::new(),
            parked: HashMap::new(),
        }
    }

    pub fn joined_rooms(&self) -> &HashSet<String> {
        &self.routes
    }

    /// Record configured auto-join rooms; they are joined on every `Online`.
    pub async fn register_auto_join(&self, rooms: &[String]) -> Result<(), MucError> {
        for room in rooms {
            self.upsert_room(&bare_jid(room), &self.default_nick, true)
                .await?;
        }
        Ok(())
    }

    /// Store the room and build the join presence.
    pub async fn join(
        &mut self,
        room: &str,
        nick: Option<&str>,
        auto_join: bool,
    ) -> Result<Stanza, MucError> {
        let room = bare_jid(room);
        let nick = nick.unwrap_or(&self.default_nick).to_string();
        let stanza = outbound::muc_join(&room, &nick)?;
        self.upsert_room(&room, &nick, auto_join).await?;
        info!(account = %self.account, %room, %nick, "joining room");
        self.track(&room, &nick);
        Ok(stanza)
    }

    /// Build the leave presence. The room stays routed until the server
    /// confirms with our unavailable self-presence.
    pub async fn leave(&mut self, room: &str) -> Result<Stanza, MucError> {
        let room = bare_jid(room);
        let nick = self
            .active
            .get(&room)
            .map(|state| state.nick.clone())
            .ok_or_else(|| MucError::UnknownRoom(room.clone()))?;
        self.db
            .execute(
                "UPDATE muc_rooms SET auto_join = 0 WHERE account = ?1 AND room_jid = ?2",
                &[&self.account, &room],
            )
            .await?;
        Ok(outbound::muc_leave(&room, &nick)?)
    }

    /// Join presences for every auto-join room.
    pub async fn rejoin_requests(&mut self) -> Result<Vec<Stanza>, MucError> {
        let rooms: Vec<Room> = self
            .db
            .query(
                "SELECT room_jid, nickname, subject, auto_join, joined, last_joined FROM muc_rooms \
                 WHERE account = ?1 AND auto_join = 1 ORDER BY room_jid",
                &[&self.account],
            )
            .await?;
        let mut stanzas = Vec::with_capacity(rooms.len());
        for room in rooms {
            stanzas.push(outbound::muc_join(&room.room, &room.nickname)?);
            self.track(&room.room, &room.nickname);
        }
        if !stanzas.is_empty() {
            info!(account = %self.account, rooms = stanzas.len(), "rejoining rooms");
        }
        Ok(stanzas)
    }

    /// Forget every occupant; membership ends with the stream.
    pub async fn connection_lost(&mut self) -> Result<(), MucError> {
        self.db
            .execute_batch(vec![
                Statement::new(
                    "DELETE FROM muc_occupants WHERE account = ?1",
                    &[&self.account],
                ),
                Statement::new(
                    "UPDATE muc_rooms SET joined = 0 WHERE account = ?1",
                    &[&self.account],
                ),
            ])
            .await?;
        self.active.clear();
        self.routes.clear();
        self.parked.clear();
        Ok(())
    }

    // ── Inbound ────────────────────────────────────────────────────

    pub async fn handle_presence(&mut self, room: &str, presence: &Presence) -> Result<(), MucError> {
        let from = presence
            .from
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let nick = resource_part(&from);
        let own_nick = self.active.get(room).map(|state| state.nick.clone());

        if presence.type_ == PresenceType::Error {
            let condition = presence
                .payloads
                .iter()
                .find(|payload| payload.name() == "error")
                .and_then(|error| error.children().find(|child| child.ns() == NS_STANZAS))
                .map(|condition| condition.name().to_string())
                .unwrap_or_else(|| "undefined-condition".to_string());
            self.untrack(room);
            self.db
                .execute(
                    "UPDATE muc_rooms SET joined = 0 WHERE account = ?1 AND room_jid = ?2",
                    &[&self.account, &room],
                )
                .await?;
            return Err(MucError::JoinFailed {
                room: room.to_string(),
                condition,
            });
        }
        if nick.is_empty() {
            debug!(account = %self.account, %room, "room presence without nick ignored");
            return Ok(());
        }

        let muc_user = presence
            .payloads
            .iter()
            .find_map(|payload| MucUser::try_from(payload.clone()).ok());
        let statuses = muc_user
            .as_ref()
            .map(|user| user.status.clone())
            .unwrap_or_default();
        let item = muc_user.as_ref().and_then(|user| user.items.first());
        let is_self =
            statuses.contains(&Status::SelfPresence) || own_nick.as_deref() == Some(nick.as_str());

        let real_jid = item
            .and_then(|item| item.jid.as_ref())
            .map(|jid| bare_jid(&jid.to_string()));
        let occupant_id = real_jid
            .clone()
            .or_else(|| {
                presence
                    .payloads
                    .iter()
                    .find(|payload| payload.is("occupant-id", NS_OCCUPANT_ID))
                    .and_then(|tag| tag.attr("id"))
                    .map(String::from)
            })
            .unwrap_or_else(|| format!("{room}/{nick}"));

        if presence.type_ == PresenceType::Unavailable {
            if statuses.contains(&Status::NewNick) {
                let new_nick = item.and_then(|item| item.nick.clone()).ok_or_else(|| {
                    ProtocolError::Unexpected(format!("nick change in {room} without new nick"))
                })?;
                debug!(account = %self.account, %room, old = %nick, new = %new_nick, "nick change parked");
                if is_self {
                    if let Some(state) = self.active.get_mut(room) {
                        state.nick = new_nick.clone();
                    }
                }
                self.parked.insert(
                    (room.to_string(), new_nick),
                    ParkedNick {
                        occupant_id,
                        old_nick: nick,
                    },
                );
                return Ok(());
            }
            if is_self {
                return self.left(room).await;
            }
            return self.occupant_left(room, &occupant_id, &nick).await;
        }

        let parked = self.parked.remove(&(room.to_string(), nick.clone()));
        let occupant = MucOccupant {
            room: room.to_string(),
            occupant_id: parked
                .as_ref()
                .map(|parked| parked.occupant_id.clone())
                .unwrap_or(occupant_id),
            nick: nick.clone(),
            real_jid,
            role: item.map_or(MucRole::None, |item| role(&item.role)),
            affiliation: item.map_or(MucAffiliation::None, |item| affiliation(&item.affiliation)),
            online: true,
        };
        let existing = self.occupant(room, &occupant.occupant_id).await?;
        let change = match (parked, existing) {
            (Some(parked), _) => Some(OccupantChange::NickChanged {
                old_nick: parked.old_nick,
            }),
            (None, None) => Some(OccupantChange::Joined),
            (None, Some(existing)) if existing == occupant => None,
            (None, Some(_)) => Some(OccupantChange::Updated),
        };

        if let Some(change) = change {
            self.upsert_occupant(&occupant).await?;
            debug!(account = %self.account, %room, nick = %occupant.nick, ?change, "occupant changed");
            self.emitter
                .emit(EventPayload::RoomOccupantChanged { occupant, change });
        }

        if is_self {
            self.joined(room, &nick).await?;
        }
        Ok(())
    }

    /// Subject changes and room messages.
    pub async fn handle_message(&mut self, room: &str, message: &Message) -> Result<(), MucError> {
        let sender = message
            .from
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| room.to_string());
        let Some((_, body)) = message.get_best_body(vec![]) else {
            if let Some((_, subject)) = message.get_best_subject(vec![]) {
                let subject: String = subject.clone();
                self.db
                    .execute(
                        "UPDATE muc_rooms SET subject = ?3 WHERE account = ?1 AND room_jid = ?2",
                        &[&self.account, &room, &subject],
                    )
                    .await?;
                info!(account = %self.account, %room, "room subject changed");
                self.emitter.emit(EventPayload::RoomSubjectChanged {
                    room: room.to_string(),
                    subject,
                });
            }
            return Ok(());
        };

        let sent_at = message
            .payloads
            .iter()
            .find(|payload| payload.is("delay", NS_DELAY))
            .and_then(|delay| delay.attr("stamp"))
            .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
            .map_or_else(Utc::now, |stamp| stamp.with_timezone(&Utc));
        let room_message = RoomMessage {
            room: room.to_string(),
            id: message.id.as_ref().map(|id| id.0.clone()),
            nick: resource_part(&sender),
            sender,
            body: body.clone(),
            sent_at,
        };
        self.store_message(room_message).await?;
        Ok(())
    }

    /// Store the optimistic row and build the groupchat message. The
    /// server's reflection deduplicates against the row.
    pub async fn send_message(&self, room: &str, body: &str) -> Result<Stanza, MucError> {
        let room = bare_jid(room);
        let nick = self
            .active
            .get(&room)
            .filter(|state| state.joined)
            .map(|state| state.nick.clone())
            .ok_or_else(|| MucError::UnknownRoom(room.clone()))?;
        let id = new_message_id();
        let stanza = outbound::groupchat_message(&id, &room, body)?;
        self.store_message(RoomMessage {
            room: room.clone(),
            id: Some(id),
            sender: format!("{room}/{nick}"),
            nick,
            body: body.to_string(),
            sent_at: Utc::now(),
        })
        .await?;
        Ok(stanza)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn rooms(&self) -> Result<Vec<Room>, MucError> {
        Ok(self
            .db
            .query(
                "SELECT room_jid, nickname, subject, auto_join, joined, last_joined FROM muc_rooms \
                 WHERE account = ?1 ORDER BY room_jid",
                &[&self.account],
            )
            .await?)
    }

    pub async fn occupants(&self, room: &str) -> Result<Vec<MucOccupant>, MucError> {
        let rows: Vec<OccupantRow> = self
            .db
            .query(
                "SELECT room_jid, occupant_id, nick, real_jid, role, affiliation, online \
                 FROM muc_occupants WHERE account = ?1 AND room_jid = ?2 ORDER BY nick",
                &[&self.account, &bare_jid(room)],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    /// The newest `limit` messages of `room`, oldest first.
    pub async fn room_messages(&self, room: &str, limit: u32) -> Result<Vec<RoomMessage>, MucError> {
        let rows: Vec<RoomMessageRow> = self
            .db
            .query(
                "SELECT room_jid, stanza_id, sender, nick, body, sent_at FROM muc_messages \
                 WHERE account = ?1 AND room_jid = ?2 ORDER BY sent_at DESC, row_id DESC LIMIT ?3",
                &[&self.account, &bare_jid(room), &limit],
            )
            .await?;
        Ok(rows.into_iter().rev().map(|row| row.0).collect())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn track(&mut self, room: &str, nick: &str) {
        self.active.insert(
            room.to_string(),
            ActiveRoom {
                nick: nick.to_string(),
                joined: false,
            },
        );
        self.routes.insert(room.to_string());
    }

    fn untrack(&mut self, room: &str) {
        self.active.remove(room);
        self.routes.remove(room);
        self.parked.retain(|(parked_room, _), _| parked_room != room);
    }

    async fn upsert_room(&self, room: &str, nick: &str, auto_join: bool) -> Result<(), MucError> {
        self.db
            .execute(
                "INSERT INTO muc_rooms (account, room_jid, nickname, auto_join) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(account, room_jid) DO UPDATE SET \
                 nickname = excluded.nickname, auto_join = excluded.auto_join",
                &[&self.account, &room, &nick, &auto_join],
            )
            .await?;
        Ok(())
    }

    async fn occupant(&self, room: &str, occupant_id: &str) -> Result<Option<MucOccupant>, MucError> {
        let rows: Vec<OccupantRow> = self
            .db
            .query(
                "SELECT room_jid, occupant_id, nick, real_jid, role, affiliation, online \
                 FROM muc_occupants WHERE account = ?1 AND room_jid = ?2 AND occupant_id = ?3",
                &[&self.account, &room, &occupant_id],
            )
            .await?;
        Ok(rows.into_iter().next().map(|row| row.0))
    }

    async fn upsert_occupant(&self, occupant: &MucOccupant) -> Result<(), MucError> {
        self.db
            .execute(
                "INSERT INTO muc_occupants (account, room_jid, occupant_id, nick, real_jid, role, affiliation, online) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1) \
                 ON CONFLICT(account, room_jid, occupant_id) DO UPDATE SET \
                 nick = excluded.nick, real_jid = excluded.real_jid, role = excluded.role, \
                 affiliation = excluded.affiliation, online = 1",
                &[
                    &self.account,
                    &occupant.room,
                    &occupant.occupant_id,
                    &occupant.nick,
                    &occupant.real_jid,
                    &occupant.role.as_str(),
                    &occupant.affiliation.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn occupant_left(&self, room: &str, occupant_id: &str, nick: &str) -> Result<(), MucError> {
        let Some(mut occupant) = self.occupant(room, occupant_id).await? else {
            debug!(account = %self.account, %room, %nick, "unknown occupant left");
            return Ok(());
        };
        self.db
            .execute(
                "DELETE FROM muc_occupants WHERE account = ?1 AND room_jid = ?2 AND occupant_id = ?3",
                &[&self.account, &room, &occupant_id],
            )
            .await?;
        occupant.online = false;
        self.emitter.emit(EventPayload::RoomOccupantChanged {
            occupant,
            change: OccupantChange::Left,
        });
        Ok(())
    }

    async fn joined(&mut self, room: &str, nick: &str) -> Result<(), MucError> {
        let Some(state) = self.active.get_mut(room) else {
            warn!(account = %self.account, %room, "self-presence for untracked room");
            return Ok(());
        };
        if state.joined {
            return Ok(());
        }
        state.joined = true;
        state.nick = nick.to_string();

        let now = Utc::now();
        self.db
            .execute(
                "UPDATE muc_rooms SET joined = 1, last_joined = ?3, nickname = ?4 \
                 WHERE account = ?1 AND room_jid = ?2",
                &[&self.account, &room, &now, &nick],
            )
            .await?;
        info!(account = %self.account, %room, %nick, "joined room");
        self.emitter.emit(EventPayload::RoomJoined {
            room: room.to_string(),
            nick: nick.to_string(),
        });
        Ok(())
    }

    async fn left(&mut self, room: &str) -> Result<(), MucError> {
        self.db
            .execute_batch(vec![
                Statement::new(
                    "DELETE FROM muc_occupants WHERE account = ?1 AND room_jid = ?2",
                    &[&self.account, &room],
                ),
                Statement::new(
                    "UPDATE muc_rooms SET joined = 0 WHERE account = ?1 AND room_jid = ?2",
                    &[&self.account, &room],
                ),
            ])
            .await?;
        self.untrack(room);
        info!(account = %self.account, %room, "left room");
        self.emitter.emit(EventPayload::RoomLeft {
            room: room.to_string(),
        });
        Ok(())
    }

    async fn store_message(&self, message: RoomMessage) -> Result<bool, MucError> {
        let inserted = self
            .db
            .execute(
                "INSERT OR IGNORE INTO muc_messages (account, room_jid, stanza_id, sender, nick, body, sent_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                &[
                    &self.account,
                    &message.room,
                    &message.id,
                    &message.sender,
                    &message.nick,
                    &message.body,
                    &message.sent_at,
                ],
            )
            .await?;
        if inserted == 0 {
            debug!(account = %self.account, room = %message.room, id = ?message.id, "duplicate room message");
            return Ok(false);
        }
        self.emitter
            .emit(EventPayload::RoomMessageReceived { message });
        Ok(true)
    }
}
