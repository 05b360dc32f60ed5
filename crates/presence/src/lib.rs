use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use xmpp_parsers::{
    minidom::Element,
    presence::{Presence, Show, Type as PresenceType},
};

use rookery_core::{
    Emitter, EventPayload,
    event::{Availability, EffectivePresence},
    jid::{bare_jid, resource_part},
};
use rookery_storage::{Database, FromRow, Row, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("presence without sender")]
    MissingSender,

    #[error("invalid priority value: {0}")]
    InvalidPriority(String),
}

/// One resource's presence as announced on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    /// Full jid, or bare jid when the sender has no resource.
    pub jid: String,
    pub availability: Availability,
    pub status: Option<String>,
    pub priority: i8,
    pub at: DateTime<Utc>,
}

impl PresenceUpdate {
    /// Availability presences only; subscription traffic yields `Ok(None)`.
    pub fn from_stanza(presence: &Presence, at: DateTime<Utc>) -> Result<Option<Self>, PresenceError> {
        let availability = match presence.type_ {
            PresenceType::None => match presence.show {
                None => Availability::Available,
                Some(Show::Chat) => Availability::Chat,
                Some(Show::Away) => Availability::Away,
                Some(Show::Xa) => Availability::Xa,
                Some(Show::Dnd) => Availability::Dnd,
            },
            PresenceType::Unavailable => Availability::Unavailable,
            _ => return Ok(None),
        };
        let jid = presence
            .from
            .as_ref()
            .map(ToString::to_string)
            .ok_or(PresenceError::MissingSender)?;

        Ok(Some(Self {
            jid,
            availability,
            status: presence.statuses.get("").cloned(),
            priority: priority_of(presence)?,
            at,
        }))
    }
}

/// The announced `<priority/>`, 0 when absent.
fn priority_of(presence: &Presence) -> Result<i8, PresenceError> {
    let element = Element::from(presence);
    match element.children().find(|child| child.name() == "priority") {
        Some(child) => {
            let text = child.text();
            text.trim()
                .parse()
                .map_err(|_| PresenceError::InvalidPriority(text))
        }
        None => Ok(0),
    }
}

struct PresenceRow {
    full_jid: String,
    bare_jid: String,
    availability: Availability,
    status: Option<String>,
    priority: i8,
    updated_at: DateTime<Utc>,
}

impl FromRow for PresenceRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let Ok(availability) = row.text(2, "availability")?.parse::<Availability>();
        Ok(PresenceRow {
            full_jid: row.text(0, "full_jid")?,
            bare_jid: row.text(1, "bare_jid")?,
            availability,
            status: row.opt_text(3),
            priority: row.integer(4, "priority")?.clamp(i8::MIN.into(), i8::MAX.into()) as i8,
            updated_at: row.timestamp(5, "updated_at")?,
        })
    }
}

impl PresenceRow {
    fn into_presence(self) -> EffectivePresence {
        let resource = resource_part(&self.full_jid);
        EffectivePresence {
            jid: self.bare_jid,
            resource: (!resource.is_empty()).then_some(resource),
            availability: self.availability,
            status: self.status,
            priority: self.priority,
            updated_at: self.updated_at,
        }
    }
}

/// Bare jid -> (full jid -> presence).
type ResourceMap = HashMap<String, EffectivePresence>;

/// Per-resource presence for one account and the effective presence of
/// every contact.
pub struct PresenceAggregator<D: Database> {
    db: Arc<D>,
    emitter: Emitter,
    account: String,
    contacts: HashMap<String, ResourceMap>,
    emitted: HashMap<String, EffectivePresence>,
}

impl<D: Database> PresenceAggregator<D> {
    pub fn new(db: Arc<D>, emitter: Emitter) -> Self {
        Self {
            account: emitter.account().to_string(),
            db,
            emitter,
            contacts: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    /// Store or drop the row for `update.jid` and return the contact's new
    /// effective presence when it changed.
    pub async fn apply(
        &mut self,
        update: PresenceUpdate,
    ) -> Result<Option<EffectivePresence>, PresenceError> {
        let bare = bare_jid(&update.jid);
        let resource = resource_part(&update.jid);

        if update.availability == Availability::Unavailable {
            self.db
                .execute(
                    "DELETE FROM presence WHERE account = ?1 AND full_jid = ?2",
                    &[&self.account, &update.jid],
                )
                .await?;
            if let Some(resources) = self.contacts.get_mut(&bare) {
                resources.remove(&update.jid);
                if resources.is_empty() {
                    self.contacts.remove(&bare);
                }
            }
        } else {
            self.db
                .execute(
                    "INSERT INTO presence \
                     (account, full_jid, bare_jid, availability, status, priority, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(account, full_jid) DO UPDATE SET \
                     availability = excluded.availability, status = excluded.status, \
                     priority = excluded.priority, updated_at = excluded.updated_at",
                    &[
                        &self.account,
                        &update.jid,
                        &bare,
                        &update.availability.as_str(),
                        &update.status,
                        &update.priority,
                        &update.at,
                    ],
                )
                .await?;
            self.contacts.entry(bare.clone()).or_default().insert(
                update.jid.clone(),
                EffectivePresence {
                    jid: bare.clone(),
                    resource: (!resource.is_empty()).then_some(resource),
                    availability: update.availability,
                    status: update.status,
                    priority: update.priority,
                    updated_at: update.at,
                },
            );
        }

        let effective = self.effective(&bare);
        let unchanged = match self.emitted.get(&bare) {
            Some(previous) => previous.same_value(&effective),
            None => effective.same_value(&EffectivePresence::offline(&bare)),
        };
        if unchanged {
            debug!(account = %self.account, jid = %bare, "effective presence unchanged");
            return Ok(None);
        }

        self.emitted.insert(bare, effective.clone());
        self.emitter.emit(EventPayload::PresenceUpdated {
            presence: effective.clone(),
        });
        Ok(Some(effective))
    }

    /// Highest priority wins, then the most recent update. Offline when no
    /// resource is known.
    pub fn effective(&self, jid: &str) -> EffectivePresence {
        let bare = bare_jid(jid);
        self.contacts
            .get(&bare)
            .and_then(|resources| best_presence(resources))
            .unwrap_or_else(|| EffectivePresence::offline(&bare))
    }

    /// Presence rows currently stored for `jid`, one per resource.
    pub async fn resources(&self, jid: &str) -> Result<Vec<EffectivePresence>, PresenceError> {
        let bare = bare_jid(jid);
        let rows: Vec<PresenceRow> = self
            .db
            .query(
                "SELECT full_jid, bare_jid, availability, status, priority, updated_at \
                 FROM presence WHERE account = ?1 AND bare_jid = ?2 ORDER BY full_jid",
                &[&self.account, &bare],
            )
            .await?;
        Ok(rows.into_iter().map(PresenceRow::into_presence).collect())
    }

    /// Forget every contact's presence; used when the stream goes away.
    pub async fn clear(&mut self) -> Result<(), PresenceError> {
        self.db
            .execute("DELETE FROM presence WHERE account = ?1", &[&self.account])
            .await?;
        self.contacts.clear();
        self.emitted.clear();
        Ok(())
    }
}

fn best_presence(resources: &ResourceMap) -> Option<EffectivePresence> {
    resources
        .iter()
        .max_by(|(a_jid, a), (b_jid, b)| {
            a.priority
                .cmp(&b.priority)
                .then(a.updated_at.cmp(&b.updated_at))
                .then(b_jid.cmp(a_jid))
        })
        .map(|(_, presence)| presence.clone())
}
