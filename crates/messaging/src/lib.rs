use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::{
    message::{Message, MessageType as XmppMessageType},
    minidom::Element,
};

use rookery_core::{
    Emitter, EventPayload,
    event::{ChatMessage, MessageType},
    jid::{bare_jid, new_iq_id, new_message_id, same_bare},
};
use rookery_storage::{Database, FromRow, Row, StorageError, parse_timestamp};
use rookery_xmpp::{
    CarbonDirection, OutboundError, ProtocolError, Stanza,
    outbound::{self, NS_MARKERS, NS_RECEIPTS},
    unwrap_carbon,
};

mod archive;

pub use archive::{ArchivedMessage, fin_complete, parse_archive_result};

use archive::{ArchiveQuery, delay_stamp};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("archive query failed: {0}")]
    ArchiveFailed(String),
}

const COLUMNS: &str =
    "stanza_id, from_jid, to_jid, body, message_type, thread, sent_at, delivered_at, displayed_at";

struct StoredMessage(ChatMessage);

impl FromRow for StoredMessage {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let Ok(message_type) = row.text(4, "message_type")?.parse::<MessageType>();
        Ok(StoredMessage(ChatMessage {
            id: row.text(0, "stanza_id")?,
            from: row.text(1, "from_jid")?,
            to: row.text(2, "to_jid")?,
            body: row.text(3, "body")?,
            message_type,
            thread: row.opt_text(5),
            sent_at: row.timestamp(6, "sent_at")?,
            delivered_at: row.opt_timestamp(7)?,
            displayed_at: row.opt_timestamp(8)?,
        }))
    }
}

/// What storing a message did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    Inserted,
    /// The key was already present. The flags say which stamps were set
    /// by this call.
    Merged { delivered: bool, displayed: bool },
}

/// Keep `delivered <= displayed`, treating a displayed message as delivered.
fn normalize_stamps(
    delivered: Option<DateTime<Utc>>,
    displayed: Option<DateTime<Utc>>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match (delivered, displayed) {
        (None, Some(displayed)) => (Some(displayed), Some(displayed)),
        (Some(delivered), Some(displayed)) if delivered > displayed => {
            (Some(delivered), Some(delivered))
        }
        other => other,
    }
}

fn wants_receipt(message: &Message) -> bool {
    message
        .payloads
        .iter()
        .any(|payload| payload.is("request", NS_RECEIPTS))
}

/// Deduplicating store for one-to-one messages and their receipt state.
///
/// The key is `(from, to, stanza id)` on bare jids, so a server echo or a
/// carbon of a message we sent merges into the optimistic row.
pub struct MessagePipeline<D: Database> {
    db: Arc<D>,
    emitter: Emitter,
    account: String,
    /// Archive queries in flight, by iq id.
    queries: HashMap<String, ArchiveQuery>,
}

impl<D: Database> MessagePipeline<D> {
    pub fn new(db: Arc<D>, emitter: Emitter) -> Self {
        Self {
            account: emitter.account().to_string(),
            db,
            emitter,
            queries: HashMap::new(),
        }
    }

    /// Store the optimistic row and return the stanza to send.
    pub async fn send(&self, to: &str, body: &str) -> Result<Stanza, MessagingError> {
        let id = new_message_id();
        let stanza = outbound::chat_message(&id, to, body)?;
        let message = ChatMessage {
            id,
            from: self.account.clone(),
            to: bare_jid(to),
            body: body.to_string(),
            message_type: MessageType::Chat,
            thread: None,
            sent_at: Utc::now(),
            delivered_at: None,
            displayed_at: None,
        };
        self.ingest(message).await?;
        Ok(stanza)
    }

    /// Handle a one-to-one message from the router: archive results,
    /// carbons, markers and bodies. Returns the stanzas to send in reply.
    pub async fn handle_message(&mut self, message: &Message) -> Result<Vec<Stanza>, MessagingError> {
        if let Some(archived) = parse_archive_result(message, &self.account)? {
            self.ingest_archived(archived).await?;
            return Ok(Vec::new());
        }

        if let Some(carbon) = unwrap_carbon(message, &self.account)? {
            debug!(account = %self.account, direction = ?carbon.direction, "carbon copy");
            self.apply_markers(&carbon.message).await?;
            self.ingest_wire(&carbon.message, carbon.direction == CarbonDirection::Sent)
                .await?;
            return Ok(Vec::new());
        }

        self.apply_markers(message).await?;
        let mut replies = Vec::new();
        if let Some(stored) = self.ingest_wire(message, false).await? {
            if stored.from != self.account && wants_receipt(message) {
                let to = message
                    .from
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or(stored.from);
                replies.push(outbound::receipt(&to, &stored.id)?);
            }
        }
        Ok(replies)
    }

    /// Store `message` and emit what changed.
    pub async fn ingest(&self, message: ChatMessage) -> Result<Stored, MessagingError> {
        let stored = self.store(&message).await?;
        let peer = self.peer_of(&message).to_string();
        match stored {
            Stored::Inserted if message.from == self.account => {
                self.emitter.emit(EventPayload::MessageSent { message });
            }
            Stored::Inserted => {
                debug!(account = %self.account, from = %message.from, id = %message.id, "message stored");
                self.emitter.emit(EventPayload::MessageReceived { message });
            }
            Stored::Merged {
                delivered,
                displayed,
            } => {
                debug!(account = %self.account, id = %message.id, "duplicate message merged");
                let current = self
                    .message(&message.from, &message.to, &message.id)
                    .await?
                    .unwrap_or(message);
                if delivered {
                    if let Some(delivered_at) = current.delivered_at {
                        self.emitter.emit(EventPayload::MessageDelivered {
                            id: current.id.clone(),
                            peer: peer.clone(),
                            delivered_at,
                        });
                    }
                }
                if displayed {
                    if let Some(displayed_at) = current.displayed_at {
                        self.emitter.emit(EventPayload::MessageDisplayed {
                            id: current.id.clone(),
                            peer,
                            displayed_at,
                        });
                    }
                }
            }
        }
        Ok(stored)
    }

    async fn store(&self, message: &ChatMessage) -> Result<Stored, MessagingError> {
        let Some(existing) = self
            .message(&message.from, &message.to, &message.id)
            .await?
        else {
            let (delivered, displayed) =
                normalize_stamps(message.delivered_at, message.displayed_at);
            self.db
                .execute(
                    "INSERT INTO messages (account, stanza_id, from_jid, to_jid, body, \
                     message_type, thread, sent_at, delivered_at, displayed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    &[
                        &self.account,
                        &message.id,
                        &message.from,
                        &message.to,
                        &message.body,
                        &message.message_type.as_str(),
                        &message.thread,
                        &message.sent_at,
                        &delivered,
                        &displayed,
                    ],
                )
                .await?;
            return Ok(Stored::Inserted);
        };

        let (delivered, displayed) = normalize_stamps(
            existing.delivered_at.or(message.delivered_at),
            existing.displayed_at.or(message.displayed_at),
        );
        let delivered_set = existing.delivered_at.is_none() && delivered.is_some();
        let displayed_set = existing.displayed_at.is_none() && displayed.is_some();
        if delivered_set || displayed_set {
            self.db
                .execute(
                    "UPDATE messages SET delivered_at = ?5, displayed_at = ?6 \
                     WHERE account = ?1 AND from_jid = ?2 AND to_jid = ?3 AND stanza_id = ?4",
                    &[
                        &self.account,
                        &message.from,
                        &message.to,
                        &message.id,
                        &delivered,
                        &displayed,
                    ],
                )
                .await?;
        }
        Ok(Stored::Merged {
            delivered: delivered_set,
            displayed: displayed_set,
        })
    }

    /// Turn a wire message into a stored row. `sent` marks a copy of a
    /// message another of our resources sent.
    async fn ingest_wire(
        &self,
        message: &Message,
        sent: bool,
    ) -> Result<Option<ChatMessage>, MessagingError> {
        let message_type = match message.type_ {
            XmppMessageType::Chat => MessageType::Chat,
            XmppMessageType::Normal => MessageType::Normal,
            XmppMessageType::Headline => MessageType::Headline,
            XmppMessageType::Error | XmppMessageType::Groupchat => {
                debug!(account = %self.account, "ignoring {:?} message", message.type_);
                return Ok(None);
            }
        };
        let Some((_, body)) = message.get_best_body(vec![]) else {
            return Ok(None);
        };

        let from = message.from.as_ref().map(|jid| bare_jid(&jid.to_string()));
        let outbound = sent || from.as_deref().is_some_and(|from| same_bare(from, &self.account));
        let (from, to) = if outbound {
            // Our own message, as a carbon or as the server's echo.
            let to = message
                .to
                .as_ref()
                .map(|jid| bare_jid(&jid.to_string()))
                .ok_or_else(|| ProtocolError::Unexpected("own message without recipient".into()))?;
            (self.account.clone(), to)
        } else {
            let from = from.ok_or_else(|| ProtocolError::Unexpected("message without sender".into()))?;
            (from, self.account.clone())
        };

        let chat = ChatMessage {
            id: message
                .id
                .as_ref()
                .map(|id| id.0.clone())
                .unwrap_or_else(new_message_id),
            from,
            to,
            body: body.clone(),
            message_type,
            thread: message.thread.as_ref().map(|thread| thread.id.clone()),
            sent_at: delay_stamp(message.payloads.iter()).unwrap_or_else(Utc::now),
            delivered_at: None,
            displayed_at: None,
        };
        self.ingest(chat.clone()).await?;
        Ok(Some(chat))
    }

    /// Receipts and displayed markers carried by `message`.
    ///
    /// A marker refers to a message its recipient sent to its sender, which
    /// covers both live markers and carbons of markers we sent elsewhere.
    async fn apply_markers(&self, message: &Message) -> Result<(), MessagingError> {
        let Some(marker_from) = message.from.as_ref().map(|jid| bare_jid(&jid.to_string())) else {
            return Ok(());
        };
        let marker_to = message
            .to
            .as_ref()
            .map(|jid| bare_jid(&jid.to_string()))
            .unwrap_or_else(|| self.account.clone());
        let now = Utc::now();

        for payload in &message.payloads {
            let Some(id) = payload.attr("id") else {
                continue;
            };
            if payload.is("received", NS_RECEIPTS) {
                self.stamp_delivered(&marker_to, &marker_from, id, now).await?;
            } else if payload.is("displayed", NS_MARKERS) {
                self.stamp_displayed(&marker_to, &marker_from, id, now).await?;
            }
        }
        Ok(())
    }

    /// Set `delivered_at` if still unset. Unknown ids are dropped.
    pub async fn stamp_delivered(
        &self,
        from: &str,
        to: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, MessagingError> {
        let Some(row) = self.message(from, to, id).await? else {
            debug!(account = %self.account, %id, "receipt for unknown message dropped");
            return Ok(false);
        };
        if row.delivered_at.is_some() {
            return Ok(false);
        }
        let at = row.displayed_at.map_or(at, |displayed| at.min(displayed));
        self.db
            .execute(
                "UPDATE messages SET delivered_at = ?5 WHERE account = ?1 AND from_jid = ?2 \
                 AND to_jid = ?3 AND stanza_id = ?4 AND delivered_at IS NULL",
                &[&self.account, &row.from, &row.to, &row.id, &at],
            )
            .await?;
        self.emitter.emit(EventPayload::MessageDelivered {
            peer: self.peer_of(&row).to_string(),
            id: row.id,
            delivered_at: at,
        });
        Ok(true)
    }

    /// Set `displayed_at`, and `delivered_at` when still unset.
    pub async fn stamp_displayed(
        &self,
        from: &str,
        to: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, MessagingError> {
        let Some(row) = self.message(from, to, id).await? else {
            debug!(account = %self.account, %id, "displayed marker for unknown message dropped");
            return Ok(false);
        };
        if row.displayed_at.is_some() {
            return Ok(false);
        }
        let delivered = row.delivered_at.unwrap_or(at);
        let displayed = at.max(delivered);
        self.db
            .execute(
                "UPDATE messages SET delivered_at = ?5, displayed_at = ?6 WHERE account = ?1 \
                 AND from_jid = ?2 AND to_jid = ?3 AND stanza_id = ?4 AND displayed_at IS NULL",
                &[&self.account, &row.from, &row.to, &row.id, &delivered, &displayed],
            )
            .await?;

        let peer = self.peer_of(&row).to_string();
        if row.delivered_at.is_none() {
            self.emitter.emit(EventPayload::MessageDelivered {
                id: row.id.clone(),
                peer: peer.clone(),
                delivered_at: delivered,
            });
        }
        self.emitter.emit(EventPayload::MessageDisplayed {
            id: row.id,
            peer,
            displayed_at: displayed,
        });
        Ok(true)
    }

    /// Tell `peer` we displayed their message `id`, and stamp it locally.
    pub async fn mark_displayed(&self, peer: &str, id: &str) -> Result<Stanza, MessagingError> {
        let stanza = outbound::displayed_marker(peer, id)?;
        self.stamp_displayed(&bare_jid(peer), &self.account, id, Utc::now())
            .await?;
        Ok(stanza)
    }

    // ── Archive backfill ───────────────────────────────────────────

    /// Build an archive query. Returns the iq id the `<fin/>` will answer.
    pub fn fetch_history(
        &mut self,
        with: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<(String, Stanza), MessagingError> {
        let iq_id = new_iq_id();
        let query_id = Uuid::new_v4().to_string();
        let with = with.map(bare_jid);
        let stanza = outbound::mam_query(&iq_id, &query_id, with.as_deref(), since)?;
        info!(account = %self.account, with = ?with, since = ?since, "archive query");
        self.queries.insert(
            iq_id.clone(),
            ArchiveQuery {
                query_id,
                stored: 0,
            },
        );
        Ok((iq_id, stanza))
    }

    /// Query everything newer than the newest stored message.
    pub async fn catch_up_request(&mut self) -> Result<(String, Stanza), MessagingError> {
        let since = self.newest_sent_at().await?;
        self.fetch_history(None, since)
    }

    pub fn is_archive_query(&self, iq_id: &str) -> bool {
        self.queries.contains_key(iq_id)
    }

    /// Close the query answered by `iq_id` and emit `HistorySynced`.
    /// `Ok(None)` when the id is not an archive query.
    pub fn finish_history(
        &mut self,
        iq_id: &str,
        result: Result<Option<Element>, String>,
    ) -> Result<Option<u64>, MessagingError> {
        let Some(query) = self.queries.remove(iq_id) else {
            return Ok(None);
        };
        let payload = result.map_err(MessagingError::ArchiveFailed)?;
        let complete = fin_complete(payload.as_ref());
        info!(
            account = %self.account,
            stored = query.stored,
            complete,
            "archive sync finished"
        );
        self.emitter.emit(EventPayload::HistorySynced {
            count: query.stored,
            complete,
        });
        Ok(Some(query.stored))
    }

    /// Forget queries in flight; their results will never arrive.
    pub fn abandon_queries(&mut self) {
        self.queries.clear();
    }

    async fn ingest_archived(&mut self, archived: ArchivedMessage) -> Result<(), MessagingError> {
        if !self
            .queries
            .values()
            .any(|query| query.query_id == archived.query_id)
        {
            warn!(account = %self.account, query = %archived.query_id, "archive result for unknown query dropped");
            return Ok(());
        }

        let inner = &archived.message;
        let message_type = match inner.type_ {
            XmppMessageType::Chat => MessageType::Chat,
            XmppMessageType::Normal => MessageType::Normal,
            _ => return Ok(()),
        };
        let Some((_, body)) = inner.get_best_body(vec![]) else {
            return Ok(());
        };
        let Some(id) = inner
            .id
            .as_ref()
            .map(|id| id.0.clone())
            .or(archived.archive_id.clone())
        else {
            debug!(account = %self.account, "archived message without id skipped");
            return Ok(());
        };
        let sender = inner.from.as_ref().map(|jid| bare_jid(&jid.to_string()));
        let (from, to) = if sender.as_deref() == Some(self.account.as_str()) {
            let to = inner
                .to
                .as_ref()
                .map(|jid| bare_jid(&jid.to_string()))
                .ok_or_else(|| ProtocolError::Unexpected("archived message without recipient".into()))?;
            (self.account.clone(), to)
        } else {
            let from = sender
                .ok_or_else(|| ProtocolError::Unexpected("archived message without sender".into()))?;
            (from, self.account.clone())
        };

        let thread = inner.thread.as_ref().map(|thread| thread.id.clone());
        let inserted = self
            .db
            .execute(
                "INSERT OR IGNORE INTO messages (account, stanza_id, from_jid, to_jid, body, \
                 message_type, thread, sent_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                &[
                    &self.account,
                    &id,
                    &from,
                    &to,
                    body,
                    &message_type.as_str(),
                    &thread,
                    &archived.stamp,
                ],
            )
            .await?;

        if inserted > 0 {
            if let Some(query) = self
                .queries
                .values_mut()
                .find(|query| query.query_id == archived.query_id)
            {
                query.stored += 1;
            }
        }
        Ok(())
    }

    async fn newest_sent_at(&self) -> Result<Option<DateTime<Utc>>, MessagingError> {
        let newest: Vec<String> = self
            .db
            .query(
                "SELECT sent_at FROM messages WHERE account = ?1 ORDER BY sent_at DESC LIMIT 1",
                &[&self.account],
            )
            .await?;
        Ok(newest
            .first()
            .map(|value| parse_timestamp(value))
            .transpose()?)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// The newest `limit` messages with `peer` sent before `before`, oldest
    /// first.
    pub async fn conversation(
        &self,
        peer: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, MessagingError> {
        let peer = bare_jid(peer);
        let rows: Vec<StoredMessage> = self
            .db
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM messages WHERE account = ?1 \
                     AND ((from_jid = ?2 AND to_jid = ?1) OR (from_jid = ?1 AND to_jid = ?2)) \
                     AND (?3 IS NULL OR sent_at < ?3) \
                     ORDER BY sent_at DESC, row_id DESC LIMIT ?4"
                ),
                &[&self.account, &peer, &before, &limit],
            )
            .await?;
        Ok(rows.into_iter().rev().map(|row| row.0).collect())
    }

    pub async fn message(
        &self,
        from: &str,
        to: &str,
        id: &str,
    ) -> Result<Option<ChatMessage>, MessagingError> {
        let rows: Vec<StoredMessage> = self
            .db
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM messages WHERE account = ?1 AND from_jid = ?2 \
                     AND to_jid = ?3 AND stanza_id = ?4"
                ),
                &[&self.account, &from, &to, &id],
            )
            .await?;
        Ok(rows.into_iter().next().map(|row| row.0))
    }

    fn peer_of<'a>(&self, message: &'a ChatMessage) -> &'a str {
        if message.from == self.account {
            &message.to
        } else {
            &message.from
        }
    }
}
