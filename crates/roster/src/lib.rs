use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};
use xmpp_parsers::minidom::Element;

use rookery_core::{
    Emitter, EventPayload,
    event::{RosterItem, Subscription},
    jid::bare_jid,
};
use rookery_storage::{Database, FromRow, Row, Statement, StorageError};
use rookery_xmpp::{OutboundError, Stanza, outbound, router::NS_ROSTER};

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error("malformed roster: {0}")]
    Malformed(String),
}

/// One server-side roster change.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterChange {
    Upsert(RosterItem),
    Remove(String),
}

/// What a fetch or push changed in the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    pub upserted: Vec<RosterItem>,
    pub removed: Vec<String>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

/// Read the `<item/>` children of a `jabber:iq:roster` query.
pub fn parse_roster_query(query: &Element) -> Result<Vec<RosterChange>, RosterError> {
    if !query.is("query", NS_ROSTER) {
        return Err(RosterError::Malformed(format!(
            "expected roster query, got <{}/>",
            query.name()
        )));
    }

    query
        .children()
        .filter(|child| child.is("item", NS_ROSTER))
        .map(|item| {
            let jid = item
                .attr("jid")
                .map(bare_jid)
                .filter(|jid| !jid.is_empty())
                .ok_or_else(|| RosterError::Malformed("roster item without jid".into()))?;
            let subscription = item.attr("subscription").unwrap_or("none");
            if subscription == "remove" {
                return Ok(RosterChange::Remove(jid));
            }
            let Ok(subscription) = subscription.parse::<Subscription>();

            let mut groups: Vec<String> = item
                .children()
                .filter(|child| child.is("group", NS_ROSTER))
                .map(|group| group.text())
                .filter(|group| !group.is_empty())
                .collect();
            groups.sort();
            groups.dedup();

            Ok(RosterChange::Upsert(RosterItem {
                jid,
                name: item.attr("name").filter(|name| !name.is_empty()).map(String::from),
                subscription,
                pending: item.attr("ask") == Some("subscribe"),
                approved: matches!(item.attr("approved"), Some("true" | "1")),
                groups,
            }))
        })
        .collect()
}

struct ItemRow {
    jid: String,
    name: Option<String>,
    subscription: Subscription,
    pending: bool,
    approved: bool,
}

impl FromRow for ItemRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let Ok(subscription) = row.text(2, "subscription")?.parse::<Subscription>();
        Ok(ItemRow {
            jid: row.text(0, "jid")?,
            name: row.opt_text(1),
            subscription,
            pending: row.flag(3, "pending")?,
            approved: row.flag(4, "approved")?,
        })
    }
}

struct GroupRow {
    jid: String,
    group: String,
}

impl FromRow for GroupRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(GroupRow {
            jid: row.text(0, "jid")?,
            group: row.text(1, "group_name")?,
        })
    }
}

/// Keeps the stored roster equal to the server's.
///
/// The server is the only authority: contact edits are sent as requests and
/// reach the store only when the matching push arrives.
pub struct RosterSync<D: Database> {
    db: Arc<D>,
    emitter: Emitter,
    account: String,
}

impl<D: Database> RosterSync<D> {
    pub fn new(db: Arc<D>, emitter: Emitter) -> Self {
        Self {
            account: emitter.account().to_string(),
            db,
            emitter,
        }
    }

    pub fn fetch_request(&self, id: &str) -> Stanza {
        outbound::roster_get(id)
    }

    /// Replace the stored roster with the server's reply in one transaction.
    pub async fn apply_fetch_result(&self, query: &Element) -> Result<RosterDiff, RosterError> {
        let server: Vec<RosterItem> = parse_roster_query(query)?
            .into_iter()
            .filter_map(|change| match change {
                RosterChange::Upsert(item) => Some(item),
                RosterChange::Remove(_) => None,
            })
            .collect();

        let local: Vec<String> = self
            .db
            .query(
                "SELECT jid FROM roster_items WHERE account = ?1",
                &[&self.account],
            )
            .await?;
        let keep: HashSet<&str> = server.iter().map(|item| item.jid.as_str()).collect();
        let removed: Vec<String> = local
            .into_iter()
            .filter(|jid| !keep.contains(jid.as_str()))
            .collect();

        let mut statements = Vec::new();
        for jid in &removed {
            statements.push(self.delete_statement(jid));
        }
        for item in &server {
            statements.extend(self.upsert_statements(item));
        }
        self.db.execute_batch(statements).await?;

        let diff = RosterDiff {
            upserted: server,
            removed,
        };
        info!(
            account = %self.account,
            items = diff.upserted.len(),
            removed = diff.removed.len(),
            "roster replaced from server"
        );
        self.emit(&diff);
        Ok(diff)
    }

    /// Apply a server push: upsert or delete each listed item.
    pub async fn apply_push(&self, query: &Element) -> Result<RosterDiff, RosterError> {
        let mut diff = RosterDiff::default();
        let mut statements = Vec::new();
        for change in parse_roster_query(query)? {
            match change {
                RosterChange::Upsert(item) => {
                    statements.extend(self.upsert_statements(&item));
                    diff.upserted.push(item);
                }
                RosterChange::Remove(jid) => {
                    statements.push(self.delete_statement(&jid));
                    diff.removed.push(jid);
                }
            }
        }
        if diff.is_empty() {
            debug!(account = %self.account, "empty roster push");
            return Ok(diff);
        }

        self.db.execute_batch(statements).await?;
        debug!(
            account = %self.account,
            upserted = diff.upserted.len(),
            removed = diff.removed.len(),
            "roster push applied"
        );
        self.emit(&diff);
        Ok(diff)
    }

    /// The roster set plus the subscription request. The store is left
    /// alone until the server pushes the new item.
    pub fn add_contact_request(
        &self,
        id: &str,
        jid: &str,
        name: Option<&str>,
        groups: &[String],
    ) -> Result<Vec<Stanza>, RosterError> {
        let jid = bare_jid(jid);
        Ok(vec![
            outbound::roster_set(id, &jid, name, groups)?,
            outbound::subscription_request(&jid)?,
        ])
    }

    pub fn remove_contact_request(&self, id: &str, jid: &str) -> Result<Stanza, RosterError> {
        Ok(outbound::roster_remove(id, &bare_jid(jid))?)
    }

    pub fn subscription_requested(&self, from: &str) {
        let from = bare_jid(from);
        info!(account = %self.account, %from, "subscription requested");
        self.emitter
            .emit(EventPayload::SubscriptionRequested { from });
    }

    pub fn respond_subscription(&self, jid: &str, accept: bool) -> Result<Stanza, RosterError> {
        Ok(outbound::subscription_response(&bare_jid(jid), accept)?)
    }

    /// Stored roster with groups, ordered by name then jid.
    pub async fn roster(&self) -> Result<Vec<RosterItem>, RosterError> {
        let items: Vec<ItemRow> = self
            .db
            .query(
                "SELECT jid, name, subscription, pending, approved FROM roster_items \
                 WHERE account = ?1 ORDER BY name, jid",
                &[&self.account],
            )
            .await?;
        let groups: Vec<GroupRow> = self
            .db
            .query(
                "SELECT jid, group_name FROM roster_groups WHERE account = ?1 \
                 ORDER BY group_name",
                &[&self.account],
            )
            .await?;

        let mut by_jid: HashMap<String, Vec<String>> = HashMap::new();
        for row in groups {
            by_jid.entry(row.jid).or_default().push(row.group);
        }

        Ok(items
            .into_iter()
            .map(|row| RosterItem {
                groups: by_jid.remove(&row.jid).unwrap_or_default(),
                jid: row.jid,
                name: row.name,
                subscription: row.subscription,
                pending: row.pending,
                approved: row.approved,
            })
            .collect())
    }

    pub async fn item(&self, jid: &str) -> Result<Option<RosterItem>, RosterError> {
        let jid = bare_jid(jid);
        Ok(self
            .roster()
            .await?
            .into_iter()
            .find(|item| item.jid == jid))
    }

    fn upsert_statements(&self, item: &RosterItem) -> Vec<Statement> {
        let mut statements = vec![
            Statement::new(
                "INSERT INTO roster_items (account, jid, name, subscription, pending, approved) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(account, jid) DO UPDATE SET \
                 name = excluded.name, subscription = excluded.subscription, \
                 pending = excluded.pending, approved = excluded.approved",
                &[
                    &self.account,
                    &item.jid,
                    &item.name,
                    &item.subscription.as_str(),
                    &item.pending,
                    &item.approved,
                ],
            ),
            Statement::new(
                "DELETE FROM roster_groups WHERE account = ?1 AND jid = ?2",
                &[&self.account, &item.jid],
            ),
        ];
        for group in &item.groups {
            statements.push(Statement::new(
                "INSERT INTO roster_groups (account, jid, group_name) VALUES (?1, ?2, ?3)",
                &[&self.account, &item.jid, group],
            ));
        }
        statements
    }

    fn delete_statement(&self, jid: &str) -> Statement {
        Statement::new(
            "DELETE FROM roster_items WHERE account = ?1 AND jid = ?2",
            &[&self.account, &jid],
        )
    }

    fn emit(&self, diff: &RosterDiff) {
        self.emitter.emit(EventPayload::RosterUpdated {
            upserted: diff.upserted.clone(),
            removed: diff.removed.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rookery_core::{BroadcastEventBus, EventBus, EventSubscription};
    use rookery_storage::NativeDatabase;
    use std::str::FromStr;
    use tempfile::TempDir;

    const ACCOUNT: &str = "me@example.com";

    async fn setup() -> (RosterSync<NativeDatabase>, EventSubscription, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = rookery_storage::open_database(&dir.path().join("rookery.db"))
            .await
            .unwrap();
        let (roster, sub) = sync_for(Arc::new(db), ACCOUNT);
        (roster, sub, dir)
    }

    fn sync_for(
        db: Arc<NativeDatabase>,
        account: &str,
    ) -> (RosterSync<NativeDatabase>, EventSubscription) {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let sub = bus.subscribe("roster.*").unwrap();
        (RosterSync::new(db, Emitter::new(account, bus)), sub)
    }

    fn query(items: &str) -> Element {
        Element::from_str(&format!("<query xmlns='jabber:iq:roster'>{items}</query>")).unwrap()
    }

    fn jids(items: &[RosterItem]) -> Vec<&str> {
        items.iter().map(|item| item.jid.as_str()).collect()
    }

    #[test]
    fn parses_items_flags_and_groups() {
        let changes = parse_roster_query(&query(
            "<item jid='bob@example.com/x' name='Bob' subscription='to' ask='subscribe' approved='true'>\
             <group>Work</group><group>Friends</group><group>Work</group></item>\
             <item jid='carol@example.com' subscription='remove'/>",
        ))
        .unwrap();

        assert_matches!(&changes[0], RosterChange::Upsert(item) if item.jid == "bob@example.com"
            && item.subscription == Subscription::To
            && item.pending
            && item.approved
            && item.groups == vec!["Friends".to_string(), "Work".to_string()]);
        assert_matches!(&changes[1], RosterChange::Remove(jid) if jid == "carol@example.com");
    }

    #[test]
    fn rejects_items_without_jid() {
        assert_matches!(
            parse_roster_query(&query("<item name='nobody'/>")),
            Err(RosterError::Malformed(_))
        );
    }

    #[tokio::test]
    async fn fetch_replaces_local_roster() {
        let (roster, _sub, _dir) = setup().await;
        roster
            .apply_fetch_result(&query(
                "<item jid='a@example.com' name='A'/><item jid='b@example.com' name='B'/>\
                 <item jid='c@example.com' name='C'/>",
            ))
            .await
            .unwrap();

        let diff = roster
            .apply_fetch_result(&query(
                "<item jid='a@example.com' name='A' subscription='both'/>\
                 <item jid='b@example.com' name='B'/>",
            ))
            .await
            .unwrap();

        assert_eq!(diff.removed, vec!["c@example.com".to_string()]);
        let stored = roster.roster().await.unwrap();
        assert_eq!(jids(&stored), vec!["a@example.com", "b@example.com"]);
        assert_eq!(stored[0].subscription, Subscription::Both);
    }

    #[tokio::test]
    async fn push_upserts_and_removes_single_items() {
        let (roster, mut sub, _dir) = setup().await;
        roster
            .apply_push(&query(
                "<item jid='bob@example.com' name='Bob' subscription='both'><group>Friends</group></item>",
            ))
            .await
            .unwrap();
        roster
            .apply_push(&query(
                "<item jid='bob@example.com' name='Robert' subscription='both'><group>Work</group></item>",
            ))
            .await
            .unwrap();

        let bob = roster.item("bob@example.com").await.unwrap().unwrap();
        assert_eq!(bob.name.as_deref(), Some("Robert"));
        assert_eq!(bob.groups, vec!["Work".to_string()]);

        roster
            .apply_push(&query("<item jid='bob@example.com' subscription='remove'/>"))
            .await
            .unwrap();
        assert!(roster.roster().await.unwrap().is_empty());

        let mut updates = 0;
        while let Some(Ok(event)) = sub.try_recv() {
            assert_matches!(event.payload, EventPayload::RosterUpdated { .. });
            updates += 1;
        }
        assert_eq!(updates, 3);
    }

    #[tokio::test]
    async fn contact_requests_leave_store_untouched() {
        let (roster, mut sub, _dir) = setup().await;
        let stanzas = roster
            .add_contact_request("iq_add", "dave@example.com/phone", Some("Dave"), &[])
            .unwrap();
        assert_eq!(stanzas.len(), 2);
        assert_eq!(stanzas[0].id(), Some("iq_add"));
        assert_matches!(&stanzas[1], Stanza::Presence(_));

        let remove = roster.remove_contact_request("iq_rm", "dave@example.com").unwrap();
        assert_eq!(remove.id(), Some("iq_rm"));

        assert!(roster.roster().await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscription_request_is_announced() {
        let (roster, mut sub, _dir) = setup().await;
        roster.subscription_requested("eve@example.com/laptop");
        let event = sub.try_recv().unwrap().unwrap();
        assert_matches!(
            event.payload,
            EventPayload::SubscriptionRequested { from } if from == "eve@example.com"
        );
    }

    #[tokio::test]
    async fn roster_is_scoped_to_account() {
        let (roster, _sub, _dir) = setup().await;
        roster
            .apply_push(&query("<item jid='bob@example.com'/>"))
            .await
            .unwrap();

        let (other, _other_sub) = sync_for(roster.db.clone(), "other@example.com");
        assert!(other.roster().await.unwrap().is_empty());
        assert_eq!(roster.roster().await.unwrap().len(), 1);
    }
}
