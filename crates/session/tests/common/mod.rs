//! Harness driving a whole session against a scripted server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use rookery_core::{
    BroadcastEventBus, Command, EventBus, EventPayload, EventSubscription, Event,
    config::{AccountConfig, ReconnectConfig},
};
use rookery_session::{Session, SessionHandle, SessionSettings};
use rookery_storage::{NativeDatabase, open_database};
use rookery_test_support::{ScriptedServer, ScriptedTransport, fixtures};
use rookery_xmpp::{
    Stanza,
    carbons::{CARBONS_ENABLE_IQ_ID, NS_CARBONS},
    outbound::NS_MAM,
    router::NS_ROSTER,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn open_store(dir: &TempDir) -> Arc<NativeDatabase> {
    Arc::new(open_database(&dir.path().join("rookery.db")).await.unwrap())
}

/// Fast retries without jitter.
pub fn quick_settings(dir: &TempDir) -> SessionSettings {
    let mut settings = SessionSettings {
        reconnect: ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        },
        ..SessionSettings::default()
    };
    settings.transfer.download_dir = Some(dir.path().join("downloads").display().to_string());
    settings
}

pub struct Harness {
    pub server: ScriptedServer,
    pub session: SessionHandle,
    pub events: EventSubscription,
    pub db: Arc<NativeDatabase>,
    pub bus: Arc<BroadcastEventBus>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start(account: AccountConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = quick_settings(&dir);
        Self::start_with(account, settings, dir).await
    }

    pub async fn start_with(account: AccountConfig, settings: SessionSettings, dir: TempDir) -> Self {
        let server = ScriptedServer::register(&account.jid);
        let db = open_store(&dir).await;
        let bus = Arc::new(BroadcastEventBus::new(1024));
        let events = bus.subscribe("**").unwrap();
        let session =
            Session::<ScriptedTransport, _>::spawn(account, &settings, db.clone(), bus.clone());
        Self {
            server,
            session,
            events,
            db,
            bus,
            dir,
        }
    }

    pub fn account(&self) -> &str {
        self.session.account()
    }

    pub async fn send(&self, command: Command) -> uuid::Uuid {
        self.session.send(command).await.unwrap()
    }

    pub async fn next_event(&mut self) -> Event {
        match timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(error)) => panic!("event stream failed: {error}"),
            Err(_) => panic!("no event within {EVENT_TIMEOUT:?}"),
        }
    }

    /// Skip events until one matches.
    pub async fn expect(&mut self, predicate: impl Fn(&EventPayload) -> bool) -> Event {
        loop {
            let event = self.next_event().await;
            if predicate(&event.payload) {
                return event;
            }
        }
    }

    /// Connect and answer the initial sync: `roster` items, carbons and an
    /// empty archive page.
    pub async fn connect(&mut self, roster: &[(&str, &str, &str)]) {
        self.send(Command::Connect).await;
        self.expect(|payload| matches!(payload, EventPayload::Connected { .. }))
            .await;
        self.answer_sync(roster).await;
    }

    pub async fn answer_sync(&mut self, roster: &[(&str, &str, &str)]) {
        let presence = self.server.next_sent().await;
        assert_eq!(presence.name(), "presence");

        let fetch = self.server.sent_iq("query", NS_ROSTER).await;
        self.server
            .deliver(&fixtures::roster_result(iq_id(&fetch), roster));

        let carbons = self.server.sent_iq("enable", NS_CARBONS).await;
        assert_eq!(carbons.id(), Some(CARBONS_ENABLE_IQ_ID));
        self.server.deliver(&fixtures::iq_result(CARBONS_ENABLE_IQ_ID));

        let archive = self.server.sent_iq("query", NS_MAM).await;
        self.server
            .deliver(&fixtures::archive_fin(iq_id(&archive), true));
        self.expect(|payload| matches!(payload, EventPayload::HistorySynced { .. }))
            .await;
    }

    /// Round-trip a ping so everything delivered before it has been handled.
    pub async fn settle(&mut self) {
        self.server.deliver(&fixtures::ping("settle", "x.com"));
        self.server
            .sent_matching(|stanza| stanza.id() == Some("settle"))
            .await;
    }
}

pub fn iq_id(stanza: &Stanza) -> &str {
    stanza.id().expect("iq without id")
}
