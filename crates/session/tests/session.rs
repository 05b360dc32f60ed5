mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use tempfile::TempDir;

use rookery_core::{
    BroadcastEventBus, Command, Emitter, ErrorKind, EventBus, EventPayload,
    config::{AccountConfig, Config},
    event::{Availability, OccupantChange, TransferState},
};
use rookery_messaging::MessagePipeline;
use rookery_muc::MucManager;
use rookery_presence::PresenceAggregator;
use rookery_roster::RosterSync;
use rookery_session::{Engine, SessionSettings};
use rookery_storage::AccountStore;
use rookery_test_support::{ScriptedServer, ScriptedTransport, fixtures};
use rookery_xmpp::{ConnectionError, Stanza, router::NS_SI};

use common::{Harness, iq_id, open_store, quick_settings};

fn account(jid: &str) -> AccountConfig {
    AccountConfig::new(jid, "secret")
}

fn body_of(stanza: &Stanza) -> Option<String> {
    stanza
        .to_element()
        .get_child("body", "jabber:client")
        .map(|body| body.text())
}

#[tokio::test]
async fn sent_message_merges_with_its_carbon_and_receipt() {
    let mut harness = Harness::start(account("send@x.com")).await;
    harness.connect(&[]).await;

    harness
        .send(Command::SendMessage {
            to: "b@x.com".into(),
            body: "hi".into(),
        })
        .await;
    let sent = harness
        .server
        .sent_matching(|stanza| stanza.name() == "message")
        .await;
    assert_eq!(body_of(&sent).as_deref(), Some("hi"));
    let id = sent.id().unwrap().to_string();
    assert!(id.starts_with("msg_"));

    harness
        .server
        .deliver(&fixtures::sent_carbon("send@x.com", "phone", "b@x.com", &id, "hi"));
    harness
        .server
        .deliver(&fixtures::receipt("b@x.com/pc", "send@x.com/rookery", &id));
    let delivered = harness
        .expect(|payload| matches!(payload, EventPayload::MessageDelivered { .. }))
        .await;
    assert_matches!(delivered.payload, EventPayload::MessageDelivered { id: ref got, .. } if *got == id);

    let pipeline = MessagePipeline::new(
        harness.db.clone(),
        Emitter::new("send@x.com", harness.bus.clone()),
    );
    let conversation = pipeline.conversation("b@x.com", 10, None).await.unwrap();
    assert_eq!(conversation.len(), 1);
    let stored = &conversation[0];
    assert_eq!(stored.id, id);
    assert!(stored.delivered_at.is_some());
    assert!(stored.displayed_at.is_none());
}

#[tokio::test]
async fn inbound_chat_is_stored_and_acknowledged() {
    let mut harness = Harness::start(account("recv@x.com")).await;
    harness.connect(&[]).await;

    harness
        .server
        .deliver(&fixtures::chat("b@x.com/pc", "recv@x.com/rookery", "m1", "hello"));
    let received = harness
        .expect(|payload| matches!(payload, EventPayload::MessageReceived { .. }))
        .await;
    assert_matches!(received.payload, EventPayload::MessageReceived { message } if message.body == "hello");

    let receipt = harness
        .server
        .sent_matching(|stanza| stanza.name() == "message")
        .await;
    let element = receipt.to_element();
    let received = element.get_child("received", "urn:xmpp:receipts").unwrap();
    assert_eq!(received.attr("id"), Some("m1"));

    let marked = harness
        .send(Command::MarkDisplayed {
            peer: "b@x.com/pc".into(),
            id: "m1".into(),
        })
        .await;
    let displayed = harness
        .expect(|payload| matches!(payload, EventPayload::MessageDisplayed { .. }))
        .await;
    assert_eq!(displayed.correlation_id, Some(marked));
}

#[tokio::test]
async fn roster_fetch_replaces_the_local_roster() {
    let mut harness = Harness::start(account("roster@x.com")).await;
    harness
        .connect(&[
            ("a@x.com", "A", "both"),
            ("b@x.com", "B", "both"),
            ("c@x.com", "C", "to"),
        ])
        .await;

    harness.send(Command::FetchRoster).await;
    let fetch = harness
        .server
        .sent_iq("query", rookery_xmpp::router::NS_ROSTER)
        .await;
    harness.server.deliver(&fixtures::roster_result(
        iq_id(&fetch),
        &[("a@x.com", "A", "both"), ("b@x.com", "Bee", "both")],
    ));

    let updated = harness
        .expect(|payload| {
            matches!(payload, EventPayload::RosterUpdated { removed, .. } if !removed.is_empty())
        })
        .await;
    assert_matches!(
        updated.payload,
        EventPayload::RosterUpdated { upserted, removed }
            if upserted.len() == 2 && removed == vec!["c@x.com".to_string()]
    );

    let roster = RosterSync::new(
        harness.db.clone(),
        Emitter::new("roster@x.com", harness.bus.clone()),
    );
    let items = roster.roster().await.unwrap();
    let jids: Vec<&str> = items.iter().map(|item| item.jid.as_str()).collect();
    assert_eq!(jids, vec!["a@x.com", "b@x.com"]);
    assert_eq!(items[1].name.as_deref(), Some("Bee"));
}

#[tokio::test]
async fn roster_push_is_acknowledged_and_applied() {
    let mut harness = Harness::start(account("push@x.com")).await;
    harness.connect(&[("a@x.com", "A", "both")]).await;

    harness
        .server
        .deliver(&fixtures::roster_push("push1", &[("a@x.com", "A", "remove")]));
    let ack = harness
        .server
        .sent_matching(|stanza| stanza.id() == Some("push1"))
        .await;
    assert_eq!(ack.name(), "iq");
    harness
        .expect(|payload| matches!(payload, EventPayload::RosterUpdated { removed, .. } if removed == &vec!["a@x.com".to_string()]))
        .await;
}

#[tokio::test]
async fn subscription_requests_and_presence_reach_the_bus() {
    let mut harness = Harness::start(account("pres@x.com")).await;
    harness.connect(&[]).await;

    harness.server.deliver(&fixtures::subscribe("carol@x.com"));
    harness
        .expect(|payload| matches!(payload, EventPayload::SubscriptionRequested { from } if from == "carol@x.com"))
        .await;

    harness
        .server
        .deliver(&fixtures::presence("b@x.com/pc", Some("away"), 1));
    harness
        .server
        .deliver(&fixtures::presence("b@x.com/phone", None, 5));
    let updated = harness
        .expect(|payload| {
            matches!(payload, EventPayload::PresenceUpdated { presence } if presence.availability == Availability::Available)
        })
        .await;
    assert_matches!(updated.payload, EventPayload::PresenceUpdated { presence } if presence.resource.as_deref() == Some("phone"));
}

#[tokio::test]
async fn nick_change_emits_a_single_occupant_update() {
    let mut harness = Harness::start(account("muc@x.com")).await;
    harness.connect(&[]).await;
    let room = "dev@conf.x.com";
    let mut occupant_events = harness.bus.subscribe("muc.occupant").unwrap();

    harness
        .send(Command::JoinRoom {
            room: room.into(),
            nick: Some("me".into()),
            auto_join: false,
        })
        .await;
    let join = harness
        .server
        .sent_matching(|stanza| stanza.name() == "presence")
        .await;
    assert_eq!(
        join.to_element().attr("to"),
        Some("dev@conf.x.com/me")
    );
    harness.server.deliver(&fixtures::self_occupant(room, "me"));
    harness
        .expect(|payload| matches!(payload, EventPayload::RoomJoined { .. }))
        .await;

    harness
        .server
        .deliver(&fixtures::occupant_with_jid(room, "old", "alice@x.com/laptop"));
    harness
        .server
        .deliver(&fixtures::nick_change_leave(room, "old", "new", "alice@x.com/laptop"));
    harness
        .server
        .deliver(&fixtures::occupant_with_jid(room, "new", "alice@x.com/laptop"));
    harness.settle().await;

    let mut alice_changes = Vec::new();
    while let Some(event) = occupant_events.try_recv() {
        if let EventPayload::RoomOccupantChanged { occupant, change } = event.unwrap().payload {
            if occupant.occupant_id == "alice@x.com" {
                alice_changes.push(change);
            }
        }
    }
    assert_eq!(
        alice_changes,
        vec![
            OccupantChange::Joined,
            OccupantChange::NickChanged {
                old_nick: "old".into()
            },
        ]
    );

    let muc = MucManager::new(
        harness.db.clone(),
        Emitter::new("muc@x.com", harness.bus.clone()),
        "me",
    );
    let alice: Vec<_> = muc
        .occupants(room)
        .await
        .unwrap()
        .into_iter()
        .filter(|occupant| occupant.occupant_id == "alice@x.com")
        .collect();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].nick, "new");
}

#[tokio::test]
async fn room_messages_are_deduplicated_against_the_reflection() {
    let mut harness = Harness::start(account("room@x.com")).await;
    harness.connect(&[]).await;
    let room = "ops@conf.x.com";

    harness
        .send(Command::JoinRoom {
            room: room.into(),
            nick: None,
            auto_join: true,
        })
        .await;
    harness.server.deliver(&fixtures::self_occupant(room, "room"));
    harness
        .expect(|payload| matches!(payload, EventPayload::RoomJoined { nick, .. } if nick == "room"))
        .await;

    harness
        .send(Command::SendRoomMessage {
            room: room.into(),
            body: "deploying".into(),
        })
        .await;
    let sent = harness
        .server
        .sent_matching(|stanza| stanza.name() == "message")
        .await;
    let id = sent.id().unwrap().to_string();
    harness
        .server
        .deliver(&fixtures::groupchat(room, "room", &id, "deploying"));
    harness
        .server
        .deliver(&fixtures::groupchat(room, "bob", "b1", "ok"));
    harness.settle().await;

    let muc = MucManager::new(
        harness.db.clone(),
        Emitter::new("room@x.com", harness.bus.clone()),
        "room",
    );
    let bodies: Vec<String> = muc
        .room_messages(room, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|message| message.body)
        .collect();
    assert_eq!(bodies, vec!["deploying", "ok"]);
}

#[tokio::test]
async fn reconnect_clears_occupants_and_rejoins_auto_join_rooms() {
    let room = "lobby@conf.x.com";
    let mut config = account("rejoin@x.com");
    config.auto_join = vec![room.into()];
    let mut harness = Harness::start(config).await;
    let is_join = |stanza: &Stanza| {
        stanza.name() == "presence"
            && stanza.to_element().attr("to") == Some("lobby@conf.x.com/rejoin")
    };

    harness.connect(&[]).await;
    harness.server.sent_matching(is_join).await;
    harness.server.deliver(&fixtures::self_occupant(room, "rejoin"));
    harness
        .expect(|payload| matches!(payload, EventPayload::RoomJoined { .. }))
        .await;
    harness
        .server
        .deliver(&fixtures::occupant_with_jid(room, "bob", "bob@x.com/desk"));
    harness.settle().await;

    let muc = MucManager::new(
        harness.db.clone(),
        Emitter::new("rejoin@x.com", harness.bus.clone()),
        "rejoin",
    );
    let before = muc.occupants(room).await.unwrap();
    assert!(before.iter().any(|occupant| occupant.nick == "bob"));

    harness.server.drop_connection("connection reset");
    harness
        .expect(|payload| matches!(payload, EventPayload::ConnectionLost { will_retry: true, .. }))
        .await;
    harness
        .expect(|payload| matches!(payload, EventPayload::Connected { .. }))
        .await;
    assert_eq!(harness.server.connects(), 2);
    assert!(muc.occupants(room).await.unwrap().is_empty());

    harness.answer_sync(&[]).await;
    harness.server.sent_matching(is_join).await;
    harness.server.deliver(&fixtures::self_occupant(room, "rejoin"));
    harness
        .expect(|payload| {
            matches!(payload, EventPayload::RoomJoined { room, .. } if room == "lobby@conf.x.com")
        })
        .await;
    harness.settle().await;
    let after = muc.occupants(room).await.unwrap();
    assert!(after.iter().all(|occupant| occupant.nick != "bob"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconnect_gives_up_after_the_configured_attempts() {
    let dir = TempDir::new().unwrap();
    let mut config = account("flaky@x.com");
    config.max_reconnect_attempts = 3;
    let settings = quick_settings(&dir);
    let mut harness = Harness::start_with(config, settings, dir).await;

    harness.send(Command::Connect).await;
    harness
        .expect(|payload| matches!(payload, EventPayload::Connected { .. }))
        .await;

    for _ in 0..3 {
        harness.server.script_connect(Err(ConnectionError::Timeout));
    }
    harness.server.drop_connection("connection reset");

    let mut lost = 0;
    let mut delays = Vec::new();
    loop {
        let event = harness.events.recv().await.unwrap();
        match event.payload {
            EventPayload::ConnectionLost { will_retry, delay_ms, .. } => {
                assert!(will_retry);
                delays.extend(delay_ms);
                lost += 1;
            }
            EventPayload::Reconnecting { delay_ms, .. } => delays.push(delay_ms),
            EventPayload::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 3);
                break;
            }
            EventPayload::Connected { .. } => panic!("reconnected against a failing server"),
            _ => {}
        }
    }
    assert_eq!(lost, 1);
    assert_eq!(delays, vec![100, 200, 400]);
    assert_eq!(harness.server.connects(), 4);

    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(harness.server.connects(), 4);
    while let Some(event) = harness.events.try_recv() {
        assert!(!matches!(
            event.unwrap().payload,
            EventPayload::ReconnectExhausted { .. } | EventPayload::Connected { .. }
        ));
    }
}

#[tokio::test]
async fn authentication_rejection_is_not_retried() {
    let mut harness = Harness::start(account("denied@x.com")).await;
    harness
        .server
        .script_auth(Err(ConnectionError::AuthenticationFailed("not-authorized".into())));

    harness.send(Command::Connect).await;
    let error = harness
        .expect(|payload| matches!(payload, EventPayload::Error { .. }))
        .await;
    assert_matches!(error.payload, EventPayload::Error { kind: ErrorKind::Authentication, .. });
    harness
        .expect(|payload| matches!(payload, EventPayload::Disconnected { .. }))
        .await;
    assert_eq!(harness.server.connects(), 1);
}

#[tokio::test]
async fn commands_while_offline_report_errors() {
    let mut harness = Harness::start(account("offline@x.com")).await;

    let command = harness
        .send(Command::SendMessage {
            to: "b@x.com".into(),
            body: "anyone?".into(),
        })
        .await;
    let error = harness
        .expect(|payload| matches!(payload, EventPayload::Error { .. }))
        .await;
    assert_eq!(error.correlation_id, Some(command));
    assert_matches!(error.payload, EventPayload::Error { kind: ErrorKind::Connection, .. });

    let pipeline = MessagePipeline::new(
        harness.db.clone(),
        Emitter::new("offline@x.com", harness.bus.clone()),
    );
    assert!(pipeline.conversation("b@x.com", 10, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn disconnect_fails_transfers_and_clears_presence() {
    let mut harness = Harness::start(account("bye@x.com")).await;
    harness.connect(&[]).await;

    harness
        .server
        .deliver(&fixtures::presence("b@x.com/pc", None, 0));
    harness
        .expect(|payload| matches!(payload, EventPayload::PresenceUpdated { .. }))
        .await;

    let path = harness.dir.path().join("report.txt");
    tokio::fs::write(&path, b"quarterly numbers").await.unwrap();
    harness
        .send(Command::StartFileTransfer {
            to: "b@x.com/pc".into(),
            path,
        })
        .await;
    harness.server.sent_iq("si", NS_SI).await;
    harness
        .expect(|payload| {
            matches!(payload, EventPayload::FileTransferProgress { state: TransferState::Negotiating, .. })
        })
        .await;

    harness.send(Command::Disconnect).await;
    let failed = harness
        .expect(|payload| {
            matches!(payload, EventPayload::FileTransferProgress { state: TransferState::Failed, .. })
        })
        .await;
    assert_matches!(
        failed.payload,
        EventPayload::FileTransferProgress { reason: Some(reason), .. } if reason == "session closed"
    );
    harness
        .expect(|payload| matches!(payload, EventPayload::Disconnected { .. }))
        .await;
    assert_eq!(harness.server.closes(), 1);

    let presence = PresenceAggregator::new(
        harness.db.clone(),
        Emitter::new("bye@x.com", harness.bus.clone()),
    );
    assert!(presence.resources("b@x.com").await.unwrap().is_empty());
}

#[tokio::test]
async fn inbound_file_is_accepted_and_written() {
    let mut harness = Harness::start(account("files@x.com")).await;
    harness.connect(&[]).await;
    let peer = "b@x.com/pc";

    harness
        .server
        .deliver(&fixtures::file_offer("offer1", peer, "sid1", "notes.txt", 6));
    let offered = harness
        .expect(|payload| matches!(payload, EventPayload::FileTransferOffered { .. }))
        .await;
    let EventPayload::FileTransferOffered { transfer } = offered.payload else {
        unreachable!()
    };

    harness
        .send(Command::AcceptFileTransfer {
            id: transfer.id.clone(),
        })
        .await;
    harness
        .server
        .sent_matching(|stanza| stanza.id() == Some("offer1"))
        .await;

    harness.server.deliver(&fixtures::ibb_open("open1", peer, "sid1", 4096));
    harness
        .server
        .sent_matching(|stanza| stanza.id() == Some("open1"))
        .await;
    harness
        .server
        .deliver(&fixtures::ibb_data("data1", peer, "sid1", 0, "aGVsbG8h"));
    harness
        .server
        .sent_matching(|stanza| stanza.id() == Some("data1"))
        .await;
    harness.server.deliver(&fixtures::ibb_close("close1", peer, "sid1"));
    harness
        .expect(|payload| {
            matches!(payload, EventPayload::FileTransferProgress { state: TransferState::Completed, .. })
        })
        .await;

    let written = tokio::fs::read(harness.dir.path().join("downloads").join("notes.txt"))
        .await
        .unwrap();
    assert_eq!(written, b"hello!");
}

#[tokio::test]
async fn malformed_and_unknown_stanzas_do_not_end_the_session() {
    let mut harness = Harness::start(account("robust@x.com")).await;
    harness.connect(&[]).await;

    harness.server.deliver_garbage("<message><unclosed>");
    harness.server.deliver(&fixtures::iq_result("nobody-asked"));
    harness.server.deliver(
        "<iq xmlns='jabber:client' type='get' id='v1' from='b@x.com/pc'>\
         <query xmlns='jabber:iq:version'/></iq>",
    );
    let reply = harness
        .server
        .sent_matching(|stanza| stanza.id() == Some("v1"))
        .await;
    let element = reply.to_element();
    assert_eq!(element.attr("type"), Some("error"));
    let error = element.get_child("error", "jabber:client").unwrap();
    assert!(error.has_child("feature-not-implemented", "urn:ietf:params:xml:ns:xmpp-stanzas"));

    harness.settle().await;
    assert!(harness.server.is_connected());
}

#[tokio::test]
async fn dropping_every_sender_disconnects() {
    let mut harness = Harness::start(account("drop@x.com")).await;
    harness.connect(&[]).await;

    let Harness {
        server,
        session,
        mut events,
        ..
    } = harness;
    session.join().await.unwrap();

    let mut disconnected = false;
    while let Some(event) = events.try_recv() {
        if let EventPayload::Disconnected { reason } = event.unwrap().payload {
            assert_eq!(reason, "session closed");
            disconnected = true;
        }
    }
    assert!(disconnected);
    assert!(!server.is_connected());
}

#[tokio::test]
async fn engine_runs_accounts_side_by_side() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    let bus = Arc::new(BroadcastEventBus::new(1024));
    let mut events = bus.subscribe("connection.online").unwrap();
    let first = ScriptedServer::register("first@x.com");
    let second = ScriptedServer::register("second@y.com");

    let config = Config {
        accounts: vec![account("first@x.com"), account("second@y.com")],
        reconnect: Default::default(),
        timeouts: Default::default(),
        transfer: Default::default(),
        storage: Default::default(),
        logging: Default::default(),
        event_bus: Default::default(),
    };
    let engine = Engine::start::<ScriptedTransport, _>(&config, db.clone(), bus.clone());
    assert_eq!(
        engine.accounts().collect::<Vec<_>>(),
        vec!["first@x.com", "second@y.com"]
    );
    assert!(engine.session("second@y.com/laptop").is_some());

    engine.connect_all().await.unwrap();
    let mut online = Vec::new();
    for _ in 0..2 {
        online.push(events.recv().await.unwrap().account);
    }
    online.sort();
    assert_eq!(online, vec!["first@x.com", "second@y.com"]);
    assert_eq!(first.connects(), 1);
    assert_eq!(second.connects(), 1);

    engine.shutdown().await;
    assert!(!first.is_connected());
    assert!(!second.is_connected());

    let accounts = AccountStore::new(db).accounts().await.unwrap();
    assert_eq!(accounts.len(), 2);
}

#[test]
fn settings_follow_the_loaded_configuration() {
    let config = Config {
        accounts: Vec::new(),
        reconnect: Default::default(),
        timeouts: Default::default(),
        transfer: Default::default(),
        storage: Default::default(),
        logging: Default::default(),
        event_bus: rookery_core::config::EventBusConfig {
            channel_capacity: 7,
        },
    };
    let settings = SessionSettings::from(&config);
    assert_eq!(settings.command_capacity, 7);
    assert_eq!(settings.timeouts.roster_fetch().as_secs(), 30);
}
