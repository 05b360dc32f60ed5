use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use rookery_core::{
    Command, CommandEnvelope, CommandReceiver, CommandSender, Emitter, EventBus, EventBusError,
    EventPayload, command_channel,
    config::{AccountConfig, Config, ReconnectConfig, TimeoutConfig, TransferConfig},
    event::Availability,
    jid::new_iq_id,
};
use rookery_messaging::MessagePipeline;
use rookery_muc::MucManager;
use rookery_presence::{PresenceAggregator, PresenceUpdate};
use rookery_roster::RosterSync;
use rookery_storage::{AccountStore, Database};
use rookery_transfer::{TransferError, TransferManager};
use rookery_xmpp::{
    CarbonsManager, ConnectionError, ConnectionManager, IqResponse, IqRoute, ReconnectPolicy,
    ReconnectStep, RecvError, RoomEvent, Route, RouteContext, Stanza, XmppTransport,
    carbons::CARBONS_ENABLE_IQ_ID, classify, outbound,
};

use crate::error::SessionError;

/// Settings shared by every session of an engine.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reconnect: ReconnectConfig,
    pub timeouts: TimeoutConfig,
    pub transfer: TransferConfig,
    pub command_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            timeouts: TimeoutConfig::default(),
            transfer: TransferConfig::default(),
            command_capacity: 64,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            timeouts: config.timeouts.clone(),
            transfer: config.transfer.clone(),
            command_capacity: config.event_bus.channel_capacity,
        }
    }
}

/// Requests whose responses the session correlates itself.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    RosterFetch { deadline: Instant },
    RosterSet { jid: String },
}

/// The running session of one account.
pub struct SessionHandle {
    account: String,
    commands: CommandSender,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn account(&self) -> &str {
        &self.account
    }

    /// A sender for this session's commands. The session stops once every
    /// sender is dropped.
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub async fn send(&self, command: Command) -> Result<Uuid, EventBusError> {
        self.commands.send(command).await
    }

    /// Drop this handle's sender and wait for the session to finish.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        drop(self.commands);
        self.task.await
    }
}

/// Per-account actor. Owns the connection and every component's in-memory
/// state; inbound stanzas and commands are handled one at a time.
pub struct Session<T, D>
where
    T: XmppTransport,
    D: Database,
{
    account: String,
    auto_join: Vec<String>,
    emitter: Emitter,
    connection: ConnectionManager<T>,
    accounts: AccountStore<D>,
    roster: RosterSync<D>,
    presence: PresenceAggregator<D>,
    messages: MessagePipeline<D>,
    muc: MucManager<D>,
    transfers: TransferManager<D>,
    carbons: CarbonsManager,
    pending: HashMap<String, Request>,
    roster_timeout: std::time::Duration,
    retry_at: Option<Instant>,
    commands: CommandReceiver,
}

impl<T, D> Session<T, D>
where
    T: XmppTransport + Sync,
    D: Database,
{
    /// Start the actor for `account` on the current runtime. The session
    /// stays `Disconnected` until it receives `Command::Connect`.
    pub fn spawn(
        account: AccountConfig,
        settings: &SessionSettings,
        db: Arc<D>,
        bus: Arc<dyn EventBus>,
    ) -> SessionHandle {
        let (commands, receiver) = command_channel(settings.command_capacity);
        let session = Self::new(account, settings, db, bus, receiver);
        let account = session.account.clone();
        let task = tokio::spawn(session.run());
        SessionHandle {
            account,
            commands,
            task,
        }
    }

    fn new(
        config: AccountConfig,
        settings: &SessionSettings,
        db: Arc<D>,
        bus: Arc<dyn EventBus>,
        commands: CommandReceiver,
    ) -> Self {
        let account = config.bare_jid();
        let emitter = Emitter::new(account.clone(), bus);
        let policy = ReconnectPolicy::new(&config, &settings.reconnect);
        Self {
            connection: ConnectionManager::new(
                &config,
                policy,
                settings.timeouts.auth(),
                emitter.clone(),
            ),
            accounts: AccountStore::new(db.clone()),
            roster: RosterSync::new(db.clone(), emitter.clone()),
            presence: PresenceAggregator::new(db.clone(), emitter.clone()),
            messages: MessagePipeline::new(db.clone(), emitter.clone()),
            muc: MucManager::new(db.clone(), emitter.clone(), config.nickname()),
            transfers: TransferManager::new(
                db,
                emitter.clone(),
                settings.transfer.clone(),
                settings.timeouts.transfer_negotiation(),
            ),
            carbons: CarbonsManager::new(),
            pending: HashMap::new(),
            roster_timeout: settings.timeouts.roster_fetch(),
            retry_at: None,
            auto_join: config.auto_join,
            account,
            emitter,
            commands,
        }
    }

    async fn run(mut self) {
        info!(account = %self.account, "session started");
        if let Err(error) = self.muc.register_auto_join(&self.auto_join).await {
            self.report(error.into());
        }

        loop {
            let online = self.connection.is_online();
            let retry_at = self.retry_at;
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(envelope) => self.handle_command(envelope).await,
                    None => break,
                },
                inbound = self.connection.recv(), if online => self.handle_inbound(inbound).await,
                _ = sleep_until(retry_at) => self.retry().await,
                _ = sleep_until(deadline) => self.sweep_deadlines().await,
            }
        }

        debug!(account = %self.account, "command stream closed");
        self.disconnect("session closed").await;
        info!(account = %self.account, "session stopped");
    }

    // ── Commands ───────────────────────────────────────────────────

    async fn handle_command(&mut self, envelope: CommandEnvelope) {
        let CommandEnvelope { id, command } = envelope;
        debug!(account = %self.account, command = command.name(), %id, "handling command");
        self.emitter.set_correlation(Some(id));
        if let Err(error) = self.execute(command).await {
            self.report(error);
        }
        self.emitter.set_correlation(None);
    }

    async fn execute(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Connect => {
                let step = self.connection.connect().await?;
                self.advance(step).await;
            }
            Command::Disconnect => self.disconnect("disconnected by user").await,
            Command::SendMessage { to, body } => {
                self.require_online()?;
                let stanza = self.messages.send(&to, &body).await?;
                self.send(stanza).await?;
            }
            Command::SendPresence {
                availability,
                status,
            } => {
                self.require_online()?;
                self.send(outbound::presence(availability, status.as_deref(), 0))
                    .await?;
            }
            Command::FetchRoster => {
                self.require_online()?;
                self.fetch_roster().await?;
            }
            Command::AddContact { jid, name, groups } => {
                self.require_online()?;
                let id = new_iq_id();
                let stanzas = self
                    .roster
                    .add_contact_request(&id, &jid, name.as_deref(), &groups)?;
                self.pending.insert(id, Request::RosterSet { jid });
                self.send_all(stanzas).await?;
            }
            Command::RemoveContact { jid } => {
                self.require_online()?;
                let id = new_iq_id();
                let stanza = self.roster.remove_contact_request(&id, &jid)?;
                self.pending.insert(id, Request::RosterSet { jid });
                self.send(stanza).await?;
            }
            Command::RespondSubscription { jid, accept } => {
                self.require_online()?;
                let stanza = self.roster.respond_subscription(&jid, accept)?;
                self.send(stanza).await?;
            }
            Command::JoinRoom {
                room,
                nick,
                auto_join,
            } => {
                self.require_online()?;
                let stanza = self.muc.join(&room, nick.as_deref(), auto_join).await?;
                self.send(stanza).await?;
            }
            Command::LeaveRoom { room } => {
                self.require_online()?;
                let stanza = self.muc.leave(&room).await?;
                self.send(stanza).await?;
            }
            Command::SendRoomMessage { room, body } => {
                self.require_online()?;
                let stanza = self.muc.send_message(&room, &body).await?;
                self.send(stanza).await?;
            }
            Command::MarkDisplayed { peer, id } => {
                self.require_online()?;
                let stanza = self.messages.mark_displayed(&peer, &id).await?;
                self.send(stanza).await?;
            }
            Command::FetchHistory { with, since } => {
                self.require_online()?;
                let (_, stanza) = self.messages.fetch_history(with.as_deref(), since)?;
                self.send(stanza).await?;
            }
            Command::StartFileTransfer { to, path } => {
                self.require_online()?;
                let stanza = self.transfers.start(&to, &path).await?;
                self.send(stanza).await?;
            }
            Command::AcceptFileTransfer { id } => {
                self.require_online()?;
                let stanza = self.transfers.accept(&id).await?;
                self.send(stanza).await?;
            }
            Command::RejectFileTransfer { id } => {
                let stanza = self.transfers.reject(&id).await?;
                self.send_if_online(stanza).await?;
            }
            Command::CancelFileTransfer { id } => {
                if let Some(stanza) = self.transfers.cancel(&id).await? {
                    self.send_if_online(stanza).await?;
                }
            }
            other => {
                warn!(account = %self.account, command = other.name(), "command not supported");
            }
        }
        Ok(())
    }

    fn require_online(&self) -> Result<(), SessionError> {
        if self.connection.is_online() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected.into())
        }
    }

    async fn fetch_roster(&mut self) -> Result<(), SessionError> {
        self.pending
            .retain(|_, request| !matches!(request, Request::RosterFetch { .. }));
        let id = new_iq_id();
        let stanza = self.roster.fetch_request(&id);
        self.pending.insert(
            id,
            Request::RosterFetch {
                deadline: Instant::now() + self.roster_timeout,
            },
        );
        self.send(stanza).await
    }

    // ── Connection lifecycle ───────────────────────────────────────

    async fn advance(&mut self, step: ReconnectStep) {
        match step {
            ReconnectStep::Online => {
                self.retry_at = None;
                self.on_online().await;
            }
            ReconnectStep::RetryIn(delay) => self.retry_at = Some(Instant::now() + delay),
            ReconnectStep::GaveUp => self.retry_at = None,
        }
    }

    async fn retry(&mut self) {
        self.retry_at = None;
        let step = self.connection.retry().await;
        self.advance(step).await;
    }

    /// Bring a fresh stream up to date: presence, roster, carbons, archive
    /// catch-up and rooms.
    async fn on_online(&mut self) {
        if let Err(error) = self.accounts.record_login(&self.account, None).await {
            self.report(error.into());
        }
        if let Err(error) = self.resync().await {
            self.report(error);
        }
    }

    async fn resync(&mut self) -> Result<(), SessionError> {
        self.send(outbound::presence(Availability::Available, None, 0))
            .await?;
        self.fetch_roster().await?;
        if let Some(stanza) = self.carbons.enable()? {
            self.send(stanza).await?;
        }
        let (_, stanza) = self.messages.catch_up_request().await?;
        self.send(stanza).await?;
        let joins = self.muc.rejoin_requests().await?;
        self.send_all(joins).await
    }

    async fn connection_lost(&mut self, reason: String) {
        let delay = self.connection.handle_transport_failure(reason).await;
        self.retry_at = delay.map(|delay| Instant::now() + delay);
        self.teardown("connection lost").await;
    }

    /// Cancel everything in flight, then close the stream.
    async fn disconnect(&mut self, reason: &str) {
        self.retry_at = None;
        self.teardown("session closed").await;
        self.connection.disconnect(reason).await;
    }

    async fn teardown(&mut self, reason: &str) {
        if let Err(error) = self.transfers.fail_all(reason).await {
            self.report(error.into());
        }
        self.pending.clear();
        self.messages.abandon_queries();
        self.carbons.reset();
        if let Err(error) = self.presence.clear().await {
            self.report(error.into());
        }
        if let Err(error) = self.muc.connection_lost().await {
            self.report(error.into());
        }
    }

    async fn send(&mut self, stanza: Stanza) -> Result<(), SessionError> {
        match self.connection.send(&stanza).await {
            Ok(()) => Ok(()),
            Err(error @ ConnectionError::NotConnected) => Err(error.into()),
            Err(error) => {
                self.connection_lost(error.to_string()).await;
                Ok(())
            }
        }
    }

    async fn send_all(&mut self, stanzas: Vec<Stanza>) -> Result<(), SessionError> {
        for stanza in stanzas {
            self.send(stanza).await?;
        }
        Ok(())
    }

    /// For replies that only matter to a peer we are still connected to.
    async fn send_if_online(&mut self, stanza: Stanza) -> Result<(), SessionError> {
        if self.connection.is_online() {
            self.send(stanza).await
        } else {
            debug!(account = %self.account, stanza = stanza.name(), "offline, not sent");
            Ok(())
        }
    }

    // ── Inbound ────────────────────────────────────────────────────

    async fn handle_inbound(&mut self, inbound: Result<Stanza, RecvError>) {
        match inbound {
            Ok(stanza) => {
                if let Err(error) = self.route(stanza).await {
                    self.report(error);
                }
            }
            Err(RecvError::Protocol(error)) => {
                warn!(account = %self.account, %error, "dropping malformed stanza");
            }
            Err(RecvError::Connection(error)) => self.connection_lost(error.to_string()).await,
        }
    }

    async fn route(&mut self, stanza: Stanza) -> Result<(), SessionError> {
        let name = stanza.name();
        let id = stanza.id().map(str::to_string);
        let context = RouteContext {
            account: &self.account,
            rooms: self.muc.joined_rooms(),
        };
        let route = match classify(stanza, &context) {
            Ok(route) => route,
            Err(error) => {
                warn!(account = %self.account, stanza = name, ?id, %error, "dropping stanza");
                return Ok(());
            }
        };
        debug!(account = %self.account, stanza = name, ?id, "routing stanza");

        match route {
            Route::Message(message) => {
                let replies = self.messages.handle_message(&message).await?;
                self.send_all(replies).await
            }
            Route::Presence(presence) => self.handle_presence(&presence).await,
            Route::RoomEvent(RoomEvent::Presence { room, presence }) => {
                Ok(self.muc.handle_presence(&room, &presence).await?)
            }
            Route::RoomEvent(RoomEvent::Message { room, message }) => {
                Ok(self.muc.handle_message(&room, &message).await?)
            }
            Route::Iq(iq) => self.handle_iq(iq).await,
        }
    }

    async fn handle_presence(&mut self, presence: &Presence) -> Result<(), SessionError> {
        if presence.type_ == PresenceType::Subscribe {
            match &presence.from {
                Some(from) => self.roster.subscription_requested(&from.to_string()),
                None => warn!(account = %self.account, "subscription request without sender"),
            }
            return Ok(());
        }
        match PresenceUpdate::from_stanza(presence, Utc::now())? {
            Some(update) => {
                self.presence.apply(update).await?;
            }
            None => {
                debug!(account = %self.account, kind = ?presence.type_, "presence ignored");
            }
        }
        Ok(())
    }

    async fn handle_iq(&mut self, route: IqRoute) -> Result<(), SessionError> {
        match route {
            IqRoute::RosterPush { id, query } => {
                let applied = self.roster.apply_push(&query).await;
                self.send(outbound::iq_result(&id, None)).await?;
                applied?;
                Ok(())
            }
            IqRoute::Transfer(iq) => {
                let replies = self.transfers.handle_request(&iq).await?;
                self.send_all(replies).await
            }
            IqRoute::Ping { id, from } => self.send(outbound::iq_result(&id, from)).await,
            IqRoute::Unsupported { id, from } => {
                debug!(account = %self.account, %id, "unsupported request");
                let reply = outbound::iq_error(&id, from.as_ref(), "feature-not-implemented")?;
                self.send(reply).await
            }
            IqRoute::Response(response) => self.handle_response(response).await,
        }
    }

    async fn handle_response(&mut self, response: IqResponse) -> Result<(), SessionError> {
        if let Some(request) = self.pending.remove(&response.id) {
            return match (request, response.result) {
                (Request::RosterFetch { .. }, Ok(Some(query))) => {
                    self.roster.apply_fetch_result(&query).await?;
                    Ok(())
                }
                (Request::RosterFetch { .. }, Ok(None)) => {
                    debug!(account = %self.account, "roster result without items");
                    Ok(())
                }
                (Request::RosterFetch { .. }, Err(condition)) => Err(SessionError::RequestFailed {
                    request: "roster fetch",
                    condition,
                }),
                (Request::RosterSet { jid }, Ok(_)) => {
                    debug!(account = %self.account, %jid, "roster change accepted");
                    Ok(())
                }
                (Request::RosterSet { jid }, Err(condition)) => {
                    warn!(account = %self.account, %jid, %condition, "roster change refused");
                    Err(SessionError::RequestFailed {
                        request: "roster update",
                        condition,
                    })
                }
            };
        }

        if response.id == CARBONS_ENABLE_IQ_ID {
            let enabled = response.result.is_ok();
            self.carbons.on_enable_result(enabled);
            info!(account = %self.account, enabled, "message carbons");
            return Ok(());
        }

        if self.messages.is_archive_query(&response.id) {
            self.messages.finish_history(&response.id, response.result)?;
            return Ok(());
        }

        if self.transfers.owns_response(&response.id) {
            let next = self.transfers.handle_response(&response).await?;
            return self.send_all(next).await;
        }

        warn!(account = %self.account, id = %response.id, "response to unknown request dropped");
        Ok(())
    }

    // ── Deadlines ──────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        let roster = self.pending.values().filter_map(|request| match request {
            Request::RosterFetch { deadline } => Some(*deadline),
            Request::RosterSet { .. } => None,
        });
        roster.chain(self.transfers.next_deadline()).min()
    }

    async fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| {
                matches!(request, Request::RosterFetch { deadline } if *deadline <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.pending.remove(&id);
            warn!(account = %self.account, %id, "roster fetch timed out");
            self.report(SessionError::TimedOut("roster fetch"));
        }

        match self.transfers.expire_negotiations(now).await {
            Ok(expired) => {
                for id in expired {
                    self.report(TransferError::NegotiationTimedOut(id).into());
                }
            }
            Err(error) => self.report(error.into()),
        }
    }

    fn report(&self, error: SessionError) {
        let kind = error.kind();
        warn!(account = %self.account, %kind, %error, "session error");
        self.emitter
            .emit(EventPayload::error(kind, error.to_string()));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
