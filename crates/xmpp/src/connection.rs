use std::time::Duration;

use rand::Rng;
use rookery_core::{
    Emitter, ErrorKind, EventPayload,
    config::{AccountConfig, ReconnectConfig},
    event::ConnectionState,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ConnectionError, RecvError},
    stanza::Stanza,
    transport::{ConnectionConfig, Credentials, XmppTransport},
};

/// Retry rules for one account.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl ReconnectPolicy {
    pub fn new(account: &AccountConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            auto_reconnect: account.auto_reconnect,
            max_attempts: account.max_reconnect_attempts,
            base_delay: reconnect.base_delay(),
            max_delay: reconnect.max_delay(),
            jitter: reconnect.jitter,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.auto_reconnect && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        delay + Duration::from_secs_f64(rand::rng().random_range(0.0..=spread))
    }
}

/// What the caller should do after a connect or retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Online,
    RetryIn(Duration),
    GaveUp,
}

/// Session lifecycle for one account. The only component that owns the
/// transport.
///
/// The manager never sleeps: when a retry is due it returns the delay and
/// the caller schedules the next [`retry`](Self::retry).
pub struct ConnectionManager<T>
where
    T: XmppTransport,
{
    config: ConnectionConfig,
    credentials: Credentials,
    resource: String,
    policy: ReconnectPolicy,
    auth_timeout: Duration,
    state: ConnectionState,
    transport: Option<T>,
    bound_jid: Option<String>,
    attempt: u32,
    emitter: Emitter,
}

impl<T> ConnectionManager<T>
where
    T: XmppTransport,
{
    pub fn new(
        account: &AccountConfig,
        policy: ReconnectPolicy,
        auth_timeout: Duration,
        emitter: Emitter,
    ) -> Self {
        Self {
            config: ConnectionConfig::from(account),
            credentials: Credentials::from(account),
            resource: account.resource().to_string(),
            policy,
            auth_timeout,
            state: ConnectionState::Disconnected,
            transport: None,
            bound_jid: None,
            attempt: 0,
            emitter,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Online
    }

    pub fn bound_jid(&self) -> Option<&str> {
        self.bound_jid.as_deref()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start a session from `Disconnected`.
    pub async fn connect(&mut self) -> Result<ReconnectStep, ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.attempt = 0;
        match self.handshake().await {
            Ok(()) => Ok(ReconnectStep::Online),
            Err(error) => Ok(self.handshake_failed(error, 1)),
        }
    }

    /// Run the retry that the last step scheduled.
    pub async fn retry(&mut self) -> ReconnectStep {
        let ConnectionState::Reconnecting { attempt } = self.state else {
            debug!(account = %self.config.jid, state = %self.state, "retry ignored outside reconnecting");
            return if self.is_online() {
                ReconnectStep::Online
            } else {
                ReconnectStep::GaveUp
            };
        };

        self.attempt = attempt;
        match self.handshake().await {
            Ok(()) => ReconnectStep::Online,
            Err(error) => self.handshake_failed(error, attempt.saturating_add(1)),
        }
    }

    /// The transport failed while online. Returns the retry delay, or `None`
    /// when the session stays down.
    pub async fn handle_transport_failure(&mut self, reason: String) -> Option<Duration> {
        if !self.is_online() {
            debug!(account = %self.config.jid, %reason, "transport failure outside online state");
            return None;
        }

        self.drop_transport().await;
        self.bound_jid = None;

        if self.policy.should_retry(1) {
            let delay = self.policy.backoff(1);
            self.attempt = 1;
            self.state = ConnectionState::Reconnecting { attempt: 1 };
            warn!(account = %self.config.jid, %reason, delay_ms = delay.as_millis() as u64, "connection lost, reconnecting");
            self.emitter.emit(EventPayload::ConnectionLost {
                reason,
                will_retry: true,
                delay_ms: Some(delay.as_millis() as u64),
            });
            Some(delay)
        } else {
            self.attempt = 0;
            self.state = ConnectionState::Disconnected;
            warn!(account = %self.config.jid, %reason, "connection lost");
            self.emitter.emit(EventPayload::ConnectionLost {
                reason,
                will_retry: false,
                delay_ms: None,
            });
            None
        }
    }

    /// User-initiated teardown. Always succeeds; a no-op when already down.
    pub async fn disconnect(&mut self, reason: &str) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        self.drop_transport().await;
        self.bound_jid = None;
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
        info!(account = %self.config.jid, reason, "disconnected");
        self.emitter.emit(EventPayload::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub async fn send(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
        if !self.is_online() {
            return Err(ConnectionError::NotConnected);
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        debug!(account = %self.config.jid, stanza = stanza.name(), id = stanza.id(), "sending stanza");
        transport.send(stanza).await
    }

    /// Next inbound stanza. Cancel-safe.
    pub async fn recv(&mut self) -> Result<Stanza, RecvError> {
        match self.transport.as_mut() {
            Some(transport) => transport.recv().await,
            None => Err(ConnectionError::NotConnected.into()),
        }
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Connecting);
        let mut transport = T::connect(&self.config).await?;

        self.transition(ConnectionState::Authenticating);
        let authenticated =
            tokio::time::timeout(self.auth_timeout, transport.authenticate(&self.credentials))
                .await;
        let result = match authenticated {
            Ok(result) => result,
            Err(_) => {
                self.emitter.emit(EventPayload::error(
                    ErrorKind::Connection,
                    "authentication timed out",
                ));
                Err(ConnectionError::Timeout)
            }
        };
        if let Err(error) = result {
            self.abandon(&mut transport).await;
            return Err(error);
        }

        self.transition(ConnectionState::NegotiatingFeatures);
        if let Err(error) = transport.negotiate_features().await {
            self.abandon(&mut transport).await;
            return Err(error);
        }

        let jid = match transport.bind(&self.resource).await {
            Ok(jid) => jid,
            Err(error) => {
                self.abandon(&mut transport).await;
                return Err(error);
            }
        };
        self.transition(ConnectionState::Bound);

        self.transport = Some(transport);
        self.bound_jid = Some(jid.clone());
        self.attempt = 0;
        self.state = ConnectionState::Online;
        info!(account = %self.config.jid, %jid, "session online");
        self.emitter.emit(EventPayload::Connected { jid });
        Ok(())
    }

    fn handshake_failed(&mut self, error: ConnectionError, next_attempt: u32) -> ReconnectStep {
        self.transport = None;
        self.bound_jid = None;

        if !error.is_retryable() {
            warn!(account = %self.config.jid, %error, "handshake rejected");
            self.emitter
                .emit(EventPayload::error(error.kind(), error.to_string()));
            self.go_offline(error.to_string());
            return ReconnectStep::GaveUp;
        }

        if self.policy.should_retry(next_attempt) {
            let delay = self.policy.backoff(next_attempt);
            self.attempt = next_attempt;
            self.state = ConnectionState::Reconnecting {
                attempt: next_attempt,
            };
            warn!(account = %self.config.jid, %error, attempt = next_attempt, delay_ms = delay.as_millis() as u64, "handshake failed, retrying");
            self.emitter.emit(EventPayload::Reconnecting {
                attempt: next_attempt,
                delay_ms: delay.as_millis() as u64,
            });
            return ReconnectStep::RetryIn(delay);
        }

        if self.attempt > 0 {
            let attempts = self.attempt;
            self.attempt = 0;
            self.state = ConnectionState::Disconnected;
            warn!(account = %self.config.jid, %error, attempts, "reconnect attempts exhausted");
            self.emitter
                .emit(EventPayload::ReconnectExhausted { attempts });
        } else {
            self.emitter
                .emit(EventPayload::error(error.kind(), error.to_string()));
            self.go_offline(error.to_string());
        }
        ReconnectStep::GaveUp
    }

    fn go_offline(&mut self, reason: String) {
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
        info!(account = %self.config.jid, %reason, "disconnected");
        self.emitter.emit(EventPayload::Disconnected { reason });
    }

    fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        debug!(account = %self.config.jid, %state, "connection state changed");
        self.emitter
            .emit(EventPayload::ConnectionStateChanged { state });
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            self.abandon(&mut transport).await;
        }
    }

    async fn abandon(&self, transport: &mut T) {
        if let Err(error) = transport.close().await {
            debug!(account = %self.config.jid, %error, "transport close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex, OnceLock},
    };

    use assert_matches::assert_matches;
    use rookery_core::{BroadcastEventBus, EventBus, EventSubscription};
    use tokio::sync::Mutex as AsyncMutex;
    use tracing_test::traced_test;

    use super::*;

    enum AuthOutcome {
        Accept,
        Reject,
        Hang,
    }

    #[derive(Default)]
    struct TestTransportState {
        connect_outcomes: VecDeque<Result<(), ConnectionError>>,
        auth_outcomes: VecDeque<AuthOutcome>,
        connect_calls: u32,
        close_calls: u32,
        close_fails: bool,
        sent: Vec<Stanza>,
    }

    fn transport_state() -> &'static Mutex<TestTransportState> {
        static STATE: OnceLock<Mutex<TestTransportState>> = OnceLock::new();
        STATE.get_or_init(|| Mutex::new(TestTransportState::default()))
    }

    fn test_lock() -> &'static AsyncMutex<()> {
        static LOCK: OnceLock<AsyncMutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| AsyncMutex::new(()))
    }

    fn configure_transport(
        connect: Vec<Result<(), ConnectionError>>,
        auth: Vec<AuthOutcome>,
    ) {
        let mut state = transport_state()
            .lock()
            .expect("failed to lock transport state");
        *state = TestTransportState {
            connect_outcomes: connect.into_iter().collect(),
            auth_outcomes: auth.into_iter().collect(),
            ..TestTransportState::default()
        };
    }

    fn connect_calls() -> u32 {
        transport_state().lock().unwrap().connect_calls
    }

    fn close_calls() -> u32 {
        transport_state().lock().unwrap().close_calls
    }

    struct TestTransport;

    impl XmppTransport for TestTransport {
        async fn connect(_config: &ConnectionConfig) -> Result<Self, ConnectionError> {
            let mut state = transport_state().lock().unwrap();
            state.connect_calls += 1;
            state.connect_outcomes.pop_front().unwrap_or(Ok(()))?;
            Ok(Self)
        }

        async fn authenticate(&mut self, _credentials: &Credentials) -> Result<(), ConnectionError> {
            let outcome = transport_state()
                .lock()
                .unwrap()
                .auth_outcomes
                .pop_front()
                .unwrap_or(AuthOutcome::Accept);
            match outcome {
                AuthOutcome::Accept => Ok(()),
                AuthOutcome::Reject => Err(ConnectionError::AuthenticationFailed(
                    "not-authorized".to_string(),
                )),
                AuthOutcome::Hang => std::future::pending().await,
            }
        }

        async fn negotiate_features(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn bind(&mut self, resource: &str) -> Result<String, ConnectionError> {
            Ok(format!("alice@example.com/{resource}"))
        }

        async fn send(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
            transport_state().lock().unwrap().sent.push(stanza.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Stanza, RecvError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            let mut state = transport_state().lock().unwrap();
            state.close_calls += 1;
            if state.close_fails {
                return Err(ConnectionError::TransportError("broken pipe".into()));
            }
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    fn manager(policy: ReconnectPolicy) -> (ConnectionManager<TestTransport>, EventSubscription) {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(64));
        let subscription = bus.subscribe("**").expect("subscribe");
        let account = AccountConfig::new("alice@example.com", "secret");
        let emitter = Emitter::new("alice@example.com", bus);
        (
            ConnectionManager::new(&account, policy, Duration::from_secs(30), emitter),
            subscription,
        )
    }

    fn drain(subscription: &mut EventSubscription) -> Vec<EventPayload> {
        let mut payloads = Vec::new();
        while let Some(Ok(event)) = subscription.try_recv() {
            payloads.push(event.payload);
        }
        payloads
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(0);
        assert_eq!(policy.base_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.base_backoff(2), Duration::from_secs(2));
        assert_eq!(policy.base_backoff(3), Duration::from_secs(4));
        assert_eq!(policy.base_backoff(6), Duration::from_secs(32));
        assert_eq!(policy.base_backoff(7), Duration::from_secs(60));
        assert_eq!(policy.base_backoff(99), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy {
            jitter: 0.5,
            ..policy(0)
        };
        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn zero_max_attempts_retries_forever_unless_disabled() {
        assert!(policy(0).should_retry(1_000));
        assert!(!policy(3).should_retry(4));
        let disabled = ReconnectPolicy {
            auto_reconnect: false,
            ..policy(0)
        };
        assert!(!disabled.should_retry(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_walks_every_state_once() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![AuthOutcome::Accept]);
        let (mut manager, mut events) = manager(policy(3));

        let step = manager.connect().await.expect("connect");
        assert_eq!(step, ReconnectStep::Online);
        assert_eq!(manager.state(), ConnectionState::Online);
        assert_eq!(manager.bound_jid(), Some("alice@example.com/rookery"));

        let payloads = drain(&mut events);
        let states: Vec<_> = payloads
            .iter()
            .filter_map(|payload| match payload {
                EventPayload::ConnectionStateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::NegotiatingFeatures,
                ConnectionState::Bound,
            ]
        );
        assert_matches!(
            payloads.last(),
            Some(EventPayload::Connected { jid }) if jid == "alice@example.com/rookery"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_twice_is_rejected() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![]);
        let (mut manager, _events) = manager(policy(3));

        manager.connect().await.expect("connect");
        assert_matches!(
            manager.connect().await,
            Err(ConnectionError::AlreadyConnected)
        );
        assert_eq!(connect_calls(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_credentials_are_not_retried() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![AuthOutcome::Reject]);
        let (mut manager, mut events) = manager(policy(10));

        let step = manager.connect().await.expect("connect");
        assert_eq!(step, ReconnectStep::GaveUp);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connect_calls(), 1);
        assert_eq!(close_calls(), 1);

        let payloads = drain(&mut events);
        let tail = &payloads[payloads.len() - 2..];
        assert_matches!(
            &tail[0],
            EventPayload::Error { kind: ErrorKind::Authentication, .. }
        );
        assert_matches!(&tail[1], EventPayload::Disconnected { .. });
    }

    #[tokio::test(flavor = "current_thread")]
    #[traced_test]
    async fn failed_close_after_rejected_credentials_is_logged() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![AuthOutcome::Reject]);
        transport_state().lock().unwrap().close_fails = true;
        let (mut manager, _events) = manager(policy(10));

        let step = manager.connect().await.expect("connect");
        assert_eq!(step, ReconnectStep::GaveUp);
        assert_eq!(close_calls(), 1);
        assert!(logs_contain("transport close failed"));
        assert!(logs_contain("broken pipe"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn authentication_timeout_schedules_retry() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![AuthOutcome::Hang]);
        let (mut manager, mut events) = manager(policy(3));

        let step = manager.connect().await.expect("connect");
        assert_eq!(step, ReconnectStep::RetryIn(Duration::from_secs(1)));
        assert_eq!(
            manager.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );

        let payloads = drain(&mut events);
        assert!(payloads.iter().any(|payload| matches!(
            payload,
            EventPayload::Error { kind: ErrorKind::Connection, detail } if detail == "authentication timed out"
        )));
        assert_matches!(
            payloads.last(),
            Some(EventPayload::Reconnecting { attempt: 1, delay_ms: 1000 })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn three_failed_retries_exhaust_once() {
        let _guard = test_lock().lock().await;
        configure_transport(
            vec![
                Ok(()),
                Err(ConnectionError::TransportError("refused".into())),
                Err(ConnectionError::TransportError("refused".into())),
                Err(ConnectionError::TransportError("refused".into())),
            ],
            vec![],
        );
        let (mut manager, mut events) = manager(policy(3));
        manager.connect().await.expect("connect");
        drain(&mut events);

        let first = manager
            .handle_transport_failure("stream reset".into())
            .await
            .expect("retry scheduled");
        assert_eq!(first, Duration::from_secs(1));

        assert_eq!(
            manager.retry().await,
            ReconnectStep::RetryIn(Duration::from_secs(2))
        );
        assert_eq!(
            manager.retry().await,
            ReconnectStep::RetryIn(Duration::from_secs(4))
        );
        assert_eq!(manager.retry().await, ReconnectStep::GaveUp);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connect_calls(), 4);

        let payloads = drain(&mut events);
        assert_matches!(
            &payloads[0],
            EventPayload::ConnectionLost { will_retry: true, delay_ms: Some(1000), .. }
        );
        let exhausted: Vec<_> = payloads
            .iter()
            .filter(|payload| matches!(payload, EventPayload::ReconnectExhausted { .. }))
            .collect();
        assert_eq!(exhausted.len(), 1);
        assert_matches!(
            exhausted[0],
            EventPayload::ReconnectExhausted { attempts: 3 }
        );
        assert!(
            !payloads
                .iter()
                .any(|payload| matches!(payload, EventPayload::Disconnected { .. }))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn successful_retry_resets_attempts() {
        let _guard = test_lock().lock().await;
        configure_transport(
            vec![
                Ok(()),
                Err(ConnectionError::Timeout),
                Ok(()),
                Err(ConnectionError::Timeout),
            ],
            vec![],
        );
        let (mut manager, _events) = manager(policy(3));
        manager.connect().await.expect("connect");

        manager.handle_transport_failure("reset".into()).await;
        assert_eq!(
            manager.retry().await,
            ReconnectStep::RetryIn(Duration::from_secs(2))
        );
        assert_eq!(manager.retry().await, ReconnectStep::Online);

        let delay = manager.handle_transport_failure("reset again".into()).await;
        assert_eq!(delay, Some(Duration::from_secs(1)));
        assert_eq!(
            manager.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lost_connection_without_auto_reconnect_goes_offline() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![]);
        let (mut manager, mut events) = manager(ReconnectPolicy {
            auto_reconnect: false,
            ..policy(3)
        });
        manager.connect().await.expect("connect");
        drain(&mut events);

        assert_eq!(manager.handle_transport_failure("eof".into()).await, None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_matches!(
            drain(&mut events).as_slice(),
            [EventPayload::ConnectionLost { will_retry: false, delay_ms: None, .. }]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disconnect_emits_once_and_closes_transport() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![]);
        let (mut manager, mut events) = manager(policy(3));

        manager.disconnect("idle").await;
        assert!(drain(&mut events).is_empty());

        manager.connect().await.expect("connect");
        drain(&mut events);
        manager.disconnect("user requested").await;
        manager.disconnect("user requested").await;

        assert_eq!(close_calls(), 1);
        assert_matches!(
            drain(&mut events).as_slice(),
            [EventPayload::Disconnected { reason }] if reason == "user requested"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_requires_online_session() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(())], vec![]);
        let (mut manager, _events) = manager(policy(3));
        let presence: Stanza =
            xmpp_parsers::presence::Presence::new(xmpp_parsers::presence::Type::None).into();

        assert_matches!(
            manager.send(&presence).await,
            Err(ConnectionError::NotConnected)
        );

        manager.connect().await.expect("connect");
        manager.send(&presence).await.expect("send");
        assert_eq!(transport_state().lock().unwrap().sent.len(), 1);
    }
}
