use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use rookery_core::jid::bare_jid;
use rookery_xmpp::{
    ConnectionConfig, ConnectionError, Credentials, RecvError, Stanza, XmppTransport,
    stanza::parse_stanza_str,
};

/// How long `next_sent` waits before failing the test.
pub const SENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Script {
    connect_outcomes: VecDeque<Result<(), ConnectionError>>,
    auth_outcomes: VecDeque<Result<(), ConnectionError>>,
    connects: u32,
    closes: u32,
    inbound: Option<mpsc::UnboundedSender<Result<Stanza, RecvError>>>,
}

struct Shared {
    script: Mutex<Script>,
    sent: mpsc::UnboundedSender<Stanza>,
}

impl Shared {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Shared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Shared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lookup(jid: &str) -> Option<Arc<Shared>> {
    registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&bare_jid(jid))
        .cloned()
}

/// The server side of a scripted account.
///
/// Registering a server makes every [`ScriptedTransport`] connecting as that
/// bare jid talk to it. Tests running in parallel use distinct jids.
pub struct ScriptedServer {
    jid: String,
    shared: Arc<Shared>,
    sent: AsyncMutex<mpsc::UnboundedReceiver<Stanza>>,
}

impl ScriptedServer {
    pub fn register(jid: &str) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            script: Mutex::new(Script::default()),
            sent: sent_tx,
        });
        registry()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(bare_jid(jid), shared.clone());
        Self {
            jid: bare_jid(jid),
            shared,
            sent: AsyncMutex::new(sent_rx),
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// Outcome of the next connect attempt. Unscripted attempts succeed.
    pub fn script_connect(&self, outcome: Result<(), ConnectionError>) {
        self.shared.script().connect_outcomes.push_back(outcome);
    }

    /// Outcome of the next authentication. Unscripted attempts succeed.
    pub fn script_auth(&self, outcome: Result<(), ConnectionError>) {
        self.shared.script().auth_outcomes.push_back(outcome);
    }

    pub fn connects(&self) -> u32 {
        self.shared.script().connects
    }

    pub fn closes(&self) -> u32 {
        self.shared.script().closes
    }

    pub fn is_connected(&self) -> bool {
        self.shared.script().inbound.is_some()
    }

    /// Deliver `xml` to the connected transport.
    pub fn deliver(&self, xml: &str) {
        let stanza = parse_stanza_str(xml)
            .unwrap_or_else(|error| panic!("fixture does not parse: {error}\n{xml}"));
        self.push(Ok(stanza));
    }

    /// Deliver bytes the transport could not parse.
    pub fn deliver_garbage(&self, detail: &str) {
        self.push(Err(rookery_xmpp::ProtocolError::ParseFailed(detail.to_string()).into()));
    }

    /// Break the stream as a network failure would.
    pub fn drop_connection(&self, reason: &str) {
        self.push(Err(
            ConnectionError::TransportError(reason.to_string()).into()
        ));
        self.shared.script().inbound = None;
    }

    fn push(&self, item: Result<Stanza, RecvError>) {
        let script = self.shared.script();
        let inbound = script
            .inbound
            .as_ref()
            .unwrap_or_else(|| panic!("{} is not connected", self.jid));
        if inbound.send(item).is_err() {
            panic!("{} transport is gone", self.jid);
        }
    }

    /// The next stanza the client sent. Panics after [`SENT_TIMEOUT`].
    pub async fn next_sent(&self) -> Stanza {
        let mut sent = self.sent.lock().await;
        match tokio::time::timeout(SENT_TIMEOUT, sent.recv()).await {
            Ok(Some(stanza)) => stanza,
            Ok(None) => panic!("{} sent channel closed", self.jid),
            Err(_) => panic!("{} sent nothing within {SENT_TIMEOUT:?}", self.jid),
        }
    }

    /// Skip sent stanzas until one matches `predicate`.
    pub async fn sent_matching(&self, predicate: impl Fn(&Stanza) -> bool) -> Stanza {
        loop {
            let stanza = self.next_sent().await;
            if predicate(&stanza) {
                return stanza;
            }
            debug!(jid = %self.jid, stanza = stanza.name(), id = stanza.id(), "skipping sent stanza");
        }
    }

    /// The next sent iq whose payload is `<name xmlns=ns/>`.
    pub async fn sent_iq(&self, name: &str, ns: &str) -> Stanza {
        self.sent_matching(|stanza| {
            stanza.name() == "iq"
                && stanza
                    .to_element()
                    .children()
                    .any(|child| child.is(name, ns))
        })
        .await
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        registry()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.jid);
    }
}

/// In-memory transport driven by a [`ScriptedServer`].
pub struct ScriptedTransport {
    jid: String,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Result<Stanza, RecvError>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("jid", &self.jid)
            .finish_non_exhaustive()
    }
}

impl XmppTransport for ScriptedTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let shared = lookup(&config.jid).ok_or_else(|| {
            ConnectionError::DnsResolutionFailed(format!("no scripted server for {}", config.jid))
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut script = shared.script();
            script.connects += 1;
            script.connect_outcomes.pop_front().unwrap_or(Ok(()))?;
            script.inbound = Some(tx);
        }
        Ok(Self {
            jid: config.jid.clone(),
            shared,
            inbound: rx,
        })
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> Result<(), ConnectionError> {
        self.shared
            .script()
            .auth_outcomes
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn negotiate_features(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn bind(&mut self, resource: &str) -> Result<String, ConnectionError> {
        Ok(format!("{}/{resource}", self.jid))
    }

    async fn send(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
        self.shared
            .sent
            .send(stanza.clone())
            .map_err(|_| ConnectionError::TransportError("scripted server dropped".into()))
    }

    async fn recv(&mut self) -> Result<Stanza, RecvError> {
        match self.inbound.recv().await {
            Some(item) => item,
            None => Err(ConnectionError::TransportError("stream closed".into()).into()),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let mut script = self.shared.script();
        script.closes += 1;
        script.inbound = None;
        Ok(())
    }
}
