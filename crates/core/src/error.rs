use serde::{Deserialize, Serialize};

/// The failure classes surfaced to the presentation layer in `Error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Bad credentials. Never retried automatically.
    Authentication,
    /// Transport-level failure. Feeds the reconnect policy.
    Connection,
    /// Malformed or unexpected stanza. The stanza is dropped.
    Protocol,
    /// Persistence failed after its local retry.
    Storage,
    /// Terminates a single file transfer.
    Transfer,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Storage => "storage",
            ErrorKind::Transfer => "transfer",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),

    #[error("Session is no longer accepting commands")]
    SessionClosed,
}
