use rookery_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session is not online")]
    NotConnected,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_)
                | ConnectionError::AlreadyConnected
                | ConnectionError::NotConnected
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::AuthenticationFailed(_) => ErrorKind::Authentication,
            _ => ErrorKind::Connection,
        }
    }
}

/// A malformed or unexpected stanza. The stanza is dropped; the session
/// carries on.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),

    #[error("unexpected stanza: {0}")]
    Unexpected(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// What the transport reports from `recv`: connection faults feed the
/// reconnect policy, protocol faults only drop the offending unit.
#[derive(Debug, Clone, Error)]
pub enum RecvError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Error)]
pub enum OutboundError {
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("failed to build stanza: {0}")]
    Build(String),
}

impl OutboundError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_are_never_retried() {
        assert!(!ConnectionError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::TransportError("reset".into()).is_retryable());
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            ConnectionError::AuthenticationFailed("x".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(ConnectionError::Timeout.kind(), ErrorKind::Connection);
        assert_eq!(
            RecvError::from(ProtocolError::ParseFailed("x".into())).to_string(),
            "stanza parse failed: x"
        );
    }
}
