use rookery_core::config::AccountConfig;

use crate::{
    error::{ConnectionError, RecvError},
    stanza::Stanza,
};

/// Where and how to open the stream for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub jid: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub use_tls: bool,
    pub accept_invalid_certs: bool,
}

impl From<&AccountConfig> for ConnectionConfig {
    fn from(account: &AccountConfig) -> Self {
        Self {
            jid: account.bare_jid(),
            server: account.server.clone(),
            port: account.port,
            use_tls: account.use_tls,
            accept_invalid_certs: account.accept_invalid_certs,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub jid: String,
    pub password: String,
}

impl Credentials {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
        }
    }
}

impl From<&AccountConfig> for Credentials {
    fn from(account: &AccountConfig) -> Self {
        Self::new(account.bare_jid(), account.password.clone())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("jid", &self.jid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The socket, TLS and XML framing layer the session drives.
///
/// Implementations deliver and accept whole parsed stanzas. Connection-level
/// faults come back as `RecvError::Connection`, a stanza that would not parse
/// as `RecvError::Protocol`. `recv` must be cancel-safe: the session polls it
/// inside `select!` and drops the future whenever a command arrives first.
pub trait XmppTransport: Send + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn authenticate(
        &mut self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn negotiate_features(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Bind `resource` and return the full jid the server assigned.
    fn bind(
        &mut self,
        resource: &str,
    ) -> impl Future<Output = Result<String, ConnectionError>> + Send;

    fn send(&mut self, stanza: &Stanza) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Stanza, RecvError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_config_uses_bare_jid() {
        let mut account = AccountConfig::new("alice@example.com/laptop", "secret");
        account.server = Some("xmpp.example.com".into());
        account.port = Some(5223);
        account.accept_invalid_certs = true;

        let config = ConnectionConfig::from(&account);
        assert_eq!(config.jid, "alice@example.com");
        assert_eq!(config.server.as_deref(), Some("xmpp.example.com"));
        assert_eq!(config.port, Some(5223));
        assert!(config.use_tls);
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn credentials_never_print_password() {
        let credentials = Credentials::new("alice@example.com", "hunter2");
        let printed = format!("{credentials:?}");
        assert!(printed.contains("alice@example.com"));
        assert!(!printed.contains("hunter2"));
    }
}
