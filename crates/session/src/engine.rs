use std::sync::Arc;

use tracing::{info, warn};

use rookery_core::{Command, EventBus, EventBusError, config::Config};
use rookery_storage::Database;
use rookery_xmpp::XmppTransport;

use crate::session::{Session, SessionHandle, SessionSettings};

/// One session per configured account, all sharing one store and one bus.
pub struct Engine {
    sessions: Vec<SessionHandle>,
}

impl Engine {
    pub fn start<T, D>(config: &Config, db: Arc<D>, bus: Arc<dyn EventBus>) -> Self
    where
        T: XmppTransport + Sync,
        D: Database,
    {
        let settings = SessionSettings::from(config);
        let sessions: Vec<SessionHandle> = config
            .accounts
            .iter()
            .map(|account| {
                Session::<T, D>::spawn(account.clone(), &settings, db.clone(), bus.clone())
            })
            .collect();
        info!(accounts = sessions.len(), "engine started");
        Self { sessions }
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(SessionHandle::account)
    }

    /// The session of `account` (bare jid).
    pub fn session(&self, account: &str) -> Option<&SessionHandle> {
        let account = rookery_core::jid::bare_jid(account);
        self.sessions
            .iter()
            .find(|session| session.account() == account)
    }

    pub async fn connect_all(&self) -> Result<(), EventBusError> {
        for session in &self.sessions {
            session.send(Command::Connect).await?;
        }
        Ok(())
    }

    /// Disconnect every account and wait for the sessions to stop.
    pub async fn shutdown(self) {
        for session in &self.sessions {
            if let Err(error) = session.send(Command::Disconnect).await {
                warn!(account = session.account(), %error, "session already gone");
            }
        }
        for session in self.sessions {
            let account = session.account().to_string();
            if let Err(error) = session.join().await {
                warn!(%account, %error, "session task failed");
            }
        }
        info!("engine stopped");
    }
}
