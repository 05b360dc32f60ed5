use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::event::{Event, EventPayload};

/// Publishes events on behalf of one account session.
///
/// Clones share the correlation slot, so every component of a session tags
/// its events with the command currently being handled.
#[derive(Clone)]
pub struct Emitter {
    account: Arc<str>,
    bus: Arc<dyn EventBus>,
    correlation: Arc<Mutex<Option<Uuid>>>,
}

impl Emitter {
    pub fn new(account: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            account: Arc::from(account.into()),
            bus,
            correlation: Arc::new(Mutex::new(None)),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn set_correlation(&self, id: Option<Uuid>) {
        let mut slot = self
            .correlation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = id;
    }

    pub fn correlation(&self) -> Option<Uuid> {
        *self
            .correlation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn emit(&self, payload: EventPayload) {
        let event = match self.correlation() {
            Some(id) => Event::with_correlation(self.account.as_ref(), payload, id),
            None => Event::new(self.account.as_ref(), payload),
        };
        if let Err(error) = self.bus.publish(event) {
            warn!(account = %self.account, %error, "failed to publish event");
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("account", &self.account)
            .field("correlation", &self.correlation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BroadcastEventBus;
    use crate::event::ConnectionState;

    #[tokio::test]
    async fn events_carry_account_and_correlation() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut sub = bus.subscribe("connection.**").unwrap();
        let emitter = Emitter::new("alice@example.com", bus.clone());

        emitter.emit(EventPayload::ConnectionStateChanged {
            state: ConnectionState::Connecting,
        });
        let command = Uuid::new_v4();
        emitter.clone().set_correlation(Some(command));
        emitter.emit(EventPayload::Connected {
            jid: "alice@example.com/rookery".into(),
        });

        let first = sub.recv().await.unwrap();
        assert_eq!(first.account, "alice@example.com");
        assert_eq!(first.correlation_id, None);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.channel.as_str(), "connection.online");
        assert_eq!(second.correlation_id, Some(command));
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let bus = Arc::new(BroadcastEventBus::default());
        let emitter = Emitter::new("alice@example.com", bus);
        emitter.emit(EventPayload::Disconnected {
            reason: "bye".into(),
        });
    }
}
