use globset::{Glob, GlobMatcher};
use tokio::sync::broadcast;

use crate::error::EventBusError;
use crate::event::{Channel, Event};

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

/// Event bus backed by a single broadcast channel.
///
/// Every subscriber observes events in publish order; filtering by channel
/// pattern happens on the receiving side.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        if !Channel::is_valid(event.channel.as_str()) {
            return Err(EventBusError::InvalidChannel(event.channel.to_string()));
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();
        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }
        if !has_glob_meta(first_segment) && !Channel::DOMAINS.contains(&first_segment) {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        Ok(EventSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }
}

#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Wait for the next event whose channel matches this subscription.
    ///
    /// A lagging subscriber gets `Lagged(n)` once and resumes with the oldest
    /// event still buffered.
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing
    /// matching is buffered.
    pub fn try_recv(&mut self) -> Option<std::result::Result<Event, EventBusError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => {
                    return Some(Ok(event));
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Some(Err(EventBusError::ChannelClosed));
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(Err(EventBusError::Lagged(count)));
                }
            }
        }
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}
