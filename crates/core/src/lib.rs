pub mod bus;
pub mod command;
pub mod config;
pub mod emit;
pub mod error;
pub mod event;
pub mod jid;
pub mod logging;

pub use bus::{BroadcastEventBus, EventBus, EventSubscription};
pub use command::{Command, CommandEnvelope, CommandReceiver, CommandSender, command_channel};
pub use emit::Emitter;
pub use error::{ErrorKind, EventBusError};
pub use event::{Channel, Event, EventPayload};
