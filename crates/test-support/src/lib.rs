pub mod fixtures;
pub mod transport;

pub use transport::{SENT_TIMEOUT, ScriptedServer, ScriptedTransport};
