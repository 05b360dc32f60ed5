//! Account sessions: one actor per account that owns the connection and
//! feeds inbound stanzas through the roster, presence, message, room and
//! transfer components, plus the engine that runs several of them.

pub mod engine;
pub mod error;
pub mod session;

pub use engine::Engine;
pub use error::SessionError;
pub use session::{Session, SessionHandle, SessionSettings};
