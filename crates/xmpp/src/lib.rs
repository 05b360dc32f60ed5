pub mod carbons;
pub mod connection;
pub mod error;
pub mod outbound;
pub mod router;
pub mod stanza;
pub mod transport;

pub use carbons::{Carbon, CarbonDirection, CarbonsManager, CarbonsState, unwrap_carbon};
pub use connection::{ConnectionManager, ReconnectPolicy, ReconnectStep};
pub use error::{ConnectionError, OutboundError, ProtocolError, RecvError};
pub use router::{IqResponse, IqRoute, RoomEvent, Route, RouteContext, classify};
pub use stanza::Stanza;
pub use transport::{ConnectionConfig, Credentials, XmppTransport};
