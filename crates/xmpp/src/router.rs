use std::collections::HashSet;

use rookery_core::jid::bare_jid;
use xmpp_parsers::{
    iq::Iq,
    jid::Jid,
    message::{Message, MessageType},
    minidom::Element,
    presence::Presence,
    stanza_error::StanzaError,
};

use crate::{error::ProtocolError, stanza::Stanza};

pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_PING: &str = "urn:xmpp:ping";
pub const NS_SI: &str = "http://jabber.org/protocol/si";
pub const NS_IBB: &str = "http://jabber.org/protocol/ibb";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// What the router needs to know about the session.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    /// Bare jid of the account.
    pub account: &'a str,
    /// Rooms joined or being joined.
    pub rooms: &'a HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(IqRoute),
    RoomEvent(RoomEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Presence {
        room: String,
        presence: Box<Presence>,
    },
    Message {
        room: String,
        message: Box<Message>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IqRoute {
    /// The `<query/>` of a roster push from a trusted sender.
    RosterPush { id: String, query: Element },
    /// Stream initiation or in-band bytestream request.
    Transfer(Box<Iq>),
    Ping { id: String, from: Option<Jid> },
    Response(IqResponse),
    /// A get or set nobody handles; answered with feature-not-implemented.
    Unsupported { id: String, from: Option<Jid> },
}

/// The reply to one of our own requests.
#[derive(Debug, Clone, PartialEq)]
pub struct IqResponse {
    pub id: String,
    pub from: Option<Jid>,
    pub result: Result<Option<Element>, String>,
}

/// Decide which handler owns `stanza`. Never touches state.
pub fn classify(stanza: Stanza, context: &RouteContext<'_>) -> Result<Route, ProtocolError> {
    match stanza {
        Stanza::Message(message) => classify_message(message, context),
        Stanza::Presence(presence) => Ok(classify_presence(presence, context)),
        Stanza::Iq(iq) => classify_iq(*iq, context).map(Route::Iq),
    }
}

fn classify_message(
    message: Box<Message>,
    context: &RouteContext<'_>,
) -> Result<Route, ProtocolError> {
    if message.type_ != MessageType::Groupchat {
        return Ok(Route::Message(message));
    }

    let room = message
        .from
        .as_ref()
        .map(|from| bare_jid(&from.to_string()))
        .ok_or_else(|| ProtocolError::Unexpected("groupchat message without sender".into()))?;
    if !context.rooms.contains(&room) {
        return Err(ProtocolError::Unexpected(format!(
            "groupchat message from unjoined room {room}"
        )));
    }
    Ok(Route::RoomEvent(RoomEvent::Message { room, message }))
}

fn classify_presence(presence: Box<Presence>, context: &RouteContext<'_>) -> Route {
    let room = presence
        .from
        .as_ref()
        .map(|from| bare_jid(&from.to_string()))
        .filter(|room| context.rooms.contains(room));
    match room {
        Some(room) => Route::RoomEvent(RoomEvent::Presence { room, presence }),
        None => Route::Presence(presence),
    }
}

fn classify_iq(iq: Iq, context: &RouteContext<'_>) -> Result<IqRoute, ProtocolError> {
    match iq {
        Iq::Set {
            ref from,
            ref id,
            ref payload,
            ..
        } if payload.is("query", NS_ROSTER) => {
            if !trusted_roster_source(from.as_ref(), context.account) {
                return Err(ProtocolError::Unexpected(format!(
                    "roster push from untrusted sender {}",
                    from.as_ref().map(ToString::to_string).unwrap_or_default()
                )));
            }
            Ok(IqRoute::RosterPush {
                id: id.clone(),
                query: payload.clone(),
            })
        }
        Iq::Get {
            ref from,
            ref id,
            ref payload,
            ..
        } if payload.is("ping", NS_PING) => Ok(IqRoute::Ping {
            id: id.clone(),
            from: from.clone(),
        }),
        Iq::Set { ref payload, .. } if is_transfer_payload(payload) => {
            Ok(IqRoute::Transfer(Box::new(iq)))
        }
        Iq::Get { from, id, .. } | Iq::Set { from, id, .. } => {
            Ok(IqRoute::Unsupported { id, from })
        }
        Iq::Result {
            from, id, payload, ..
        } => Ok(IqRoute::Response(IqResponse {
            id,
            from,
            result: Ok(payload),
        })),
        Iq::Error {
            from, id, error, ..
        } => Ok(IqRoute::Response(IqResponse {
            id,
            from,
            result: Err(error_condition(&error)),
        })),
    }
}

fn is_transfer_payload(payload: &Element) -> bool {
    payload.is("si", NS_SI) || payload.ns() == NS_IBB
}

/// Roster pushes come from the server itself or from our own bare jid.
fn trusted_roster_source(from: Option<&Jid>, account: &str) -> bool {
    let Some(from) = from else {
        return true;
    };
    let from = from.to_string();
    let domain = account.split_once('@').map(|(_, domain)| domain);
    from == account || Some(from.as_str()) == domain
}

/// The defined condition of a stanza error, e.g. `not-acceptable`.
pub fn error_condition(error: &StanzaError) -> String {
    let element: Element = error.clone().into();
    element
        .children()
        .find(|child| child.ns() == NS_STANZAS && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}
