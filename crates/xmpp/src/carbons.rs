use std::str::FromStr;

use rookery_core::jid::same_bare;
use xmpp_parsers::{message::Message, minidom::Element};

use crate::{error::ProtocolError, stanza::Stanza};

pub const NS_CARBONS: &str = "urn:xmpp:carbons:2";
pub const NS_FORWARD: &str = "urn:xmpp:forward:0";
pub const CARBONS_ENABLE_IQ_ID: &str = "carbons-enable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CarbonsState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
}

/// Tracks whether the server copies our traffic to this resource.
#[derive(Debug, Default)]
pub struct CarbonsManager {
    state: CarbonsState,
}

impl CarbonsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CarbonsState {
        self.state
    }

    /// The enable request, or `None` when already enabled or in flight.
    pub fn enable(&mut self) -> Result<Option<Stanza>, ProtocolError> {
        if self.state != CarbonsState::Disabled {
            return Ok(None);
        }
        let element = Element::from_str(&format!(
            "<iq xmlns='jabber:client' type='set' id='{CARBONS_ENABLE_IQ_ID}'>\
             <enable xmlns='{NS_CARBONS}'/></iq>"
        ))
        .map_err(|error| ProtocolError::SerializeFailed(error.to_string()))?;
        let stanza = Stanza::try_from(element)?;
        self.state = CarbonsState::Enabling;
        Ok(Some(stanza))
    }

    pub fn on_enable_result(&mut self, success: bool) {
        if self.state != CarbonsState::Enabling {
            return;
        }
        self.state = if success {
            CarbonsState::Enabled
        } else {
            CarbonsState::Disabled
        };
    }

    /// Every new stream starts without carbons.
    pub fn reset(&mut self) {
        self.state = CarbonsState::Disabled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    /// Someone wrote to another of our resources.
    Received,
    /// Another of our resources sent this.
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Carbon {
    pub direction: CarbonDirection,
    pub message: Message,
}

/// Extract the forwarded message from a carbon copy.
///
/// `Ok(None)` means `message` is not a carbon. A carbon whose outer sender is
/// anything other than `account` is a spoofing attempt and rejected.
pub fn unwrap_carbon(message: &Message, account: &str) -> Result<Option<Carbon>, ProtocolError> {
    let Some((direction, wrapper)) = message.payloads.iter().find_map(|payload| {
        if payload.ns() != NS_CARBONS {
            return None;
        }
        match payload.name() {
            "received" => Some((CarbonDirection::Received, payload)),
            "sent" => Some((CarbonDirection::Sent, payload)),
            _ => None,
        }
    }) else {
        return Ok(None);
    };

    let sender = message
        .from
        .as_ref()
        .map(|from| from.to_string())
        .unwrap_or_default();
    if !is_own_jid(&sender, account) {
        return Err(ProtocolError::Unexpected(format!(
            "carbon copy from foreign sender {sender:?}"
        )));
    }

    let inner = wrapper
        .get_child("forwarded", NS_FORWARD)
        .and_then(|forwarded| forwarded.children().find(|child| child.name() == "message"))
        .ok_or_else(|| ProtocolError::ParseFailed("carbon without forwarded message".into()))?;
    let message = Message::try_from(inner.clone())
        .map_err(|error| ProtocolError::ParseFailed(format!("invalid forwarded message: {error}")))?;

    Ok(Some(Carbon { direction, message }))
}

/// True when `from` is the bare or full jid of `account`.
pub fn is_own_jid(from: &str, account: &str) -> bool {
    same_bare(from, account)
}
