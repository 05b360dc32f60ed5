use std::str::FromStr;

use xmpp_parsers::{iq::Iq, message::Message, minidom::Element, presence::Presence};

use crate::error::ProtocolError;

/// One parsed protocol unit as delivered by, or handed to, the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// The `id` attribute, when present.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(message) => message.id.as_ref().map(|id| id.0.as_str()),
            Stanza::Presence(presence) => presence.id.as_deref(),
            Stanza::Iq(iq) => Some(iq.id()),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(Box::new(message))
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(Box::new(presence))
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(Box::new(iq))
    }
}

impl TryFrom<Element> for Stanza {
    type Error = ProtocolError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        parse_stanza_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        match value {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        value.to_element()
    }
}

pub fn parse_stanza_str(xml: &str) -> Result<Stanza, ProtocolError> {
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::ParseFailed(
            "stanza payload is empty".to_string(),
        ));
    }

    let element = Element::from_str(trimmed).map_err(|error| {
        ProtocolError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })?;
    parse_stanza_element(element)
}

fn parse_stanza_element(element: Element) -> Result<Stanza, ProtocolError> {
    match element.name() {
        "message" => Message::try_from(element)
            .map(Stanza::from)
            .map_err(|error| {
                ProtocolError::ParseFailed(format!("failed to parse <message/> stanza: {error}"))
            }),
        "presence" => Presence::try_from(element)
            .map(Stanza::from)
            .map_err(|error| {
                ProtocolError::ParseFailed(format!("failed to parse <presence/> stanza: {error}"))
            }),
        "iq" => Iq::try_from(element).map(Stanza::from).map_err(|error| {
            ProtocolError::ParseFailed(format!("failed to parse <iq/> stanza: {error}"))
        }),
        other => Err(ProtocolError::ParseFailed(format!(
            "unsupported stanza element <{other}/>"
        ))),
    }
}

/// Escape a value for use inside a single-quoted XML attribute or text node.
pub fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use xmpp_parsers::{message::MessageType, presence::Show};

    use super::*;

    const MESSAGE_XML: &str = "<message xmlns='jabber:client' type='chat' id='m1' from='alice@example.com' to='bob@example.com'><body>hello</body></message>";
    const PRESENCE_XML: &str =
        "<presence xmlns='jabber:client'><show>away</show><status>out</status></presence>";
    const IQ_XML: &str =
        "<iq xmlns='jabber:client' type='get' id='ping-1'><ping xmlns='urn:xmpp:ping'/></iq>";

    #[test]
    fn parses_message_stanza() {
        let stanza = parse_stanza_str(MESSAGE_XML).expect("message stanza should parse");
        assert_eq!(stanza.id(), Some("m1"));
        let Stanza::Message(message) = stanza else {
            panic!("expected message stanza");
        };

        assert_eq!(message.type_, MessageType::Chat);
        assert_eq!(message.bodies.get("").map(String::as_str), Some("hello"));
    }

    #[test]
    fn parses_presence_stanza() {
        let stanza = parse_stanza_str(PRESENCE_XML).expect("presence stanza should parse");
        let Stanza::Presence(presence) = stanza else {
            panic!("expected presence stanza");
        };

        assert_eq!(presence.show, Some(Show::Away));
        assert_eq!(presence.statuses.get("").map(String::as_str), Some("out"));
    }

    #[test]
    fn parses_iq_stanza() {
        let stanza = parse_stanza_str(IQ_XML).expect("iq stanza should parse");
        assert_eq!(stanza.name(), "iq");
        assert_eq!(stanza.id(), Some("ping-1"));
    }

    #[test]
    fn parse_rejects_unknown_root_element() {
        let error = parse_stanza_str("<foo xmlns='jabber:client'/>").expect_err("must fail");
        assert!(matches!(error, ProtocolError::ParseFailed(_)));
        assert!(
            error
                .to_string()
                .contains("unsupported stanza element <foo/>")
        );
    }

    #[test]
    fn parse_rejects_empty_input() {
        let error = parse_stanza_str("   ").expect_err("must fail");
        assert!(error.to_string().contains("empty"));
    }

    #[test]
    fn escapes_attribute_values() {
        assert_eq!(escape_xml("a'b<c>&\"d"), "a&apos;b&lt;c&gt;&amp;&quot;d");
        assert_eq!(escape_xml("plain"), "plain");
    }
}
