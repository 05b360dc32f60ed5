use std::str::FromStr;

use base64::{Engine, prelude::BASE64_STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use rookery_core::event::Availability;
use xmpp_parsers::{
    iq::Iq,
    jid::{BareJid, Jid},
    message::{Id as MessageId, Lang, Message, MessageType as XmppMessageType},
    minidom::{Element, rxml::NcName},
    muc::Muc,
    presence::{Presence, Show, Type as PresenceType},
    roster,
};

use crate::{error::OutboundError, stanza::Stanza, stanza::escape_xml};

pub const NS_RECEIPTS: &str = "urn:xmpp:receipts";
pub const NS_MARKERS: &str = "urn:xmpp:chat-markers:0";
pub const NS_MAM: &str = "urn:xmpp:mam:2";
pub const NS_SI_FILE: &str = "http://jabber.org/protocol/si/profile/file-transfer";
pub const NS_FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
const NS_DATA_FORMS: &str = "jabber:x:data";

pub fn parse_jid(value: &str) -> Result<Jid, OutboundError> {
    value
        .parse()
        .map_err(|_| OutboundError::InvalidJid(value.to_string()))
}

fn parse_bare(value: &str) -> Result<BareJid, OutboundError> {
    value
        .parse()
        .map_err(|_| OutboundError::InvalidJid(value.to_string()))
}

fn iq_from_xml(xml: &str) -> Result<Stanza, OutboundError> {
    let element =
        Element::from_str(xml).map_err(|error| OutboundError::Build(error.to_string()))?;
    Iq::try_from(element)
        .map(Stanza::from)
        .map_err(|error| OutboundError::Build(error.to_string()))
}

/// Chat message that asks for a delivery receipt and is markable.
pub fn chat_message(id: &str, to: &str, body: &str) -> Result<Stanza, OutboundError> {
    let mut message = Message::new_with_type(XmppMessageType::Chat, Some(parse_jid(to)?));
    message.id = Some(MessageId(id.to_string()));
    message.bodies.insert(Lang::new(), body.to_string());
    message
        .payloads
        .push(Element::builder("request", NS_RECEIPTS).build());
    message
        .payloads
        .push(Element::builder("markable", NS_MARKERS).build());
    Ok(message.into())
}

pub fn groupchat_message(id: &str, room: &str, body: &str) -> Result<Stanza, OutboundError> {
    let mut message = Message::new_with_type(XmppMessageType::Groupchat, Some(parse_jid(room)?));
    message.id = Some(MessageId(id.to_string()));
    message.bodies.insert(Lang::new(), body.to_string());
    Ok(message.into())
}

/// `<name xmlns=ns id=id/>`, the shape of receipts and markers.
fn id_element(name: &str, ns: &str, id: &str) -> Result<Element, OutboundError> {
    let attr = NcName::try_from("id").map_err(|error| OutboundError::Build(error.to_string()))?;
    Ok(Element::builder(name, ns).attr(attr, id).build())
}

/// `<received/>` acknowledging the message `id` from `to`.
pub fn receipt(to: &str, id: &str) -> Result<Stanza, OutboundError> {
    let mut message = Message::new_with_type(XmppMessageType::Chat, Some(parse_jid(to)?));
    message
        .payloads
        .push(id_element("received", NS_RECEIPTS, id)?);
    Ok(message.into())
}

pub fn displayed_marker(to: &str, id: &str) -> Result<Stanza, OutboundError> {
    let mut message = Message::new_with_type(XmppMessageType::Chat, Some(parse_jid(to)?));
    message
        .payloads
        .push(id_element("displayed", NS_MARKERS, id)?);
    Ok(message.into())
}

pub fn presence(availability: Availability, status: Option<&str>, priority: i8) -> Stanza {
    let mut presence = Presence::new(PresenceType::None);
    if availability != Availability::Unavailable {
        presence = presence.with_priority(priority);
    }
    match availability {
        Availability::Unavailable => presence.type_ = PresenceType::Unavailable,
        Availability::Available => {}
        Availability::Chat => presence.show = Some(Show::Chat),
        Availability::Away => presence.show = Some(Show::Away),
        Availability::Xa => presence.show = Some(Show::Xa),
        Availability::Dnd => presence.show = Some(Show::Dnd),
    }
    if let Some(text) = status {
        presence.statuses.insert(Lang::new(), text.to_string());
    }
    presence.into()
}

pub fn roster_get(id: &str) -> Stanza {
    let query = roster::Roster {
        ver: None,
        items: vec![],
    };
    Iq::from_get(id.to_string(), query).into()
}

pub fn roster_set(
    id: &str,
    jid: &str,
    name: Option<&str>,
    groups: &[String],
) -> Result<Stanza, OutboundError> {
    let item = roster::Item {
        jid: parse_bare(jid)?,
        name: name.map(String::from),
        subscription: roster::Subscription::None,
        ask: roster::Ask::None,
        groups: groups.iter().map(|g| roster::Group(g.clone())).collect(),
    };
    let query = roster::Roster {
        ver: None,
        items: vec![item],
    };
    Ok(Iq::from_set(id.to_string(), query).into())
}

pub fn roster_remove(id: &str, jid: &str) -> Result<Stanza, OutboundError> {
    let item = roster::Item {
        jid: parse_bare(jid)?,
        name: None,
        subscription: roster::Subscription::Remove,
        ask: roster::Ask::None,
        groups: vec![],
    };
    let query = roster::Roster {
        ver: None,
        items: vec![item],
    };
    Ok(Iq::from_set(id.to_string(), query).into())
}

pub fn subscription_request(jid: &str) -> Result<Stanza, OutboundError> {
    let mut presence = Presence::new(PresenceType::Subscribe);
    presence.to = Some(parse_jid(jid)?);
    Ok(presence.into())
}

pub fn subscription_response(jid: &str, accept: bool) -> Result<Stanza, OutboundError> {
    let mut presence = Presence::new(if accept {
        PresenceType::Subscribed
    } else {
        PresenceType::Unsubscribed
    });
    presence.to = Some(parse_jid(jid)?);
    Ok(presence.into())
}

pub fn muc_join(room: &str, nick: &str) -> Result<Stanza, OutboundError> {
    let mut presence = Presence::new(PresenceType::None);
    presence.to = Some(parse_jid(&format!("{room}/{nick}"))?);
    presence.payloads.push(Muc::new().into());
    Ok(presence.into())
}

pub fn muc_leave(room: &str, nick: &str) -> Result<Stanza, OutboundError> {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.to = Some(parse_jid(&format!("{room}/{nick}"))?);
    Ok(presence.into())
}

pub fn iq_result(id: &str, to: Option<Jid>) -> Stanza {
    Iq::Result {
        from: None,
        to,
        id: id.to_string(),
        payload: None,
    }
    .into()
}

pub fn iq_result_with(id: &str, to: Option<Jid>, payload: Element) -> Stanza {
    Iq::Result {
        from: None,
        to,
        id: id.to_string(),
        payload: Some(payload),
    }
    .into()
}

/// Error reply with a `cancel` defined condition such as
/// `feature-not-implemented` or `forbidden`.
pub fn iq_error(id: &str, to: Option<&Jid>, condition: &str) -> Result<Stanza, OutboundError> {
    let to = to
        .map(|jid| format!(" to='{}'", escape_xml(&jid.to_string())))
        .unwrap_or_default();
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='error' id='{id}'{to}>\
         <error type='cancel'><{condition} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
         </iq>",
        id = escape_xml(id),
        condition = escape_xml(condition),
    ))
}

/// Archive query for messages after `start`, optionally with one peer.
pub fn mam_query(
    id: &str,
    query_id: &str,
    with: Option<&str>,
    start: Option<DateTime<Utc>>,
) -> Result<Stanza, OutboundError> {
    let mut fields = format!(
        "<field var='FORM_TYPE' type='hidden'><value>{NS_MAM}</value></field>"
    );
    if let Some(with) = with {
        parse_bare(with)?;
        fields.push_str(&format!(
            "<field var='with'><value>{}</value></field>",
            escape_xml(with)
        ));
    }
    if let Some(start) = start {
        fields.push_str(&format!(
            "<field var='start'><value>{}</value></field>",
            start.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='set' id='{id}'>\
         <query xmlns='{NS_MAM}' queryid='{query_id}'>\
         <x xmlns='{NS_DATA_FORMS}' type='submit'>{fields}</x>\
         </query></iq>",
        id = escape_xml(id),
        query_id = escape_xml(query_id),
    ))
}

/// Stream-initiation file offer proposing in-band bytestreams.
pub fn si_offer(
    id: &str,
    to: &str,
    sid: &str,
    filename: &str,
    size: u64,
    mime_type: &str,
) -> Result<Stanza, OutboundError> {
    parse_jid(to)?;
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='set' id='{id}' to='{to}'>\
         <si xmlns='{NS_SI}' id='{sid}' mime-type='{mime}' profile='{NS_SI_FILE}'>\
         <file xmlns='{NS_SI_FILE}' name='{name}' size='{size}'/>\
         <feature xmlns='{NS_FEATURE_NEG}'><x xmlns='{NS_DATA_FORMS}' type='form'>\
         <field var='stream-method' type='list-single'><option><value>{NS_IBB}</value></option></field>\
         </x></feature></si></iq>",
        id = escape_xml(id),
        to = escape_xml(to),
        sid = escape_xml(sid),
        mime = escape_xml(mime_type),
        name = escape_xml(filename),
        NS_SI = crate::router::NS_SI,
        NS_IBB = crate::router::NS_IBB,
    ))
}

/// Accept an offer by selecting in-band bytestreams.
pub fn si_accept(id: &str, to: &str) -> Result<Stanza, OutboundError> {
    let to = parse_jid(to)?;
    let payload = Element::from_str(&format!(
        "<si xmlns='{NS_SI}'><feature xmlns='{NS_FEATURE_NEG}'>\
         <x xmlns='{NS_DATA_FORMS}' type='submit'>\
         <field var='stream-method'><value>{NS_IBB}</value></field>\
         </x></feature></si>",
        NS_SI = crate::router::NS_SI,
        NS_IBB = crate::router::NS_IBB,
    ))
    .map_err(|error| OutboundError::Build(error.to_string()))?;
    Ok(iq_result_with(id, Some(to), payload))
}

pub fn ibb_open(id: &str, to: &str, sid: &str, block_size: u32) -> Result<Stanza, OutboundError> {
    parse_jid(to)?;
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='set' id='{id}' to='{to}'>\
         <open xmlns='{NS_IBB}' sid='{sid}' block-size='{block_size}' stanza='iq'/></iq>",
        id = escape_xml(id),
        to = escape_xml(to),
        sid = escape_xml(sid),
        NS_IBB = crate::router::NS_IBB,
    ))
}

pub fn ibb_data(id: &str, to: &str, sid: &str, seq: u16, chunk: &[u8]) -> Result<Stanza, OutboundError> {
    parse_jid(to)?;
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='set' id='{id}' to='{to}'>\
         <data xmlns='{NS_IBB}' sid='{sid}' seq='{seq}'>{data}</data></iq>",
        id = escape_xml(id),
        to = escape_xml(to),
        sid = escape_xml(sid),
        data = BASE64_STANDARD.encode(chunk),
        NS_IBB = crate::router::NS_IBB,
    ))
}

pub fn ibb_close(id: &str, to: &str, sid: &str) -> Result<Stanza, OutboundError> {
    parse_jid(to)?;
    iq_from_xml(&format!(
        "<iq xmlns='jabber:client' type='set' id='{id}' to='{to}'>\
         <close xmlns='{NS_IBB}' sid='{sid}'/></iq>",
        id = escape_xml(id),
        to = escape_xml(to),
        sid = escape_xml(sid),
        NS_IBB = crate::router::NS_IBB,
    ))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn iq_payload(stanza: &Stanza) -> Element {
        let Stanza::Iq(iq) = stanza else {
            panic!("expected iq stanza");
        };
        match iq.as_ref() {
            Iq::Get { payload, .. } | Iq::Set { payload, .. } => payload.clone(),
            Iq::Result {
                payload: Some(payload),
                ..
            } => payload.clone(),
            other => panic!("unexpected iq {other:?}"),
        }
    }

    #[test]
    fn chat_message_requests_receipt_and_is_markable() {
        let stanza = chat_message("msg_1", "bob@example.com", "Hello!").unwrap();
        let Stanza::Message(message) = &stanza else {
            panic!("expected message stanza");
        };
        assert_eq!(message.type_, XmppMessageType::Chat);
        assert_eq!(message.id.as_ref().map(|id| id.0.as_str()), Some("msg_1"));
        assert_eq!(message.bodies.get("").map(String::as_str), Some("Hello!"));
        assert!(message.payloads.iter().any(|p| p.is("request", NS_RECEIPTS)));
        assert!(message.payloads.iter().any(|p| p.is("markable", NS_MARKERS)));
    }

    #[test]
    fn receipts_and_markers_carry_the_acknowledged_id() {
        for (stanza, name, ns) in [
            (receipt("bob@example.com/pc", "msg_7").unwrap(), "received", NS_RECEIPTS),
            (displayed_marker("bob@example.com", "msg_7").unwrap(), "displayed", NS_MARKERS),
        ] {
            let Stanza::Message(message) = &stanza else {
                panic!("expected message stanza");
            };
            let ack = message
                .payloads
                .iter()
                .find(|payload| payload.is(name, ns))
                .unwrap_or_else(|| panic!("missing <{name}/>"));
            assert_eq!(ack.attr("id"), Some("msg_7"));
            assert!(message.bodies.is_empty());
        }
    }

    #[test]
    fn rejects_invalid_jid() {
        assert_matches!(
            chat_message("m", "not a jid!!!@", "body"),
            Err(OutboundError::InvalidJid(_))
        );
        assert_matches!(
            roster_set("r", "@@", None, &[]),
            Err(OutboundError::InvalidJid(_))
        );
    }

    #[test]
    fn presence_maps_availability() {
        let Stanza::Presence(away) = presence(Availability::Away, Some("brb"), 5) else {
            panic!("expected presence");
        };
        assert_eq!(away.show, Some(Show::Away));
        assert_eq!(away.statuses.get("").map(String::as_str), Some("brb"));
        assert_eq!(priority_text(&away).as_deref(), Some("5"));

        let Stanza::Presence(gone) = presence(Availability::Unavailable, None, 5) else {
            panic!("expected presence");
        };
        assert_eq!(gone.type_, PresenceType::Unavailable);
        assert_matches!(priority_text(&gone).as_deref(), None | Some("0"));
    }

    fn priority_text(presence: &Presence) -> Option<String> {
        Element::from(presence)
            .children()
            .find(|child| child.name() == "priority")
            .map(Element::text)
    }

    #[test]
    fn roster_requests_carry_caller_ids() {
        let get = roster_get("iq_get");
        assert_eq!(get.id(), Some("iq_get"));
        assert!(iq_payload(&get).is("query", crate::router::NS_ROSTER));

        let add = roster_set("iq_add", "bob@example.com", Some("Bob"), &["Friends".into()]).unwrap();
        let roster = roster::Roster::try_from(iq_payload(&add)).unwrap();
        assert_eq!(roster.items[0].name.as_deref(), Some("Bob"));
        let groups: Vec<_> = roster.items[0].groups.iter().map(|g| g.0.as_str()).collect();
        assert_eq!(groups, vec!["Friends"]);

        let remove = roster_remove("iq_rm", "bob@example.com").unwrap();
        let roster = roster::Roster::try_from(iq_payload(&remove)).unwrap();
        assert_eq!(roster.items[0].subscription, roster::Subscription::Remove);
    }

    #[test]
    fn muc_join_targets_room_nick_with_muc_payload() {
        let Stanza::Presence(join) = muc_join("dev@conference.example.com", "alice").unwrap() else {
            panic!("expected presence");
        };
        assert_eq!(
            join.to.as_ref().map(ToString::to_string).as_deref(),
            Some("dev@conference.example.com/alice")
        );
        assert!(
            join.payloads
                .iter()
                .any(|p| p.is("x", "http://jabber.org/protocol/muc"))
        );
    }

    #[test]
    fn feature_not_implemented_reply() {
        let to: Jid = "bob@example.com/pc".parse().unwrap();
        let stanza = iq_error("v1", Some(&to), "feature-not-implemented").unwrap();
        let Stanza::Iq(iq) = stanza else {
            panic!("expected iq");
        };
        assert_matches!(*iq, Iq::Error { ref id, .. } if id == "v1");
    }

    #[test]
    fn mam_query_includes_filters() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let stanza = mam_query("iq_1", "q1", Some("bob@example.com"), Some(start)).unwrap();
        let payload = iq_payload(&stanza);
        assert!(payload.is("query", NS_MAM));
        assert_eq!(payload.attr("queryid"), Some("q1"));

        let mut xml = Vec::new();
        payload.write_to(&mut xml).unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains("bob@example.com"));
        assert!(xml.contains("2024-05-01T10:00:00.000Z"));
    }

    #[test]
    fn file_offer_describes_file() {
        let stanza = si_offer(
            "iq_si",
            "bob@example.com/pc",
            "sid1",
            "report & notes.pdf",
            1024,
            "application/pdf",
        )
        .unwrap();
        let si = iq_payload(&stanza);
        assert!(si.is("si", crate::router::NS_SI));
        assert_eq!(si.attr("id"), Some("sid1"));
        let file = si.get_child("file", NS_SI_FILE).unwrap();
        assert_eq!(file.attr("name"), Some("report & notes.pdf"));
        assert_eq!(file.attr("size"), Some("1024"));
    }

    #[test]
    fn ibb_data_is_base64() {
        let stanza = ibb_data("iq_d", "bob@example.com/pc", "sid1", 3, b"hello").unwrap();
        let data = iq_payload(&stanza);
        assert_eq!(data.attr("seq"), Some("3"));
        assert_eq!(data.text(), "aGVsbG8=");
    }

    #[test]
    fn si_accept_selects_ibb() {
        let stanza = si_accept("iq_offer", "bob@example.com/pc").unwrap();
        let si = iq_payload(&stanza);
        let mut xml = Vec::new();
        si.write_to(&mut xml).unwrap();
        assert!(String::from_utf8(xml).unwrap().contains(crate::router::NS_IBB));
    }
}
