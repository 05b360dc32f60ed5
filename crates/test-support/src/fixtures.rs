//! Stanzas a server would send, as XML strings for
//! [`ScriptedServer::deliver`](crate::ScriptedServer::deliver).

pub fn chat(from: &str, to: &str, id: &str, body: &str) -> String {
    format!(
        "<message xmlns='jabber:client' type='chat' from='{from}' to='{to}' id='{id}'>\
         <body>{body}</body><request xmlns='urn:xmpp:receipts'/><markable xmlns='urn:xmpp:chat-markers:0'/>\
         </message>"
    )
}

pub fn receipt(from: &str, to: &str, id: &str) -> String {
    format!(
        "<message xmlns='jabber:client' from='{from}' to='{to}'>\
         <received xmlns='urn:xmpp:receipts' id='{id}'/></message>"
    )
}

pub fn displayed(from: &str, to: &str, id: &str) -> String {
    format!(
        "<message xmlns='jabber:client' from='{from}' to='{to}'>\
         <displayed xmlns='urn:xmpp:chat-markers:0' id='{id}'/></message>"
    )
}

/// A `sent` carbon of a message another of our resources wrote.
pub fn sent_carbon(account: &str, resource: &str, to: &str, id: &str, body: &str) -> String {
    format!(
        "<message xmlns='jabber:client' from='{account}' to='{account}/rookery'>\
         <sent xmlns='urn:xmpp:carbons:2'><forwarded xmlns='urn:xmpp:forward:0'>\
         <message xmlns='jabber:client' type='chat' from='{account}/{resource}' to='{to}' id='{id}'>\
         <body>{body}</body></message></forwarded></sent></message>"
    )
}

pub fn presence(from: &str, show: Option<&str>, priority: i8) -> String {
    let show = show
        .map(|show| format!("<show>{show}</show>"))
        .unwrap_or_default();
    format!(
        "<presence xmlns='jabber:client' from='{from}'>{show}<priority>{priority}</priority></presence>"
    )
}

pub fn unavailable(from: &str) -> String {
    format!("<presence xmlns='jabber:client' type='unavailable' from='{from}'/>")
}

pub fn subscribe(from: &str) -> String {
    format!("<presence xmlns='jabber:client' type='subscribe' from='{from}'/>")
}

/// `(jid, name, subscription)` triples as roster items.
fn roster_items(items: &[(&str, &str, &str)]) -> String {
    items
        .iter()
        .map(|(jid, name, subscription)| {
            format!("<item jid='{jid}' name='{name}' subscription='{subscription}'/>")
        })
        .collect()
}

pub fn roster_result(id: &str, items: &[(&str, &str, &str)]) -> String {
    format!(
        "<iq xmlns='jabber:client' type='result' id='{id}'>\
         <query xmlns='jabber:iq:roster'>{}</query></iq>",
        roster_items(items)
    )
}

pub fn roster_push(id: &str, items: &[(&str, &str, &str)]) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='{id}'>\
         <query xmlns='jabber:iq:roster'>{}</query></iq>",
        roster_items(items)
    )
}

pub fn iq_result(id: &str) -> String {
    format!("<iq xmlns='jabber:client' type='result' id='{id}'/>")
}

pub fn iq_error(id: &str, from: &str, condition: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='error' id='{id}' from='{from}'>\
         <error type='cancel'><{condition} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
    )
}

pub fn ping(id: &str, from: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='get' id='{id}' from='{from}'><ping xmlns='urn:xmpp:ping'/></iq>"
    )
}

/// One archived message answering the query `query_id`.
pub fn archive_result(query_id: &str, archive_id: &str, stamp: &str, inner: &str) -> String {
    format!(
        "<message xmlns='jabber:client'>\
         <result xmlns='urn:xmpp:mam:2' queryid='{query_id}' id='{archive_id}'>\
         <forwarded xmlns='urn:xmpp:forward:0'><delay xmlns='urn:xmpp:delay' stamp='{stamp}'/>\
         {inner}</forwarded></result></message>"
    )
}

pub fn archive_fin(id: &str, complete: bool) -> String {
    format!(
        "<iq xmlns='jabber:client' type='result' id='{id}'>\
         <fin xmlns='urn:xmpp:mam:2' complete='{complete}'/></iq>"
    )
}

/// Occupant presence from `room/nick`. `extra` goes inside the muc#user
/// element after the item (status codes).
pub fn occupant(room: &str, nick: &str, affiliation: &str, role: &str, extra: &str) -> String {
    format!(
        "<presence xmlns='jabber:client' from='{room}/{nick}'>\
         <x xmlns='http://jabber.org/protocol/muc#user'>\
         <item affiliation='{affiliation}' role='{role}'/>{extra}</x></presence>"
    )
}

/// Our own occupant presence, which completes a join.
pub fn self_occupant(room: &str, nick: &str) -> String {
    occupant(room, nick, "member", "participant", "<status code='110'/>")
}

/// The unavailable half of a nick change by `real_jid`.
pub fn nick_change_leave(room: &str, old: &str, new: &str, real_jid: &str) -> String {
    format!(
        "<presence xmlns='jabber:client' type='unavailable' from='{room}/{old}'>\
         <x xmlns='http://jabber.org/protocol/muc#user'>\
         <item affiliation='member' role='participant' jid='{real_jid}' nick='{new}'/>\
         <status code='303'/></x></presence>"
    )
}

pub fn occupant_with_jid(room: &str, nick: &str, real_jid: &str) -> String {
    format!(
        "<presence xmlns='jabber:client' from='{room}/{nick}'>\
         <x xmlns='http://jabber.org/protocol/muc#user'>\
         <item affiliation='member' role='participant' jid='{real_jid}'/></x></presence>"
    )
}

pub fn groupchat(room: &str, nick: &str, id: &str, body: &str) -> String {
    format!(
        "<message xmlns='jabber:client' type='groupchat' from='{room}/{nick}' id='{id}'>\
         <body>{body}</body></message>"
    )
}

pub fn room_subject(room: &str, nick: &str, subject: &str) -> String {
    format!(
        "<message xmlns='jabber:client' type='groupchat' from='{room}/{nick}'>\
         <subject>{subject}</subject></message>"
    )
}

pub fn file_offer(iq_id: &str, from: &str, sid: &str, name: &str, size: u64) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='{iq_id}' from='{from}'>\
         <si xmlns='http://jabber.org/protocol/si' id='{sid}' mime-type='application/octet-stream' \
         profile='http://jabber.org/protocol/si/profile/file-transfer'>\
         <file xmlns='http://jabber.org/protocol/si/profile/file-transfer' name='{name}' size='{size}'/>\
         <feature xmlns='http://jabber.org/protocol/feature-neg'><x xmlns='jabber:x:data' type='form'>\
         <field var='stream-method' type='list-single'>\
         <option><value>http://jabber.org/protocol/ibb</value></option></field>\
         </x></feature></si></iq>"
    )
}

pub fn ibb_open(iq_id: &str, from: &str, sid: &str, block_size: u32) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='{iq_id}' from='{from}'>\
         <open xmlns='http://jabber.org/protocol/ibb' sid='{sid}' block-size='{block_size}' stanza='iq'/></iq>"
    )
}

/// `data` is already base64.
pub fn ibb_data(iq_id: &str, from: &str, sid: &str, seq: u16, data: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='{iq_id}' from='{from}'>\
         <data xmlns='http://jabber.org/protocol/ibb' sid='{sid}' seq='{seq}'>{data}</data></iq>"
    )
}

pub fn ibb_close(iq_id: &str, from: &str, sid: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='{iq_id}' from='{from}'>\
         <close xmlns='http://jabber.org/protocol/ibb' sid='{sid}'/></iq>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookery_xmpp::{Stanza, stanza::parse_stanza_str};

    #[test]
    fn fixtures_parse_as_stanzas() {
        let fixtures = [
            chat("bob@x.com/pc", "me@x.com", "m1", "hi"),
            receipt("bob@x.com/pc", "me@x.com", "m1"),
            displayed("bob@x.com/pc", "me@x.com", "m1"),
            sent_carbon("me@x.com", "phone", "bob@x.com", "m2", "yo"),
            presence("bob@x.com/pc", Some("away"), 5),
            unavailable("bob@x.com/pc"),
            subscribe("carol@x.com"),
            roster_result("r1", &[("bob@x.com", "Bob", "both")]),
            roster_push("p1", &[("bob@x.com", "Bob", "remove")]),
            iq_result("i1"),
            iq_error("i2", "bob@x.com/pc", "forbidden"),
            ping("g1", "x.com"),
            archive_fin("q1", true),
            self_occupant("dev@conf.x.com", "me"),
            nick_change_leave("dev@conf.x.com", "old", "new", "alice@x.com/laptop"),
            groupchat("dev@conf.x.com", "bob", "g1", "hello"),
            room_subject("dev@conf.x.com", "bob", "topic"),
            file_offer("f1", "bob@x.com/pc", "s1", "a.bin", 3),
            ibb_open("b1", "bob@x.com/pc", "s1", 4096),
            ibb_data("b2", "bob@x.com/pc", "s1", 0, "aGk="),
            ibb_close("b3", "bob@x.com/pc", "s1"),
        ];
        for xml in fixtures {
            assert!(parse_stanza_str(&xml).is_ok(), "does not parse: {xml}");
        }
        let archived = archive_result(
            "q1",
            "a1",
            "2024-01-01T00:00:00Z",
            "<message xmlns='jabber:client' from='bob@x.com/pc' to='me@x.com' id='old' type='chat'><body>old</body></message>",
        );
        assert!(matches!(parse_stanza_str(&archived), Ok(Stanza::Message(_))));
    }
}
