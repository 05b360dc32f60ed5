//! String-level helpers for XMPP addresses.
//!
//! Stored rows and event payloads carry addresses as plain strings; parsing
//! into typed JIDs happens at the protocol edge in `rookery-xmpp`.

use uuid::Uuid;

/// Strip the resource from a full address (`user@domain/res` -> `user@domain`).
pub fn bare_jid(jid: &str) -> String {
    match jid.find('/') {
        Some(pos) => jid[..pos].to_string(),
        None => jid.to_string(),
    }
}

/// The resource of a full address, or an empty string for a bare one.
pub fn resource_part(jid: &str) -> String {
    match jid.find('/') {
        Some(pos) => jid[pos + 1..].to_string(),
        None => String::new(),
    }
}

/// The local part of an address (`user@domain` -> `user`), if present.
pub fn local_part(jid: &str) -> Option<&str> {
    let bare = jid.split('/').next().unwrap_or(jid);
    bare.split_once('@').map(|(local, _)| local)
}

pub fn same_bare(a: &str, b: &str) -> bool {
    bare_jid(a).eq_ignore_ascii_case(&bare_jid(b))
}

/// Client-chosen id for an outbound message stanza.
pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4())
}

/// Client-chosen id for an outbound iq request.
pub fn new_iq_id() -> String {
    format!("iq_{}", Uuid::new_v4())
}
