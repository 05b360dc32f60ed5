use chrono::{DateTime, Utc};
use xmpp_parsers::{message::Message, minidom::Element};

use rookery_xmpp::{ProtocolError, carbons::NS_FORWARD, outbound::NS_MAM};

const NS_DELAY: &str = "urn:xmpp:delay";

/// One archived message from a `<result/>` wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    pub query_id: String,
    /// Archive id of the result, used when the message itself has none.
    pub archive_id: Option<String>,
    pub message: Message,
    /// Origin time from the forwarded `<delay/>`.
    pub stamp: DateTime<Utc>,
}

/// An archive query in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchiveQuery {
    pub query_id: String,
    pub stored: u64,
}

/// Unwrap an archive result. `Ok(None)` when `message` is not one.
///
/// Results come from our own archive, so any sender other than the server
/// (no `from`) or the account's bare jid is rejected.
pub fn parse_archive_result(
    message: &Message,
    account: &str,
) -> Result<Option<ArchivedMessage>, ProtocolError> {
    let Some(result) = message
        .payloads
        .iter()
        .find(|payload| payload.is("result", NS_MAM))
    else {
        return Ok(None);
    };

    if let Some(from) = message.from.as_ref().map(ToString::to_string) {
        if from != account {
            return Err(ProtocolError::Unexpected(format!(
                "archive result from foreign sender {from:?}"
            )));
        }
    }

    let query_id = result.attr("queryid").unwrap_or_default().to_string();
    let forwarded = result
        .get_child("forwarded", NS_FORWARD)
        .ok_or_else(|| ProtocolError::ParseFailed("archive result without forwarded".into()))?;
    let stamp = delay_stamp(forwarded.children())
        .ok_or_else(|| ProtocolError::ParseFailed("archive result without delay stamp".into()))?;
    let inner = forwarded
        .children()
        .find(|child| child.name() == "message")
        .ok_or_else(|| ProtocolError::ParseFailed("archive result without message".into()))?;
    let message = Message::try_from(inner.clone())
        .map_err(|error| ProtocolError::ParseFailed(format!("invalid archived message: {error}")))?;

    Ok(Some(ArchivedMessage {
        query_id,
        archive_id: result.attr("id").map(String::from),
        message,
        stamp,
    }))
}

/// The `<delay stamp/>` among `elements`, if any.
pub(crate) fn delay_stamp<'a>(mut elements: impl Iterator<Item = &'a Element>) -> Option<DateTime<Utc>> {
    elements
        .find(|element| element.is("delay", NS_DELAY))
        .and_then(|delay| delay.attr("stamp"))
        .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
}

/// `complete` flag of the `<fin/>` closing a query. A missing `<fin/>`
/// counts as incomplete.
pub fn fin_complete(payload: Option<&Element>) -> bool {
    payload
        .filter(|fin| fin.is("fin", NS_MAM))
        .and_then(|fin| fin.attr("complete"))
        .is_some_and(|complete| complete == "true" || complete == "1")
}
