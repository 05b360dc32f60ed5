use rookery_core::ErrorKind;
use rookery_messaging::MessagingError;
use rookery_muc::MucError;
use rookery_presence::PresenceError;
use rookery_roster::RosterError;
use rookery_storage::StorageError;
use rookery_transfer::TransferError;
use rookery_xmpp::{ConnectionError, OutboundError, ProtocolError};

/// Everything that can go wrong inside a session. The actor turns each one
/// into an `Error{kind, detail}` event.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Muc(#[from] MucError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{request} failed: {condition}")]
    RequestFailed {
        request: &'static str,
        condition: String,
    },

    #[error("{0} timed out")]
    TimedOut(&'static str),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(error) => error.kind(),
            SessionError::Protocol(error) => error.kind(),
            SessionError::Outbound(error) => error.kind(),
            SessionError::Storage(_) => ErrorKind::Storage,
            SessionError::Presence(PresenceError::Storage(_)) => ErrorKind::Storage,
            SessionError::Presence(PresenceError::MissingSender | PresenceError::InvalidPriority(_)) => {
                ErrorKind::Protocol
            }
            SessionError::Roster(RosterError::Storage(_)) => ErrorKind::Storage,
            SessionError::Roster(RosterError::Outbound(error)) => error.kind(),
            SessionError::Roster(RosterError::Malformed(_)) => ErrorKind::Protocol,
            SessionError::Messaging(MessagingError::Storage(_)) => ErrorKind::Storage,
            SessionError::Messaging(MessagingError::Outbound(error)) => error.kind(),
            SessionError::Messaging(_) => ErrorKind::Protocol,
            SessionError::Muc(MucError::Storage(_)) => ErrorKind::Storage,
            SessionError::Muc(MucError::Outbound(error)) => error.kind(),
            SessionError::Muc(_) => ErrorKind::Protocol,
            SessionError::Transfer(TransferError::Storage(_)) => ErrorKind::Storage,
            SessionError::Transfer(_) => ErrorKind::Transfer,
            SessionError::RequestFailed { .. } => ErrorKind::Protocol,
            SessionError::TimedOut(_) => ErrorKind::Connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_user_facing_kinds() {
        assert_eq!(
            SessionError::from(ConnectionError::AuthenticationFailed("bad".into())).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            SessionError::from(MessagingError::Storage(StorageError::NotFound)).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            SessionError::from(TransferError::UnknownTransfer("ft_1".into())).kind(),
            ErrorKind::Transfer
        );
        assert_eq!(
            SessionError::from(TransferError::Storage(StorageError::NotFound)).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            SessionError::from(MucError::UnknownRoom("dev@conf.x.com".into())).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(SessionError::TimedOut("roster fetch").kind(), ErrorKind::Connection);
    }
}
