use crate::ids::{SessionId, UserId};
use crate::session::SessionStatus;

/// Why an inbound message was dropped by the session router.
///
/// None of these are fatal: the message is discarded, shared state is left
/// untouched, and the sender's connection stays open.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("{user} is not allowed to {kind}")]
    Unauthorized { kind: &'static str, user: String },

    #[error("{user} is not the session creator")]
    NotCreator { user: UserId },

    #[error("session is {status}, not waiting")]
    NotWaiting { status: SessionStatus },

    #[error("unknown sender {0}")]
    UnknownSender(UserId),

    #[error("unknown message type: {0}")]
    UnknownKind(String),

    /// The session was retired by the reaper; join a fresh one instead.
    #[error("session {0} has ended")]
    SessionEnded(SessionId),
}

impl RouteError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::Unauthorized { .. } | Self::NotCreator { .. } => "unauthorized",
            Self::NotWaiting { .. } | Self::SessionEnded(_) => "invalid_state",
            Self::UnknownSender(_) => "unknown_sender",
            Self::UnknownKind(_) => "unknown_kind",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = RouteError::Malformed {
            kind: "vote",
            reason: "missing string field `vote`".into(),
        };
        assert_eq!(err.to_string(), "malformed vote payload: missing string field `vote`");

        let err = RouteError::Unauthorized {
            kind: "reveal",
            user: "Bob".into(),
        };
        assert_eq!(err.to_string(), "Bob is not allowed to reveal");

        let err = RouteError::NotWaiting {
            status: SessionStatus::Active,
        };
        assert_eq!(err.to_string(), "session is active, not waiting");
    }

    #[test]
    fn creator_and_moderator_failures_share_a_kind() {
        let a = RouteError::NotCreator {
            user: UserId::from_raw("u"),
        };
        let b = RouteError::Unauthorized {
            kind: "new_round",
            user: "u".into(),
        };
        assert_eq!(a.error_kind(), "unauthorized");
        assert_eq!(b.error_kind(), "unauthorized");
        assert_eq!(RouteError::UnknownKind("x".into()).error_kind(), "unknown_kind");
        assert_eq!(
            RouteError::SessionEnded(SessionId::from_raw("S1")).to_string(),
            "session S1 has ended"
        );
    }
}
