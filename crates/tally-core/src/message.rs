//! Wire envelope shared by inbound commands and outbound events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RouteError;
use crate::ids::{SessionId, UserId};
use crate::outbound::Frame;
use crate::session::SessionState;
use crate::user::UserView;

/// `{ "type": ..., "data": ..., "userId": ... }`
///
/// `type` is kept as a raw string so an unrecognized kind is reported by the
/// router rather than failing the parse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data: Some(data),
            user_id: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Extract a required string field from `data`.
    pub(crate) fn require_str(&self, kind: MessageKind, key: &str) -> Result<String, RouteError> {
        let data = self.data.as_ref().ok_or_else(|| RouteError::Malformed {
            kind: kind.as_str(),
            reason: "missing payload".into(),
        })?;
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RouteError::Malformed {
                kind: kind.as_str(),
                reason: format!("missing string field `{key}`"),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Inbound
    Vote,
    Reveal,
    NewRound,
    SetStory,
    StartSession,
    // Outbound only
    UserJoined,
    UserLeft,
    SessionState,
    WaitingRoom,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vote => "vote",
            Self::Reveal => "reveal",
            Self::NewRound => "new_round",
            Self::SetStory => "set_story",
            Self::StartSession => "start_session",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::SessionState => "session_state",
            Self::WaitingRoom => "waiting_room",
        }
    }

    /// Parse a kind a client is allowed to send.
    pub fn inbound(s: &str) -> Option<Self> {
        match s {
            "vote" => Some(Self::Vote),
            "reveal" => Some(Self::Reveal),
            "new_round" => Some(Self::NewRound),
            "set_story" => Some(Self::SetStory),
            "start_session" => Some(Self::StartSession),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events pushed from a session to its participants.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined(UserView),
    UserLeft {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    SessionState(SessionState),
    WaitingRoom {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        message: String,
    },
    StartSession {
        message: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::UserJoined(_) => MessageKind::UserJoined,
            Self::UserLeft { .. } => MessageKind::UserLeft,
            Self::SessionState(_) => MessageKind::SessionState,
            Self::WaitingRoom { .. } => MessageKind::WaitingRoom,
            Self::StartSession { .. } => MessageKind::StartSession,
        }
    }

    /// Serialize once for fan-out. A serialization failure never aborts a
    /// broadcast: recipients get the same `type` with an empty `data` object.
    pub fn encode(&self) -> Frame {
        match serde_json::to_string(self) {
            Ok(json) => Frame::from(json),
            Err(e) => {
                tracing::error!(kind = %self.kind(), error = %e, "failed to serialize event, sending empty payload");
                fallback_frame(self.kind())
            }
        }
    }
}

fn fallback_frame(kind: MessageKind) -> Frame {
    Frame::from(serde_json::json!({ "type": kind.as_str(), "data": {} }).to_string())
}
