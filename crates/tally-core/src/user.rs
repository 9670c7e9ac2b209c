use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::outbound::{Frame, Outbound};

/// Placeholder shown in place of a cast vote until votes are revealed.
pub const HIDDEN_VOTE: &str = "?";

/// A participant's vote for the current round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Vote {
    #[default]
    Unset,
    Cast(String),
}

impl Vote {
    /// The vote as other participants may see it.
    ///
    /// Unset is always `None`. A cast vote is passed through only once the
    /// round has been revealed; before that it is masked.
    pub fn visible(&self, revealed: bool) -> Option<String> {
        match self {
            Self::Unset => None,
            Self::Cast(token) if revealed => Some(token.clone()),
            Self::Cast(_) => Some(HIDDEN_VOTE.to_string()),
        }
    }
}

/// Public, transport-free view of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub vote: Option<String>,
    pub is_online: bool,
    pub is_moderator: bool,
}

/// A participant as the owning session holds it.
pub(crate) struct User {
    pub(crate) id: UserId,
    pub(crate) name: String,
    pub(crate) vote: Vote,
    pub(crate) is_online: bool,
    pub(crate) is_moderator: bool,
    outbound: Option<Box<dyn Outbound>>,
}

impl User {
    pub(crate) fn new(
        id: UserId,
        name: String,
        is_moderator: bool,
        outbound: Option<Box<dyn Outbound>>,
    ) -> Self {
        Self {
            id,
            name,
            vote: Vote::Unset,
            is_online: true,
            is_moderator,
            outbound,
        }
    }

    pub(crate) fn view(&self, revealed: bool) -> UserView {
        UserView {
            id: self.id.clone(),
            name: self.name.clone(),
            vote: self.vote.visible(revealed),
            is_online: self.is_online,
            is_moderator: self.is_moderator,
        }
    }

    /// Hand a frame to this participant's connection.
    ///
    /// A failed hand-off marks the participant offline and drops the outbound
    /// handle. With the queue's last sender gone the connection's writer
    /// drains what is left and closes the socket, so the client sees a
    /// disconnect and can rejoin with fresh state. Users that never had an
    /// outbound path (detached) are treated as delivered.
    pub(crate) fn send(&mut self, frame: &Frame) -> bool {
        if !self.is_online {
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return true;
        };
        match outbound.deliver(Frame::clone(frame)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id = %self.id, name = %self.name, error = %e, "send failed, disconnecting user");
                self.is_online = false;
                self.outbound = None;
                false
            }
        }
    }
}
