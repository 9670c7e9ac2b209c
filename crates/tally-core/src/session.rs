//! One voting room: membership, round state, routing and fan-out.
//!
//! Every field lives behind a single `RwLock`. Mutating operations hold the
//! write lock for their whole duration, including the broadcast they trigger,
//! so no participant ever sees a snapshot taken between two halves of a
//! transition. Fan-out goes through [`Outbound::deliver`](crate::Outbound),
//! which never blocks, so the lock is never held hostage by a slow client.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::errors::RouteError;
use crate::ids::{SessionId, UserId};
use crate::message::{Envelope, MessageKind, ServerEvent};
use crate::outbound::Outbound;
use crate::user::{User, UserView, Vote};

pub const WAITING_ROOM_NOTICE: &str = "Waiting for the session creator to start the session...";
pub const SESSION_STARTED_NOTICE: &str = "Session has been started by the moderator!";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Waiting,
    Active,
    /// Set only when the registry retires an idle session.
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sanitized snapshot sent as `session_state.data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: SessionId,
    pub users: BTreeMap<UserId, UserView>,
    pub current_story: String,
    pub votes_revealed: bool,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    users: HashMap<UserId, User>,
    current_story: String,
    votes_revealed: bool,
    creator_id: Option<UserId>,
    moderator_id: Option<UserId>,
    status: SessionStatus,
    last_activity: Instant,
}

impl SessionInner {
    /// A creator claim is honoured when nobody holds the role, or when the
    /// recorded creator has left (a reconnect).
    fn accepts_creator(&self) -> bool {
        match &self.creator_id {
            None => true,
            Some(id) => !self.users.contains_key(id),
        }
    }

    fn start_new_round(&mut self) {
        self.votes_revealed = false;
        for user in self.users.values_mut() {
            user.vote = Vote::Unset;
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn broadcast(&mut self, event: &ServerEvent) {
        let frame = event.encode();
        let mut delivered = 0usize;
        for (user_id, user) in &mut self.users {
            if !user.is_online {
                trace!(user_id = %user_id, name = %user.name, "skipping offline user");
                continue;
            }
            if user.send(&frame) {
                delivered += 1;
            }
        }
        debug!(kind = %event.kind(), delivered, "broadcast event");
    }

    fn send_to(&mut self, user_id: &UserId, event: &ServerEvent) {
        if let Some(user) = self.users.get_mut(user_id) {
            let _ = user.send(&event.encode());
        }
    }
}

fn moderator_only(kind: MessageKind, name: &str, is_moderator: bool) -> Result<(), RouteError> {
    if is_moderator {
        Ok(())
    } else {
        Err(RouteError::Unauthorized {
            kind: kind.as_str(),
            user: name.to_string(),
        })
    }
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            inner: RwLock::new(SessionInner {
                users: HashMap::new(),
                current_story: String::new(),
                votes_revealed: false,
                creator_id: None,
                moderator_id: None,
                status: SessionStatus::Waiting,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.read().status
    }

    pub fn user_count(&self) -> usize {
        self.inner.read().users.len()
    }

    pub fn online_count(&self) -> usize {
        self.inner.read().users.values().filter(|u| u.is_online).count()
    }

    pub fn creator_id(&self) -> Option<UserId> {
        self.inner.read().creator_id.clone()
    }

    pub fn moderator_id(&self) -> Option<UserId> {
        self.inner.read().moderator_id.clone()
    }

    /// Sanitized view of a single participant.
    pub fn user(&self, user_id: &UserId) -> Option<UserView> {
        let inner = self.inner.read();
        inner.users.get(user_id).map(|u| u.view(inner.votes_revealed))
    }

    /// Sanitized snapshot of the whole session.
    pub fn state(&self) -> SessionState {
        let inner = self.inner.read();
        self.snapshot(&inner)
    }

    /// Enroll a participant.
    ///
    /// Everyone online (the newcomer included) is told `user_joined`. A
    /// non-creator joining a session that has not started also gets a private
    /// `waiting_room` notice. The newcomer then receives a private
    /// `session_state` so it knows who is already here.
    ///
    /// Fails only once the session has been retired by the registry.
    pub fn add_user(
        &self,
        name: impl Into<String>,
        outbound: Option<Box<dyn Outbound>>,
        is_creator: bool,
    ) -> Result<UserView, RouteError> {
        let mut inner = self.inner.write();
        if inner.status == SessionStatus::Ended {
            return Err(RouteError::SessionEnded(self.id.clone()));
        }
        let user_id = UserId::new();
        let name = name.into();

        let becomes_creator = is_creator && inner.accepts_creator();
        if is_creator && !becomes_creator {
            info!(
                session_id = %self.id,
                name = %name,
                "creator already present, joining as participant"
            );
        }

        let user = User::new(user_id.clone(), name, becomes_creator, outbound);
        let view = user.view(inner.votes_revealed);
        let _ = inner.users.insert(user_id.clone(), user);
        if becomes_creator {
            inner.creator_id = Some(user_id.clone());
            inner.moderator_id = Some(user_id.clone());
        }
        inner.touch();

        inner.broadcast(&ServerEvent::UserJoined(view.clone()));

        if inner.status == SessionStatus::Waiting && !becomes_creator {
            inner.send_to(
                &user_id,
                &ServerEvent::WaitingRoom {
                    session_id: self.id.clone(),
                    message: WAITING_ROOM_NOTICE.to_string(),
                },
            );
        }

        let state = self.snapshot(&inner);
        inner.send_to(&user_id, &ServerEvent::SessionState(state));

        info!(
            session_id = %self.id,
            user_id = %user_id,
            name = %view.name,
            creator = becomes_creator,
            "user joined"
        );
        Ok(view)
    }

    /// Drop a participant and tell everyone else. Returns `false` (and sends
    /// nothing) if the id is not a member.
    pub fn remove_user(&self, user_id: &UserId) -> bool {
        let mut inner = self.inner.write();
        let Some(mut user) = inner.users.remove(user_id) else {
            return false;
        };
        user.is_online = false;
        inner.touch();

        inner.broadcast(&ServerEvent::UserLeft {
            user_id: user_id.clone(),
        });
        info!(session_id = %self.id, user_id = %user_id, name = %user.name, "user left");
        true
    }

    /// Hand the creator and moderator roles to a present participant. The
    /// previous moderator loses the flag.
    pub fn set_creator(&self, user_id: &UserId) -> bool {
        let mut inner = self.inner.write();
        if !inner.users.contains_key(user_id) {
            return false;
        }
        for user in inner.users.values_mut() {
            user.is_moderator = &user.id == user_id;
        }
        inner.creator_id = Some(user_id.clone());
        inner.moderator_id = Some(user_id.clone());
        inner.touch();

        info!(session_id = %self.id, user_id = %user_id, "creator reassigned");
        self.broadcast_state(&mut inner);
        true
    }

    /// Move the session from `waiting` to `active` on behalf of `user_id`.
    pub fn start(&self, user_id: &UserId) -> Result<(), RouteError> {
        let mut inner = self.inner.write();
        if !inner.users.contains_key(user_id) {
            return Err(RouteError::UnknownSender(user_id.clone()));
        }
        self.start_locked(&mut inner, user_id)
    }

    /// Validate and apply one inbound message from `user_id`.
    ///
    /// On success the new state has been broadcast to every online
    /// participant. On error nothing changed and nothing was sent.
    pub fn handle_message(&self, user_id: &UserId, envelope: &Envelope) -> Result<(), RouteError> {
        let mut inner = self.inner.write();

        let (name, is_moderator) = match inner.users.get(user_id) {
            Some(user) => (user.name.clone(), user.is_moderator),
            None => return Err(RouteError::UnknownSender(user_id.clone())),
        };
        let kind = MessageKind::inbound(&envelope.kind)
            .ok_or_else(|| RouteError::UnknownKind(envelope.kind.clone()))?;

        match kind {
            MessageKind::Vote => {
                let token = envelope.require_str(kind, "vote")?;
                if let Some(user) = inner.users.get_mut(user_id) {
                    user.vote = Vote::Cast(token);
                }
                debug!(session_id = %self.id, user_id = %user_id, "vote cast");
            }
            MessageKind::Reveal => {
                moderator_only(kind, &name, is_moderator)?;
                inner.votes_revealed = true;
                info!(session_id = %self.id, "votes revealed");
            }
            MessageKind::NewRound => {
                moderator_only(kind, &name, is_moderator)?;
                inner.start_new_round();
                info!(session_id = %self.id, "new round");
            }
            MessageKind::SetStory => {
                moderator_only(kind, &name, is_moderator)?;
                let story = envelope.require_str(kind, "story")?;
                inner.current_story = story;
                inner.start_new_round();
                info!(session_id = %self.id, story = %inner.current_story, "story set");
            }
            MessageKind::StartSession => return self.start_locked(&mut inner, user_id),
            MessageKind::UserJoined
            | MessageKind::UserLeft
            | MessageKind::SessionState
            | MessageKind::WaitingRoom => {
                return Err(RouteError::UnknownKind(envelope.kind.clone()));
            }
        }

        inner.touch();
        self.broadcast_state(&mut inner);
        Ok(())
    }

    /// Mark the session ended if it has had no members for `max_age`.
    /// Once ended it refuses new members, so the answer never flips back.
    pub(crate) fn retire_if_idle(&self, max_age: Duration) -> bool {
        let mut inner = self.inner.write();
        if inner.status == SessionStatus::Ended {
            return true;
        }
        if !inner.users.is_empty() || inner.last_activity.elapsed() < max_age {
            return false;
        }
        inner.status = SessionStatus::Ended;
        true
    }

    // Creator check is by id, unlike the moderator actions which check the
    // sender's own flag. Keep them separate.
    fn start_locked(&self, inner: &mut SessionInner, user_id: &UserId) -> Result<(), RouteError> {
        if inner.creator_id.as_ref() != Some(user_id) {
            return Err(RouteError::NotCreator {
                user: user_id.clone(),
            });
        }
        if inner.status != SessionStatus::Waiting {
            return Err(RouteError::NotWaiting {
                status: inner.status,
            });
        }

        inner.status = SessionStatus::Active;
        inner.touch();
        info!(session_id = %self.id, user_id = %user_id, "session started");

        inner.broadcast(&ServerEvent::StartSession {
            message: SESSION_STARTED_NOTICE.to_string(),
        });
        self.broadcast_state(inner);
        Ok(())
    }

    fn snapshot(&self, inner: &SessionInner) -> SessionState {
        SessionState {
            id: self.id.clone(),
            users: inner
                .users
                .iter()
                .map(|(id, user)| (id.clone(), user.view(inner.votes_revealed)))
                .collect(),
            current_story: inner.current_story.clone(),
            votes_revealed: inner.votes_revealed,
            status: inner.status,
            created_at: self.created_at,
        }
    }

    fn broadcast_state(&self, inner: &mut SessionInner) {
        let state = self.snapshot(inner);
        inner.broadcast(&ServerEvent::SessionState(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Frame;
    use crate::user::HIDDEN_VOTE;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn join(session: &Session, name: &str, creator: bool) -> (UserView, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let view = session.add_user(name, Some(Box::new(tx)), creator).unwrap();
        (view, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn kinds(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
    }

    fn send(session: &Session, user: &UserView, kind: MessageKind, data: Value) -> Result<(), RouteError> {
        session.handle_message(&user.id, &Envelope::new(kind, data))
    }

    fn state_bytes(session: &Session) -> String {
        serde_json::to_string(&session.state()).unwrap()
    }

    /// Alice (creator) and Bob, session started, inboxes drained.
    fn started_pair() -> (Session, UserView, mpsc::Receiver<Frame>, UserView, mpsc::Receiver<Frame>) {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, mut alice_rx) = join(&session, "Alice", true);
        let (bob, mut bob_rx) = join(&session, "Bob", false);
        send(&session, &alice, MessageKind::StartSession, json!({})).unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        (session, alice, alice_rx, bob, bob_rx)
    }

    #[test]
    fn new_session_defaults() {
        let session = Session::new(SessionId::from_raw("S1"));
        let state = session.state();
        assert_eq!(state.id.as_str(), "S1");
        assert!(state.users.is_empty());
        assert!(state.current_story.is_empty());
        assert!(!state.votes_revealed);
        assert_eq!(state.status, SessionStatus::Waiting);
        assert!(session.creator_id().is_none());
        assert!(session.moderator_id().is_none());
    }

    #[test]
    fn creator_is_moderator_and_participant_is_not() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, _a) = join(&session, "Alice", true);
        assert!(alice.is_moderator);
        assert!(alice.is_online);
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert_eq!(session.creator_id(), Some(alice.id.clone()));
        assert_eq!(session.moderator_id(), Some(alice.id.clone()));

        let (bob, _b) = join(&session, "Bob", false);
        assert!(!bob.is_moderator);
        assert_eq!(session.user_count(), 2);
        assert_eq!(session.state().users[&bob.id].id, bob.id);
    }

    #[test]
    fn creator_gets_joined_then_state_without_waiting_room() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (_alice, mut rx) = join(&session, "Alice", true);
        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames), ["user_joined", "session_state"]);
        assert_eq!(frames[0]["data"]["name"], "Alice");
        assert_eq!(frames[1]["data"]["status"], "waiting");
    }

    #[test]
    fn participant_in_waiting_session_gets_waiting_room_before_state() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (_alice, mut alice_rx) = join(&session, "Alice", true);
        drain(&mut alice_rx);

        let (bob, mut bob_rx) = join(&session, "Bob", false);
        let frames = drain(&mut bob_rx);
        assert_eq!(kinds(&frames), ["user_joined", "waiting_room", "session_state"]);
        assert_eq!(frames[1]["data"]["sessionId"], "S1");
        assert_eq!(frames[1]["data"]["message"], WAITING_ROOM_NOTICE);
        assert_eq!(frames[2]["data"]["users"].as_object().unwrap().len(), 2);

        let alice_frames = drain(&mut alice_rx);
        assert_eq!(kinds(&alice_frames), ["user_joined"]);
        assert_eq!(alice_frames[0]["data"]["id"], bob.id.as_str());
    }

    #[test]
    fn participant_in_active_session_skips_waiting_room() {
        let (session, _alice, _arx, _bob, _brx) = started_pair();
        let (_carol, mut rx) = join(&session, "Carol", false);
        assert_eq!(kinds(&drain(&mut rx)), ["user_joined", "session_state"]);
    }

    #[test]
    fn creator_starts_session_and_everyone_is_notified() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, mut alice_rx) = join(&session, "Alice", true);
        let (bob, mut bob_rx) = join(&session, "Bob", false);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(&session, &alice, MessageKind::StartSession, json!({})).unwrap();
        assert_eq!(session.status(), SessionStatus::Active);

        for frames in [drain(&mut alice_rx), drain(&mut bob_rx)] {
            assert_eq!(kinds(&frames), ["start_session", "session_state"]);
            assert_eq!(frames[0]["data"]["message"], SESSION_STARTED_NOTICE);
            assert_eq!(frames[1]["data"]["status"], "active");
        }

        // Already active, and Bob is not the creator anyway.
        let err = send(&session, &bob, MessageKind::StartSession, json!({})).unwrap_err();
        assert!(matches!(err, RouteError::NotCreator { .. }));
        assert_eq!(session.status(), SessionStatus::Active);

        let err = send(&session, &alice, MessageKind::StartSession, json!({})).unwrap_err();
        assert_eq!(
            err,
            RouteError::NotWaiting {
                status: SessionStatus::Active
            }
        );
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn non_creator_cannot_start() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (_alice, _arx) = join(&session, "Alice", true);
        let (bob, mut bob_rx) = join(&session, "Bob", false);
        drain(&mut bob_rx);

        let err = send(&session, &bob, MessageKind::StartSession, json!({})).unwrap_err();
        assert!(matches!(err, RouteError::NotCreator { .. }));
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn start_checks_creator_id_not_moderator_flag() {
        let session = Session::new(SessionId::from_raw("S1"));
        // No creator at all: a moderator flag alone is never enough to start.
        let (bob, _brx) = join(&session, "Bob", false);
        assert_eq!(
            session.start(&bob.id),
            Err(RouteError::NotCreator { user: bob.id.clone() })
        );
        assert!(session.start(&UserId::from_raw("ghost")).is_err());
    }

    #[test]
    fn votes_are_masked_until_revealed() {
        let (session, alice, _arx, bob, mut bob_rx) = started_pair();

        send(&session, &alice, MessageKind::Vote, json!({"vote": "5"})).unwrap();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "8"})).unwrap();

        let state = session.state();
        assert!(!state.votes_revealed);
        assert_eq!(state.users[&alice.id].vote.as_deref(), Some(HIDDEN_VOTE));
        assert_eq!(state.users[&bob.id].vote.as_deref(), Some(HIDDEN_VOTE));

        // Broadcast frames never leak a literal vote either.
        for frame in drain(&mut bob_rx) {
            let text = frame.to_string();
            assert!(!text.contains("\"5\"") && !text.contains("\"8\""), "leaked: {text}");
        }

        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();
        let state = session.state();
        assert!(state.votes_revealed);
        assert_eq!(state.users[&alice.id].vote.as_deref(), Some("5"));
        assert_eq!(state.users[&bob.id].vote.as_deref(), Some("8"));

        let frames = drain(&mut bob_rx);
        assert_eq!(kinds(&frames), ["session_state"]);
        assert_eq!(frames[0]["data"]["users"][bob.id.as_str()]["vote"], "8");
    }

    #[test]
    fn revealed_state_shows_last_cast_vote_and_null_for_abstainers() {
        let (session, alice, _arx, bob, _brx) = started_pair();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "3"})).unwrap();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "13"})).unwrap();
        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();

        let state = session.state();
        assert_eq!(state.users[&bob.id].vote.as_deref(), Some("13"));
        assert_eq!(state.users[&alice.id].vote, None);
    }

    #[test]
    fn new_round_clears_votes_and_reveal() {
        let (session, alice, _arx, bob, _brx) = started_pair();
        send(&session, &alice, MessageKind::Vote, json!({"vote": "5"})).unwrap();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "8"})).unwrap();
        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();

        send(&session, &alice, MessageKind::NewRound, json!({})).unwrap();
        let state = session.state();
        assert!(!state.votes_revealed);
        assert!(state.users.values().all(|u| u.vote.is_none()));
    }

    #[test]
    fn set_story_starts_a_fresh_round() {
        let (session, alice, _arx, bob, mut bob_rx) = started_pair();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "2"})).unwrap();
        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();
        drain(&mut bob_rx);

        send(&session, &alice, MessageKind::SetStory, json!({"story": "Checkout flow"})).unwrap();
        let state = session.state();
        assert_eq!(state.current_story, "Checkout flow");
        assert!(!state.votes_revealed);
        assert_eq!(state.users[&bob.id].vote, None);

        let frames = drain(&mut bob_rx);
        assert_eq!(kinds(&frames), ["session_state"]);
        assert_eq!(frames[0]["data"]["currentStory"], "Checkout flow");
    }

    #[test]
    fn non_moderator_transitions_change_nothing() {
        let (session, alice, _arx, bob, mut bob_rx) = started_pair();
        send(&session, &alice, MessageKind::SetStory, json!({"story": "Search"})).unwrap();
        send(&session, &alice, MessageKind::Vote, json!({"vote": "5"})).unwrap();
        send(&session, &bob, MessageKind::Vote, json!({"vote": "8"})).unwrap();
        drain(&mut bob_rx);
        let before = state_bytes(&session);

        for (kind, data) in [
            (MessageKind::Reveal, json!({})),
            (MessageKind::NewRound, json!({})),
            (MessageKind::SetStory, json!({"story": "Hijack"})),
            (MessageKind::SetStory, json!({"wrong": 1})),
        ] {
            let err = send(&session, &bob, kind, data).unwrap_err();
            assert!(matches!(err, RouteError::Unauthorized { .. }), "{kind}: {err}");
        }

        assert_eq!(state_bytes(&session), before);
        assert!(drain(&mut bob_rx).is_empty());

        // Bob's real vote is still there once the moderator reveals.
        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();
        assert_eq!(session.user(&bob.id).unwrap().vote.as_deref(), Some("8"));
    }

    #[test]
    fn malformed_payloads_are_dropped_without_broadcast() {
        let (session, alice, mut alice_rx, _bob, _brx) = started_pair();
        let before = state_bytes(&session);

        let err = send(&session, &alice, MessageKind::Vote, json!({"vote": 5})).unwrap_err();
        assert!(matches!(err, RouteError::Malformed { kind: "vote", .. }));
        let err = session
            .handle_message(
                &alice.id,
                &Envelope::parse(r#"{"type":"set_story"}"#).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, RouteError::Malformed { kind: "set_story", .. }));

        assert_eq!(state_bytes(&session), before);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn unknown_sender_and_kind_are_rejected() {
        let (session, alice, mut alice_rx, _bob, _brx) = started_pair();
        let ghost = UserId::from_raw("ghost");
        let err = send(&session, &UserView { id: ghost.clone(), ..alice.clone() }, MessageKind::Reveal, json!({}))
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownSender(ghost));

        let err = session
            .handle_message(&alice.id, &Envelope::parse(r#"{"type":"session_state"}"#).unwrap())
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownKind("session_state".into()));
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn remove_user_is_idempotent() {
        let (session, alice, mut alice_rx, bob, _brx) = started_pair();

        assert!(session.remove_user(&bob.id));
        assert!(!session.remove_user(&bob.id));
        assert_eq!(session.user_count(), 1);
        assert!(session.user(&bob.id).is_none());

        let frames = drain(&mut alice_rx);
        assert_eq!(kinds(&frames), ["user_left"]);
        assert_eq!(frames[0]["data"]["userId"], bob.id.as_str());

        // A message arriving after the disconnect is dropped.
        let err = send(&session, &bob, MessageKind::Vote, json!({"vote": "1"})).unwrap_err();
        assert!(matches!(err, RouteError::UnknownSender(_)));
        assert!(session.user(&alice.id).is_some());
    }

    #[test]
    fn broken_recipient_is_flagged_offline_without_blocking_others() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, mut alice_rx) = join(&session, "Alice", true);
        let (bob, bob_rx) = join(&session, "Bob", false);
        let (carol, mut carol_rx) = join(&session, "Carol", false);
        drop(bob_rx);
        drain(&mut alice_rx);
        drain(&mut carol_rx);

        send(&session, &alice, MessageKind::SetStory, json!({"story": "API"})).unwrap();

        assert!(!session.user(&bob.id).unwrap().is_online);
        assert!(session.user(&carol.id).unwrap().is_online);
        assert_eq!(session.online_count(), 2);
        assert_eq!(kinds(&drain(&mut alice_rx)), ["session_state"]);
        assert_eq!(kinds(&drain(&mut carol_rx)), ["session_state"]);

        // Offline users stay in the room and can still vote.
        send(&session, &bob, MessageKind::Vote, json!({"vote": "1"})).unwrap();
        assert!(session.state().users[&bob.id].vote.is_some());
    }

    #[test]
    fn overflowing_recipient_is_disconnected() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, _alice_rx) = join(&session, "Alice", true);
        let (tx, mut slow_rx) = mpsc::channel::<Frame>(2);
        let slow = session.add_user("Slow", Some(Box::new(tx)), false).unwrap();

        // The join's private session_state is the frame that overflows.
        send(&session, &alice, MessageKind::Reveal, json!({})).unwrap();
        assert!(!session.user(&slow.id).unwrap().is_online);

        // Draining the backlog does not bring updates back; the queue is
        // closed instead, which is what ends the connection's writer.
        let backlog = drain(&mut slow_rx);
        assert_eq!(kinds(&backlog), ["user_joined", "waiting_room"]);
        for story in ["a", "b", "c"] {
            send(&session, &alice, MessageKind::SetStory, json!({"story": story})).unwrap();
        }
        assert_eq!(slow_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));

        // The transport then removes the user, and a rejoin works normally.
        assert!(session.remove_user(&slow.id));
        let (_again, mut again_rx) = join(&session, "Slow", false);
        assert_eq!(
            kinds(&drain(&mut again_rx)),
            ["user_joined", "waiting_room", "session_state"]
        );
    }

    #[test]
    fn second_creator_claim_is_ignored_while_creator_present() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, _a) = join(&session, "Alice", true);
        let (mallory, mut rx) = join(&session, "Mallory", true);

        assert!(!mallory.is_moderator);
        assert_eq!(session.creator_id(), Some(alice.id.clone()));
        assert!(kinds(&drain(&mut rx)).contains(&"waiting_room"));
        let moderators = session.state().users.values().filter(|u| u.is_moderator).count();
        assert_eq!(moderators, 1);
    }

    #[test]
    fn creator_can_reclaim_after_leaving() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, _a) = join(&session, "Alice", true);
        let (_bob, _b) = join(&session, "Bob", false);
        session.remove_user(&alice.id);

        let (again, _a2) = join(&session, "Alice", true);
        assert!(again.is_moderator);
        assert_eq!(session.creator_id(), Some(again.id.clone()));
        session.start(&again.id).unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[test]
    fn set_creator_moves_both_roles() {
        let session = Session::new(SessionId::from_raw("S1"));
        let (alice, _a) = join(&session, "Alice", true);
        let (bob, mut bob_rx) = join(&session, "Bob", false);
        drain(&mut bob_rx);

        assert!(!session.set_creator(&UserId::from_raw("ghost")));
        assert!(session.set_creator(&bob.id));

        let state = session.state();
        assert!(state.users[&bob.id].is_moderator);
        assert!(!state.users[&alice.id].is_moderator);
        assert_eq!(session.creator_id(), Some(bob.id.clone()));
        assert_eq!(session.moderator_id(), Some(bob.id.clone()));
        assert_eq!(kinds(&drain(&mut bob_rx)), ["session_state"]);

        send(&session, &bob, MessageKind::StartSession, json!({})).unwrap();
        assert!(send(&session, &alice, MessageKind::Reveal, json!({})).is_err());
    }

    #[test]
    fn detached_users_are_supported() {
        let session = Session::new(SessionId::from_raw("S1"));
        let alice = session.add_user("Alice", None, true).unwrap();
        session.start(&alice.id).unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(session.user(&alice.id).unwrap().is_online);
    }

    #[test]
    fn retire_only_when_empty_and_idle() {
        let session = Session::new(SessionId::from_raw("S1"));
        let alice = session.add_user("Alice", None, true).unwrap();
        assert!(!session.retire_if_idle(Duration::ZERO));

        session.remove_user(&alice.id);
        assert!(!session.retire_if_idle(Duration::from_secs(3600)));
        assert!(session.retire_if_idle(Duration::ZERO));
        assert_eq!(session.status(), SessionStatus::Ended);
    }

    #[test]
    fn state_serializes_wire_shape() {
        let (session, alice, _arx, _bob, _brx) = started_pair();
        let json = serde_json::to_value(session.state()).unwrap();
        assert_eq!(json["id"], "S1");
        assert_eq!(json["status"], "active");
        assert_eq!(json["votesRevealed"], false);
        assert_eq!(json["currentStory"], "");
        assert!(json["createdAt"].is_string());
        let user = &json["users"][alice.id.as_str()];
        assert_eq!(user["name"], "Alice");
        assert_eq!(user["isModerator"], true);
        assert!(user["vote"].is_null());
    }
}
