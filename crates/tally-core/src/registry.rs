//! Registry: the process-wide map from session id to live session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::ids::SessionId;
use crate::outbound::Outbound;
use crate::session::Session;
use crate::user::UserView;

/// Concurrent session map.
///
/// Sessions are created on first reference and live until [`reap_idle`]
/// retires them. The map's shard locks are never held while a session lock
/// is taken.
///
/// [`reap_idle`]: Registry::reap_idle
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating it if absent.
    ///
    /// Concurrent callers with the same id all get the same `Arc`.
    pub fn get_or_create(&self, id: &SessionId) -> Arc<Session> {
        if let Some(existing) = self.sessions.get(id) {
            return Arc::clone(existing.value());
        }
        let entry = self.sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session_id = %id, "session created");
            Arc::new(Session::new(id.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Enroll a participant in the live session for `id`.
    ///
    /// If the reaper retires the session between lookup and enrollment, the
    /// retired instance refuses the join and the lookup is repeated until it
    /// yields a live one. `outbound` is called once per attempt.
    pub fn join<F>(
        &self,
        id: &SessionId,
        name: &str,
        is_creator: bool,
        mut outbound: F,
    ) -> (Arc<Session>, UserView)
    where
        F: FnMut() -> Option<Box<dyn Outbound>>,
    {
        loop {
            let session = self.get_or_create(id);
            match session.add_user(name, outbound(), is_creator) {
                Ok(user) => return (session, user),
                Err(e) => {
                    debug!(session_id = %id, error = %e, "session retired during join, retrying");
                    // The reaper may not have removed it yet.
                    let _ = self
                        .sessions
                        .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
                }
            }
        }
    }

    /// Look up a session without creating it.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// All registered ids, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Retire and drop sessions that have had no members for `max_age`.
    ///
    /// Sessions are snapshotted first and the map guards released. Each one
    /// is retired under its own lock, after which it refuses new members, and
    /// only then is that exact instance removed from the map.
    #[instrument(skip(self))]
    pub fn reap_idle(&self, max_age: Duration) -> Vec<SessionId> {
        let snapshot: Vec<(SessionId, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut reaped = Vec::new();
        for (id, session) in snapshot {
            if !session.retire_if_idle(max_age) {
                continue;
            }
            if self
                .sessions
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &session))
                .is_some()
            {
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), remaining = self.sessions.len(), "reaped idle sessions");
        }
        reaped
    }
}
