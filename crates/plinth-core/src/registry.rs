use std::time::{Duration, Instant};

use dashmap::DashMap;
use plinth_models::SessionState;

use crate::error::CoreError;
use crate::session::{Session, SessionId};

/// In-memory store of streaming sessions with state-machine enforcement.
///
/// One non-terminal session per user. Same-user calls are serialized by the
/// stream service (per-user lock), so the registry only has to stay
/// consistent under cross-user concurrency. Guards from the two maps are
/// never held across each other.
///
/// Terminal records are kept (so a late `transition` reports
/// `InvalidTransition` rather than `NotFound`) but leave the per-user index
/// immediately; `reap_terminal` removes them after a retention window.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    by_user: DashMap<i64, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Register a new `Pending` session for `user_id`.
    ///
    /// Fails with `AlreadyActive` if the user still owns a non-terminal
    /// session; the service resolves that by stopping the prior session
    /// first (last-writer-wins).
    pub fn create(&self, user_id: i64, asset_id: i64) -> Result<SessionId, CoreError> {
        if let Some(existing_id) = self.by_user.get(&user_id).map(|r| r.value().clone()) {
            let still_active = self
                .sessions
                .get(&existing_id)
                .map(|s| !s.state.is_terminal())
                .unwrap_or(false);
            if still_active {
                return Err(CoreError::AlreadyActive(user_id));
            }
        }

        let session = Session::new(user_id, asset_id);
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        self.by_user.insert(user_id, id.clone());

        tracing::info!(session_id = %id, user_id, asset_id, "session created");
        Ok(id)
    }

    /// Snapshot of a live session. Absent and terminal sessions are both
    /// `NotFound` — callers only ever operate on live ones.
    pub fn get(&self, id: &SessionId) -> Result<Session, CoreError> {
        let session = self.sessions.get(id).ok_or(CoreError::NotFound)?;
        if session.state.is_terminal() {
            return Err(CoreError::NotFound);
        }
        Ok(session.clone())
    }

    /// The user's current non-terminal session, if any.
    pub fn current_for_user(&self, user_id: i64) -> Option<SessionId> {
        let id = self.by_user.get(&user_id).map(|r| r.value().clone())?;
        let live = self
            .sessions
            .get(&id)
            .map(|s| !s.state.is_terminal())
            .unwrap_or(false);
        live.then_some(id)
    }

    /// Apply `next` to the session's state machine.
    pub fn transition(&self, id: &SessionId, next: SessionState) -> Result<(), CoreError> {
        let (user_id, became_terminal) = {
            let mut session = self.sessions.get_mut(id).ok_or(CoreError::NotFound)?;
            let from = session.state;
            if !from.can_transition(next) {
                return Err(CoreError::InvalidTransition { from, to: next });
            }
            session.state = next;
            if next.is_terminal() {
                session.ended_at = Some(Instant::now());
            }
            tracing::info!(session_id = %id, %from, to = %next, "session transition");
            (session.user_id, next.is_terminal())
        };

        if became_terminal {
            self.by_user.remove_if(&user_id, |_, current| current == id);
        }
        Ok(())
    }

    /// Update the activity timestamp. Side-effect only; a missing session
    /// is a no-op.
    pub fn touch(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.touch();
        }
    }

    /// Record the media URL reported by the session's worker.
    pub fn set_media_url(&self, id: &SessionId, url: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.media_url = Some(url.to_string());
        }
    }

    /// Active sessions whose last activity is older than `threshold`.
    pub fn idle_sessions(&self, threshold: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| {
                entry.state == SessionState::Active && entry.idle_for() > threshold
            })
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Drop terminal records older than `retention`. Returns how many were
    /// removed.
    pub fn reap_terminal(&self, retention: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let expired = session.state.is_terminal()
                && session
                    .ended_at
                    .map(|at| at.elapsed() > retention)
                    .unwrap_or(true);
            !expired
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "reaped terminal session records");
        }
        removed
    }

    /// Ids of all non-terminal sessions.
    pub fn live_session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Number of non-terminal sessions.
    pub fn live_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();
        let session = registry.get(&id).unwrap();
        assert_eq!(session.user_id, 1);
        assert_eq!(session.asset_id, 42);
        assert_eq!(session.state, SessionState::Pending);
        assert_eq!(registry.current_for_user(1), Some(id));
    }

    #[test]
    fn second_session_for_same_user_is_refused() {
        let registry = SessionRegistry::new();
        registry.create(1, 42).unwrap();
        assert!(matches!(
            registry.create(1, 43),
            Err(CoreError::AlreadyActive(1))
        ));
    }

    #[test]
    fn stopped_session_frees_the_user_slot() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();
        registry.transition(&id, SessionState::Active).unwrap();
        registry.transition(&id, SessionState::Stopping).unwrap();
        registry.transition(&id, SessionState::Stopped).unwrap();

        assert_eq!(registry.current_for_user(1), None);
        let id2 = registry.create(1, 43).unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn get_hides_terminal_sessions() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();
        registry.transition(&id, SessionState::Failed).unwrap();
        assert!(matches!(registry.get(&id), Err(CoreError::NotFound)));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();

        // Pending -> Stopped skips Stopping
        assert!(matches!(
            registry.transition(&id, SessionState::Stopped),
            Err(CoreError::InvalidTransition { .. })
        ));

        // Terminal states admit nothing further
        registry.transition(&id, SessionState::Failed).unwrap();
        assert!(matches!(
            registry.transition(&id, SessionState::Active),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn touch_on_missing_session_is_a_noop() {
        let registry = SessionRegistry::new();
        registry.touch(&SessionId::new());
    }

    #[test]
    fn idle_sessions_reports_only_stale_active_ones() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();
        registry.transition(&id, SessionState::Active).unwrap();

        assert!(registry.idle_sessions(Duration::from_secs(3600)).is_empty());

        let idle = registry.idle_sessions(Duration::ZERO);
        assert_eq!(idle, vec![id]);

        // Pending sessions are never idle-evicted
        let pending = registry.create(2, 43).unwrap();
        assert!(!registry.idle_sessions(Duration::ZERO).contains(&pending));
    }

    #[test]
    fn reap_removes_expired_terminal_records() {
        let registry = SessionRegistry::new();
        let id = registry.create(1, 42).unwrap();
        registry.transition(&id, SessionState::Failed).unwrap();

        // Still retained within the window
        assert_eq!(registry.reap_terminal(Duration::from_secs(3600)), 0);
        // Gone once the retention window is zero
        assert_eq!(registry.reap_terminal(Duration::ZERO), 1);
        assert!(matches!(
            registry.transition(&id, SessionState::Active),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn live_count_ignores_terminal_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.create(1, 42).unwrap();
        registry.create(2, 43).unwrap();
        assert_eq!(registry.live_count(), 2);
        registry.transition(&a, SessionState::Failed).unwrap();
        assert_eq!(registry.live_count(), 1);
    }
}
