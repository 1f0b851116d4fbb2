use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use plinth_models::SessionState;

/// Opaque session identifier (UUID v4 on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One user's live streaming + control scope over a single asset.
///
/// The supervised worker is deliberately not part of this record; the
/// supervisor owns it exclusively and the registry only tracks state.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user_id: i64,
    pub asset_id: i64,
    pub state: SessionState,
    /// Populated once the worker reports readiness.
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Monotonic timestamp of the last control command or client keepalive;
    /// drives idle-timeout eviction.
    pub last_activity_at: Instant,
    /// Set when the session enters a terminal state; drives record reaping.
    pub ended_at: Option<Instant>,
}

impl Session {
    pub fn new(user_id: i64, asset_id: i64) -> Self {
        Self {
            id: SessionId::new(),
            user_id,
            asset_id,
            state: SessionState::Pending,
            media_url: None,
            created_at: Utc::now(),
            last_activity_at: Instant::now(),
            ended_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_pending() {
        let session = Session::new(7, 42);
        assert_eq!(session.state, SessionState::Pending);
        assert_eq!(session.user_id, 7);
        assert_eq!(session.asset_id, 42);
        assert!(session.media_url.is_none());
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn touch_resets_idle_clock() {
        let mut session = Session::new(1, 1);
        session.last_activity_at = Instant::now() - Duration::from_secs(120);
        assert!(session.idle_for() >= Duration::from_secs(120));
        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
