use std::collections::HashSet;
use std::sync::Mutex;

use crate::session::SessionId;

/// Capacity gate for new sessions.
///
/// Admission and release share one mutex so concurrent starts cannot race
/// the ceiling check. Accounting is a set of admitted session ids, which
/// makes `release` idempotent — every terminal path may call it without
/// coordinating on who releases first.
pub struct AdmissionGovernor {
    max_sessions: usize,
    admitted: Mutex<HashSet<SessionId>>,
}

impl AdmissionGovernor {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            admitted: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a slot for `session_id`. Returns false at the ceiling.
    pub fn try_admit(&self, user_id: i64, session_id: &SessionId) -> bool {
        let mut admitted = self.admitted.lock().unwrap_or_else(|e| e.into_inner());
        if admitted.len() >= self.max_sessions {
            tracing::warn!(
                user_id,
                session_id = %session_id,
                capacity = self.max_sessions,
                "admission denied, node at capacity"
            );
            return false;
        }
        admitted.insert(session_id.clone());
        true
    }

    /// Free the slot held by `session_id`. No-op if it was never admitted
    /// or was already released.
    pub fn release(&self, session_id: &SessionId) -> bool {
        let mut admitted = self.admitted.lock().unwrap_or_else(|e| e.into_inner());
        let released = admitted.remove(session_id);
        if released {
            tracing::debug!(session_id = %session_id, in_use = admitted.len(), "admission released");
        }
        released
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
