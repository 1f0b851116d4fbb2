use serde::{Deserialize, Serialize};

/// Lifecycle state of a streaming session.
///
/// ```text
/// Pending ──worker ready──► Active ──stop / idle / crash──► Stopping ──► Stopped
///    │                        │
///    └──launch error──► Failed ◄──retries exhausted──┘
/// ```
///
/// `Stopped` and `Failed` are terminal; no further transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Stopping)
                | (Pending, Failed)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status payload returned to the client by the start/status endpoints.
///
/// The client inspects `is_active`/`rtsp_url` rather than HTTP status
/// codes, so a failed start is reported as a non-active status here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub is_active: bool,
    pub rtsp_url: Option<String>,
    pub current_asset_id: Option<i64>,
}

impl StreamStatus {
    pub fn inactive() -> Self {
        Self {
            is_active: false,
            rtsp_url: None,
            current_asset_id: None,
        }
    }

    pub fn active(rtsp_url: String, asset_id: i64) -> Self {
        Self {
            is_active: true,
            rtsp_url: Some(rtsp_url),
            current_asset_id: Some(asset_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(SessionState::Pending.can_transition(SessionState::Active));
        assert!(SessionState::Active.can_transition(SessionState::Stopping));
        assert!(SessionState::Stopping.can_transition(SessionState::Stopped));
    }

    #[test]
    fn failure_edges_are_legal() {
        assert!(SessionState::Pending.can_transition(SessionState::Failed));
        assert!(SessionState::Active.can_transition(SessionState::Failed));
        assert!(SessionState::Stopping.can_transition(SessionState::Failed));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [SessionState::Stopped, SessionState::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                SessionState::Pending,
                SessionState::Active,
                SessionState::Stopping,
                SessionState::Stopped,
                SessionState::Failed,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn skipping_stopping_is_illegal() {
        assert!(!SessionState::Active.can_transition(SessionState::Stopped));
        assert!(!SessionState::Pending.can_transition(SessionState::Stopped));
    }

    #[test]
    fn status_serializes_with_client_field_names() {
        let status = StreamStatus::active("rtsp://host/42".into(), 42);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "is_active": true,
                "rtsp_url": "rtsp://host/42",
                "current_asset_id": 42,
            })
        );
    }
}
