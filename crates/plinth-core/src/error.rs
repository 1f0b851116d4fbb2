use plinth_models::{ControlAction, ControlDirection, SessionState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session not found")]
    NotFound,
    #[error("user {0} already has an active session")]
    AlreadyActive(i64),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("session not active")]
    SessionNotActive,
    #[error("invalid command: {action:?} does not accept direction {direction:?}")]
    InvalidCommand {
        action: ControlAction,
        direction: ControlDirection,
    },
    #[error("session capacity exhausted")]
    ResourceExhausted,
    #[error("worker launch failed: {0}")]
    LaunchFailed(String),
    #[error("worker not ready")]
    WorkerNotReady,
    #[error("worker error: {0}")]
    Worker(String),
}
