use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use plinth_models::{ControlCommand, SessionState, StreamStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::admission::AdmissionGovernor;
use crate::control::ControlChannel;
use crate::egress::EgressPublisher;
use crate::error::CoreError;
use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::supervisor::WorkerSupervisor;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Sessions with no control traffic or keepalive for this long are
    /// evicted by the sweep.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long terminal session records are kept before reaping.
    pub terminal_retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(600),
        }
    }
}

/// Orchestrates the start/stop/control flows across the registry, the
/// admission governor, the worker supervisor, the control channel and the
/// egress publisher.
///
/// All same-user flows run under a per-user async lock, so a `start`
/// racing an idle-timeout stop (or a double `start`) serializes instead of
/// corrupting the one-session-per-user invariant.
pub struct StreamService {
    registry: Arc<SessionRegistry>,
    governor: Arc<AdmissionGovernor>,
    supervisor: Arc<WorkerSupervisor>,
    control: Arc<ControlChannel>,
    egress: Arc<EgressPublisher>,
    user_locks: DashMap<i64, Arc<Mutex<()>>>,
    config: ServiceConfig,
}

impl StreamService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        governor: Arc<AdmissionGovernor>,
        supervisor: Arc<WorkerSupervisor>,
        control: Arc<ControlChannel>,
        egress: Arc<EgressPublisher>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry,
            governor,
            supervisor,
            control,
            egress,
            user_locks: DashMap::new(),
            config,
        }
    }

    /// Start a stream for `user_id` over `asset_id`.
    ///
    /// Idempotent per user: an existing session is fully stopped first
    /// (last-writer-wins). Admission and launch failures surface as errors
    /// here; the API layer maps them to a non-active status for the client.
    pub async fn start_stream(
        &self,
        user_id: i64,
        asset_id: i64,
    ) -> Result<StreamStatus, CoreError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        if let Some(prior) = self.registry.current_for_user(user_id) {
            tracing::info!(user_id, prior = %prior, "start replaces existing session");
            self.stop_session(&prior, "replaced by new start").await;
        }

        let session_id = self.registry.create(user_id, asset_id)?;

        if !self.governor.try_admit(user_id, &session_id) {
            // Never launched; the record goes straight to Failed.
            let _ = self.registry.transition(&session_id, SessionState::Failed);
            return Err(CoreError::ResourceExhausted);
        }

        let launched = match self.supervisor.launch(&session_id, asset_id).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    user_id,
                    asset_id,
                    error = %e,
                    "stream start failed"
                );
                self.governor.release(&session_id);
                let _ = self.registry.transition(&session_id, SessionState::Failed);
                return Err(e);
            }
        };

        let url = match self.egress.allocate(&session_id) {
            Ok(url) => url,
            Err(e) => {
                self.supervisor.terminate(&session_id).await;
                self.egress.revoke(&session_id);
                self.governor.release(&session_id);
                let _ = self.registry.transition(&session_id, SessionState::Failed);
                return Err(e);
            }
        };
        self.registry.set_media_url(&session_id, &url);
        self.control.attach(&session_id, launched.input_tx);

        if let Err(e) = self.registry.transition(&session_id, SessionState::Active) {
            self.control.detach(&session_id, false);
            self.supervisor.terminate(&session_id).await;
            self.egress.revoke(&session_id);
            self.governor.release(&session_id);
            return Err(e);
        }
        self.supervisor.watch(&session_id);

        tracing::info!(session_id = %session_id, user_id, asset_id, url = %url, "stream started");
        Ok(StreamStatus::active(url, asset_id))
    }

    /// Stop the caller's current session. Succeeds as a no-op (returns
    /// false) when there is nothing to stop.
    pub async fn stop_stream(&self, user_id: i64) -> bool {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        match self.registry.current_for_user(user_id) {
            Some(session_id) => self.stop_session(&session_id, "stop requested").await,
            None => false,
        }
    }

    /// Forward one control command on the caller's current session.
    pub fn send_control(&self, user_id: i64, command: ControlCommand) -> Result<(), CoreError> {
        if !command.is_well_formed() {
            return Err(CoreError::InvalidCommand {
                action: command.action,
                direction: command.direction,
            });
        }

        let session_id = self
            .registry
            .current_for_user(user_id)
            .ok_or(CoreError::SessionNotActive)?;
        let session = self.registry.get(&session_id)?;
        if session.state != SessionState::Active {
            return Err(CoreError::SessionNotActive);
        }

        self.control.send(&session_id, command)?;
        self.registry.touch(&session_id);
        Ok(())
    }

    /// Current stream status for the caller. A status poll counts as a
    /// keepalive, so a client that only watches (never steers) is not
    /// idle-evicted while it keeps polling.
    pub fn status(&self, user_id: i64) -> StreamStatus {
        let Some(session_id) = self.registry.current_for_user(user_id) else {
            return StreamStatus::inactive();
        };
        let Ok(session) = self.registry.get(&session_id) else {
            return StreamStatus::inactive();
        };
        if session.state != SessionState::Active {
            return StreamStatus::inactive();
        }
        self.registry.touch(&session_id);

        match self.egress.lookup(&session_id).or(session.media_url) {
            Some(url) => StreamStatus::active(url, session.asset_id),
            None => StreamStatus::inactive(),
        }
    }

    /// One sweep pass: evict idle sessions through the regular stop path,
    /// then reap expired terminal records.
    pub async fn sweep_once(&self) {
        for session_id in self.registry.idle_sessions(self.config.idle_timeout) {
            let Ok(session) = self.registry.get(&session_id) else {
                continue;
            };
            let lock = self.user_lock(session.user_id);
            let _guard = lock.lock().await;

            // Re-check under the lock; an explicit stop or a fresh control
            // command may have won the race.
            let still_idle = self
                .registry
                .get(&session_id)
                .map(|s| {
                    s.state == SessionState::Active && s.idle_for() > self.config.idle_timeout
                })
                .unwrap_or(false);
            if still_idle {
                tracing::info!(
                    session_id = %session_id,
                    user_id = session.user_id,
                    idle_timeout = ?self.config.idle_timeout,
                    "evicting idle session"
                );
                self.stop_session(&session_id, "idle timeout").await;
            }
        }

        self.registry.reap_terminal(self.config.terminal_retention);
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            loop {
                ticker.tick().await;
                service.sweep_once().await;
            }
        })
    }

    /// Stop every live session; used on server shutdown so no renderer
    /// outlives the relay.
    pub async fn shutdown(&self) {
        for session_id in self.registry.live_session_ids() {
            self.stop_session(&session_id, "server shutdown").await;
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.registry.live_count()
    }

    pub fn admitted_sessions(&self) -> usize {
        self.governor.admitted_count()
    }

    /// The shared stop path: explicit stop, idle eviction, replacement and
    /// shutdown all funnel through here.
    async fn stop_session(&self, session_id: &SessionId, reason: &str) -> bool {
        match self.registry.transition(session_id, SessionState::Stopping) {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "stop skipped");
                return false;
            }
        }
        tracing::info!(session_id = %session_id, reason, "stopping session");

        // Order matters: stop supervising first so the teardown is not
        // mistaken for a crash, then release held controls while the worker
        // still listens, then shut it down.
        self.supervisor.unwatch(session_id);
        self.control.detach(session_id, true);
        self.supervisor.terminate(session_id).await;
        self.egress.revoke(session_id);
        self.governor.release(session_id);

        if let Err(e) = self.registry.transition(session_id, SessionState::Stopped) {
            tracing::warn!(session_id = %session_id, error = %e, "stopped transition failed");
        }
        true
    }

    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().clone()
    }
}
