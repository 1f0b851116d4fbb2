use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use plinth_models::SessionState;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::admission::AdmissionGovernor;
use crate::control::ControlChannel;
use crate::egress::EgressPublisher;
use crate::error::CoreError;
use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::worker::{SpawnedWorker, WorkerEvent, WorkerInput, WorkerLauncher};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a launched worker gets to report `ready`.
    pub launch_timeout: Duration,
    /// Silence on the event stream beyond this counts as a crash.
    pub heartbeat_grace: Duration,
    /// Crash restarts per session before the session is failed.
    pub max_restarts: u32,
    /// Linear backoff unit: attempt N sleeps N * restart_backoff.
    pub restart_backoff: Duration,
    /// Graceful-shutdown wait before the worker is force-killed.
    pub graceful_wait: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(10),
            heartbeat_grace: Duration::from_secs(15),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(2),
            graceful_wait: Duration::from_secs(5),
        }
    }
}

/// Supervisor-private state for one session's worker.
struct WorkerCell {
    input_tx: mpsc::UnboundedSender<WorkerInput>,
    child: Option<Child>,
    /// Event stream parked between `launch` and `watch`.
    pending_events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    restart_count: u32,
}

/// What `launch` hands back to the stream service: the advertised-URL
/// source and the input sender the control channel attaches to. The worker
/// itself stays inside the supervisor.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub media_url: String,
    pub input_tx: mpsc::UnboundedSender<WorkerInput>,
}

/// Owns every render worker: launches them, watches their heartbeats,
/// restarts crashed ones within a bounded budget, and tears them down.
///
/// On exhausted retries the supervisor runs the full terminal path itself
/// (fail transition, control detach, egress revoke, admission release) —
/// crashes are detected asynchronously, with no request in flight to do it.
pub struct WorkerSupervisor {
    launcher: WorkerLauncher,
    registry: Arc<SessionRegistry>,
    governor: Arc<AdmissionGovernor>,
    control: Arc<ControlChannel>,
    egress: Arc<EgressPublisher>,
    config: SupervisorConfig,
    cells: DashMap<SessionId, WorkerCell>,
    monitors: DashMap<SessionId, JoinHandle<()>>,
}

impl WorkerSupervisor {
    pub fn new(
        launcher: WorkerLauncher,
        registry: Arc<SessionRegistry>,
        governor: Arc<AdmissionGovernor>,
        control: Arc<ControlChannel>,
        egress: Arc<EgressPublisher>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            launcher,
            registry,
            governor,
            control,
            egress,
            config,
            cells: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    /// Launch a worker for the session and wait for its `ready` event.
    pub async fn launch(
        &self,
        session_id: &SessionId,
        asset_id: i64,
    ) -> Result<LaunchedWorker, CoreError> {
        let mut spawned = self.launcher.launch(session_id, asset_id).await?;
        let media_url = self.wait_ready(session_id, &mut spawned).await?;
        self.egress.record_worker_url(session_id, &media_url);

        let input_tx = spawned.input_tx.clone();
        self.cells.insert(
            session_id.clone(),
            WorkerCell {
                input_tx: spawned.input_tx,
                child: spawned.child,
                pending_events: Some(spawned.events_rx),
                restart_count: 0,
            },
        );
        Ok(LaunchedWorker {
            media_url,
            input_tx,
        })
    }

    /// Start the background monitor for a launched worker.
    pub fn watch(self: &Arc<Self>, session_id: &SessionId) {
        let events = match self.cells.get_mut(session_id) {
            Some(mut cell) => match cell.pending_events.take() {
                Some(events) => events,
                None => return,
            },
            None => return,
        };

        let supervisor = Arc::clone(self);
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            supervisor.monitor_loop(id, events).await;
        });
        self.monitors.insert(session_id.clone(), handle);
    }

    /// Stop monitoring a session (the stop path calls this before terminate
    /// so a teardown is never mistaken for a crash).
    pub fn unwatch(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.monitors.remove(session_id) {
            handle.abort();
        }
    }

    /// Gracefully shut the session's worker down, force-killing after the
    /// configured wait. Terminating an unknown or already-dead worker
    /// succeeds silently.
    pub async fn terminate(&self, session_id: &SessionId) {
        let Some((_, mut cell)) = self.cells.remove(session_id) else {
            return;
        };
        let _ = cell.input_tx.send(WorkerInput::Shutdown);

        if let Some(mut child) = cell.child.take() {
            match timeout(self.config.graceful_wait, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(session_id = %session_id, ?status, "worker exited gracefully");
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %session_id, error = %e, "worker wait failed");
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        wait = ?self.config.graceful_wait,
                        "graceful shutdown timed out, killing worker"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(session_id = %session_id, error = %e, "failed to kill worker");
                    }
                }
            }
        }
    }

    pub fn restart_count(&self, session_id: &SessionId) -> Option<u32> {
        self.cells.get(session_id).map(|c| c.restart_count)
    }

    pub fn worker_count(&self) -> usize {
        self.cells.len()
    }

    async fn monitor_loop(
        self: Arc<Self>,
        session_id: SessionId,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let mut restarts: u32 = 0;
        loop {
            let reason = loop {
                match timeout(self.config.heartbeat_grace, events.recv()).await {
                    Ok(Some(WorkerEvent::Heartbeat)) => {}
                    Ok(Some(WorkerEvent::Ready { media_url })) => {
                        // A restarted worker re-reports; refresh what clients see.
                        self.egress.record_worker_url(&session_id, &media_url);
                        if let Ok(url) = self.egress.allocate(&session_id) {
                            self.registry.set_media_url(&session_id, &url);
                        }
                    }
                    Ok(Some(WorkerEvent::Exited { detail })) => break detail,
                    Ok(None) => break "worker event stream closed".to_string(),
                    Err(_) => {
                        break format!("no heartbeat within {:?}", self.config.heartbeat_grace)
                    }
                }
            };

            // The stop path aborts this task before tearing down; seeing a
            // non-live session here means we are racing that teardown.
            match self.registry.get(&session_id) {
                Ok(s) if matches!(s.state, SessionState::Active | SessionState::Pending) => {}
                _ => return,
            }

            restarts += 1;
            if restarts > self.config.max_restarts {
                tracing::error!(
                    session_id = %session_id,
                    attempts = restarts - 1,
                    %reason,
                    "worker retries exhausted, failing session"
                );
                self.fail_session(&session_id).await;
                return;
            }

            tracing::warn!(
                session_id = %session_id,
                attempt = restarts,
                max = self.config.max_restarts,
                %reason,
                "worker died, restarting"
            );
            self.reap_child(&session_id).await;
            tokio::time::sleep(self.config.restart_backoff * restarts).await;

            let asset_id = match self.registry.get(&session_id) {
                Ok(s) => s.asset_id,
                Err(_) => return,
            };
            match self.respawn(&session_id, asset_id, restarts).await {
                Ok(new_events) => events = new_events,
                Err(e) => {
                    // The old receiver is closed, so the next pass breaks out
                    // immediately and this failure consumes another attempt.
                    tracing::warn!(session_id = %session_id, error = %e, "worker relaunch failed");
                }
            }
        }
    }

    async fn respawn(
        &self,
        session_id: &SessionId,
        asset_id: i64,
        attempt: u32,
    ) -> Result<mpsc::UnboundedReceiver<WorkerEvent>, CoreError> {
        let mut spawned = self.launcher.launch(session_id, asset_id).await?;
        let media_url = self.wait_ready(session_id, &mut spawned).await?;
        self.egress.record_worker_url(session_id, &media_url);
        if let Ok(url) = self.egress.allocate(session_id) {
            self.registry.set_media_url(session_id, &url);
        }

        let input_tx = spawned.input_tx.clone();
        match self.cells.get_mut(session_id) {
            Some(mut cell) => {
                cell.input_tx = spawned.input_tx;
                cell.child = spawned.child.take();
                cell.restart_count = attempt;
            }
            None => {
                // Teardown raced the restart; don't leak the fresh worker.
                Self::kill_quietly(&mut spawned.child).await;
                return Err(CoreError::Worker("session torn down during restart".into()));
            }
        }
        self.control.rebind(session_id, input_tx);
        tracing::info!(session_id = %session_id, attempt, "worker restarted");
        Ok(spawned.events_rx)
    }

    /// Drive the asynchronous terminal path for a session whose worker is
    /// beyond saving.
    async fn fail_session(&self, session_id: &SessionId) {
        if let Err(e) = self.registry.transition(session_id, SessionState::Failed) {
            tracing::debug!(session_id = %session_id, error = %e, "fail transition skipped");
        }
        // The worker is dead: detach without synthesizing release edges.
        self.control.detach(session_id, false);
        self.egress.revoke(session_id);
        self.governor.release(session_id);
        self.reap_child(session_id).await;
        self.cells.remove(session_id);
        self.monitors.remove(session_id);
    }

    async fn wait_ready(
        &self,
        session_id: &SessionId,
        spawned: &mut SpawnedWorker,
    ) -> Result<String, CoreError> {
        let ready = timeout(self.config.launch_timeout, async {
            while let Some(event) = spawned.events_rx.recv().await {
                match event {
                    WorkerEvent::Ready { media_url } => return Ok(media_url),
                    WorkerEvent::Heartbeat => {}
                    WorkerEvent::Exited { detail } => {
                        return Err(CoreError::LaunchFailed(format!(
                            "worker exited before ready: {detail}"
                        )))
                    }
                }
            }
            Err(CoreError::LaunchFailed("worker exited before ready".into()))
        })
        .await;

        match ready {
            Ok(Ok(url)) => Ok(url),
            Ok(Err(e)) => {
                Self::kill_quietly(&mut spawned.child).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    timeout = ?self.config.launch_timeout,
                    "worker launch timed out"
                );
                Self::kill_quietly(&mut spawned.child).await;
                Err(CoreError::LaunchFailed(format!(
                    "worker not ready within {:?}",
                    self.config.launch_timeout
                )))
            }
        }
    }

    /// Take and kill the session's current child, if any.
    async fn reap_child(&self, session_id: &SessionId) {
        let child = self
            .cells
            .get_mut(session_id)
            .and_then(|mut cell| cell.child.take());
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to kill worker");
            }
        }
    }

    async fn kill_quietly(child: &mut Option<Child>) {
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
        }
    }
}
