use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use plinth_models::{ControlAction, ControlCommand, ControlDirection, ControlEdge};

use crate::error::CoreError;
use crate::session::SessionId;
use crate::worker::WorkerInput;

type HeldKey = (ControlAction, ControlDirection);

struct SessionControl {
    /// Bounded FIFO into the pump task; one writer path per session.
    queue_tx: mpsc::Sender<ControlCommand>,
    /// Current worker input sender, shared with the pump task. Swapped in
    /// place on worker restart so the pump and the release path always
    /// target the live worker.
    worker_tx: Arc<Mutex<mpsc::UnboundedSender<WorkerInput>>>,
    /// Controls currently held down: a `start` edge with no `stop` yet.
    held: Mutex<HashSet<HeldKey>>,
    pump: JoinHandle<()>,
}

/// Low-latency command path between clients and render workers.
///
/// Commands for one session flow through a bounded queue consumed by a
/// dedicated pump task, so the worker observes them in `send` order. There
/// is no ordering relationship across sessions.
pub struct ControlChannel {
    sessions: DashMap<SessionId, SessionControl>,
    queue_depth: usize,
}

impl ControlChannel {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_depth,
        }
    }

    /// Install the FIFO queue and pump task for a session.
    pub fn attach(&self, session_id: &SessionId, worker_tx: mpsc::UnboundedSender<WorkerInput>) {
        let (queue_tx, mut queue_rx) = mpsc::channel::<ControlCommand>(self.queue_depth);
        let worker_tx = Arc::new(Mutex::new(worker_tx));
        let pump_session = session_id.clone();
        let pump_slot = Arc::clone(&worker_tx);
        let pump = tokio::spawn(async move {
            while let Some(cmd) = queue_rx.recv().await {
                // Re-read the slot per command: a worker restart swaps the
                // sender underneath us via `rebind`.
                let tx = pump_slot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if tx.send(WorkerInput::Control(cmd)).is_err() {
                    // Worker went away mid-stream; the supervisor notices
                    // through the event stream and handles the session.
                    tracing::debug!(session_id = %pump_session, "control pump: worker input closed");
                }
            }
        });

        self.sessions.insert(
            session_id.clone(),
            SessionControl {
                queue_tx,
                worker_tx,
                held: Mutex::new(HashSet::new()),
                pump,
            },
        );
        tracing::debug!(session_id = %session_id, "control channel attached");
    }

    /// Enqueue one command for the session's worker.
    ///
    /// A `stop` edge with no matching held `start` is absorbed silently —
    /// clients retransmit release edges and that must never error.
    pub fn send(&self, session_id: &SessionId, cmd: ControlCommand) -> Result<(), CoreError> {
        if !cmd.is_well_formed() {
            return Err(CoreError::InvalidCommand {
                action: cmd.action,
                direction: cmd.direction,
            });
        }

        let ctl = self
            .sessions
            .get(session_id)
            .ok_or(CoreError::SessionNotActive)?;

        {
            let mut held = ctl.held.lock().unwrap_or_else(|e| e.into_inner());
            match cmd.edge {
                ControlEdge::Start => {
                    held.insert(cmd.held_key());
                }
                ControlEdge::Stop => {
                    if !held.remove(&cmd.held_key()) {
                        tracing::trace!(
                            session_id = %session_id,
                            action = ?cmd.action,
                            direction = ?cmd.direction,
                            "unmatched stop edge ignored"
                        );
                        return Ok(());
                    }
                }
            }
        }

        ctl.queue_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(session_id = %session_id, "control queue full, dropping command");
                CoreError::Worker("control queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => CoreError::SessionNotActive,
        })
    }

    /// Point the session at a fresh worker after a restart and re-press any
    /// held controls so a mid-motion restart does not drop the motion.
    pub fn rebind(&self, session_id: &SessionId, worker_tx: mpsc::UnboundedSender<WorkerInput>) {
        let Some(ctl) = self.sessions.get(session_id) else {
            return;
        };

        let held = {
            let held = ctl.held.lock().unwrap_or_else(|e| e.into_inner());
            let mut keys: Vec<HeldKey> = held.iter().copied().collect();
            keys.sort();
            keys
        };
        for key in &held {
            let _ = worker_tx.send(WorkerInput::Control(ControlCommand::new(
                key.0,
                key.1,
                ControlEdge::Start,
            )));
        }
        if !held.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                held = held.len(),
                "re-pressed held controls on restarted worker"
            );
        }

        *ctl.worker_tx.lock().unwrap_or_else(|e| e.into_inner()) = worker_tx;
    }

    /// Tear the session's control path down.
    ///
    /// Queued and in-flight commands are discarded. With `release_held`,
    /// a `stop` edge is synthesized for every held control (in sorted
    /// order) so the worker is not left running a dangling motion; pass
    /// false when the worker is already dead.
    pub fn detach(&self, session_id: &SessionId, release_held: bool) {
        let Some((_, ctl)) = self.sessions.remove(session_id) else {
            return;
        };
        ctl.pump.abort();

        let mut held: Vec<HeldKey> = ctl
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        held.sort();

        if release_held && !held.is_empty() {
            let worker_tx = ctl.worker_tx.lock().unwrap_or_else(|e| e.into_inner());
            for key in &held {
                let _ = worker_tx.send(WorkerInput::Control(ControlCommand::release_of(*key)));
            }
            tracing::debug!(
                session_id = %session_id,
                released = held.len(),
                "implicit release of held controls"
            );
        }
        tracing::debug!(session_id = %session_id, "control channel detached");
    }

    pub fn is_attached(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn attached_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_models::ControlEdge;

    fn cmd(
        action: ControlAction,
        direction: ControlDirection,
        edge: ControlEdge,
    ) -> ControlCommand {
        ControlCommand::new(action, direction, edge)
    }

    fn attach_one(channel: &ControlChannel) -> (SessionId, mpsc::UnboundedReceiver<WorkerInput>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(&id, tx);
        (id, rx)
    }

    #[tokio::test]
    async fn commands_arrive_in_send_order() {
        let channel = ControlChannel::new(64);
        let (id, mut rx) = attach_one(&channel);

        let sent = vec![
            cmd(ControlAction::Rotate, ControlDirection::Left, ControlEdge::Start),
            cmd(ControlAction::Pan, ControlDirection::Up, ControlEdge::Start),
            cmd(ControlAction::Zoom, ControlDirection::In, ControlEdge::Start),
            cmd(ControlAction::Rotate, ControlDirection::Left, ControlEdge::Stop),
            cmd(ControlAction::Zoom, ControlDirection::In, ControlEdge::Stop),
            cmd(ControlAction::Pan, ControlDirection::Up, ControlEdge::Stop),
        ];
        for c in &sent {
            channel.send(&id, *c).unwrap();
        }

        for expected in sent {
            match rx.recv().await.unwrap() {
                WorkerInput::Control(got) => assert_eq!(got, expected),
                other => panic!("unexpected worker input: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn malformed_pair_is_rejected() {
        let channel = ControlChannel::new(8);
        let (id, _rx) = attach_one(&channel);

        let err = channel
            .send(
                &id,
                cmd(ControlAction::Zoom, ControlDirection::Up, ControlEdge::Start),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn send_to_unattached_session_is_not_active() {
        let channel = ControlChannel::new(8);
        let err = channel
            .send(
                &SessionId::new(),
                cmd(ControlAction::Pan, ControlDirection::Up, ControlEdge::Start),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionNotActive));
    }

    #[tokio::test]
    async fn unmatched_stop_is_silently_absorbed() {
        let channel = ControlChannel::new(8);
        let (id, mut rx) = attach_one(&channel);

        channel
            .send(
                &id,
                cmd(ControlAction::Rotate, ControlDirection::Up, ControlEdge::Stop),
            )
            .unwrap();

        // Nothing reached the worker; a subsequent start still flows.
        channel
            .send(
                &id,
                cmd(ControlAction::Rotate, ControlDirection::Up, ControlEdge::Start),
            )
            .unwrap();
        match rx.recv().await.unwrap() {
            WorkerInput::Control(got) => assert_eq!(got.edge, ControlEdge::Start),
            other => panic!("unexpected worker input: {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_releases_held_controls_in_order() {
        let channel = ControlChannel::new(8);
        let (id, mut rx) = attach_one(&channel);

        channel
            .send(
                &id,
                cmd(ControlAction::Zoom, ControlDirection::In, ControlEdge::Start),
            )
            .unwrap();
        channel
            .send(
                &id,
                cmd(ControlAction::Rotate, ControlDirection::Left, ControlEdge::Start),
            )
            .unwrap();
        // Held then released before detach: must not be re-released.
        channel
            .send(
                &id,
                cmd(ControlAction::Pan, ControlDirection::Up, ControlEdge::Start),
            )
            .unwrap();
        channel
            .send(
                &id,
                cmd(ControlAction::Pan, ControlDirection::Up, ControlEdge::Stop),
            )
            .unwrap();

        // Drain the explicit traffic first.
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }

        channel.detach(&id, true);

        let mut releases = Vec::new();
        while let Some(input) = rx.recv().await {
            match input {
                WorkerInput::Control(c) => releases.push(c),
                other => panic!("unexpected worker input: {other:?}"),
            }
        }
        assert_eq!(
            releases,
            vec![
                cmd(ControlAction::Rotate, ControlDirection::Left, ControlEdge::Stop),
                cmd(ControlAction::Zoom, ControlDirection::In, ControlEdge::Stop),
            ]
        );
        assert!(!channel.is_attached(&id));
    }

    #[tokio::test]
    async fn detach_without_release_sends_nothing() {
        let channel = ControlChannel::new(8);
        let (id, mut rx) = attach_one(&channel);

        channel
            .send(
                &id,
                cmd(ControlAction::Zoom, ControlDirection::Out, ControlEdge::Start),
            )
            .unwrap();
        rx.recv().await.unwrap();

        channel.detach(&id, false);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn rebind_represses_held_controls() {
        let channel = ControlChannel::new(8);
        let (id, mut old_rx) = attach_one(&channel);

        channel
            .send(
                &id,
                cmd(ControlAction::Rotate, ControlDirection::Right, ControlEdge::Start),
            )
            .unwrap();
        old_rx.recv().await.unwrap();

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        channel.rebind(&id, new_tx);

        match new_rx.recv().await.unwrap() {
            WorkerInput::Control(c) => {
                assert_eq!(
                    c,
                    cmd(ControlAction::Rotate, ControlDirection::Right, ControlEdge::Start)
                );
            }
            other => panic!("unexpected worker input: {other:?}"),
        }

        // Later traffic flows to the new worker only.
        channel
            .send(
                &id,
                cmd(ControlAction::Rotate, ControlDirection::Right, ControlEdge::Stop),
            )
            .unwrap();
        match new_rx.recv().await.unwrap() {
            WorkerInput::Control(c) => assert_eq!(c.edge, ControlEdge::Stop),
            other => panic!("unexpected worker input: {other:?}"),
        }
    }
}
