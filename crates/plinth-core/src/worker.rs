use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use plinth_models::ControlCommand;

use crate::error::CoreError;
use crate::session::SessionId;

/// Instruction written to a worker, one JSON object per line on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerInput {
    Control(ControlCommand),
    Shutdown,
}

/// Event read from a worker, one JSON object per line on stdout.
/// `Exited` is synthesized locally when the event stream ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready { media_url: String },
    Heartbeat,
    Exited { detail: String },
}

/// A freshly launched worker, before the supervisor takes it apart:
/// the input sender feeds the control path, the event receiver feeds the
/// monitor, and the child (process workers only) is kept for teardown.
pub struct SpawnedWorker {
    pub input_tx: mpsc::UnboundedSender<WorkerInput>,
    pub events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    pub child: Option<Child>,
}

/// How render workers come into being.
///
/// Production spawns the configured renderer binary per session; tests and
/// embedded renderers bridge the same line protocol over channels.
pub enum WorkerLauncher {
    Process(ProcessLauncher),
    Bridged(BridgedLauncher),
}

impl WorkerLauncher {
    pub async fn launch(
        &self,
        session_id: &SessionId,
        asset_id: i64,
    ) -> Result<SpawnedWorker, CoreError> {
        match self {
            WorkerLauncher::Process(launcher) => launcher.spawn(session_id, asset_id),
            WorkerLauncher::Bridged(launcher) => launcher.bridge(session_id, asset_id),
        }
    }
}

/// Spawns the renderer binary with stdin/stdout piped to the JSON-line
/// protocol. The child is killed on drop, so a crashed server never leaks
/// renderer processes.
pub struct ProcessLauncher {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    fn spawn(&self, session_id: &SessionId, asset_id: i64) -> Result<SpawnedWorker, CoreError> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg("--session")
            .arg(session_id.as_str())
            .arg("--asset")
            .arg(asset_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::LaunchFailed(format!("spawn {:?}: {}", self.binary, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::LaunchFailed("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::LaunchFailed("worker stdout not piped".into()))?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<WorkerInput>();
        let writer_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let mut line = match serde_json::to_vec(&input) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(session_id = %writer_session, error = %e, "unencodable worker input");
                        continue;
                    }
                };
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() {
                    // Worker went away; the monitor sees it via the event stream.
                    break;
                }
            }
        });

        let (event_tx, events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let reader_session = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                session_id = %reader_session,
                                error = %e,
                                line,
                                "unparseable worker event line"
                            );
                        }
                    },
                    Ok(None) => {
                        let _ = event_tx.send(WorkerEvent::Exited {
                            detail: "stdout closed".into(),
                        });
                        break;
                    }
                    Err(e) => {
                        let _ = event_tx.send(WorkerEvent::Exited {
                            detail: e.to_string(),
                        });
                        break;
                    }
                }
            }
        });

        tracing::info!(
            session_id = %session_id,
            asset_id,
            pid = ?child.id(),
            "render worker spawned"
        );

        Ok(SpawnedWorker {
            input_tx,
            events_rx,
            child: Some(child),
        })
    }
}

/// The far end of a channel-bridged worker, handed to whoever drives it
/// (a test harness or an in-process renderer).
pub struct WorkerHarness {
    pub session_id: SessionId,
    pub asset_id: i64,
    pub inputs: mpsc::UnboundedReceiver<WorkerInput>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Hands out channel-bridged workers. Each launch delivers a
/// [`WorkerHarness`] on the receiver returned by [`BridgedLauncher::new`].
pub struct BridgedLauncher {
    harness_tx: mpsc::UnboundedSender<WorkerHarness>,
}

impl BridgedLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerHarness>) {
        let (harness_tx, harness_rx) = mpsc::unbounded_channel();
        (Self { harness_tx }, harness_rx)
    }

    fn bridge(&self, session_id: &SessionId, asset_id: i64) -> Result<SpawnedWorker, CoreError> {
        let (input_tx, inputs) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let harness = WorkerHarness {
            session_id: session_id.clone(),
            asset_id,
            inputs,
            events,
        };
        self.harness_tx
            .send(harness)
            .map_err(|_| CoreError::LaunchFailed("bridged worker driver is gone".into()))?;
        Ok(SpawnedWorker {
            input_tx,
            events_rx,
            child: None,
        })
    }
}

/// Locate the renderer binary: the configured path if it exists, then next
/// to our own executable, then a `bin/` subdirectory, then `$PATH`.
pub fn find_renderer_binary(configured: &str) -> Option<PathBuf> {
    let configured_path = PathBuf::from(configured);
    if configured_path.is_file() {
        return Some(configured_path);
    }

    let file_name = configured_path.file_name()?.to_owned();
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let candidate = exe_dir.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
            let candidate = exe_dir.join("bin").join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    which::which(&file_name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_models::{ControlAction, ControlDirection, ControlEdge};

    #[test]
    fn worker_input_wire_format() {
        let input = WorkerInput::Control(ControlCommand::new(
            ControlAction::Rotate,
            ControlDirection::Left,
            ControlEdge::Start,
        ));
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "command": "control",
                "action": "rotate",
                "direction": "left",
                "mode": "start",
            })
        );

        let shutdown = serde_json::to_value(WorkerInput::Shutdown).unwrap();
        assert_eq!(shutdown, serde_json::json!({"command": "shutdown"}));
    }

    #[test]
    fn worker_event_wire_format() {
        let event: WorkerEvent =
            serde_json::from_str(r#"{"event":"ready","media_url":"rtsp://127.0.0.1:8554/42"}"#)
                .unwrap();
        assert_eq!(
            event,
            WorkerEvent::Ready {
                media_url: "rtsp://127.0.0.1:8554/42".into()
            }
        );

        let hb: WorkerEvent = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(hb, WorkerEvent::Heartbeat);
    }

    #[tokio::test]
    async fn bridged_launch_round_trip() {
        let (launcher, mut harnesses) = BridgedLauncher::new();
        let launcher = WorkerLauncher::Bridged(launcher);
        let session_id = SessionId::new();

        let mut spawned = launcher.launch(&session_id, 42).await.unwrap();
        let mut harness = harnesses.recv().await.unwrap();
        assert_eq!(harness.session_id, session_id);
        assert_eq!(harness.asset_id, 42);

        harness
            .events
            .send(WorkerEvent::Ready {
                media_url: "rtsp://127.0.0.1:8554/42".into(),
            })
            .unwrap();
        assert_eq!(
            spawned.events_rx.recv().await.unwrap(),
            WorkerEvent::Ready {
                media_url: "rtsp://127.0.0.1:8554/42".into()
            }
        );

        spawned.input_tx.send(WorkerInput::Shutdown).unwrap();
        assert_eq!(harness.inputs.recv().await.unwrap(), WorkerInput::Shutdown);
    }

    #[tokio::test]
    async fn process_launch_reads_stdout_events() {
        let launcher = ProcessLauncher {
            binary: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                r#"printf '{"event":"ready","media_url":"rtsp://127.0.0.1:8554/7"}\n'"#.into(),
            ],
        };
        let session_id = SessionId::new();
        let mut spawned = launcher.spawn(&session_id, 7).unwrap();

        assert_eq!(
            spawned.events_rx.recv().await.unwrap(),
            WorkerEvent::Ready {
                media_url: "rtsp://127.0.0.1:8554/7".into()
            }
        );
        // Script exits after the single line; the reader synthesizes Exited.
        assert!(matches!(
            spawned.events_rx.recv().await.unwrap(),
            WorkerEvent::Exited { .. }
        ));
    }

    #[test]
    fn find_renderer_binary_falls_back_to_path_lookup() {
        // `sh` is on PATH everywhere these tests run.
        assert!(find_renderer_binary("sh").is_some());
        assert!(find_renderer_binary("/definitely/not/here/renderer-xyz").is_none());
    }
}
