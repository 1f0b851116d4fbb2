use serde::{Deserialize, Serialize};

/// Camera motion a control command drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Rotate,
    Pan,
    Zoom,
}

/// Direction of a control command. Zoom only accepts `In`/`Out`;
/// rotate and pan accept the four planar directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlDirection {
    Up,
    Down,
    Left,
    Right,
    In,
    Out,
}

/// Press/release edge of a held-button control.
/// `Start` begins a continuous motion, `Stop` ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlEdge {
    Start,
    Stop,
}

impl ControlAction {
    /// Whether `direction` is meaningful for this action.
    pub fn accepts(self, direction: ControlDirection) -> bool {
        match self {
            ControlAction::Zoom => {
                matches!(direction, ControlDirection::In | ControlDirection::Out)
            }
            ControlAction::Rotate | ControlAction::Pan => matches!(
                direction,
                ControlDirection::Up
                    | ControlDirection::Down
                    | ControlDirection::Left
                    | ControlDirection::Right
            ),
        }
    }
}

/// One camera-control instruction on an active session.
///
/// The wire field for the edge is `mode`, matching the client payload
/// (`{"action": "rotate", "direction": "left", "mode": "start"}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: ControlAction,
    pub direction: ControlDirection,
    #[serde(rename = "mode")]
    pub edge: ControlEdge,
}

impl ControlCommand {
    pub fn new(action: ControlAction, direction: ControlDirection, edge: ControlEdge) -> Self {
        Self {
            action,
            direction,
            edge,
        }
    }

    /// Whether the action/direction pair is well-formed.
    pub fn is_well_formed(&self) -> bool {
        self.action.accepts(self.direction)
    }

    /// The held-control key for this command, ignoring the edge.
    pub fn held_key(&self) -> (ControlAction, ControlDirection) {
        (self.action, self.direction)
    }

    /// The release command matching a held `(action, direction)` pair.
    pub fn release_of(key: (ControlAction, ControlDirection)) -> Self {
        Self {
            action: key.0,
            direction: key.1,
            edge: ControlEdge::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_only_accepts_in_out() {
        assert!(ControlAction::Zoom.accepts(ControlDirection::In));
        assert!(ControlAction::Zoom.accepts(ControlDirection::Out));
        assert!(!ControlAction::Zoom.accepts(ControlDirection::Up));
        assert!(!ControlAction::Zoom.accepts(ControlDirection::Left));
    }

    #[test]
    fn rotate_and_pan_accept_planar_directions_only() {
        for action in [ControlAction::Rotate, ControlAction::Pan] {
            for dir in [
                ControlDirection::Up,
                ControlDirection::Down,
                ControlDirection::Left,
                ControlDirection::Right,
            ] {
                assert!(action.accepts(dir));
            }
            assert!(!action.accepts(ControlDirection::In));
            assert!(!action.accepts(ControlDirection::Out));
        }
    }

    #[test]
    fn edge_field_serializes_as_mode() {
        let cmd = ControlCommand::new(
            ControlAction::Rotate,
            ControlDirection::Left,
            ControlEdge::Start,
        );
        let json = serde_json::to_value(cmd).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "rotate", "direction": "left", "mode": "start"})
        );
    }

    #[test]
    fn client_payload_deserializes() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"action":"zoom","direction":"in","mode":"stop"}"#).unwrap();
        assert_eq!(cmd.action, ControlAction::Zoom);
        assert_eq!(cmd.direction, ControlDirection::In);
        assert_eq!(cmd.edge, ControlEdge::Stop);
        assert!(cmd.is_well_formed());
    }

    #[test]
    fn release_of_held_key_is_stop_edge() {
        let release =
            ControlCommand::release_of((ControlAction::Pan, ControlDirection::Right));
        assert_eq!(release.edge, ControlEdge::Stop);
        assert_eq!(release.held_key(), (ControlAction::Pan, ControlDirection::Right));
    }
}
