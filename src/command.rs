//! Typed commands from the UI layer
//!
//! The UI never hands the engine a closure to call back into. It sends one
//! of these, either directly through [`Engine::execute`](crate::engine::Engine::execute)
//! or as JSON decoded with serde.

use crate::node::{NodeId, NodeKind, ParamPatch};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    CreateNode {
        kind: NodeKind,
        #[serde(default)]
        params: ParamPatch,
    },
    RemoveNode {
        id: NodeId,
    },
    UpdateParams {
        id: NodeId,
        params: ParamPatch,
    },
    ToggleStep {
        id: NodeId,
        step: usize,
    },
    Connect {
        source: NodeId,
        target: NodeId,
    },
    Disconnect {
        source: NodeId,
        target: NodeId,
    },
    SetBpm {
        bpm: f64,
    },
    ToggleTransport {
        playing: bool,
    },
    Trigger {
        id: NodeId,
        level: f64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateNode { .. } => "createNode",
            Command::RemoveNode { .. } => "removeNode",
            Command::UpdateParams { .. } => "updateParams",
            Command::ToggleStep { .. } => "toggleStep",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::SetBpm { .. } => "setBpm",
            Command::ToggleTransport { .. } => "toggleTransport",
            Command::Trigger { .. } => "trigger",
        }
    }
}

/// What a successfully executed command produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum CommandOutput {
    Done,
    NodeCreated(NodeId),
    /// New state of the toggled step
    StepToggled(bool),
    /// Whether a matching edge existed
    Disconnected(bool),
    /// Tempo after clamping
    Bpm(f64),
    /// Whether the target had an envelope to fire
    Triggered(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Waveform;

    #[test]
    fn test_commands_decode_from_json() {
        let commands: Vec<Command> = serde_json::from_str(
            r#"[
                { "type": "createNode", "kind": "oscillator", "params": { "waveform": "square" } },
                { "type": "createNode", "kind": "gain" },
                { "type": "connect", "source": "oscillator-1", "target": "gain-2" },
                { "type": "setBpm", "bpm": 96 },
                { "type": "toggleTransport", "playing": true }
            ]"#,
        )
        .unwrap();

        assert_eq!(
            commands[0],
            Command::CreateNode {
                kind: NodeKind::Oscillator,
                params: ParamPatch::new().with_waveform(Waveform::Square),
            }
        );
        assert_eq!(
            commands[1],
            Command::CreateNode {
                kind: NodeKind::Gain,
                params: ParamPatch::new(),
            }
        );
        assert_eq!(commands[2].name(), "connect");
        assert_eq!(commands[3], Command::SetBpm { bpm: 96.0 });
        assert_eq!(commands[4], Command::ToggleTransport { playing: true });
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result =
            serde_json::from_str::<Command>(r#"{ "type": "createNode", "kind": "filter" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_output_encodes_tagged() {
        let json = serde_json::to_string(&CommandOutput::NodeCreated(NodeId::new("gain-2"))).unwrap();
        assert_eq!(json, r#"{"type":"nodeCreated","value":"gain-2"}"#);
    }
}
