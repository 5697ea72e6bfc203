//! Node identity, kinds and parameter schemas
//!
//! Each [`NodeKind`] has a fixed parameter set. Numeric values are clamped to
//! their documented range on the way in, so a UI control can never put the
//! engine into an invalid state.

use crate::error::EngineError;
use crate::param::ParamRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of steps in a sequencer pattern
pub const STEP_COUNT: usize = 16;

pub const FREQUENCY_RANGE: ParamRange = ParamRange::new(20.0, 2000.0);
pub const LEVEL_RANGE: ParamRange = ParamRange::new(0.0, 1.0);
pub const DELAY_TIME_RANGE: ParamRange = ParamRange::new(0.0, 1.0);
pub const FEEDBACK_RANGE: ParamRange = ParamRange::new(0.0, 0.9);
pub const BPM_RANGE: ParamRange = ParamRange::new(60.0, 200.0);

pub const DEFAULT_BPM: f64 = 120.0;

/// Stable identifier of a node in the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Id of the master output node, present for the lifetime of the engine
    pub const OUTPUT: &'static str = "output";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn output() -> Self {
        Self(Self::OUTPUT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_output(&self) -> bool {
        self.0 == Self::OUTPUT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

/// The closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Oscillator,
    Gain,
    Delay,
    Sequencer,
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Oscillator => "oscillator",
            NodeKind::Gain => "gain",
            NodeKind::Delay => "delay",
            NodeKind::Sequencer => "sequencer",
            NodeKind::Output => "output",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oscillator" => Ok(NodeKind::Oscillator),
            "gain" => Ok(NodeKind::Gain),
            "delay" => Ok(NodeKind::Delay),
            "sequencer" => Ok(NodeKind::Sequencer),
            "output" => Ok(NodeKind::Output),
            other => Err(EngineError::invalid_parameter(
                "kind",
                format!("unknown node kind '{other}'"),
            )),
        }
    }
}

/// Oscillator waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl FromStr for Waveform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "sawtooth" => Ok(Waveform::Sawtooth),
            "triangle" => Ok(Waveform::Triangle),
            other => Err(EngineError::invalid_parameter(
                "waveform",
                format!("unknown waveform '{other}'"),
            )),
        }
    }
}

/// A 16-step trigger pattern plus the step last reached by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPattern {
    steps: [bool; STEP_COUNT],
    current_step: usize,
}

impl StepPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: [bool; STEP_COUNT]) -> Self {
        Self {
            steps,
            current_step: 0,
        }
    }

    pub fn steps(&self) -> &[bool; STEP_COUNT] {
        &self.steps
    }

    pub fn is_active(&self, step: usize) -> bool {
        self.steps.get(step).copied().unwrap_or(false)
    }

    /// Flip a single step, returning its new state
    pub fn toggle(&mut self, step: usize) -> Result<bool, EngineError> {
        let slot = self.steps.get_mut(step).ok_or_else(|| {
            EngineError::invalid_parameter("step", format!("index {step} outside 0..{STEP_COUNT}"))
        })?;
        *slot = !*slot;
        Ok(*slot)
    }

    pub fn set_steps(&mut self, steps: [bool; STEP_COUNT]) {
        self.steps = steps;
    }

    /// Display-only position; triggering never reads it
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn set_current_step(&mut self, step: usize) {
        self.current_step = step % STEP_COUNT;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OscillatorParams {
    pub frequency: f64,
    pub waveform: Waveform,
}

impl Default for OscillatorParams {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            waveform: Waveform::Sine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainParams {
    pub level: f64,
    pub muted: bool,
}

impl GainParams {
    /// Level actually applied to the signal; muting overrides the stored level
    pub fn effective_level(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            self.level
        }
    }
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            level: 0.5,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayParams {
    pub delay_time: f64,
    pub feedback: f64,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            delay_time: 0.3,
            feedback: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencerParams {
    pub pattern: StepPattern,
    pub bpm: f64,
    pub is_playing: bool,
}

impl Default for SequencerParams {
    fn default() -> Self {
        Self {
            pattern: StepPattern::new(),
            bpm: DEFAULT_BPM,
            is_playing: false,
        }
    }
}

/// Stored parameter set of a node, tagged by kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeParams {
    Oscillator(OscillatorParams),
    Gain(GainParams),
    Delay(DelayParams),
    Sequencer(SequencerParams),
    Output,
}

/// A single parameter change that survived merging and clamping
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamChange {
    Frequency(f64),
    Waveform(Waveform),
    /// New effective gain (stored level, or 0 when muted)
    GainLevel(f64),
    DelayTime(f64),
    Feedback(f64),
    Steps([bool; STEP_COUNT]),
    Bpm(f64),
    Playing(bool),
}

impl NodeParams {
    pub fn defaults(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Oscillator => NodeParams::Oscillator(OscillatorParams::default()),
            NodeKind::Gain => NodeParams::Gain(GainParams::default()),
            NodeKind::Delay => NodeParams::Delay(DelayParams::default()),
            NodeKind::Sequencer => NodeParams::Sequencer(SequencerParams::default()),
            NodeKind::Output => NodeParams::Output,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeParams::Oscillator(_) => NodeKind::Oscillator,
            NodeParams::Gain(_) => NodeKind::Gain,
            NodeParams::Delay(_) => NodeKind::Delay,
            NodeParams::Sequencer(_) => NodeKind::Sequencer,
            NodeParams::Output => NodeKind::Output,
        }
    }

    pub fn pattern(&self) -> Option<&StepPattern> {
        match self {
            NodeParams::Sequencer(params) => Some(&params.pattern),
            _ => None,
        }
    }

    pub fn pattern_mut(&mut self) -> Option<&mut StepPattern> {
        match self {
            NodeParams::Sequencer(params) => Some(&mut params.pattern),
            _ => None,
        }
    }

    /// Merge a partial update, returning the fields whose value changed
    ///
    /// Fields that do not belong to this kind are ignored.
    pub fn merge(&mut self, patch: &ParamPatch) -> Vec<ParamChange> {
        let mut changes = Vec::new();

        match self {
            NodeParams::Oscillator(params) => {
                if let Some(frequency) = patch.frequency {
                    let frequency = clamp_logged("frequency", FREQUENCY_RANGE, frequency);
                    if frequency != params.frequency {
                        params.frequency = frequency;
                        changes.push(ParamChange::Frequency(frequency));
                    }
                }
                if let Some(waveform) = patch.waveform {
                    if waveform != params.waveform {
                        params.waveform = waveform;
                        changes.push(ParamChange::Waveform(waveform));
                    }
                }
            }
            NodeParams::Gain(params) => {
                let before = params.effective_level();
                if let Some(level) = patch.level {
                    params.level = clamp_logged("level", LEVEL_RANGE, level);
                }
                if let Some(muted) = patch.muted {
                    params.muted = muted;
                }
                let after = params.effective_level();
                if after != before {
                    changes.push(ParamChange::GainLevel(after));
                }
            }
            NodeParams::Delay(params) => {
                if let Some(delay_time) = patch.delay_time {
                    let delay_time = clamp_logged("delayTime", DELAY_TIME_RANGE, delay_time);
                    if delay_time != params.delay_time {
                        params.delay_time = delay_time;
                        changes.push(ParamChange::DelayTime(delay_time));
                    }
                }
                if let Some(feedback) = patch.feedback {
                    let feedback = clamp_logged("feedback", FEEDBACK_RANGE, feedback);
                    if feedback != params.feedback {
                        params.feedback = feedback;
                        changes.push(ParamChange::Feedback(feedback));
                    }
                }
            }
            NodeParams::Sequencer(params) => {
                if let Some(steps) = patch.steps {
                    if &steps != params.pattern.steps() {
                        params.pattern.set_steps(steps);
                        changes.push(ParamChange::Steps(steps));
                    }
                }
                if let Some(bpm) = patch.bpm {
                    let bpm = clamp_logged("bpm", BPM_RANGE, bpm);
                    if bpm != params.bpm {
                        params.bpm = bpm;
                        changes.push(ParamChange::Bpm(bpm));
                    }
                }
                if let Some(is_playing) = patch.is_playing {
                    if is_playing != params.is_playing {
                        params.is_playing = is_playing;
                        changes.push(ParamChange::Playing(is_playing));
                    }
                }
            }
            NodeParams::Output => {}
        }

        changes
    }
}

fn clamp_logged(name: &'static str, range: ParamRange, value: f64) -> f64 {
    let clamped = range.clamp(value);
    if clamped != value {
        tracing::debug!(param = name, value, clamped, "parameter outside range, clamped");
    }
    clamped
}

/// Partial parameter update, merged field by field into a node's parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParamPatch {
    pub frequency: Option<f64>,
    pub waveform: Option<Waveform>,
    pub level: Option<f64>,
    pub muted: Option<bool>,
    pub delay_time: Option<f64>,
    pub feedback: Option<f64>,
    pub steps: Option<[bool; STEP_COUNT]>,
    pub bpm: Option<f64>,
    pub is_playing: Option<bool>,
}

impl ParamPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = Some(waveform);
        self
    }

    pub fn with_level(mut self, level: f64) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = Some(muted);
        self
    }

    pub fn with_delay_time(mut self, delay_time: f64) -> Self {
        self.delay_time = Some(delay_time);
        self
    }

    pub fn with_feedback(mut self, feedback: f64) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_steps(mut self, steps: [bool; STEP_COUNT]) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = Some(bpm);
        self
    }

    pub fn with_playing(mut self, is_playing: bool) -> Self {
        self.is_playing = Some(is_playing);
        self
    }
}

/// A node as presented to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub params: NodeParams,
}
