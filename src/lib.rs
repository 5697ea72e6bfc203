//! # Tonegraph: Patchable Synth Engine
//!
//! `tonegraph` is the audio graph and transport engine behind a small modular
//! synthesizer. Oscillators, gain stages, delays, step sequencers and a
//! master output are wired together in a graph that can be mutated while it
//! plays, and a drift-free transport drives the sequencers in real time.
//!
//! ## Architecture
//!
//! - **Node Registry / Connection Table** ([`graph`]) - live nodes, directed edges and the render plan
//! - **Parameter Update Protocol** ([`node`], [`param`]) - clamped schemas and click-free ramps
//! - **Trigger/Envelope Unit** ([`unit`]) - attack/release pulses on gain nodes
//! - **Transport Scheduler** ([`transport`], [`scheduler`]) - absolute-deadline ticks on a dedicated thread
//! - **Engine** ([`engine`]) - the command surface the UI layer talks to
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tonegraph::prelude::*;
//!
//! # async fn run() -> Result<(), EngineError> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.start().await?;
//!
//! // A sequenced voice: oscillator -> gain -> output
//! let osc = engine.create_node(NodeKind::Oscillator, ParamPatch::new())?;
//! let vca = engine.create_node(NodeKind::Gain, ParamPatch::new())?;
//! let seq = engine.create_node(NodeKind::Sequencer, ParamPatch::new())?;
//! engine.connect(&osc, &vca)?;
//! engine.connect(&vca, &NodeId::output())?;
//! engine.connect(&seq, &vca)?;
//!
//! engine.toggle_step(&seq, 0)?;
//! engine.toggle_step(&seq, 8)?;
//! engine.set_bpm(128.0);
//! engine.toggle_transport(true)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod param;
pub mod scheduler;
pub mod transport;
pub mod unit;

/// Prelude module for convenient imports
pub mod prelude {
    // Engine surface
    pub use crate::command::{Command, CommandOutput};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder, WeakEngine};
    pub use crate::error::{BackendError, EngineError};

    // Graph
    pub use crate::graph::{Edge, Graph, SEQUENCER_TRIGGER_LEVEL};
    pub use crate::node::{
        DelayParams, GainParams, NodeId, NodeKind, NodeParams, NodeSnapshot, OscillatorParams,
        ParamChange, ParamPatch, SequencerParams, StepPattern, Waveform, STEP_COUNT,
    };
    pub use crate::param::{Param, ParamRange};
    pub use crate::unit::Unit;

    // Timing
    pub use crate::clock::{AudioClock, Clock, ManualClock, MonotonicClock};
    pub use crate::scheduler::CallbackId;
    pub use crate::transport::{Tick, Transport, TransportState};

    // Audio output
    pub use crate::backend::{AudioBackend, NullBackend, Renderer, StreamHandle};
    #[cfg(feature = "cpal")]
    pub use crate::backend::CpalBackend;
}

// Re-export key types at crate root for convenience
pub use prelude::*;
