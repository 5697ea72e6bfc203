//! Error taxonomy for engine operations.
//!
//! Every condition here is recoverable. Operations log the condition where it
//! is detected and hand it back to the caller, who is free to ignore it.

use crate::node::NodeId;
use thiserror::Error;

/// Errors returned by the engine's command surface
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The operation referenced an id that is not in the registry
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The Output node cannot be removed
    #[error("node {0} is protected and cannot be removed")]
    ProtectedNode(NodeId),

    /// A value could not be interpreted at all (numeric values are clamped instead)
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The operation needs a running audio backend
    #[error("audio engine has not been started")]
    EngineNotStarted,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EngineError {
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Failures of the audio subsystem, surfaced from `Engine::start`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no audio output device available")]
    NoDevice,

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    /// The backend went away before reporting readiness
    #[error("audio backend closed before it became ready")]
    Closed,
}
