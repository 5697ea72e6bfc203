//! Engine configuration

use serde::{Deserialize, Serialize};

/// Configuration for an [`Engine`](crate::engine::Engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate used until a backend reports its own (default: 48000)
    pub sample_rate: f64,
    /// Output channel count for offline rendering (default: 2)
    pub channels: u16,
    /// Largest block the renderer processes under one graph lock (default: 512)
    pub block_size: usize,
    /// Step indices buffered per UI subscriber before new ones are dropped (default: 64)
    pub step_feed_capacity: usize,
    /// Name of the real-time transport thread
    pub transport_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            channels: 2,
            block_size: 512,
            step_feed_capacity: 64,
            transport_thread_name: "tonegraph-transport".to_string(),
        }
    }
}
