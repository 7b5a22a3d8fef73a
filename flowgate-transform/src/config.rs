//! Pipeline configuration

use flowgate_core::QueuingStrategy;
use serde::{Deserialize, Serialize};

/// High-water marks for the two sides of a transform pipeline
///
/// Both sides count items. Use
/// [`TransformStream::with_strategies`](crate::TransformStream::with_strategies)
/// for size-weighted strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Items the input side queues before its writers see backpressure
    pub writable_high_water_mark: f64,

    /// Items the output side buffers before the input side is paused
    pub readable_high_water_mark: f64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            writable_high_water_mark: 1.0,
            readable_high_water_mark: 0.0,
        }
    }
}

impl TransformConfig {
    /// Parse a configuration from JSON, filling in defaults for missing keys
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub(crate) fn writable_strategy<I>(&self) -> QueuingStrategy<I> {
        QueuingStrategy::count(self.writable_high_water_mark)
    }

    pub(crate) fn readable_strategy<O>(&self) -> QueuingStrategy<O> {
        QueuingStrategy::count(self.readable_high_water_mark)
    }
}
