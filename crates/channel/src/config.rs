//! Configuration for the buffering layer and the concurrent merge.

use crate::MergeStrategy;
use sluice_runtime::QueueStrategy;

/// Configures [crate::Channel::buffer_with].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferConfig {
    /// The queue capacity. `None` buffers without bound.
    pub capacity: Option<usize>,
    /// What happens to an element offered to a full buffer.
    pub strategy: QueueStrategy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: Some(16), strategy: QueueStrategy::BackPressure }
    }
}

/// Configures [crate::merge_all] and [crate::Channel::merge_map].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergeConfig {
    /// The maximum number of inner channels running at once.
    pub concurrency: usize,
    /// The capacity of the output buffer shared by the inner channels.
    pub buffer_size: usize,
    /// What happens to an element offered to a full output buffer.
    pub strategy: MergeStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { concurrency: 16, buffer_size: 16, strategy: MergeStrategy::BackPressure }
    }
}

impl MergeConfig {
    /// A config running at most `concurrency` inner channels with back-pressure.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency, ..Self::default() }
    }
}
