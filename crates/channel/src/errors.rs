//! Defects raised by the channel executor.

use thiserror::Error;

/// An invariant violation detected while running a channel. These never surface as typed
/// failures; they are wrapped in [sluice_runtime::Cause::Die].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// A channel read from an upstream that had already completed.
    #[error("Read from an upstream that already completed")]
    UpstreamCompleted,
    /// A single-use value inside a channel description was run twice.
    #[error("Single-use channel value consumed twice")]
    ValueConsumed,
    /// A merged side asked for input after the merge had finished.
    #[error("Merge input closed")]
    MergeInputClosed,
    /// A required service was not provided.
    #[error("Missing service: {0}")]
    MissingService(&'static str),
    /// A background producer signalled its end without handing over its done value.
    #[error("Producer ended without a done value")]
    DoneMissing,
}
