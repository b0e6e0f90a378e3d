//! Error types for the runtime primitives.

use thiserror::Error;

/// An error returned by [crate::Queue] and [crate::Hub] operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was shut down before or during the operation.
    #[error("Queue has been shut down")]
    Shutdown,
}

/// A [Result] type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
