//! Helpers for testing channels: a recorder for finalization order and a tracing layer that
//! collects emitted events.

mod events;
pub use events::EventLog;

mod tracing;
pub use tracing::{CollectingLayer, TraceStorage};
