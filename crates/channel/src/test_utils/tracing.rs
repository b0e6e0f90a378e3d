//! A subscriber layer for `tracing-subscriber` that collects events with their level and target.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;
use spin::Mutex;
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, Layer};

/// A collected event.
type Record = (Level, &'static str, String);

/// The storage for the collected events.
#[derive(Debug, Default, Clone)]
pub struct TraceStorage(pub Arc<Mutex<Vec<Record>>>);

impl TraceStorage {
    /// Returns the messages of the events at `level`.
    pub fn get_by_level(&self, level: Level) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    /// Returns the messages of the events logged under `target`.
    pub fn get_by_target(&self, target: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(_, t, _)| *t == target)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    /// Returns if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// A subscriber layer that collects events.
#[derive(Debug, Default)]
pub struct CollectingLayer {
    /// The storage for the collected events.
    pub storage: TraceStorage,
}

impl CollectingLayer {
    /// Creates a new collecting layer with the specified storage.
    pub const fn new(storage: TraceStorage) -> Self {
        Self { storage }
    }
}

/// Extracts the formatted `message` field of an event.
#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = alloc::format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CollectingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.storage.0.lock().push((*metadata.level(), metadata.target(), visitor.0));
    }
}
