//! An append-only log shared between a test and the channels it runs.

use crate::{Source, Value};
use alloc::{format, string::String, vec::Vec};
use sluice_runtime::Ref;

/// Records events in the order they happen.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Ref<Vec<String>>);

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event`.
    pub fn record(&self, event: impl Into<String>) {
        let event = event.into();
        self.0.update(|events| events.push(event));
    }

    /// Returns the events recorded so far.
    pub fn events(&self) -> Vec<String> {
        self.0.get()
    }

    /// A channel that acquires the resource `name`, writes it, and releases it once its scope
    /// ends. Both steps are recorded as `acquire <name>` and `release <name>`.
    pub fn resource<E: Value>(&self, name: &'static str) -> Source<E, &'static str, ()> {
        let (acquired, released) = (self.clone(), self.clone());
        Source::acquire_release_out(
            move || {
                acquired.record(format!("acquire {name}"));
                async move { Ok(name) }
            },
            move |name, _| {
                released.record(format!("release {name}"));
                async {}
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resource_is_released_after_its_element() {
        let log = EventLog::new();
        let writer = log.clone();
        let channel = log.resource::<()>("db").concat_map(move |name| {
            writer.record(format!("use {name}"));
            Source::write(name)
        });
        let (elems, ()) = channel.run_collect().await.unwrap();
        assert_eq!(elems.into_vec(), ["db"]);
        assert_eq!(log.events(), ["acquire db", "use db", "release db"]);
    }
}
