//! A typed environment of services.

use alloc::sync::Arc;
use core::{
    any::{Any, TypeId},
    fmt,
};
use std::collections::HashMap;

type Services = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable map from service type to service instance. Adding a service produces a new
/// [Context]; existing holders are unaffected.
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<Services>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("services", &self.services.len()).finish()
    }
}

impl Context {
    /// The empty context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a context with `service` added, replacing any service of the same type.
    pub fn with<S: Send + Sync + 'static>(&self, service: S) -> Self {
        self.with_arc(Arc::new(service))
    }

    /// Like [Context::with], for a service that is already shared.
    pub fn with_arc<S: Send + Sync + 'static>(&self, service: Arc<S>) -> Self {
        let mut services = Services::clone(&self.services);
        services.insert(TypeId::of::<S>(), service);
        Self { services: Arc::new(services) }
    }

    /// Looks up a service by type.
    pub fn get<S: Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.services.get(&TypeId::of::<S>()).cloned().and_then(|s| s.downcast::<S>().ok())
    }

    /// Returns true if a service of type `S` is present.
    pub fn contains<S: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Returns the union of both contexts. Services in `other` win.
    pub fn merge(&self, other: &Self) -> Self {
        let mut services = Services::clone(&self.services);
        services.extend(other.services.iter().map(|(k, v)| (*k, Arc::clone(v))));
        Self { services: Arc::new(services) }
    }

    /// The number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true if the context holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    #[test]
    fn test_lookup_and_merge() {
        let base = Context::empty().with(Port(80)).with("name");
        assert_eq!(base.get::<Port>().as_deref(), Some(&Port(80)));
        assert_eq!(base.get::<u8>(), None);

        let merged = base.merge(&Context::empty().with(Port(443)));
        assert_eq!(merged.get::<Port>().as_deref(), Some(&Port(443)));
        assert_eq!(merged.get::<&str>().as_deref(), Some(&"name"));
        assert_eq!(base.get::<Port>().as_deref(), Some(&Port(80)));
        assert_eq!(merged.len(), 2);
    }
}
