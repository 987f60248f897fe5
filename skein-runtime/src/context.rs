//! Fiber Context
//!
//! The environment an effect runs in: an immutable map from service type to
//! service value. A forked fiber starts with its parent's context, and
//! `provide_service` replaces it for the duration of one effect.
//!
//! Updating a context copies the map; the map itself is shared behind an
//! `Arc`, so handing the context to a child fiber is a reference-count bump.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A type-keyed map of services.
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context with `service` added, replacing any service of
    /// the same type.
    pub fn with<S: Send + Sync + 'static>(&self, service: S) -> Self {
        let mut services = (*self.services).clone();
        services.insert(TypeId::of::<S>(), Arc::new(service));
        Self {
            services: Arc::new(services),
        }
    }

    /// Look up a service by type.
    pub fn get<S: Send + Sync + 'static>(&self) -> Option<&S> {
        self.services.get(&TypeId::of::<S>())?.downcast_ref::<S>()
    }

    /// Check whether a service of type `S` is present.
    pub fn contains<S: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True if the context holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.services.len())
            .finish()
    }
}
