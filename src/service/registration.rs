//! Scoped publication of a live service.
//!
//! At most one instance per type is published at a time. The registration
//! object owns the publication; dropping it withdraws the service.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{Error, Result};

type Registry = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

#[must_use = "the service is withdrawn when the registration is dropped"]
pub struct ServiceRegistration<T: Send + Sync + 'static> {
    _published: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ServiceRegistration<T> {
    /// Publish `service`. Fails if another `T` is already published.
    pub fn publish(service: Arc<T>) -> Result<Self> {
        let mut registry = registry().write();
        let key = TypeId::of::<T>();
        if registry.contains_key(&key) {
            return Err(Error::InvalidServiceState {
                action: "publish",
                state: "already published",
            });
        }
        registry.insert(key, service);
        Ok(Self {
            _published: PhantomData,
        })
    }

    /// The currently published `T`, if any.
    pub fn current() -> Option<Arc<T>> {
        let service = registry().read().get(&TypeId::of::<T>())?.clone();
        service.downcast::<T>().ok()
    }
}

impl<T: Send + Sync + 'static> Drop for ServiceRegistration<T> {
    fn drop(&mut self) {
        registry().write().remove(&TypeId::of::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Registered(u32);

    #[test]
    fn test_publish_scope() {
        assert!(ServiceRegistration::<Registered>::current().is_none());
        {
            let _registration = ServiceRegistration::publish(Arc::new(Registered(7))).unwrap();
            assert_eq!(ServiceRegistration::<Registered>::current().unwrap().0, 7);
            assert!(ServiceRegistration::publish(Arc::new(Registered(8))).is_err());
        }
        assert!(ServiceRegistration::<Registered>::current().is_none());
    }
}
