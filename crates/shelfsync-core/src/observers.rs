//! Observer registries
//!
//! Listeners are called in subscription order, outside of any lock held by
//! the registry, so a listener may safely call back into the core.
//! Dropping the returned [`Subscription`] unsubscribes.

use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Ordered set of callbacks for one event type
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
                    registry.listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver an event to every listener, in subscription order
    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = {
            let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle that keeps a listener registered
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe explicitly
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the registry
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_is_ordered() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            observers.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
        };
        let b = {
            let seen = seen.clone();
            observers.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
        };

        observers.emit(&1);
        observers.emit(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
        drop((a, b));
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let observers = Observers::<()>::new();
        let first = observers.subscribe(|_| {});
        let second = observers.subscribe(|_| {});
        assert_eq!(observers.len(), 2);

        first.unsubscribe();
        assert_eq!(observers.len(), 1);

        drop(second);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_detach_keeps_listener() {
        let observers = Observers::<()>::new();
        observers.subscribe(|_| {}).detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_listener_may_reenter_registry() {
        let observers = Arc::new(Observers::<u8>::new());
        let inner = observers.clone();
        let _sub = observers.subscribe(move |_| {
            // Would deadlock if emit held the registry lock
            assert_eq!(inner.len(), 1);
        });
        observers.emit(&0);
    }
}
