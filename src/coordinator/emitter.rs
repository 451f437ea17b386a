//! Typed event emitter with explicit unsubscribe

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Listeners<T> = Mutex<Vec<(u64, Listener<T>)>>;

pub struct EventEmitter<T> {
    listeners: Arc<Listeners<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener. It stays registered until the returned
    /// [`Subscription`] is unsubscribed, even if the handle is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }

        let weak: Weak<Listeners<T>> = Arc::downgrade(&self.listeners);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    if let Ok(mut listeners) = listeners.lock() {
                        listeners.retain(|(other, _)| *other != id);
                    }
                }
            })),
        }
    }

    /// Call every listener with `event`; returns how many ran to completion.
    ///
    /// A panicking listener is logged and the rest still run.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return 0,
        };

        let mut completed = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(_) => error!("Update listener panicked"),
            }
        }
        completed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl<T: 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registered listener
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let emitter = EventEmitter::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            emitter.subscribe(move |n| {
                total.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }

        assert_eq!(emitter.emit(&2), 3);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe_removes_listener() {
        let emitter = EventEmitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let subscription = emitter.subscribe(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&());
        subscription.unsubscribe();
        emitter.emit(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let emitter = EventEmitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.subscribe(|_| panic!("listener failure"));
        let counted = calls.clone();
        emitter.subscribe(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(emitter.emit(&()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
