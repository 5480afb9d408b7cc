use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Registry for the "request was unauthorized" notification.
///
/// The client publishes into it on every 401 response; an auth layer
/// subscribes to it. Clones share the same listeners.
#[derive(Clone, Default)]
pub struct AuthEvents {
    inner: Arc<AuthEventsInner>,
}

#[derive(Default)]
struct AuthEventsInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// Token returned by [`AuthEvents::on_unauthorized`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener invoked once per unauthorized response.
    pub fn on_unauthorized<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("lock poisoned")
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.lock().expect("lock poisoned");
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id.0);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().expect("lock poisoned").len()
    }

    pub(crate) fn notify_unauthorized(&self) {
        // Snapshot so a listener may subscribe/unsubscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        #[cfg(feature = "tracing")]
        tracing::debug!(listeners = listeners.len(), "unauthorized response");
        for listener in listeners {
            listener();
        }
    }
}

impl fmt::Debug for AuthEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEvents")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn notifies_every_listener() {
        let events = AuthEvents::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            events.on_unauthorized(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        events.notify_unauthorized();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let events = AuthEvents::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = events.on_unauthorized(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        events.notify_unauthorized();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_listeners() {
        let events = AuthEvents::new();
        let shared = events.clone();
        events.on_unauthorized(|| {});
        assert_eq!(shared.listener_count(), 1);
    }
}
