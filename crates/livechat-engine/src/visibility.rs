use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use livechat_core::events::Visibility;

/// Callback invoked on every visibility transition.
pub type VisibilityListener = Arc<dyn Fn(Visibility) + Send + Sync>;

/// Handle returned by [`VisibilityWatcher::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Normalizes raw host visibility reports into transitions and fans them out.
pub struct VisibilityWatcher {
    listeners: Mutex<Vec<(ListenerId, VisibilityListener)>>,
    current: Mutex<Visibility>,
    next_id: AtomicU64,
}

impl VisibilityWatcher {
    /// The host document is assumed visible until it reports otherwise.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            current: Mutex::new(Visibility::Visible),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: VisibilityListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        debug!(listener = %id, "visibility listener added");
        id
    }

    /// Unknown or already-removed ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;
        if removed {
            debug!(listener = %id, "visibility listener removed");
        }
        removed
    }

    /// Feed a raw report from the host. Returns how many listeners were invoked;
    /// a report that repeats the current state invokes none.
    pub fn notify(&self, hidden: bool) -> usize {
        let next = Visibility::from_hidden(hidden);
        {
            let mut current = self.current.lock();
            if *current == next {
                trace!(?next, "visibility unchanged");
                return 0;
            }
            *current = next;
        }

        // Invoke outside the lock so listeners may add/remove listeners.
        let snapshot: Vec<VisibilityListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &snapshot {
            listener(next);
        }
        snapshot.len()
    }

    pub fn current(&self) -> Visibility {
        *self.current.lock()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for VisibilityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (VisibilityListener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: VisibilityListener = Arc::new(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    #[test]
    fn transitions_only() {
        let watcher = VisibilityWatcher::new();
        let (listener, count) = counting();
        let _ = watcher.add_listener(listener);

        assert_eq!(watcher.notify(false), 0);
        assert_eq!(watcher.notify(true), 1);
        assert_eq!(watcher.notify(true), 0);
        assert_eq!(watcher.notify(false), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(watcher.current(), Visibility::Visible);
    }

    #[test]
    fn listener_receives_normalized_state() {
        let watcher = VisibilityWatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _ = watcher.add_listener(Arc::new(move |v| s.lock().push(v)));

        let _ = watcher.notify(true);
        let _ = watcher.notify(false);
        assert_eq!(*seen.lock(), vec![Visibility::Hidden, Visibility::Visible]);
    }

    #[test]
    fn removed_listener_is_not_invoked() {
        let watcher = VisibilityWatcher::new();
        let (listener, count) = counting();
        let id = watcher.add_listener(listener);

        assert!(watcher.remove_listener(id));
        let _ = watcher.notify(true);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.listener_count(), 0);
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let watcher = VisibilityWatcher::new();
        let (listener, _count) = counting();
        let id = watcher.add_listener(listener);

        assert!(watcher.remove_listener(id));
        assert!(!watcher.remove_listener(id));
        assert!(!watcher.remove_listener(ListenerId(999)));
        assert_eq!(watcher.listener_count(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let watcher = VisibilityWatcher::new();
        let (a, _) = counting();
        let (b, _) = counting();
        assert_ne!(watcher.add_listener(a), watcher.add_listener(b));
        assert_eq!(watcher.listener_count(), 2);
    }
}
