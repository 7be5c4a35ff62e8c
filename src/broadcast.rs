//! Fan-out of build progress to every client watching the same build.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A progress listener. Returning `Err` means the receiving side is gone
/// (e.g. a disconnected client); the broadcaster removes it.
pub type Listener = Arc<dyn Fn(&str, u8) -> anyhow::Result<()> + Send + Sync>;

/// Handle for deregistering a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Thread-safe multi-subscriber notifier for `(message, percent)` updates.
///
/// Listeners added mid-build receive all subsequent broadcasts; missed ones
/// are not replayed.
#[derive(Default)]
pub struct ProgressBroadcaster {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap();
        listeners.push((id, listener));
        log::debug!("added progress listener, total: {}", listeners.len());
        id
    }

    /// No-op if the listener was already removed.
    pub fn remove(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        log::debug!("removed progress listener, remaining: {}", listeners.len());
    }

    /// Deliver one update to every currently-registered listener.
    ///
    /// Iterates over a snapshot of the list, so the lock is never held
    /// across a listener call and listeners may add/remove concurrently. A
    /// listener that fails is removed without affecting delivery to the
    /// rest.
    pub fn broadcast(&self, message: &str, percent: u8) {
        let snapshot: Vec<(ListenerId, Listener)> = self.listeners.lock().unwrap().clone();

        let mut failed = Vec::new();
        for (id, listener) in &snapshot {
            if let Err(err) = listener(message, percent) {
                log::debug!("progress listener failed: {err:#}");
                failed.push(*id);
            }
        }

        if !failed.is_empty() {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.retain(|(id, _)| !failed.contains(id));
            log::debug!(
                "dropped {} dead listener(s), remaining: {}",
                failed.len(),
                listeners.len()
            );
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::{Listener, ProgressBroadcaster};

    fn recording(into: &Arc<Mutex<Vec<(String, u8)>>>) -> Listener {
        let into = into.clone();
        Arc::new(move |message: &str, percent| {
            into.lock().unwrap().push((message.to_owned(), percent));
            Ok(())
        })
    }

    #[test]
    fn delivers_to_all_listeners_in_order() {
        let broadcaster = ProgressBroadcaster::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        broadcaster.add(recording(&first));
        broadcaster.add(recording(&second));

        broadcaster.broadcast("load", 25);
        broadcaster.broadcast("build", 75);

        let expected = vec![("load".to_owned(), 25), ("build".to_owned(), 75)];
        assert_eq!(*first.lock().unwrap(), expected);
        assert_eq!(*second.lock().unwrap(), expected);
    }

    #[test]
    fn failing_listener_is_removed_without_aborting_broadcast() {
        let broadcaster = ProgressBroadcaster::new();
        let healthy = Arc::new(Mutex::new(Vec::new()));
        broadcaster.add(Arc::new(|_: &str, _: u8| Err(anyhow!("client gone"))));
        broadcaster.add(recording(&healthy));

        broadcaster.broadcast("load", 25);
        assert_eq!(broadcaster.listener_count(), 1);
        assert_eq!(*healthy.lock().unwrap(), vec![("load".to_owned(), 25)]);

        broadcaster.broadcast("build", 75);
        assert_eq!(healthy.lock().unwrap().len(), 2);
    }

    #[test]
    fn remove_is_a_noop_for_unknown_listener() {
        let broadcaster = ProgressBroadcaster::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let keep = broadcaster.add(recording(&events));
        let gone = broadcaster.add(recording(&events));
        broadcaster.remove(gone);
        broadcaster.remove(gone);
        assert_eq!(broadcaster.listener_count(), 1);

        broadcaster.remove(keep);
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn listener_may_reenter_the_broadcaster() {
        // broadcast iterates a snapshot without holding the lock, so a
        // listener adding another listener must not deadlock
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let reentrant = broadcaster.clone();
        broadcaster.add(Arc::new(move |_: &str, _: u8| {
            reentrant.add(Arc::new(|_: &str, _: u8| Ok(())));
            Ok(())
        }));

        broadcaster.broadcast("load", 10);
        assert_eq!(broadcaster.listener_count(), 2);
    }

    #[test]
    fn late_listener_sees_only_subsequent_broadcasts() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.broadcast("early", 5);

        let events = Arc::new(Mutex::new(Vec::new()));
        broadcaster.add(recording(&events));
        broadcaster.broadcast("late", 95);

        assert_eq!(*events.lock().unwrap(), vec![("late".to_owned(), 95)]);
    }
}
