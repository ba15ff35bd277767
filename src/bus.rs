//! Long-poll wakeup bus.
//!
//! A process-wide registry of waiters keyed by stream path. Each waiter
//! holds a buffered single-slot channel; `notify` performs a non-blocking
//! send on every slot for the path and drops the signal when the slot is
//! already full, so one append produces at most one pending wakeup per
//! waiter no matter how many appends race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct LongPollBus {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    next_id: AtomicU64,
}

struct Waiter {
    id: u64,
    slot: mpsc::Sender<()>,
}

/// A registered wakeup slot. Deregisters on drop, so a caller dropped
/// mid-wait (a disconnected long-poll request) never leaks its slot.
pub struct WaiterGuard<'a> {
    bus: &'a LongPollBus,
    path: String,
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl WaiterGuard<'_> {
    /// Wait for the next wakeup on this slot.
    pub async fn notified(&mut self) {
        let _ = self.rx.recv().await;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.bus.unregister(&self.path, self.id);
    }
}

impl LongPollBus {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a wakeup slot for `path`.
    pub fn register(&self, path: &str) -> WaiterGuard<'_> {
        let (slot, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(Waiter { id, slot });
        WaiterGuard {
            bus: self,
            path: path.to_string(),
            id,
            rx,
        }
    }

    /// Wake every waiter registered for `path`.
    pub fn notify(&self, path: &str) {
        let waiters = self.waiters.lock();
        if let Some(list) = waiters.get(path) {
            for waiter in list {
                let _ = waiter.slot.try_send(());
            }
        }
    }

    /// Number of waiters currently registered for `path`.
    pub fn waiter_count(&self, path: &str) -> usize {
        self.waiters.lock().get(path).map_or(0, Vec::len)
    }

    fn unregister(&self, path: &str, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(path) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waiters.remove(path);
            }
        }
    }
}

impl Default for LongPollBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn notify_wakes_registered_waiter() {
        let bus = LongPollBus::new();
        let mut guard = bus.register("/s");
        bus.notify("/s");
        timeout(Duration::from_secs(1), guard.notified())
            .await
            .expect("waiter should wake");
    }

    #[tokio::test]
    async fn notify_on_other_path_does_not_wake() {
        let bus = LongPollBus::new();
        let mut guard = bus.register("/s");
        bus.notify("/other");
        assert!(timeout(Duration::from_millis(50), guard.notified())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_notifies_coalesce() {
        let bus = LongPollBus::new();
        let mut guard = bus.register("/s");
        bus.notify("/s");
        bus.notify("/s");
        bus.notify("/s");

        timeout(Duration::from_secs(1), guard.notified())
            .await
            .expect("first wakeup");
        // The slot held at most one pending signal.
        assert!(timeout(Duration::from_millis(50), guard.notified())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn every_waiter_on_a_path_wakes() {
        let bus = LongPollBus::new();
        let mut a = bus.register("/s");
        let mut b = bus.register("/s");
        assert_eq!(bus.waiter_count("/s"), 2);

        bus.notify("/s");
        timeout(Duration::from_secs(1), a.notified()).await.unwrap();
        timeout(Duration::from_secs(1), b.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_guard_unregisters() {
        let bus = LongPollBus::new();
        let guard = bus.register("/s");
        assert_eq!(bus.waiter_count("/s"), 1);
        drop(guard);
        assert_eq!(bus.waiter_count("/s"), 0);
        // Notifying an empty registry is fine.
        bus.notify("/s");
    }
}
