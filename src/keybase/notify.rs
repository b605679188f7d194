//! In-process wakeups for association long-polls.
//!
//! Each waiting handler registers a notifier under the association id.
//! Publishers snapshot the current set so no lock is held during send, and
//! sends are best-effort: the receiver also polls, so a dropped wakeup only
//! costs one poll interval.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

const NOTIFY_BUFFER: usize = 3;

/// Registry of long-poll listeners keyed by association id.
#[derive(Debug, Default)]
pub struct Notifier {
    listeners: Mutex<HashMap<String, HashMap<Uuid, mpsc::Sender<()>>>>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns its id and the wakeup channel.
    pub fn register(&self, token: &str) -> (Uuid, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        let id = Uuid::new_v4();
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.entry(token.to_string()).or_default().insert(id, tx);
        (id, rx)
    }

    /// Drop a listener, clearing the slot when it was the last one.
    pub fn unregister(&self, token: &str, id: Uuid) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(set) = listeners.get_mut(token) {
            set.remove(&id);
            if set.is_empty() {
                listeners.remove(token);
            }
        }
    }

    /// Wake every listener registered for the token.
    pub fn notify(&self, token: &str) {
        let snapshot: Vec<mpsc::Sender<()>> = {
            let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            listeners
                .get(token)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default()
        };

        for tx in snapshot {
            // Full buffer means a wakeup is already pending.
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Notifier;

    #[tokio::test]
    async fn notify_wakes_registered_listener() {
        let notifier = Notifier::new();
        let (_id, mut rx) = notifier.register("assoc-1");

        notifier.notify("assoc-1");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn notify_other_token_does_not_wake() {
        let notifier = Notifier::new();
        let (_id, mut rx) = notifier.register("assoc-1");

        notifier.notify("assoc-2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_listener() {
        let notifier = Notifier::new();
        let (id, mut rx) = notifier.register("assoc-1");
        notifier.unregister("assoc-1", id);

        notifier.notify("assoc-1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let notifier = Notifier::new();
        let (_id, mut rx) = notifier.register("assoc-1");

        for _ in 0..10 {
            notifier.notify("assoc-1");
        }
        // Buffered wakeups are capped; draining them all must not hang.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 3);
        assert!(received > 0);
    }

    #[tokio::test]
    async fn multiple_listeners_all_wake() {
        let notifier = Notifier::new();
        let (_a, mut rx_a) = notifier.register("assoc-1");
        let (_b, mut rx_b) = notifier.register("assoc-1");

        notifier.notify("assoc-1");
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }
}
