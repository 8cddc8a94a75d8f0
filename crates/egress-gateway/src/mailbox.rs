//! Single-slot hand-off where the newest value wins.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Holds at most one pending value. Posting while a value is pending replaces
/// it; the receiver only ever sees the latest value.
#[derive(Debug, Default)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Stores `value`, returning the value it displaced, if any.
    pub fn post(&self, value: T) -> Option<T> {
        let displaced = self.slot.lock().replace(value);
        self.notify.notify_one();
        displaced
    }

    /// Takes the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Waits for a value to be posted and takes it.
    ///
    /// Cancel safe: a value is only removed from the slot when this future
    /// completes.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_newest_value_wins() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.post(1), None);
        assert_eq!(mailbox.post(2), Some(1));
        assert_eq!(mailbox.try_take(), Some(2));
        assert_eq!(mailbox.try_take(), None);
    }

    #[tokio::test]
    async fn test_recv_returns_pending_value() {
        let mailbox = Mailbox::new();
        mailbox.post("snapshot");
        assert_eq!(mailbox.recv().await, "snapshot");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_post() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.post(3);
        mailbox.post(4);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Either the waiter woke between the two posts or it sees only the newest.
        assert!(got == 3 || got == 4);
        if got == 3 {
            assert_eq!(mailbox.try_take(), Some(4));
        }
    }
}
