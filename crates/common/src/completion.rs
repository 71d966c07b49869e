//! One-shot, multi-observer completion signal.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// A value that is produced exactly once and awaited by any number of tasks.
///
/// Cloning yields another handle to the same signal. The first `complete`
/// wins; later calls are ignored. Waiters registered before or after
/// completion all observe the same value.
pub struct Completion<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);

        Self { tx: Arc::new(tx) }
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl<T: Clone> Completion<T> {
    /// Publish the value. Returns whether this call was the one that
    /// completed the signal.
    pub fn complete(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }

            *slot = Some(value);
            true
        })
    }

    /// Value if already complete.
    pub fn try_get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the value is published.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();

        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }

            // The sender lives inside `self`, so the channel cannot close
            // while we hold a handle.
            let _ = rx.changed().await;
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_completion_wins() {
        let signal = Completion::new();

        assert!(signal.complete(1));
        assert!(!signal.complete(2));

        assert_eq!(signal.try_get(), Some(1));
        assert_eq!(signal.wait().await, 1);
    }

    #[tokio::test]
    async fn waiters_before_and_after_completion_see_the_value() {
        let signal = Completion::new();

        let early = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.complete("done");

        assert_eq!(early.await.unwrap(), "done");
        assert_eq!(signal.wait().await, "done");
    }
}
