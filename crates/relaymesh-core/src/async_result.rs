//! One-shot value that can be set from a callback and awaited elsewhere.
//!
//! Turns a reply callback into something a caller can await with a timeout.
//! The first `set` wins; later values are dropped.

use relaymesh_types::config::normalize_timeout;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// A cloneable one-shot result slot.
pub struct AsyncResult<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<T>>>>,
    rx: Arc<tokio::sync::Mutex<Option<oneshot::Receiver<T>>>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        }
    }

    /// Store the value. Returns `false` if a value was already set or the
    /// result was already consumed.
    pub fn set(&self, value: T) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// True once a value has been set.
    pub fn is_set(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Wait up to `timeout` for the value. Only the first successful wait
    /// receives it. A zero timeout means the default RPC timeout.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut()?;
        match tokio::time::timeout(normalize_timeout(timeout), rx).await {
            Ok(Ok(value)) => {
                guard.take();
                Some(value)
            }
            Ok(Err(_)) => {
                guard.take();
                None
            }
            Err(_) => None,
        }
    }
}

impl<T: Send + 'static> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_wait() {
        let ar = AsyncResult::new();
        assert!(!ar.is_set());
        assert!(ar.set(7));
        assert!(ar.is_set());
        assert_eq!(ar.wait(Duration::from_secs(1)).await, Some(7));
    }

    #[tokio::test]
    async fn test_first_set_wins() {
        let ar = AsyncResult::new();
        assert!(ar.set("first"));
        assert!(!ar.set("second"));
        assert_eq!(ar.wait(Duration::from_secs(1)).await, Some("first"));
    }

    #[tokio::test]
    async fn test_set_from_other_task() {
        let ar: AsyncResult<u32> = AsyncResult::new();
        let setter = ar.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set(42);
        });
        assert_eq!(ar.wait(Duration::from_secs(1)).await, Some(42));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_can_retry() {
        let ar: AsyncResult<u32> = AsyncResult::new();
        assert_eq!(ar.wait(Duration::from_millis(20)).await, None);
        ar.set(1);
        assert_eq!(ar.wait(Duration::from_millis(20)).await, Some(1));
        // Consumed
        assert_eq!(ar.wait(Duration::from_millis(20)).await, None);
    }
}
