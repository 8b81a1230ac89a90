//! Correlation engine: matches asynchronous responses to pending requests.
//!
//! A caller opens a slot for a correlation ID before sending its request, then
//! either awaits the response ([`CorrelationEngine::wait_for_response`]) or
//! registers a callback ([`CorrelationEngine::wait_with_callback`]). The
//! transport that receives the response hands it to
//! [`CorrelationEngine::handle_response`].
//!
//! ```text
//!   open(cid) ──► slot { oneshot tx, oneshot rx }
//!
//!   handle_response(resp)            wait_for_response(cid)
//!     take tx, send resp ──────────►   take rx, await with timeout
//!                                      close(cid)
//! ```
//!
//! Delivery and claim are symmetric: whichever side arrives second completes
//! the handoff. A response delivered before anyone waits stays buffered in the
//! oneshot until its buffer timeout passes, after which the slot is abandoned.
//!
//! The slot map is guarded by one mutex with short critical sections. Waiting
//! always happens outside the lock.

use relaymesh_types::config::normalize_timeout;
use relaymesh_types::{MeshError, MeshResult, ResponseMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Upper bound on how long an unclaimed response stays buffered.
const MAX_BUFFER: Duration = Duration::from_secs(24 * 60 * 60);

/// A single pending correlation.
struct Slot {
    /// Distinguishes re-opened IDs so a finished waiter never closes a newer slot.
    generation: u64,
    /// Consumed by the first successful delivery.
    tx: Option<oneshot::Sender<ResponseMessage>>,
    /// Consumed by the first waiter.
    rx: Option<oneshot::Receiver<ResponseMessage>>,
    /// Set when a response was delivered before anyone claimed it.
    buffered_until: Option<Instant>,
}

impl Slot {
    fn is_abandoned(&self, now: Instant) -> bool {
        self.rx.is_some() && self.buffered_until.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_generation: u64,
}

impl Slots {
    fn reap_abandoned(&mut self) {
        let now = Instant::now();
        self.map.retain(|cid, slot| {
            let abandoned = slot.is_abandoned(now);
            if abandoned {
                warn!(correlation_id = %cid, "Buffered response was never claimed, dropping");
            }
            !abandoned
        });
    }
}

/// Thread-safe registry of pending request/response correlations.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone, Default)]
pub struct CorrelationEngine {
    slots: Arc<Mutex<Slots>>,
}

impl CorrelationEngine {
    /// Create an engine with no open slots.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a slot for `correlation_id`.
    ///
    /// # Panics
    ///
    /// Panics if the ID is already open. Replacing an open slot would hand its
    /// response to the wrong waiter.
    pub fn open(&self, correlation_id: &str) {
        if let Err(e) = self.try_open(correlation_id) {
            panic!("{e}");
        }
    }

    /// Open a slot, returning [`MeshError::DuplicateCorrelation`] if it is already open.
    pub fn try_open(&self, correlation_id: &str) -> MeshResult<()> {
        let mut slots = self.lock();
        slots.reap_abandoned();
        if slots.map.contains_key(correlation_id) {
            return Err(MeshError::DuplicateCorrelation(correlation_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.next_generation += 1;
        let generation = slots.next_generation;
        slots.map.insert(
            correlation_id.to_string(),
            Slot {
                generation,
                tx: Some(tx),
                rx: Some(rx),
                buffered_until: None,
            },
        );
        debug!(correlation_id, "Opened correlation slot");
        Ok(())
    }

    /// Deliver a response to its open slot.
    ///
    /// Returns `false` when the correlation ID was never opened, is already
    /// closed, or already received a response. That covers late and duplicate
    /// deliveries alike; they are logged and dropped, never treated as errors.
    ///
    /// If nobody is waiting yet, the response stays buffered for `timeout`,
    /// capped at one day.
    pub fn handle_response(&self, response: ResponseMessage, timeout: Duration) -> bool {
        let cid = response.correlation_id.clone();
        let mut slots = self.lock();
        let now = Instant::now();

        let Some(slot) = slots.map.get_mut(&cid) else {
            warn!(correlation_id = %cid, "Response for unknown or closed correlation ID dropped");
            return false;
        };
        if slot.is_abandoned(now) {
            slots.map.remove(&cid);
            warn!(correlation_id = %cid, "Response arrived after its slot expired, dropping");
            return false;
        }
        let Some(tx) = slot.tx.take() else {
            warn!(correlation_id = %cid, "Duplicate response dropped");
            return false;
        };
        if tx.send(response).is_err() {
            // The waiter went away between claim and delivery.
            debug!(correlation_id = %cid, "Waiter gone before delivery");
            return false;
        }
        if slot.rx.is_some() {
            let hold = normalize_timeout(timeout).min(MAX_BUFFER);
            slot.buffered_until = Some(now.checked_add(hold).unwrap_or(now));
        }
        debug!(correlation_id = %cid, "Response delivered");
        true
    }

    /// Take the receiving half of a slot, if the slot exists and is unclaimed.
    fn claim(&self, correlation_id: &str) -> Option<(oneshot::Receiver<ResponseMessage>, u64)> {
        let mut slots = self.lock();
        let now = Instant::now();
        let slot = slots.map.get_mut(correlation_id)?;
        if slot.is_abandoned(now) {
            slots.map.remove(correlation_id);
            warn!(correlation_id, "Buffered response expired before it was claimed");
            return None;
        }
        let generation = slot.generation;
        match slot.rx.take() {
            Some(rx) => Some((rx, generation)),
            None => {
                warn!(correlation_id, "Correlation ID already has a waiter");
                None
            }
        }
    }

    fn close_generation(&self, correlation_id: &str, generation: u64) {
        let mut slots = self.lock();
        if slots
            .map
            .get(correlation_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.map.remove(correlation_id);
        }
    }

    async fn await_claimed(
        &self,
        correlation_id: &str,
        rx: oneshot::Receiver<ResponseMessage>,
        generation: u64,
        timeout: Duration,
    ) -> Option<ResponseMessage> {
        let result = tokio::time::timeout(normalize_timeout(timeout), rx).await;
        self.close_generation(correlation_id, generation);
        match result {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => {
                debug!(correlation_id, "Correlation slot closed while waiting");
                None
            }
            Err(_) => {
                debug!(correlation_id, "Timed out waiting for response");
                None
            }
        }
    }

    /// Wait up to `timeout` for the response to `correlation_id`.
    ///
    /// Returns `None` on timeout, when the slot is closed while waiting, or
    /// immediately when the ID was never opened. The slot is closed afterwards.
    pub async fn wait_for_response(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Option<ResponseMessage> {
        let (rx, generation) = self.claim(correlation_id)?;
        self.await_claimed(correlation_id, rx, generation, timeout)
            .await
    }

    /// Invoke `callback` exactly once with the response, or `None` on timeout.
    ///
    /// Never blocks. The callback runs on a spawned Tokio task, so it may call
    /// back into this engine. Must be called from within a Tokio runtime.
    pub fn wait_with_callback<F>(&self, correlation_id: &str, timeout: Duration, callback: F)
    where
        F: FnOnce(Option<ResponseMessage>) + Send + 'static,
    {
        let claimed = self.claim(correlation_id);
        let engine = self.clone();
        let cid = correlation_id.to_string();
        tokio::spawn(async move {
            let response = match claimed {
                Some((rx, generation)) => engine.await_claimed(&cid, rx, generation, timeout).await,
                None => None,
            };
            callback(response);
        });
    }

    /// Release a slot without delivering a response. Idempotent.
    pub fn close(&self, correlation_id: &str) {
        if self.lock().map.remove(correlation_id).is_some() {
            debug!(correlation_id, "Closed correlation slot");
        }
    }

    /// Release every slot. Parked waiters return `None` immediately.
    pub fn close_all(&self) {
        let mut slots = self.lock();
        let count = slots.map.len();
        slots.map.clear();
        if count > 0 {
            debug!(count, "Closed all correlation slots");
        }
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        let mut slots = self.lock();
        slots.reap_abandoned();
        slots.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("open", &self.lock().map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_types::{Operation, RequestMessage};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SEC: Duration = Duration::from_secs(1);

    fn response_for(cid: &str) -> ResponseMessage {
        RequestMessage::new(Operation::ReadProperty, "t1", "temp", json!(null))
            .with_correlation_id(cid)
            .create_response(Ok(json!(21)))
    }

    #[tokio::test]
    async fn test_deliver_then_wait() {
        let engine = CorrelationEngine::new();
        engine.open("c1");
        assert!(engine.handle_response(response_for("c1"), SEC));
        let resp = engine.wait_for_response("c1", SEC).await.unwrap();
        assert_eq!(resp.correlation_id, "c1");
        assert_eq!(resp.output, json!(21));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_wait_then_deliver() {
        let engine = CorrelationEngine::new();
        engine.open("c2");
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.wait_for_response("c2", SEC).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.handle_response(response_for("c2"), SEC));
        let resp = waiter.await.unwrap();
        assert_eq!(resp.map(|r| r.correlation_id), Some("c2".to_string()));
    }

    #[tokio::test]
    async fn test_callback_registered_before_delivery() {
        let engine = CorrelationEngine::new();
        engine.open("c3");
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let calls_cb = calls.clone();
        engine.wait_with_callback("c3", SEC, move |resp| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(resp);
        });
        assert!(engine.handle_response(response_for("c3"), SEC));
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.correlation_id, "c3");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_callback_on_unopened_id_gets_none() {
        let engine = CorrelationEngine::new();
        let (tx, rx) = oneshot::channel();
        engine.wait_with_callback("nope", SEC, move |resp| {
            let _ = tx.send(resp);
        });
        assert!(rx.await.unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn test_double_open_panics() {
        let engine = CorrelationEngine::new();
        engine.open("dup");
        engine.open("dup");
    }

    #[test]
    fn test_try_open_reports_duplicate() {
        let engine = CorrelationEngine::new();
        engine.try_open("dup").unwrap();
        assert!(matches!(
            engine.try_open("dup"),
            Err(MeshError::DuplicateCorrelation(_))
        ));
        // Once closed the ID may be reused
        engine.close("dup");
        engine.try_open("dup").unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = CorrelationEngine::new();
        engine.close("never-opened");
        engine.open("c1");
        engine.close("c1");
        engine.close("c1");
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_unknown_and_duplicate_responses_unhandled() {
        let engine = CorrelationEngine::new();
        assert!(!engine.handle_response(response_for("ghost"), SEC));
        engine.open("c1");
        assert!(engine.handle_response(response_for("c1"), SEC));
        assert!(!engine.handle_response(response_for("c1"), SEC));
    }

    #[tokio::test]
    async fn test_exactly_once_under_concurrency() {
        let engine = CorrelationEngine::new();
        engine.open("race");
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.handle_response(response_for("race"), SEC) })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;
        let handled = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(handled, 1);
    }

    #[tokio::test]
    async fn test_wait_on_unopened_returns_immediately() {
        let engine = CorrelationEngine::new();
        let start = Instant::now();
        assert!(engine
            .wait_for_response("missing", Duration::from_secs(5))
            .await
            .is_none());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_timeout_accuracy() {
        let engine = CorrelationEngine::new();
        engine.open("slow");
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        assert!(engine.wait_for_response("slow", timeout).await.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
        // The timed-out slot is closed, so a late response is unhandled
        assert!(!engine.handle_response(response_for("slow"), SEC));
    }

    #[tokio::test]
    async fn test_close_all_releases_waiters() {
        let engine = CorrelationEngine::new();
        for i in 0..5 {
            engine.open(&format!("c{i}"));
        }
        assert_eq!(engine.len(), 5);

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let resp = engine.wait_for_response("c0", Duration::from_secs(10)).await;
                (resp, start.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.close_all();
        assert_eq!(engine.len(), 0);

        let (resp, elapsed) = waiter.await.unwrap();
        assert!(resp.is_none());
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_buffered_response_expires() {
        let engine = CorrelationEngine::new();
        engine.open("late");
        assert!(engine.handle_response(response_for("late"), Duration::from_millis(30)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(engine.wait_for_response("late", SEC).await.is_none());
        assert_eq!(engine.len(), 0);
    }

    #[tokio::test]
    async fn test_second_waiter_gets_nothing() {
        let engine = CorrelationEngine::new();
        engine.open("c1");
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.wait_for_response("c1", SEC).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine
            .wait_for_response("c1", Duration::from_millis(50))
            .await
            .is_none());
        assert!(engine.handle_response(response_for("c1"), SEC));
        assert!(first.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_huge_buffer_timeout_is_capped() {
        let engine = CorrelationEngine::new();
        engine.open("c2");
        assert!(engine.handle_response(response_for("c2"), Duration::MAX));
        assert_eq!(engine.len(), 1);
        let resp = engine.wait_for_response("c2", Duration::MAX).await.unwrap();
        assert_eq!(resp.output, json!(21));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_callback_timeout_fires_once_with_none() {
        let engine = CorrelationEngine::new();
        engine.open("quiet");
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        let start = Instant::now();
        engine.wait_with_callback("quiet", Duration::from_millis(50), move |resp| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(resp);
        });

        let resp = rx.await.unwrap();
        assert!(resp.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        // A response after the timeout neither reaches the callback nor a new waiter.
        assert!(!engine.handle_response(response_for("quiet"), SEC));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_releases_callback_waiter() {
        let engine = CorrelationEngine::new();
        engine.open("parked");
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        engine.wait_with_callback("parked", Duration::from_secs(10), move |resp| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(resp);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        engine.close_all();
        let resp = tokio::time::timeout(SEC, rx).await.unwrap().unwrap();
        assert!(resp.is_none());
        assert!(start.elapsed() < SEC);
        assert!(!engine.handle_response(response_for("parked"), SEC));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
