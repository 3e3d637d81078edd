//! Typed listener registry and batch-completion latch.
//!
//! Listeners register against a strongly-typed contract instead of a
//! stringly-typed emitter: batch-shaped events hand out a
//! [`BatchCompletion`] the listener must resolve exactly once, and dispatch
//! allocates a latch sized to the listener count captured at emit time. The
//! pipeline advances only when every completion has been signalled; the
//! first error short-circuits the wait.
//!
//! The worker emits on snapshots taken out of the registry lock, so a
//! listener is free to register or remove listeners from inside its own
//! callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::batch::SubscriptionBatch;
use crate::error::{SubscriberError, SubscriptionError};

/// Handle to a registered listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The event families a listener can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Batch,
    AfterAcknowledgment,
    ConnectionRetry,
    Error,
    End,
}

/// Listener receiving a batch plus its completion handle.
pub type BatchListener<T> =
    Arc<dyn Fn(Arc<SubscriptionBatch<T>>, BatchCompletion) + Send + Sync>;
/// Listener observing a retryable error before the next reconnect attempt.
pub type ConnectionRetryListener = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
/// Listener observing the single fatal error of a worker, if any.
pub type ErrorListener = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
/// Listener observing worker termination; the error is the fatal one when
/// the worker did not end by disposal.
pub type EndListener = Arc<dyn Fn(Option<&SubscriptionError>) + Send + Sync>;

/// All listeners of one worker.
pub(crate) struct ListenerRegistry<T> {
    next_id: u64,
    batch: Vec<(ListenerId, BatchListener<T>)>,
    after_acknowledgment: Vec<(ListenerId, BatchListener<T>)>,
    connection_retry: Vec<(ListenerId, ConnectionRetryListener)>,
    error: Vec<(ListenerId, ErrorListener)>,
    end: Vec<(ListenerId, EndListener)>,
}

impl<T> ListenerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            batch: Vec::new(),
            after_acknowledgment: Vec::new(),
            connection_retry: Vec::new(),
            error: Vec::new(),
            end: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn add_batch(&mut self, listener: BatchListener<T>) -> ListenerId {
        let id = self.allocate_id();
        self.batch.push((id, listener));
        id
    }

    pub(crate) fn add_after_acknowledgment(&mut self, listener: BatchListener<T>) -> ListenerId {
        let id = self.allocate_id();
        self.after_acknowledgment.push((id, listener));
        id
    }

    pub(crate) fn add_connection_retry(
        &mut self,
        listener: ConnectionRetryListener,
    ) -> ListenerId {
        let id = self.allocate_id();
        self.connection_retry.push((id, listener));
        id
    }

    pub(crate) fn add_error(&mut self, listener: ErrorListener) -> ListenerId {
        let id = self.allocate_id();
        self.error.push((id, listener));
        id
    }

    pub(crate) fn add_end(&mut self, listener: EndListener) -> ListenerId {
        let id = self.allocate_id();
        self.end.push((id, listener));
        id
    }

    /// Remove one listener wherever it is registered.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.total();
        self.batch.retain(|(i, _)| *i != id);
        self.after_acknowledgment.retain(|(i, _)| *i != id);
        self.connection_retry.retain(|(i, _)| *i != id);
        self.error.retain(|(i, _)| *i != id);
        self.end.retain(|(i, _)| *i != id);
        before != self.total()
    }

    fn total(&self) -> usize {
        self.batch.len()
            + self.after_acknowledgment.len()
            + self.connection_retry.len()
            + self.error.len()
            + self.end.len()
    }

    /// Remove every listener of one kind, or all of them.
    pub(crate) fn remove_all(&mut self, kind: Option<EventKind>) {
        match kind {
            Some(EventKind::Batch) => self.batch.clear(),
            Some(EventKind::AfterAcknowledgment) => self.after_acknowledgment.clear(),
            Some(EventKind::ConnectionRetry) => self.connection_retry.clear(),
            Some(EventKind::Error) => self.error.clear(),
            Some(EventKind::End) => self.end.clear(),
            None => {
                self.batch.clear();
                self.after_acknowledgment.clear();
                self.connection_retry.clear();
                self.error.clear();
                self.end.clear();
            }
        }
    }

    pub(crate) fn snapshot_batch(&self) -> Vec<BatchListener<T>> {
        self.batch.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub(crate) fn snapshot_after_acknowledgment(&self) -> Vec<BatchListener<T>> {
        self.after_acknowledgment
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub(crate) fn snapshot_connection_retry(&self) -> Vec<ConnectionRetryListener> {
        self.connection_retry
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub(crate) fn snapshot_error(&self) -> Vec<ErrorListener> {
        self.error.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub(crate) fn snapshot_end(&self) -> Vec<EndListener> {
        self.end.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Hand a batch to every listener in the snapshot.
///
/// The latch is sized to the snapshot; it resolves once each listener's
/// completion has fired, or rejects on the first completion error.
pub(crate) fn dispatch_batch<T>(
    listeners: &[BatchListener<T>],
    batch: &Arc<SubscriptionBatch<T>>,
) -> Arc<CompletionLatch> {
    let latch = CompletionLatch::new(listeners.len());
    for listener in listeners {
        listener(Arc::clone(batch), BatchCompletion::new(Arc::clone(&latch)));
    }
    latch
}

/// Latch resolving once every completion handle has been signalled.
pub(crate) struct CompletionLatch {
    remaining: AtomicUsize,
    failure: Mutex<Option<SubscriberError>>,
    notify: Notify,
}

impl CompletionLatch {
    pub(crate) fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            failure: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    fn complete(&self, error: Option<SubscriberError>) {
        if let Some(error) = error {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn outcome(&self) -> Option<Result<(), SubscriberError>> {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(error) = failure.take() {
            return Some(Err(error));
        }
        if self.remaining.load(Ordering::Acquire) == 0 {
            return Some(Ok(()));
        }
        None
    }

    /// Wait until all completions have fired, or the first error arrives.
    pub(crate) async fn wait(&self) -> Result<(), SubscriberError> {
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// One listener's obligation to report the outcome of a batch.
///
/// Consuming `done`/`done_with_error` enforces the exactly-once contract. A
/// completion dropped unsignalled (listener panicked or bailed early) counts
/// as successful so a lost handle cannot wedge the pipeline.
pub struct BatchCompletion {
    latch: Arc<CompletionLatch>,
    signalled: bool,
}

impl BatchCompletion {
    fn new(latch: Arc<CompletionLatch>) -> Self {
        Self {
            latch,
            signalled: false,
        }
    }

    /// The batch was processed successfully.
    pub fn done(mut self) {
        self.signalled = true;
        self.latch.complete(None);
    }

    /// The batch failed; the worker applies its subscriber-error policy.
    pub fn done_with_error(mut self, error: impl Into<SubscriberError>) {
        self.signalled = true;
        self.latch.complete(Some(error.into()));
    }
}

impl Drop for BatchCompletion {
    fn drop(&mut self) {
        if !self.signalled {
            self.latch.complete(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeyProfile;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn sample_batch() -> Arc<SubscriptionBatch<serde_json::Value>> {
        let incoming = vec![json!({
            "name": "Arava",
            "@metadata": { "@id": "dogs/1", "@change-vector": "A:1" }
        })];
        Arc::new(
            SubscriptionBatch::initialize(incoming, KeyProfile::Documents, None).unwrap(),
        )
    }

    #[test]
    fn test_register_and_remove() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        let id = registry.add_batch(Arc::new(|_, completion| completion.done()));
        assert_eq!(registry.snapshot_batch().len(), 1);

        assert!(registry.remove(id));
        assert!(registry.snapshot_batch().is_empty());
        assert!(!registry.remove(id));
    }

    #[test]
    fn test_remove_all_by_kind() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        registry.add_batch(Arc::new(|_, completion| completion.done()));
        registry.add_connection_retry(Arc::new(|_| {}));

        registry.remove_all(Some(EventKind::Batch));
        assert!(registry.snapshot_batch().is_empty());
        assert_eq!(registry.snapshot_connection_retry().len(), 1);

        registry.remove_all(None);
        assert!(registry.snapshot_connection_retry().is_empty());
    }

    #[tokio::test]
    async fn test_latch_waits_for_every_listener() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            registry.add_batch(Arc::new(move |_, completion| {
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    completion.done();
                });
            }));
        }

        let latch = dispatch_batch(&registry.snapshot_batch(), &sample_batch());
        latch.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_latch_error_short_circuits() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        registry.add_batch(Arc::new(|_, completion| {
            completion.done_with_error("listener exploded")
        }));
        // Second listener never completes within the test window.
        registry.add_batch(Arc::new(|_, completion| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                completion.done();
            });
        }));

        let latch = dispatch_batch(&registry.snapshot_batch(), &sample_batch());
        let outcome = latch.wait().await;
        assert_eq!(outcome.unwrap_err().to_string(), "listener exploded");
    }

    #[tokio::test]
    async fn test_dropped_completion_counts_as_done() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        registry.add_batch(Arc::new(|_, completion| drop(completion)));

        let latch = dispatch_batch(&registry.snapshot_batch(), &sample_batch());
        latch.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_listeners_resolve_immediately() {
        let latch = dispatch_batch::<serde_json::Value>(&[], &sample_batch());
        latch.wait().await.unwrap();
    }

    #[test]
    fn test_snapshot_is_detached_from_registry() {
        let mut registry: ListenerRegistry<serde_json::Value> = ListenerRegistry::new();
        let id = registry.add_batch(Arc::new(|_, completion| completion.done()));

        let snapshot = registry.snapshot_batch();
        registry.remove(id);

        // The emit-time capture keeps the removed listener for this dispatch.
        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot_batch().is_empty());
    }
}
