//! Subscription worker - lifecycle facade, dispatch pipeline and reconnect
//! loop.
//!
//! The worker runs as one background task. Inside a connection it overlaps
//! two activities on that single task: reading the next batch from the
//! socket while the previous batch is still being processed and
//! acknowledged. Around the connection sits the reconnect controller, which
//! classifies every failure as fatal or retryable, tracks redirect targets,
//! and enforces the maximum erroneous window.
//!
//! # Example
//!
//! ```ignore
//! use docwire_client::{SubscriptionOptions, SubscriptionWorker};
//!
//! let options = SubscriptionOptions::builder("orders-feed").build()?;
//! let worker: SubscriptionWorker<Order> =
//!     SubscriptionWorker::builder("northwind", topology, options).build();
//!
//! worker.on_batch(|batch, completion| {
//!     for item in batch.items() {
//!         println!("{:?}", item.document());
//!     }
//!     completion.done();
//! });
//! worker.wait_for_shutdown().await;
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use tokio::io::{split, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ClientConfig;

use crate::batch::SubscriptionBatch;
use crate::error::{Result, SubscriptionError};
use crate::events::{
    dispatch_batch, BatchCompletion, CompletionLatch, EventKind, ListenerId, ListenerRegistry,
};
use crate::options::SubscriptionOptions;
use crate::protocol::{
    negotiate, write_json, AcknowledgeMessage, ConnectionStatus, DropMessage, JsonMessageStream,
    KeyProfile, NegotiationParams, ServerMessage, StatusData, SupportedFeatures,
};
use crate::topology::{TopologyNode, TopologyProvider};
use crate::transport::{self, ServerStream};

/// Lock helper that shrugs off poisoning; worker state stays usable even if
/// a listener panicked while holding nothing of ours.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mutable worker state; see the invariants on each field.
struct WorkerState {
    /// Monotonic false -> true, set by `dispose`.
    disposed: AtomicBool,
    /// Monotonic false -> true, set by `dispose` or a fatal classification.
    processing_cancelled: AtomicBool,
    /// Whether the background task was ever spawned.
    started: AtomicBool,
    /// Whether `end` has been emitted.
    ended: AtomicBool,
    /// Redirect target from the last `Redirect` status; cleared when
    /// contacting it fails.
    redirect_node: Mutex<Option<TopologyNode>>,
    /// Start of the current failure streak; `None` after an accepted
    /// connection.
    last_connection_failure: Mutex<Option<Instant>>,
    current_node_tag: Mutex<Option<String>>,
    supported_features: Mutex<Option<SupportedFeatures>>,
}

struct Shared<T> {
    database: String,
    options: SubscriptionOptions,
    profile: KeyProfile,
    topology: Arc<dyn TopologyProvider>,
    tls: Option<Arc<ClientConfig>>,
    listeners: Mutex<ListenerRegistry<T>>,
    state: WorkerState,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Shared<T> {
    fn is_cancelled(&self) -> bool {
        self.state.processing_cancelled.load(Ordering::Acquire)
    }

    fn emit_batch_event(&self, batch: &Arc<SubscriptionBatch<T>>) -> Arc<CompletionLatch> {
        let listeners = lock(&self.listeners).snapshot_batch();
        dispatch_batch(&listeners, batch)
    }

    fn emit_after_acknowledgment(&self, batch: &Arc<SubscriptionBatch<T>>) -> Arc<CompletionLatch> {
        let listeners = lock(&self.listeners).snapshot_after_acknowledgment();
        dispatch_batch(&listeners, batch)
    }

    fn emit_connection_retry(&self, error: &SubscriptionError) {
        let listeners = lock(&self.listeners).snapshot_connection_retry();
        for listener in listeners {
            listener(error);
        }
    }

    fn emit_error(&self, error: &SubscriptionError) {
        let listeners = lock(&self.listeners).snapshot_error();
        for listener in listeners {
            listener(error);
        }
    }

    fn emit_end_once(&self, error: Option<&SubscriptionError>) {
        if self.state.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = lock(&self.listeners).snapshot_end();
        for listener in listeners {
            listener(error);
        }
    }

    /// Shared dispose path for `dispose()` and `Drop`. Idempotent.
    fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state
            .processing_cancelled
            .store(true, Ordering::Release);
        let _ = self.cancel_tx.send(true);

        // Never started: there is no loop to emit `end` on exit.
        if !self.state.started.load(Ordering::Acquire) {
            self.emit_end_once(None);
        }
    }
}

/// Builder for a [`SubscriptionWorker`].
pub struct SubscriptionWorkerBuilder<T> {
    database: String,
    topology: Arc<dyn TopologyProvider>,
    options: SubscriptionOptions,
    tls: Option<Arc<ClientConfig>>,
    _doc: PhantomData<fn() -> T>,
}

impl<T: 'static> SubscriptionWorkerBuilder<T> {
    /// Provide the TLS configuration used for `tcp+tls` / `https` endpoints.
    pub fn tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Create the worker. The background task does not start until the
    /// first batch listener is registered.
    pub fn build(self) -> SubscriptionWorker<T> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let profile = KeyProfile::for_revisions(self.options.with_revisions);
        SubscriptionWorker {
            shared: Arc::new(Shared {
                database: self.database,
                options: self.options,
                profile,
                topology: self.topology,
                tls: self.tls,
                listeners: Mutex::new(ListenerRegistry::new()),
                state: WorkerState {
                    disposed: AtomicBool::new(false),
                    processing_cancelled: AtomicBool::new(false),
                    started: AtomicBool::new(false),
                    ended: AtomicBool::new(false),
                    redirect_node: Mutex::new(None),
                    last_connection_failure: Mutex::new(None),
                    current_node_tag: Mutex::new(None),
                    supported_features: Mutex::new(None),
                },
                cancel_tx,
                cancel_rx,
                task: Mutex::new(None),
            }),
        }
    }
}

/// Long-lived client for one named server-side subscription.
///
/// Dropping the worker disposes it.
pub struct SubscriptionWorker<T> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> SubscriptionWorker<T> {
    /// Start building a worker for `database` using validated `options`.
    pub fn builder(
        database: impl Into<String>,
        topology: Arc<dyn TopologyProvider>,
        options: SubscriptionOptions,
    ) -> SubscriptionWorkerBuilder<T> {
        SubscriptionWorkerBuilder {
            database: database.into(),
            topology,
            options,
            tls: None,
            _doc: PhantomData,
        }
    }

    /// Name of the subscription this worker serves.
    pub fn subscription_name(&self) -> &str {
        &self.shared.options.subscription_name
    }

    /// Tag of the last node a handshake completed against, if any.
    pub fn current_node_tag(&self) -> Option<String> {
        lock(&self.shared.state.current_node_tag).clone()
    }

    /// Outcome of the last protocol negotiation, if any.
    pub fn supported_features(&self) -> Option<SupportedFeatures> {
        *lock(&self.shared.state.supported_features)
    }

    /// Register a batch listener. The first registration starts the
    /// background task; must be called inside a tokio runtime.
    pub fn on_batch<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<SubscriptionBatch<T>>, BatchCompletion) + Send + Sync + 'static,
    {
        let id = lock(&self.shared.listeners).add_batch(Arc::new(listener));
        self.ensure_started();
        id
    }

    /// Register a listener for server-confirmed acknowledgements.
    pub fn on_after_acknowledgment<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<SubscriptionBatch<T>>, BatchCompletion) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).add_after_acknowledgment(Arc::new(listener))
    }

    /// Register a listener observing each retryable error before reconnect.
    pub fn on_connection_retry<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).add_connection_retry(Arc::new(listener))
    }

    /// Register a listener for the single fatal error, if one occurs.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).add_error(Arc::new(listener))
    }

    /// Register a listener for worker termination.
    pub fn on_end<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&SubscriptionError>) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).add_end(Arc::new(listener))
    }

    /// Remove a previously registered listener.
    pub fn off(&self, id: ListenerId) -> bool {
        lock(&self.shared.listeners).remove(id)
    }

    /// Remove every listener of `kind`, or all listeners.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        lock(&self.shared.listeners).remove_all(kind);
    }

    /// Stop the worker: cancel processing, end the socket and parser, and
    /// let the background task exit silently. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Wait until the background task has terminated.
    ///
    /// Returns immediately when the task never started.
    pub async fn wait_for_shutdown(&self) {
        let handle = lock(&self.shared.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn ensure_started(&self) {
        if self.shared.state.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.state.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run(shared));
        *lock(&self.shared.task) = Some(handle);
    }
}

impl<T> Drop for SubscriptionWorker<T> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

/// Background task body: the reconnect loop plus terminal event emission.
async fn run<T: 'static>(shared: Arc<Shared<T>>) {
    let outcome = run_loop(&shared).await;

    match &outcome {
        Err(error) if !shared.state.disposed.load(Ordering::Acquire) => {
            tracing::error!(
                subscription = %shared.options.subscription_name,
                error = %error,
                "subscription worker failed"
            );
            shared.emit_error(error);
            shared.emit_end_once(Some(error));
        }
        _ => shared.emit_end_once(None),
    }
}

/// The reconnect controller: wraps the connection pipeline, classifies its
/// failures and restarts it until cancelled or fatally broken.
async fn run_loop<T: 'static>(shared: &Arc<Shared<T>>) -> Result<()> {
    let mut cancel_rx = shared.cancel_rx.clone();

    loop {
        let error = match process_subscription(shared, &mut cancel_rx).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if shared.is_cancelled() {
            if shared.state.disposed.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(error);
        }

        let retry_error = classify_for_retry(shared, error).await?;

        tokio::select! {
            _ = wait_cancelled(&mut cancel_rx) => return Ok(()),
            _ = tokio::time::sleep(shared.options.time_to_wait_before_connection_retry) => {}
        }
        tracing::warn!(
            subscription = %shared.options.subscription_name,
            error = %retry_error,
            "retrying subscription connection"
        );
        shared.emit_connection_retry(&retry_error);
    }
}

/// Apply the fatal-vs-retry policy to one pipeline failure.
///
/// Returns the (possibly annotated) error to retry with, or `Err` when the
/// worker must stop. Every retryable classification runs the erroneous
/// window guard first.
async fn classify_for_retry<T>(
    shared: &Arc<Shared<T>>,
    error: SubscriptionError,
) -> Result<SubscriptionError> {
    if error.is_fatal() {
        shared
            .state
            .processing_cancelled
            .store(true, Ordering::Release);
        return Err(error);
    }

    if let Err(escalated) = record_connection_failure(shared) {
        shared
            .state
            .processing_cancelled
            .store(true, Ordering::Release);
        return Err(escalated);
    }

    let redirect_tag = match &error {
        SubscriptionError::DoesNotBelongToNode {
            appropriate_node: Some(tag),
            ..
        } => Some(tag.clone()),
        _ => None,
    };
    if let Some(tag) = redirect_tag {
        let nodes = match shared.topology.topology_nodes().await {
            Ok(nodes) => nodes,
            Err(topology_error) => {
                // Topology read failed; retry on the preferred node and let
                // the server redirect again.
                tracing::warn!(error = %topology_error, "topology lookup failed during redirect");
                return Ok(error);
            }
        };
        match nodes.into_iter().find(|node| node.cluster_tag == tag) {
            Some(node) => {
                tracing::debug!(tag = %node.cluster_tag, "redirecting subscription");
                *lock(&shared.state.redirect_node) = Some(node);
            }
            None => {
                shared
                    .state
                    .processing_cancelled
                    .store(true, Ordering::Release);
                return Err(SubscriptionError::InvalidOperation(format!(
                    "could not redirect subscription '{}' to node '{tag}': \
                     the node is not part of the current topology",
                    shared.options.subscription_name
                )));
            }
        }
    }

    Ok(error)
}

/// Erroneous-window guard: start the failure clock on the first failure of
/// a streak, escalate once the streak outlives `max_erroneous_period`.
fn record_connection_failure<T>(shared: &Shared<T>) -> Result<()> {
    let mut failure = lock(&shared.state.last_connection_failure);
    match *failure {
        None => {
            *failure = Some(Instant::now());
            Ok(())
        }
        Some(first_failure) => {
            if first_failure.elapsed() > shared.options.max_erroneous_period {
                Err(SubscriptionError::InvalidState(format!(
                    "subscription '{}' connections have been failing for longer than {:?}",
                    shared.options.subscription_name, shared.options.max_erroneous_period
                )))
            } else {
                Ok(())
            }
        }
    }
}

/// Change vector and completion latch of a dispatched-but-unacknowledged
/// batch.
struct PendingBatch {
    latch: Arc<CompletionLatch>,
    change_vector: Option<String>,
}

/// One connection iteration: contact, negotiate, then pump batches until
/// the connection dies or the worker is cancelled.
async fn process_subscription<T: 'static>(
    shared: &Arc<Shared<T>>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    if shared.is_cancelled() {
        return Ok(());
    }

    let redirect = lock(&shared.state.redirect_node).clone();
    let connection = match connect_to_server(shared, redirect.as_ref(), cancel_rx).await {
        Ok(Some(connection)) => connection,
        Ok(None) => return Ok(()),
        Err(error) => {
            // A redirect target we cannot contact is forgotten; the next
            // attempt goes back to the preferred node.
            if redirect.is_some() {
                *lock(&shared.state.redirect_node) = None;
            }
            return Err(error);
        }
    };
    let (mut reader, mut writer, features) = connection;

    let mut incoming: Vec<Value> = Vec::new();
    let mut last_emitted: Option<Arc<SubscriptionBatch<T>>> = None;
    let mut pending: Option<PendingBatch> = None;

    loop {
        if shared.is_cancelled() {
            break;
        }

        let read_result = match pending.take() {
            Some(previous) => {
                let mut ack_cancel = cancel_rx.clone();
                let read_fut = read_single_batch(
                    shared,
                    &mut reader,
                    &mut incoming,
                    &last_emitted,
                    cancel_rx,
                );
                let notify_fut =
                    finish_previous_batch(shared, previous, &mut writer, &mut ack_cancel);
                tokio::pin!(read_fut);
                tokio::pin!(notify_fut);

                // Drive both: the next read proceeds while the previous
                // batch completes. A processing failure tears the
                // connection down without waiting for the read.
                let mut early_read: Option<Result<Option<Vec<Value>>>> = None;
                let notified = loop {
                    tokio::select! {
                        outcome = &mut notify_fut => break outcome,
                        result = &mut read_fut, if early_read.is_none() => {
                            early_read = Some(result);
                        }
                    }
                };
                notified?;
                match early_read {
                    Some(result) => result,
                    None => read_fut.await,
                }
            }
            None => {
                read_single_batch(shared, &mut reader, &mut incoming, &last_emitted, cancel_rx)
                    .await
            }
        };

        let items = match read_result? {
            Some(items) => items,
            None => break,
        };

        let node_tag = lock(&shared.state.current_node_tag).clone();
        let batch = Arc::new(SubscriptionBatch::initialize(
            items,
            shared.profile,
            node_tag,
        )?);
        let change_vector = batch.last_received_change_vector().map(str::to_string);
        let latch = shared.emit_batch_event(&batch);
        pending = Some(PendingBatch {
            latch,
            change_vector,
        });
        last_emitted = Some(batch);
    }

    // Cancelled with a live negotiated connection: tell the server we are
    // leaving, best effort.
    if shared.state.disposed.load(Ordering::Acquire) {
        let drop_msg = DropMessage::new(
            &shared.database,
            features.protocol_version,
            "subscription worker disposed",
        );
        let _ = write_json(&mut writer, &drop_msg).await;
        let _ = writer.shutdown().await;
    }
    Ok(())
}

type Connection = (
    JsonMessageStream<ReadHalf<ServerStream>>,
    WriteHalf<ServerStream>,
    SupportedFeatures,
);

/// Resolve the TCP endpoint, open the transport and run the handshake.
///
/// `Ok(None)` means the worker was cancelled mid-connect.
async fn connect_to_server<T>(
    shared: &Arc<Shared<T>>,
    redirect: Option<&TopologyNode>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<Option<Connection>> {
    let destination_tag = redirect.map(|node| node.cluster_tag.as_str());
    let info = shared.topology.tcp_info(destination_tag).await?;

    let stream = transport::connect(&info.url, shared.tls.clone()).await?;
    let (read_half, mut write_half) = split(stream);
    let mut reader = JsonMessageStream::new(read_half);

    let params = NegotiationParams {
        database: &shared.database,
        options: &shared.options,
        destination_node_tag: destination_tag,
        destination_url: redirect.map(|node| node.url.as_str()),
        authorize_info: shared.topology.authorize_info(),
    };
    let features = tokio::select! {
        _ = wait_cancelled(cancel_rx) => return Ok(None),
        outcome = negotiate(&mut reader, &mut write_half, params) => outcome?,
    };

    let node_tag = info
        .requested_node
        .map(|node| node.cluster_tag)
        .or_else(|| destination_tag.map(str::to_string));
    *lock(&shared.state.current_node_tag) = node_tag;
    *lock(&shared.state.supported_features) = Some(features);

    Ok(Some((reader, write_half, features)))
}

/// Await the previous batch's listeners, then acknowledge it.
///
/// Subscriber errors are swallowed (logged) when `ignore_subscriber_errors`
/// is set; the acknowledgement is written either way, but never onto a
/// connection that is already being torn down.
async fn finish_previous_batch<T, W>(
    shared: &Shared<T>,
    previous: PendingBatch,
    writer: &mut W,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        _ = wait_cancelled(cancel_rx) => return Ok(()),
        outcome = previous.latch.wait() => outcome,
    };

    if let Err(subscriber_error) = outcome {
        if shared.options.ignore_subscriber_errors {
            tracing::warn!(
                subscription = %shared.options.subscription_name,
                error = %subscriber_error,
                "ignoring subscriber error"
            );
        } else {
            return Err(SubscriptionError::Subscriber(subscriber_error));
        }
    }

    if let Some(change_vector) = previous.change_vector {
        if !shared.is_cancelled() {
            write_json(writer, &AcknowledgeMessage::new(change_vector)).await?;
        }
    }
    Ok(())
}

/// Pump frames until one batch boundary.
///
/// `Data` accumulates into the reused buffer, `EndOfBatch` finalizes it,
/// a mid-stream `Confirm` truncates the in-flight buffer and fires
/// `after_acknowledgment` for the last delivered batch. Returns `Ok(None)`
/// when the worker was cancelled during the read.
async fn read_single_batch<T>(
    shared: &Shared<T>,
    reader: &mut JsonMessageStream<ReadHalf<ServerStream>>,
    incoming: &mut Vec<Value>,
    last_emitted: &Option<Arc<SubscriptionBatch<T>>>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<Value>>> {
    loop {
        let message = tokio::select! {
            _ = wait_cancelled(cancel_rx) => return Ok(None),
            message = reader.read::<ServerMessage>() => message,
        };
        let message = match message {
            Ok(message) => message,
            // Disposal closes the socket under us; that is not an error.
            Err(SubscriptionError::ConnectionTerminated) if shared.is_cancelled() => {
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        match message {
            ServerMessage::Data { payload } => incoming.push(payload),
            ServerMessage::EndOfBatch => return Ok(Some(std::mem::take(incoming))),
            ServerMessage::Confirm => {
                incoming.clear();
                if let Some(confirmed) = last_emitted {
                    let latch = shared.emit_after_acknowledgment(confirmed);
                    let outcome = tokio::select! {
                        _ = wait_cancelled(cancel_rx) => return Ok(None),
                        outcome = latch.wait() => outcome,
                    };
                    if let Err(listener_error) = outcome {
                        if shared.options.ignore_subscriber_errors {
                            tracing::warn!(
                                error = %listener_error,
                                "ignoring after-acknowledgment listener error"
                            );
                        } else {
                            return Err(SubscriptionError::Subscriber(listener_error));
                        }
                    }
                }
            }
            ServerMessage::ConnectionStatus {
                status,
                message,
                exception,
                data,
            } => assert_connection_status(shared, status, message, exception, data)?,
            ServerMessage::Error { exception, message } => {
                return Err(SubscriptionError::from_server_exception(
                    &exception,
                    message.as_deref().unwrap_or_default(),
                ));
            }
        }
    }
}

/// Interpret a `ConnectionStatus` frame; anything but `Accepted` ends the
/// iteration with a typed error for the reconnect controller.
fn assert_connection_status<T>(
    shared: &Shared<T>,
    status: ConnectionStatus,
    message: Option<String>,
    exception: Option<String>,
    data: Option<StatusData>,
) -> Result<()> {
    let detail = message.or(exception).unwrap_or_default();
    match status {
        ConnectionStatus::Accepted => {
            // First accepted status of a connection closes the erroneous
            // window.
            *lock(&shared.state.last_connection_failure) = None;
            tracing::debug!(
                subscription = %shared.options.subscription_name,
                "subscription connection accepted"
            );
            Ok(())
        }
        ConnectionStatus::InUse => Err(SubscriptionError::InUse(detail)),
        ConnectionStatus::Closed => Err(SubscriptionError::Closed(detail)),
        ConnectionStatus::Invalid => Err(SubscriptionError::InvalidState(detail)),
        ConnectionStatus::NotFound => Err(SubscriptionError::DoesNotExist(detail)),
        ConnectionStatus::Redirect => {
            let appropriate_node = data.and_then(|data| data.redirected_tag);
            Err(SubscriptionError::DoesNotBelongToNode {
                message: detail,
                appropriate_node,
            })
        }
        ConnectionStatus::ConcurrencyReconnect => {
            Err(SubscriptionError::ChangeVectorConcurrency(detail))
        }
    }
}

/// Resolve once the cancel flag is raised.
async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}
