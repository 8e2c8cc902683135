use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::batch::BatchQueue;
use crate::client::{ClientError, StreamClient};
use crate::record::{clamp_text, OversizeError, StreamRecord};
use crate::worker::DeliveryLoop;

/// What to do with undelivered batches when the queue is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Keep the delivery loop running until the queue drains or a fatal
    /// error occurs.
    Drain,
    /// Stop immediately; queued batches are dropped and their completions
    /// fail with [`DeliveryError::Abandoned`].
    Abandon,
}

/// Non-fatal condition reported to the owner through the error callback.
///
/// Every retryable, overrun, truncation and partial-rejection condition is
/// reported through this enum; none of them stops delivery.
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("record of {len} bytes exceeded the {max} byte limit and was truncated")]
    MessageTooLong { len: usize, max: usize },

    #[error("queue is full ({max_batches} batches queued), dropping records until it drains")]
    QueueFull { max_batches: usize },

    #[error("provisioning failed, will retry: {0}")]
    Provision(ClientError),

    #[error("delivery failed, will retry: {0}")]
    Delivery(ClientError),

    #[error("service rejected part of an accepted batch")]
    PartialRejection,
}

/// Error returned by [`StreamQueue::enqueue`] when a record is not admitted.
#[derive(thiserror::Error, Debug)]
pub enum EnqueueError {
    #[error("queue is already closed")]
    Closed,

    #[error(transparent)]
    TooLong(#[from] OversizeError),

    #[error("queue is full")]
    Full,
}

/// Terminal failure for a record or flush that will never complete.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery stopped by a fatal sink error: {0}")]
    Fatal(ClientError),

    #[error("queue was closed before the record was delivered")]
    Abandoned,
}

/// Callback invoked for every non-fatal condition. Must not panic.
pub type ErrorCallback = Arc<dyn Fn(&QueueError) + Send + Sync>;

/// Callback invoked exactly once when delivery stops permanently.
pub type FatalCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Configuration for a [`StreamQueue`].
///
/// Minimal thresholds are enforced on the send interval and queue depth to
/// avoid degenerate configurations; the interval is also the pacing
/// mechanism against the service's rate limit and must not be set below it.
#[derive(Clone)]
pub struct QueueConfig {
    /// Destination group name on the service.
    pub group: String,
    /// Destination stream name inside the group.
    pub stream: String,
    /// Create the group before the first send if it does not exist.
    pub create_group: bool,
    /// Create the stream before the first send if it does not exist.
    pub create_stream: bool,
    /// Fixed interval between delivery attempts.
    pub send_interval: Duration,
    /// Maximum number of queued batches; one slot is reserved for the
    /// overrun marker.
    pub max_queued_batches: usize,
    /// Appended to records cut down to the per-record byte limit. Empty
    /// disables truncation and oversized records are rejected instead.
    pub truncate_suffix: String,
    /// Substituted for the first record rejected during a queue overrun,
    /// so the loss is visible in the stream itself. `None` disables the
    /// marker and overrun records are rejected outright.
    pub overrun_marker: Option<String>,
    /// What happens to queued batches on [`StreamQueue::close`].
    pub close_policy: ClosePolicy,
    /// Non-fatal error callback; falls back to stderr when unset.
    pub on_error: Option<ErrorCallback>,
    /// Fatal error callback; falls back to stderr when unset.
    pub on_fatal: Option<FatalCallback>,
}

impl QueueConfig {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        QueueConfig {
            group: group.into(),
            stream: stream.into(),
            create_group: true,
            create_stream: true,
            send_interval: Duration::from_millis(200),
            max_queued_batches: 64,
            truncate_suffix: " [TRUNCATED]".to_string(),
            overrun_marker: Some(
                "log queue overrun: records are being dropped until the queue drains".to_string(),
            ),
            close_policy: ClosePolicy::Drain,
            on_error: None,
            on_fatal: None,
        }
    }

    // Enforce minimal thresholds to avoid degenerate configs.
    pub(crate) fn validated(mut self) -> Self {
        if self.send_interval < Duration::from_millis(20) {
            self.send_interval = Duration::from_millis(20);
        }
        self.max_queued_batches = self.max_queued_batches.max(2);
        self
    }

    pub(crate) fn report(&self, err: &QueueError) {
        match &self.on_error {
            Some(callback) => callback(err),
            None => eprintln!("tracing-stream-sink: {err}"),
        }
    }

    pub(crate) fn report_fatal(&self, err: &ClientError) {
        match &self.on_fatal {
            Some(callback) => callback(err),
            None => eprintln!("tracing-stream-sink: stopping delivery: {err}"),
        }
    }
}

pub(crate) struct QueueState {
    pub(crate) batches: BatchQueue,
    pub(crate) flush_waiters: Vec<oneshot::Sender<Result<(), DeliveryError>>>,
    pub(crate) overrun: bool,
    pub(crate) closed: bool,
    pub(crate) stopped: bool,
    pub(crate) fatal: Option<ClientError>,
}

/// State shared between the queue handle and the delivery loop. The mutex
/// is held only for short in-memory mutation, never across a remote call.
pub(crate) struct Shared {
    state: Mutex<QueueState>,
    pub(crate) wake: Notify,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Shared {
            state: Mutex::new(QueueState {
                batches: BatchQueue::new(),
                flush_waiters: Vec::new(),
                overrun: false,
                closed: false,
                stopped: false,
                fatal: None,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state lock poisoned")
    }

    /// The drain check: when the queue is empty, end the overrun episode
    /// and resolve every pending flush waiter. Run by the delivery loop at
    /// the start of each tick and by `flush` right after registration.
    pub(crate) fn notify_if_drained(&self) {
        let waiters = {
            let mut st = self.lock();
            if !st.batches.is_empty() {
                return;
            }
            st.overrun = false;
            std::mem::take(&mut st.flush_waiters)
        };
        for waiter in waiters {
            // A dropped receiver must not affect the others.
            let _ = waiter.send(Ok(()));
        }
    }
}

/// Completion handle returned by [`StreamQueue::enqueue`].
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<Result<(), DeliveryError>>,
}

impl DeliveryReceipt {
    /// Resolves once the record's batch, and every batch ahead of it, has
    /// been durably accepted by the service.
    pub async fn wait(self) -> Result<(), DeliveryError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Abandoned),
        }
    }
}

/// Handle to the batching/retry queue. Cheap to clone; all clones share the
/// same queue and background delivery loop.
#[derive(Clone)]
pub struct StreamQueue {
    pub(crate) shared: Arc<Shared>,
    pub(crate) config: Arc<QueueConfig>,
}

impl StreamQueue {
    /// Create the queue and spawn its delivery loop on the current Tokio
    /// runtime.
    ///
    /// **Parameters**
    /// - `client`: transport for the remote log-stream service.
    /// - `config`: queue behavior; see [`QueueConfig`].
    ///
    /// **Returns**
    /// - The cloneable queue handle and the join handle of the background
    ///   task, which finishes after [`StreamQueue::close`] or a fatal error.
    pub fn spawn(
        client: Arc<dyn StreamClient>,
        config: QueueConfig,
    ) -> (StreamQueue, JoinHandle<()>) {
        let config = Arc::new(config.validated());
        let shared = Arc::new(Shared::new());
        let worker = DeliveryLoop::new(client, Arc::clone(&shared), Arc::clone(&config));
        let handle = tokio::spawn(worker.run());
        (StreamQueue { shared, config }, handle)
    }

    /// Admit a record stamped with the current wall-clock time.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<DeliveryReceipt, EnqueueError> {
        self.enqueue_with_timestamp(Utc::now().timestamp_millis(), text)
    }

    /// Admit a record with an explicit millisecond timestamp.
    ///
    /// Runs the admission policy, then appends to the current batch. This
    /// is a short synchronous in-memory operation and never blocks on I/O.
    ///
    /// **Returns**
    /// - `Ok(receipt)` once the record (or the overrun marker substituted
    ///   for it) owns a place in the queue.
    /// - `Err(..)` if the queue is closed, full, or the record is oversized
    ///   with truncation disabled. Rejected records are never enqueued.
    pub fn enqueue_with_timestamp(
        &self,
        timestamp_millis: i64,
        text: impl Into<String>,
    ) -> Result<DeliveryReceipt, EnqueueError> {
        let mut text = text.into();
        let mut reports: Vec<QueueError> = Vec::new();

        let rx = {
            let mut st = self.shared.lock();
            if st.closed {
                return Err(EnqueueError::Closed);
            }

            // Overrun guard: one slot stays reserved for the marker.
            if st.batches.len() >= self.config.max_queued_batches.saturating_sub(1) {
                match &self.config.overrun_marker {
                    Some(marker) if !st.overrun => {
                        st.overrun = true;
                        text = marker.clone();
                        reports.push(QueueError::QueueFull {
                            max_batches: self.config.max_queued_batches,
                        });
                    }
                    _ => return Err(EnqueueError::Full),
                }
            }

            // Length guard: the service rejects whole requests over the
            // per-record ceiling, so enforce it before it costs a round trip.
            let original_len = text.len();
            let (text, truncated) = clamp_text(text, &self.config.truncate_suffix)?;
            if truncated {
                reports.push(QueueError::MessageTooLong {
                    len: original_len,
                    max: crate::limits::MAX_RECORD_BYTES,
                });
            }

            let (tx, rx) = oneshot::channel();
            st.batches.push(StreamRecord::new(timestamp_millis, text), tx);
            rx
        };

        // Callbacks run outside the lock so they may safely touch the queue.
        for err in &reports {
            self.config.report(err);
        }
        Ok(DeliveryReceipt { rx })
    }

    /// Wait until every record admitted so far has left the queue.
    ///
    /// Resolves the next time the delivery loop observes an empty queue,
    /// immediately if it is empty already. Fails if delivery stopped before
    /// the queue drained.
    pub async fn flush(&self) -> Result<(), DeliveryError> {
        let rx = {
            let mut st = self.shared.lock();
            if st.stopped {
                return match &st.fatal {
                    Some(cause) => Err(DeliveryError::Fatal(cause.clone())),
                    None if st.batches.is_empty() => Ok(()),
                    None => Err(DeliveryError::Abandoned),
                };
            }
            let (tx, rx) = oneshot::channel();
            st.flush_waiters.push(tx);
            rx
        };
        // Same emptiness check the loop runs at tick start, so flushing an
        // idle queue does not wait out a timer interval.
        self.shared.notify_if_drained();
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Abandoned),
        }
    }

    /// Request shutdown. Idempotent.
    ///
    /// Cancels the pending timer wait; with [`ClosePolicy::Abandon`] queued
    /// batches are dropped, with [`ClosePolicy::Drain`] the loop keeps
    /// delivering until the queue is empty or a fatal error occurs. An
    /// in-flight send is never interrupted. Subsequent enqueues fail with
    /// [`EnqueueError::Closed`].
    pub fn close(&self) {
        {
            let mut st = self.shared.lock();
            st.closed = true;
        }
        self.shared.wake.notify_one();
    }

    /// Number of batches currently queued, the head possibly mid-send.
    pub fn queued_batches(&self) -> usize {
        self.shared.lock().batches.len()
    }
}
