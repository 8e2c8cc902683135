use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::client::{AppendOutcome, ClientError, StreamClient};
use crate::queue::{ClosePolicy, DeliveryError, QueueConfig, QueueError, Shared};
use crate::record::StreamRecord;

/// Ceiling for the growing delay in front of a retried head batch.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// What a single tick of the delivery loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Queue was empty; flush waiters were resolved.
    Idle,
    /// Head batch was accepted and removed.
    Sent,
    /// Head batch stays queued for another attempt.
    Retry,
    /// Fatal error; delivery has ceased permanently.
    Stopped,
}

/// The background side of a [`crate::queue::StreamQueue`].
///
/// A periodic, self-rescheduling state machine: each tick peeks the oldest
/// batch, provisions the destination once per queue lifetime, sends, and
/// classifies failures into retry-forever versus stop-forever. At most one
/// remote call is ever in flight, so records reach the service in strict
/// admission order.
pub(crate) struct DeliveryLoop {
    client: Arc<dyn StreamClient>,
    shared: Arc<Shared>,
    config: Arc<QueueConfig>,
    // True-once flags; provisioning is never re-attempted after success.
    group_ready: bool,
    stream_ready: bool,
    consecutive_failures: u32,
}

impl DeliveryLoop {
    pub(crate) fn new(
        client: Arc<dyn StreamClient>,
        shared: Arc<Shared>,
        config: Arc<QueueConfig>,
    ) -> Self {
        DeliveryLoop {
            group_ready: !config.create_group,
            stream_ready: !config.create_stream,
            client,
            shared,
            config,
            consecutive_failures: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut skip_wait = false;
        loop {
            if !skip_wait {
                tokio::select! {
                    _ = sleep(self.wait_interval()) => {}
                    _ = self.shared.wake.notified() => {}
                }
            }
            skip_wait = false;

            if self.close_requested() && self.config.close_policy == ClosePolicy::Abandon {
                self.abandon();
                return;
            }

            match self.tick().await {
                TickOutcome::Stopped => return,
                TickOutcome::Idle => {
                    if self.close_requested() {
                        self.mark_stopped();
                        return;
                    }
                }
                TickOutcome::Sent => {
                    // Drained right after a close request: run the drain
                    // check now instead of waiting out another interval.
                    if self.close_requested() && self.shared.lock().batches.is_empty() {
                        skip_wait = true;
                    }
                }
                TickOutcome::Retry => {}
            }
        }
    }

    /// One tick of the state machine.
    pub(crate) async fn tick(&mut self) -> TickOutcome {
        // Peek, never pop: the head batch leaves the queue only once the
        // service accepted it.
        let records: Option<Vec<StreamRecord>> = {
            let st = self.shared.lock();
            st.batches.front_records().map(<[StreamRecord]>::to_vec)
        };
        let Some(records) = records else {
            self.shared.notify_if_drained();
            return TickOutcome::Idle;
        };

        if !self.group_ready {
            match self.client.create_group(&self.config.group).await {
                Ok(_) => self.group_ready = true,
                Err(err) => return self.classify_failure(err, true),
            }
        }
        if !self.stream_ready {
            match self
                .client
                .create_stream(&self.config.group, &self.config.stream)
                .await
            {
                Ok(_) => self.stream_ready = true,
                Err(err) => return self.classify_failure(err, true),
            }
        }

        match self
            .client
            .put_records(&self.config.group, &self.config.stream, &records)
            .await
        {
            Ok(AppendOutcome::Accepted { partially_rejected }) => {
                if partially_rejected {
                    // The batch is consumed either way; some records may
                    // not have landed and the owner needs to know.
                    self.config.report(&QueueError::PartialRejection);
                }
                self.complete_head()
            }
            Ok(AppendOutcome::Duplicate) => self.complete_head(),
            Err(err) => self.classify_failure(err, false),
        }
    }

    fn complete_head(&mut self) -> TickOutcome {
        self.consecutive_failures = 0;
        let batch = self.shared.lock().batches.pop_front();
        if let Some(batch) = batch {
            batch.resolve(Ok(()));
        }
        TickOutcome::Sent
    }

    fn classify_failure(&mut self, err: ClientError, provisioning: bool) -> TickOutcome {
        if err.is_fatal() {
            return self.stop(err);
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let report = if provisioning {
            QueueError::Provision(err)
        } else {
            QueueError::Delivery(err)
        };
        self.config.report(&report);
        TickOutcome::Retry
    }

    /// Terminal transition: the owner hears the cause exactly once, every
    /// queued completion and flush waiter fails, and nothing is sent again.
    fn stop(&mut self, cause: ClientError) -> TickOutcome {
        let (batches, waiters) = {
            let mut st = self.shared.lock();
            st.stopped = true;
            st.closed = true;
            st.fatal = Some(cause.clone());
            (st.batches.take_all(), std::mem::take(&mut st.flush_waiters))
        };
        self.config.report_fatal(&cause);
        let failure = DeliveryError::Fatal(cause);
        for batch in batches {
            batch.resolve(Err(failure.clone()));
        }
        for waiter in waiters {
            let _ = waiter.send(Err(failure.clone()));
        }
        TickOutcome::Stopped
    }

    fn abandon(&mut self) {
        let (batches, waiters) = {
            let mut st = self.shared.lock();
            st.stopped = true;
            (st.batches.take_all(), std::mem::take(&mut st.flush_waiters))
        };
        for batch in batches {
            batch.resolve(Err(DeliveryError::Abandoned));
        }
        for waiter in waiters {
            let _ = waiter.send(Err(DeliveryError::Abandoned));
        }
    }

    /// Graceful exit after a drain: the queue is empty, so any waiter that
    /// slipped in since the drain check resolves successfully.
    fn mark_stopped(&mut self) {
        let waiters = {
            let mut st = self.shared.lock();
            st.stopped = true;
            std::mem::take(&mut st.flush_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn close_requested(&self) -> bool {
        self.shared.lock().closed
    }

    /// Fixed interval, doubled per consecutive retryable failure up to
    /// [`MAX_RETRY_INTERVAL`]. Resets on any successful remote call.
    fn wait_interval(&self) -> Duration {
        let base = self.config.send_interval;
        let factor = 1u32 << self.consecutive_failures.min(6);
        (base * factor).min(MAX_RETRY_INTERVAL).max(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchQueue;
    use crate::client::ProvisionOutcome;
    use crate::queue::{DeliveryReceipt, QueueConfig, StreamQueue};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Client driven by per-call outcome scripts; an exhausted script keeps
    /// returning success.
    #[derive(Default)]
    struct ScriptedClient {
        group_script: Mutex<VecDeque<Result<ProvisionOutcome, ClientError>>>,
        stream_script: Mutex<VecDeque<Result<ProvisionOutcome, ClientError>>>,
        put_script: Mutex<VecDeque<Result<AppendOutcome, ClientError>>>,
        group_calls: AtomicUsize,
        stream_calls: AtomicUsize,
        puts: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedClient {
        fn script_puts(
            &self,
            outcomes: impl IntoIterator<Item = Result<AppendOutcome, ClientError>>,
        ) {
            self.put_script.lock().unwrap().extend(outcomes);
        }

        fn put_texts(&self) -> Vec<Vec<String>> {
            self.puts.lock().unwrap().clone()
        }
    }

    const ACCEPTED: Result<AppendOutcome, ClientError> = Ok(AppendOutcome::Accepted {
        partially_rejected: false,
    });

    #[async_trait]
    impl StreamClient for ScriptedClient {
        async fn create_group(&self, _group: &str) -> Result<ProvisionOutcome, ClientError> {
            self.group_calls.fetch_add(1, Ordering::SeqCst);
            self.group_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ProvisionOutcome::Created))
        }

        async fn create_stream(
            &self,
            _group: &str,
            _stream: &str,
        ) -> Result<ProvisionOutcome, ClientError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.stream_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ProvisionOutcome::Created))
        }

        async fn put_records(
            &self,
            _group: &str,
            _stream: &str,
            records: &[StreamRecord],
        ) -> Result<AppendOutcome, ClientError> {
            self.puts
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.text.clone()).collect());
            self.put_script.lock().unwrap().pop_front().unwrap_or(ACCEPTED)
        }
    }

    struct Harness {
        client: Arc<ScriptedClient>,
        queue: StreamQueue,
        worker: DeliveryLoop,
        fatal_count: Arc<AtomicUsize>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    /// Build a loop that is driven by calling `tick` directly, with every
    /// admitted record forming its own batch.
    fn harness(mut config: QueueConfig) -> Harness {
        let fatal_count = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let fatal_counter = Arc::clone(&fatal_count);
        config.on_fatal = Some(Arc::new(move |_| {
            fatal_counter.fetch_add(1, Ordering::SeqCst);
        }));
        let error_log = Arc::clone(&errors);
        config.on_error = Some(Arc::new(move |err| {
            error_log.lock().unwrap().push(err.to_string());
        }));

        let client = Arc::new(ScriptedClient::default());
        let config = Arc::new(config.validated());
        let shared = Arc::new(Shared::new());
        shared.lock().batches = BatchQueue::with_limits(1, usize::MAX);

        let worker = DeliveryLoop::new(
            client.clone(),
            Arc::clone(&shared),
            Arc::clone(&config),
        );
        let queue = StreamQueue { shared, config };
        Harness {
            client,
            queue,
            worker,
            fatal_count,
            errors,
        }
    }

    fn default_harness() -> Harness {
        harness(QueueConfig::new("group", "stream"))
    }

    #[tokio::test]
    async fn transient_failures_retry_same_batch_in_order() {
        let mut h = default_harness();
        h.client.script_puts([
            Err(ClientError::Transient("reset".into())),
            Err(ClientError::Transient("reset".into())),
            Err(ClientError::Transient("reset".into())),
            ACCEPTED,
        ]);

        let receipt = h.queue.enqueue("stubborn").unwrap();
        for _ in 0..3 {
            assert_eq!(h.worker.tick().await, TickOutcome::Retry);
            assert_eq!(h.queue.queued_batches(), 1);
        }
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert_eq!(h.queue.queued_batches(), 0);
        receipt.wait().await.unwrap();

        // Four identical attempts, nothing reordered or skipped.
        let puts = h.client.put_texts();
        assert_eq!(puts.len(), 4);
        assert!(puts.iter().all(|texts| texts == &["stubborn"]));
        assert_eq!(h.errors.lock().unwrap().len(), 3);
        assert_eq!(h.fatal_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_append_stops_delivery_permanently() {
        let mut h = default_harness();
        h.client
            .script_puts([Err(ClientError::Unauthorized("bad token".into()))]);

        let first = h.queue.enqueue("first").unwrap();
        let second = h.queue.enqueue("second").unwrap();

        assert_eq!(h.worker.tick().await, TickOutcome::Stopped);
        assert_eq!(h.fatal_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.wait().await,
            Err(DeliveryError::Fatal(ClientError::Unauthorized(
                "bad token".into()
            )))
        );
        assert!(second.wait().await.is_err());

        // Queue is closed and emptied; further ticks never reach the sink.
        assert!(matches!(
            h.queue.enqueue("more"),
            Err(crate::queue::EnqueueError::Closed)
        ));
        h.worker.tick().await;
        assert_eq!(h.client.put_texts().len(), 1);
        assert_eq!(h.fatal_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_failure_fails_flush_waiters() {
        let mut h = default_harness();
        h.client
            .script_puts([Err(ClientError::MissingDestination("gone".into()))]);

        h.queue.enqueue("doomed").unwrap();
        let queue = h.queue.clone();
        let waiter = tokio::spawn(async move { queue.flush().await });
        // Let the flush register before the tick runs.
        tokio::task::yield_now().await;

        assert_eq!(h.worker.tick().await, TickOutcome::Stopped);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DeliveryError::Fatal(ClientError::MissingDestination(_)))
        ));
        // Flushing a stopped queue fails without registering anything.
        assert!(h.queue.flush().await.is_err());
    }

    #[tokio::test]
    async fn duplicate_submission_counts_as_delivered() {
        let mut h = default_harness();
        h.client.script_puts([Ok(AppendOutcome::Duplicate)]);

        let receipt = h.queue.enqueue("again").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        receipt.wait().await.unwrap();
        assert_eq!(h.queue.queued_batches(), 0);
    }

    #[tokio::test]
    async fn partial_rejection_is_reported_but_consumed() {
        let mut h = default_harness();
        h.client.script_puts([Ok(AppendOutcome::Accepted {
            partially_rejected: true,
        })]);

        let receipt = h.queue.enqueue("partially ok").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        receipt.wait().await.unwrap();

        let errors = h.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("rejected part"));
    }

    #[tokio::test]
    async fn transient_provisioning_failure_leaves_batch_queued() {
        let mut h = default_harness();
        h.client
            .group_script
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Transient("connect".into())));

        h.queue.enqueue("waiting").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Retry);
        // Provisioning failed before any send was attempted.
        assert!(h.client.put_texts().is_empty());
        assert_eq!(h.queue.queued_batches(), 1);

        // Next tick provisions and delivers.
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert_eq!(h.client.put_texts().len(), 1);
    }

    #[tokio::test]
    async fn provisioning_happens_once_per_queue() {
        let mut h = default_harness();
        h.queue.enqueue("one").unwrap();
        h.queue.enqueue("two").unwrap();

        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);

        assert_eq!(h.client.group_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.stream_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_existing_destination_is_success() {
        let mut h = default_harness();
        h.client
            .group_script
            .lock()
            .unwrap()
            .push_back(Ok(ProvisionOutcome::AlreadyExists));
        h.client
            .stream_script
            .lock()
            .unwrap()
            .push_back(Ok(ProvisionOutcome::AlreadyExists));

        h.queue.enqueue("hello").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert_eq!(h.client.put_texts().len(), 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_during_provisioning_is_fatal() {
        let mut h = default_harness();
        h.client
            .group_script
            .lock()
            .unwrap()
            .push_back(Err(ClientError::QuotaExceeded("group cap".into())));

        h.queue.enqueue("never").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Stopped);
        assert_eq!(h.fatal_count.load(Ordering::SeqCst), 1);
        assert!(h.client.put_texts().is_empty());
    }

    #[tokio::test]
    async fn provisioning_skipped_when_auto_create_disabled() {
        let mut config = QueueConfig::new("group", "stream");
        config.create_group = false;
        config.create_stream = false;
        let mut h = harness(config);

        h.queue.enqueue("direct").unwrap();
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert_eq!(h.client.group_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.client.stream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drain_tick_resolves_waiters_and_ends_overrun_episode() {
        let mut h = default_harness();

        let (tx, rx) = oneshot::channel();
        {
            let mut st = h.queue.shared.lock();
            st.flush_waiters.push(tx);
            st.overrun = true;
        }

        assert_eq!(h.worker.tick().await, TickOutcome::Idle);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(!h.queue.shared.lock().overrun);
    }

    #[tokio::test]
    async fn waiter_holds_until_queue_actually_drains() {
        let mut h = default_harness();
        h.queue.enqueue("pending").unwrap();

        let (tx, mut rx) = oneshot::channel();
        h.queue.shared.lock().flush_waiters.push(tx);

        // Queue still holds the batch during the sending tick.
        assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        assert!(rx.try_recv().is_err());

        // The next tick observes the drain.
        assert_eq!(h.worker.tick().await, TickOutcome::Idle);
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn retry_interval_backs_off_and_resets() {
        let mut h = default_harness();
        let base = h.worker.config.send_interval;
        assert_eq!(h.worker.wait_interval(), base);

        h.client.script_puts([
            Err(ClientError::Transient("slow".into())),
            Err(ClientError::Transient("slow".into())),
            ACCEPTED,
        ]);
        h.queue.enqueue("backoff").unwrap();

        h.worker.tick().await;
        assert_eq!(h.worker.wait_interval(), base * 2);
        h.worker.tick().await;
        assert_eq!(h.worker.wait_interval(), base * 4);

        h.worker.tick().await;
        assert_eq!(h.worker.wait_interval(), base);
    }

    #[tokio::test]
    async fn receipts_resolve_in_batch_order() {
        let mut h = default_harness();
        let receipts: Vec<DeliveryReceipt> = (0..3)
            .map(|i| h.queue.enqueue(format!("r{i}")).unwrap())
            .collect();

        for _ in 0..3 {
            assert_eq!(h.worker.tick().await, TickOutcome::Sent);
        }
        for receipt in receipts {
            receipt.wait().await.unwrap();
        }

        let puts = h.client.put_texts();
        assert_eq!(puts, vec![vec!["r0"], vec!["r1"], vec!["r2"]]);
    }
}
