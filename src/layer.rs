use crate::queue::{EnqueueError, StreamQueue};
use crate::record::LogEvent;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Maps a captured [`LogEvent`] to the text of one stream record.
pub type Formatter = Arc<dyn Fn(&LogEvent) -> String + Send + Sync>;

/// Extracts the millisecond timestamp a record is stamped with.
pub type TimestampFn = Arc<dyn Fn(&LogEvent) -> i64 + Send + Sync>;

/// `tracing_subscriber` layer that observes events and hands them to a
/// [`StreamQueue`] as formatted text records.
///
/// By default this layer only captures events with level `ERROR` and above.
/// Admission is a short in-memory append on the caller's thread; all network
/// I/O happens on the queue's background task, so request latency is not
/// impacted. Records the queue refuses (full, oversized with truncation
/// disabled, closed) are counted in `dropped_events` and never block.
pub struct StreamLayer {
    queue: StreamQueue,
    max_level: Level,
    formatter: Formatter,
    timestamp: TimestampFn,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully admitted to the queue.
    pub enqueued_events: Arc<AtomicU64>,
    /// Refused by the queue at admission time.
    pub dropped_events: Arc<AtomicU64>,
}

impl StreamLayer {
    /// Create a layer feeding `queue`, capturing events at `max_level` and
    /// above with the default JSON formatter and event-time timestamps.
    pub fn new(queue: StreamQueue, max_level: Level) -> Self {
        StreamLayer {
            queue,
            max_level,
            formatter: Arc::new(default_format),
            timestamp: Arc::new(|event: &LogEvent| event.timestamp.timestamp_millis()),
            total_events: Arc::new(AtomicU64::new(0)),
            enqueued_events: Arc::new(AtomicU64::new(0)),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the formatter turning events into record text.
    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Replace the timestamp extractor.
    pub fn with_timestamp(mut self, timestamp: TimestampFn) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Default formatter: the whole event as a single JSON line.
pub fn default_format(event: &LogEvent) -> String {
    serde_json::to_string(event)
        .unwrap_or_else(|_| event.message.clone().unwrap_or_default())
}

impl<S> Layer<S> for StreamLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if *event.metadata().level() > self.max_level {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;

        let mut visitor = FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        };
        event.record(&mut visitor);

        let meta = event.metadata();
        let log_event = LogEvent {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            module_path: meta.module_path().map(|s| s.to_string()),
            file: meta.file().map(|s| s.to_string()),
            line: meta.line(),
            fields,
            message,
        };

        let text = (self.formatter)(&log_event);
        let timestamp = (self.timestamp)(&log_event);
        match self.queue.enqueue_with_timestamp(timestamp, text) {
            Ok(_receipt) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(EnqueueError::Full) => {
                // The queue already told the owner once per episode; here we
                // only keep the count.
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                eprintln!("tracing-stream-sink: dropping log record: {err}");
            }
        }
    }
}

use tracing::field::{Field, Visit};

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(format!("{:?}", value)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop_client::NoopClient;
    use crate::queue::QueueConfig;
    use tokio::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    fn idle_queue() -> StreamQueue {
        let mut config = QueueConfig::new("group", "stream");
        config.send_interval = Duration::from_secs(3600);
        let (queue, _handle) = StreamQueue::spawn(Arc::new(NoopClient), config);
        queue
    }

    #[tokio::test]
    async fn error_events_become_queued_records() {
        let queue = idle_queue();
        let layer = StreamLayer::new(queue.clone(), Level::ERROR);
        let enqueued = Arc::clone(&layer.enqueued_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(code = 7, "boom");
        });

        assert_eq!(enqueued.load(Ordering::Relaxed), 1);
        assert_eq!(queue.queued_batches(), 1);

        let st = queue.shared.lock();
        let record = &st.batches.front_records().unwrap()[0];
        let json: serde_json::Value = serde_json::from_str(&record.text).unwrap();
        assert_eq!(json["message"], "boom");
        assert_eq!(json["fields"]["code"], 7);
        assert_eq!(json["level"], "ERROR");
        assert!(record.timestamp_millis > 0);
    }

    #[tokio::test]
    async fn events_below_level_are_filtered() {
        let queue = idle_queue();
        let layer = StreamLayer::new(queue.clone(), Level::ERROR);
        let total = Arc::clone(&layer.total_events);
        let enqueued = Arc::clone(&layer.enqueued_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not captured");
        });

        assert_eq!(total.load(Ordering::Relaxed), 1);
        assert_eq!(enqueued.load(Ordering::Relaxed), 0);
        assert_eq!(queue.queued_batches(), 0);
    }

    #[tokio::test]
    async fn custom_formatter_and_timestamp_are_used() {
        let queue = idle_queue();
        let layer = StreamLayer::new(queue.clone(), Level::WARN)
            .with_formatter(Arc::new(|event: &LogEvent| {
                format!("{}: {}", event.level, event.message.clone().unwrap_or_default())
            }))
            .with_timestamp(Arc::new(|_event: &LogEvent| 42));
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("plain text");
        });

        let st = queue.shared.lock();
        let record = &st.batches.front_records().unwrap()[0];
        assert_eq!(record.text, "WARN: plain text");
        assert_eq!(record.timestamp_millis, 42);
    }
}
