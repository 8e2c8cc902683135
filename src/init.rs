use crate::client::StreamClient;
use crate::layer::StreamLayer;
use crate::queue::{QueueConfig, StreamQueue};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration for the global tracing installation.
///
/// **Fields**
/// - `queue`: batching and delivery behavior; see [`QueueConfig`].
/// - `max_level`: least severe event level the layer captures.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt` layer is added
///   on top of [`StreamLayer`] so captured events also reach the console.
#[derive(Clone)]
pub struct InitConfig {
    pub queue: QueueConfig,
    pub max_level: Level,
    pub enable_stdout: bool,
}

impl InitConfig {
    pub fn new(queue: QueueConfig) -> Self {
        InitConfig {
            queue,
            max_level: Level::ERROR,
            enable_stdout: true,
        }
    }
}

/// Initialize global `tracing` subscriber using the provided client and
/// [`InitConfig`].
///
/// **Parameters**
/// - `client`: implementation of [`StreamClient`] records are shipped to.
/// - `config`: [`InitConfig`] controlling capture level, console echo and
///   queue behavior.
///
/// **Returns**
/// - The [`StreamQueue`] handle, so the application can `flush` before
///   exiting and `close` at shutdown. Dropping the handle is fine; the
///   background task keeps running for the process lifetime.
///
/// **Effects**
///
/// This installs a [`Registry`] combined with [`StreamLayer`] as the global
/// default subscriber, so all `tracing` events in the process are observed
/// by the layer.
pub fn init_tracing_with_config(client: Arc<dyn StreamClient>, config: InitConfig) -> StreamQueue {
    let (queue, _handle) = StreamQueue::spawn(client, config.queue);
    let layer = StreamLayer::new(queue.clone(), config.max_level);

    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
    }
    queue
}

/// Initialize tracing with sensible defaults.
///
/// **Parameters**
/// - `client`: implementation of [`StreamClient`] records are shipped to.
/// - `group` / `stream`: destination names on the service.
///
/// **Behavior**
///
/// Equivalent to calling [`init_tracing_with_config`] with
/// [`InitConfig::new`] over [`QueueConfig::new`]. This is the recommended
/// entrypoint for typical microservices.
pub fn init_tracing(client: Arc<dyn StreamClient>, group: &str, stream: &str) -> StreamQueue {
    init_tracing_with_config(client, InitConfig::new(QueueConfig::new(group, stream)))
}
