use std::sync::Arc;
use tracing::error;

use tracing_stream_sink::env::{
    env_or, STREAM_SINK_GROUP_ENV, STREAM_SINK_STREAM_ENV, STREAM_SINK_TOKEN_ENV,
    STREAM_SINK_URL_ENV,
};
use tracing_stream_sink::http::{HttpStreamClient, HttpStreamConfig};
use tracing_stream_sink::init::{init_tracing_with_config, InitConfig};
use tracing_stream_sink::queue::QueueConfig;

#[tokio::main]
async fn main() {
    let client = Arc::new(HttpStreamClient::new(HttpStreamConfig {
        base_url: env_or(STREAM_SINK_URL_ENV, "http://127.0.0.1:9280"),
        token: std::env::var(STREAM_SINK_TOKEN_ENV).ok(),
    }));

    let mut queue_config = QueueConfig::new(
        env_or(STREAM_SINK_GROUP_ENV, "demo"),
        env_or(STREAM_SINK_STREAM_ENV, "http-backend"),
    );
    queue_config.on_error = Some(Arc::new(|err| eprintln!("sink error: {err}")));

    let queue = init_tracing_with_config(client, InitConfig::new(queue_config));

    for i in 0..25 {
        error!(attempt = i, "demo error event");
    }

    match queue.flush().await {
        Ok(()) => println!("all records delivered"),
        Err(err) => eprintln!("delivery did not finish: {err}"),
    }
    queue.close();
}
