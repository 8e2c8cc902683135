use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use tracing_stream_sink::init::{init_tracing_with_config, InitConfig};
use tracing_stream_sink::noop_client::NoopClient;
use tracing_stream_sink::queue::QueueConfig;

#[tokio::main]
async fn main() {
    let client = Arc::new(NoopClient::default());
    let mut config = InitConfig::new(QueueConfig::new("services", "load-test"));
    config.enable_stdout = false;
    let queue = init_tracing_with_config(client, config);

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "noop load test error");
    }

    let elapsed = start.elapsed();
    println!(
        "noop backend: enqueued {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Wait for the background loop to drain the queue before exiting.
    if let Err(err) = queue.flush().await {
        eprintln!("flush failed: {err}");
    }
    queue.close();
}
