/// Environment variable names used by this crate for convenient
/// configuration of the HTTP backend from microservices.
///
/// These are purely helpers; the core queue types remain decoupled from
/// environment access.

/// Base URL of the log-stream service, e.g. `http://127.0.0.1:9280`.
pub const STREAM_SINK_URL_ENV: &str = "STREAM_SINK_URL";

/// Optional bearer token for the service.
pub const STREAM_SINK_TOKEN_ENV: &str = "STREAM_SINK_TOKEN";

/// Destination group name.
pub const STREAM_SINK_GROUP_ENV: &str = "STREAM_SINK_GROUP";

/// Destination stream name.
pub const STREAM_SINK_STREAM_ENV: &str = "STREAM_SINK_STREAM";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
