pub mod record;
pub mod limits;
pub mod client;
pub mod queue;
pub mod layer;

mod batch;
mod worker;

#[cfg(feature = "http")]
pub mod http;

pub mod init;
pub mod noop_client;
pub mod env;
