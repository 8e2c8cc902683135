use crate::client::{AppendOutcome, ClientError, ProvisionOutcome, StreamClient};
use crate::record::StreamRecord;
use async_trait::async_trait;

/// A client that accepts and drops all records.
///
/// Useful for measuring the overhead of the queue and layer themselves
/// without any external I/O, and for unit tests that don't care about
/// persistence.
#[derive(Clone, Default)]
pub struct NoopClient;

#[async_trait]
impl StreamClient for NoopClient {
    async fn create_group(&self, _group: &str) -> Result<ProvisionOutcome, ClientError> {
        Ok(ProvisionOutcome::AlreadyExists)
    }

    async fn create_stream(
        &self,
        _group: &str,
        _stream: &str,
    ) -> Result<ProvisionOutcome, ClientError> {
        Ok(ProvisionOutcome::AlreadyExists)
    }

    async fn put_records(
        &self,
        _group: &str,
        _stream: &str,
        _records: &[StreamRecord],
    ) -> Result<AppendOutcome, ClientError> {
        Ok(AppendOutcome::Accepted {
            partially_rejected: false,
        })
    }
}
