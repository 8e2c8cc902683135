use crate::record::StreamRecord;
use async_trait::async_trait;

/// Classified error returned by a [`StreamClient`] call.
///
/// Every variant except [`ClientError::Transient`] is fatal: the request
/// will deterministically fail again, so the delivery loop stops instead of
/// retrying. Transient errors (network failure, throttling, timeouts) are
/// retried indefinitely at the queue's send interval.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid request parameters: {0}")]
    InvalidParameter(String),

    #[error("service quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    #[error("destination does not exist: {0}")]
    MissingDestination(String),

    #[error("append sequencing rejected: {0}")]
    BadSequence(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl ClientError {
    /// Whether retrying this error is pointless.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Transient(_))
    }
}

/// Result of provisioning a group or stream that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    /// The destination was already there. Treated as success; provisioning
    /// is idempotent from the queue's point of view.
    AlreadyExists,
}

/// Result of an append call that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted {
        /// The service took the request but rejected some records in it
        /// (usually for timestamps outside its retention window). The batch
        /// is consumed either way; the owner is notified.
        partially_rejected: bool,
    },
    /// The service recognized the request as a resubmission it already
    /// accepted. Treated as success.
    Duplicate,
}

/// Remote log-stream service the delivery loop appends to.
///
/// Implementations transport batches of [`StreamRecord`]s to a concrete
/// backend organized as named groups containing named streams. The queue
/// calls these methods from a background task and never on the application
/// thread.
///
/// Error classification is the implementation's contract: return
/// [`ClientError::Transient`] only for failures that can genuinely succeed
/// on a later attempt. Anything classified fatal permanently stops delivery.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Create the named group, tolerating "already exists".
    async fn create_group(&self, group: &str) -> Result<ProvisionOutcome, ClientError>;

    /// Create the named stream inside `group`, tolerating "already exists".
    async fn create_stream(&self, group: &str, stream: &str)
        -> Result<ProvisionOutcome, ClientError>;

    /// Append `records` to the stream, in order.
    ///
    /// **Parameters**
    /// - `records`: an ordered, non-empty slice already validated against
    ///   the service's per-record and per-batch byte limits.
    ///
    /// **Returns**
    /// - `Ok(AppendOutcome)` when the request was consumed by the service.
    /// - `Err(..)` classified per [`ClientError`]; on a transient error the
    ///   queue will resend the identical batch later.
    async fn put_records(
        &self,
        group: &str,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<AppendOutcome, ClientError>;
}
