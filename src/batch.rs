use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::limits::{MAX_BATCH_BYTES, MAX_BATCH_RECORDS};
use crate::queue::DeliveryError;
use crate::record::StreamRecord;

/// Completion sender attached to one admitted record; resolved when the
/// record's batch is accepted by the service, failed when it is abandoned.
pub(crate) type ReceiptSender = oneshot::Sender<Result<(), DeliveryError>>;

/// One append request in the making: an ordered run of records plus the
/// completion handles travelling with them.
pub(crate) struct Batch {
    pub(crate) records: Vec<StreamRecord>,
    pub(crate) bytes: usize,
    pub(crate) receipts: Vec<ReceiptSender>,
}

impl Batch {
    fn new() -> Self {
        Batch {
            records: Vec::new(),
            bytes: 0,
            receipts: Vec::new(),
        }
    }

    fn fits(&self, record: &StreamRecord, max_records: usize, max_bytes: usize) -> bool {
        self.records.len() < max_records && self.bytes + record.accounted_bytes() <= max_bytes
    }

    fn push(&mut self, record: StreamRecord, receipt: ReceiptSender) {
        self.bytes += record.accounted_bytes();
        self.records.push(record);
        self.receipts.push(receipt);
    }

    /// Resolve every completion in this batch with the same result.
    pub(crate) fn resolve(self, result: Result<(), DeliveryError>) {
        for receipt in self.receipts {
            // A dropped receiver just means the caller stopped waiting.
            let _ = receipt.send(result.clone());
        }
    }
}

/// Ordered sequence of batches, oldest first. The builder side of the queue:
/// appends seal the tail batch when the next record would push it over the
/// count or byte ceiling, and start a fresh one for that record.
pub(crate) struct BatchQueue {
    batches: VecDeque<Batch>,
    max_batch_records: usize,
    max_batch_bytes: usize,
}

impl BatchQueue {
    pub(crate) fn new() -> Self {
        Self::with_limits(MAX_BATCH_RECORDS, MAX_BATCH_BYTES)
    }

    /// Limits are per-batch ceilings; the service defaults come from
    /// [`crate::limits`]. Tests shrink them to exercise sealing.
    pub(crate) fn with_limits(max_batch_records: usize, max_batch_bytes: usize) -> Self {
        BatchQueue {
            batches: VecDeque::new(),
            max_batch_records: max_batch_records.max(1),
            max_batch_bytes,
        }
    }

    /// Append a record, sealing the tail batch first if the record would
    /// not fit it. Never blocks, never reorders.
    pub(crate) fn push(&mut self, record: StreamRecord, receipt: ReceiptSender) {
        let needs_new = match self.batches.back() {
            None => true,
            Some(tail) => !tail.fits(&record, self.max_batch_records, self.max_batch_bytes),
        };
        if needs_new {
            self.batches.push_back(Batch::new());
        }
        if let Some(tail) = self.batches.back_mut() {
            tail.push(record, receipt);
        }
    }

    /// Records of the oldest batch, without removing it.
    pub(crate) fn front_records(&self) -> Option<&[StreamRecord]> {
        self.batches.front().map(|b| b.records.as_slice())
    }

    /// Remove and return the oldest batch once it has been delivered.
    pub(crate) fn pop_front(&mut self) -> Option<Batch> {
        self.batches.pop_front()
    }

    /// Remove everything at once, for abandon-on-close and fatal stops.
    pub(crate) fn take_all(&mut self) -> VecDeque<Batch> {
        std::mem::take(&mut self.batches)
    }

    pub(crate) fn len(&self) -> usize {
        self.batches.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
