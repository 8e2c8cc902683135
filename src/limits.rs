/// Hard limits enforced by the remote log-stream service.
///
/// The append API rejects an entire request when any of these is exceeded,
/// so the queue enforces them at admission and batching time instead of
/// paying a round trip to find out.

/// Maximum encoded byte length of a single record's text.
///
/// The service ceiling is ~262,144 bytes; the margin below it is intentional
/// so that admission never races the server-side accounting.
pub const MAX_RECORD_BYTES: usize = 256_000;

/// Maximum number of records in one append request.
pub const MAX_BATCH_RECORDS: usize = 10_000;

/// Maximum accounted byte size of one append request.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Fixed per-record envelope the service charges against the batch byte
/// ceiling, on top of the text's own encoded length.
pub const RECORD_OVERHEAD_BYTES: usize = 26;
