//! Batch and field limits for the ingestion path.
//!
//! Limits bound the working set per accepted batch so queue depth remains
//! the only backpressure variable.

/// Maximum records per ingested batch.
pub const MAX_BATCH_RECORDS: usize = 1000;

/// Maximum allowed clock skew for future timestamps (seconds).
pub const MAX_FUTURE_SKEW_SECS: i64 = 5;

/// Maximum age for stale records at ingest (hours).
///
/// Older data belongs to backfill tooling writing to the base store
/// directly, not the live sink.
pub const MAX_RECORD_AGE_HOURS: i64 = 24;

/// Page URL max length.
pub const MAX_PAGE_URL_LEN: usize = 2048;

/// Session ID max length.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Browser name max length.
pub const MAX_BROWSER_LEN: usize = 64;

/// Payment method max length.
pub const MAX_PAYMENT_METHOD_LEN: usize = 32;

/// Maximum order quantity per line.
pub const MAX_ORDER_QUANTITY: u32 = 1000;

/// Upper bound for a single monetary amount (revenue or order total).
pub const MAX_AMOUNT: f64 = 1_000_000.0;

/// Upper bound for an event duration (24h in seconds).
pub const MAX_DURATION_SECS: f64 = 86_400.0;
