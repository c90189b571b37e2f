//! Batch validation for the ingestion sink.
//!
//! A batch is all-or-nothing: any failing record rejects the whole batch
//! before it touches the base store or the rollup queues.

use chrono::{DateTime, Duration, Utc};
use validator::Validate;

use crate::error::{Error, Result};
use crate::limits::{MAX_BATCH_RECORDS, MAX_FUTURE_SKEW_SECS, MAX_RECORD_AGE_HOURS};
use crate::records::{Record, StreamKind};

/// Validates a batch against its target stream.
///
/// Checks, in order: batch shape, per-record field constraints, stream
/// membership, and cross-field timestamp/revenue coherence.
pub fn validate_batch(stream: StreamKind, records: &[Record]) -> Result<()> {
    if records.is_empty() {
        return Err(Error::validation("empty batch"));
    }
    if records.len() > MAX_BATCH_RECORDS {
        return Err(Error::validation(format!(
            "batch has {} records, exceeds {} limit",
            records.len(),
            MAX_BATCH_RECORDS
        )));
    }

    let now = Utc::now();
    for (i, record) in records.iter().enumerate() {
        validate_record(stream, record, now)
            .map_err(|e| Error::validation(format!("record {}: {}", i, e)))?;
    }
    Ok(())
}

fn validate_record(stream: StreamKind, record: &Record, now: DateTime<Utc>) -> Result<()> {
    if record.stream() != stream {
        return Err(Error::validation(format!(
            "{} record in a {} batch",
            record.stream().as_str(),
            stream.as_str()
        )));
    }

    match record {
        Record::Event(event) => {
            event
                .validate()
                .map_err(|e| Error::validation(e.to_string()))?;
            if event.revenue != 0.0 && !event.event_type.carries_revenue() {
                return Err(Error::validation(format!(
                    "revenue on a '{}' event",
                    event.event_type.as_str()
                )));
            }
        }
        Record::Order(order) => {
            order
                .validate()
                .map_err(|e| Error::validation(e.to_string()))?;
        }
    }

    validate_timestamp(record.timestamp(), now)
}

/// Rejects timestamps from the future (beyond clock skew) or older than the
/// live-ingest horizon. Backfill writes to the base store directly.
fn validate_timestamp(ts: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if ts > now + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
        return Err(Error::validation(format!(
            "timestamp more than {}s in the future",
            MAX_FUTURE_SKEW_SECS
        )));
    }
    if now - ts > Duration::hours(MAX_RECORD_AGE_HOURS) {
        return Err(Error::validation(format!(
            "timestamp more than {}h in the past",
            MAX_RECORD_AGE_HOURS
        )));
    }
    Ok(())
}
