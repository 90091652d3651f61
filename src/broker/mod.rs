//! Stream broker abstraction: trait + Redis Streams and in-memory implementations.
//!
//! `StreamBroker` is the only way stages talk to each other: an ordered
//! append-only log per stream, fanned out to named consumer groups with
//! per-entry pending lists. An entry stays pending until `ack`; a crashed
//! worker's entries are picked back up via `claim_stale`, which is also where
//! the redelivery budget for dead-lettering is observed.
//!
//! - [`RedisBroker`] speaks Redis Streams over a sync connection.
//! - [`MemoryBroker`] is the in-process double used by unit and pipeline tests.

pub mod mem;
pub mod redis;

use std::time::Duration;

use crate::error::BrokerError;
use crate::event::Fields;

pub use self::mem::MemoryBroker;
pub use self::redis::RedisBroker;

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

// ── Stream names ────────────────────────────────────────────────────────

/// Poller → normalizer.
pub const STREAM_RAW: &str = "raw_emails.v1";
/// Normalizer → semantic filter.
pub const STREAM_NORMALIZED: &str = "emails.normalized.v1";
/// Semantic filter → classifier.
pub const STREAM_TO_CLASSIFY: &str = "emails.to_classify.v1";
/// Classifier → persister.
pub const STREAM_CLASSIFIED: &str = "emails.classified.v1";

/// All pipeline streams, in dependency order.
pub const ALL_STREAMS: [&str; 4] = [
    STREAM_RAW,
    STREAM_NORMALIZED,
    STREAM_TO_CLASSIFY,
    STREAM_CLASSIFIED,
];

/// Dead-letter stream for a pipeline stream: `raw_emails.v1` → `raw_emails.dlq.v1`.
pub fn dlq_stream(stream: &str) -> String {
    match stream.strip_suffix(".v1") {
        Some(base) => format!("{base}.dlq.v1"),
        None => format!("{stream}.dlq"),
    }
}

/// Wire field on DLQ entries naming why the entry was dead-lettered.
pub const DLQ_REASON_FIELD: &str = "reason";
/// Wire field on DLQ entries naming the stream the entry came from.
pub const DLQ_SOURCE_FIELD: &str = "source_stream";

// ── Delivery ────────────────────────────────────────────────────────────

/// One entry handed to a consumer, pending until acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub stream: String,
    /// Broker-assigned, monotonically ordered entry id.
    pub id: String,
    pub fields: Fields,
    /// How many times this entry has now been delivered to the group
    /// (1 on first delivery).
    pub delivery_count: u64,
}

// ── StreamBroker trait ──────────────────────────────────────────────────

/// Capability surface over the stream broker.
///
/// Implementations must be `Send + Sync`: stage workers share a broker handle
/// across threads. All blocking is bounded by the `block` argument to
/// `read_group`.
pub trait StreamBroker: Send + Sync {
    /// Append an entry, returning its server-assigned id.
    fn append(&self, stream: &str, fields: &Fields) -> BrokerResult<String>;

    /// Create a consumer group starting from the beginning of the stream,
    /// creating the stream itself if needed. Already-exists is not an error.
    fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()>;

    /// Read up to `count` new entries for `consumer`, blocking at most
    /// `block`. Returned entries are moved onto the group's pending list.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Remove an entry from the group's pending list.
    fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()>;

    /// Re-deliver pending entries idle for at least `min_idle` to `consumer`,
    /// bumping their delivery counts. This is how entries abandoned by a
    /// crashed worker come back, and where the dead-letter budget is read.
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Number of entries currently retained in the stream.
    fn stream_len(&self, stream: &str) -> BrokerResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_names_keep_the_version_suffix() {
        assert_eq!(dlq_stream(STREAM_RAW), "raw_emails.dlq.v1");
        assert_eq!(dlq_stream(STREAM_NORMALIZED), "emails.normalized.dlq.v1");
        assert_eq!(dlq_stream("oddball"), "oddball.dlq");
    }
}
