//! DLQ replayer: surfaces dead-lettered entries and re-injects them on demand.
//!
//! Two independent consumer groups share each `*.dlq.v1` stream: the monitor
//! group drains entries into operator-visible logs as they arrive, and the
//! replay group is consumed by the manual `mailsift replay` command, which
//! strips the DLQ envelope and appends each entry back onto its source
//! stream. Entries stay in the DLQ stream itself under the broker's
//! retention, so both groups see every entry exactly once.

use std::time::Duration;

use tracing::{info, warn};

use super::EventHandler;
use crate::broker::{
    DLQ_REASON_FIELD, DLQ_SOURCE_FIELD, Delivery, StreamBroker, dlq_stream,
};
use crate::error::MailsiftResult;

/// Consumer group for the logging monitor.
const MONITOR_GROUP: &str = "dlq-monitor-g";

/// Consumer group for manual re-injection.
const REPLAY_GROUP: &str = "dlq-replayer-g";

// ── DlqMonitor ──────────────────────────────────────────────────────────

/// Logs every entry arriving on one stage's DLQ.
#[derive(Debug)]
pub struct DlqMonitor {
    source_stream: String,
}

impl DlqMonitor {
    /// Monitor the DLQ of `source_stream` (e.g. `raw_emails.v1`).
    pub fn new(source_stream: impl Into<String>) -> Self {
        Self {
            source_stream: source_stream.into(),
        }
    }
}

impl EventHandler for DlqMonitor {
    fn service(&self) -> &'static str {
        "dlq_replayer"
    }

    fn stream(&self) -> String {
        dlq_stream(&self.source_stream)
    }

    fn group(&self) -> String {
        MONITOR_GROUP.to_string()
    }

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
        let reason = delivery
            .fields
            .get(DLQ_REASON_FIELD)
            .map(String::as_str)
            .unwrap_or("unknown");
        let trace_id = delivery
            .fields
            .get("trace_id")
            .map(String::as_str)
            .unwrap_or_default();
        warn!(
            service = "dlq_replayer",
            stream_message_id = %delivery.id,
            source_stream = %self.source_stream,
            trace_id,
            reason,
            "dead-lettered entry; re-inject with `mailsift replay`"
        );
        Ok(())
    }
}

// ── Manual re-injection ─────────────────────────────────────────────────

/// Re-inject up to `max` dead-lettered entries back onto `source_stream`.
///
/// The DLQ envelope fields are stripped so the re-injected entry is
/// indistinguishable from a first delivery; idempotent stages make the
/// replay safe. Returns the number re-injected.
pub fn replay(
    broker: &dyn StreamBroker,
    source_stream: &str,
    max: usize,
) -> MailsiftResult<usize> {
    let dlq = dlq_stream(source_stream);
    broker.create_group(&dlq, REPLAY_GROUP)?;

    let mut replayed = 0;
    while replayed < max {
        let batch = broker.read_group(
            &dlq,
            REPLAY_GROUP,
            "dlq-replayer-cli",
            (max - replayed).min(16),
            Duration::ZERO,
        )?;
        if batch.is_empty() {
            break;
        }
        for delivery in batch {
            let mut fields = delivery.fields.clone();
            fields.remove(DLQ_REASON_FIELD);
            fields.remove(DLQ_SOURCE_FIELD);
            let new_id = broker.append(source_stream, &fields)?;
            broker.ack(&dlq, REPLAY_GROUP, &delivery.id)?;
            replayed += 1;
            info!(
                service = "dlq_replayer",
                dlq_id = %delivery.id,
                stream_message_id = %new_id,
                stream = source_stream,
                "re-injected"
            );
        }
    }
    Ok(replayed)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, STREAM_RAW};
    use crate::event::Fields;

    fn dead_letter(broker: &MemoryBroker, n: u32) {
        let fields = Fields::from([
            ("trace_id".to_string(), format!("t-{n}")),
            ("payload".to_string(), format!("p-{n}")),
            (DLQ_REASON_FIELD.to_string(), "exceeded 5 deliveries".to_string()),
            (DLQ_SOURCE_FIELD.to_string(), STREAM_RAW.to_string()),
        ]);
        broker.append(&dlq_stream(STREAM_RAW), &fields).unwrap();
    }

    #[test]
    fn replay_strips_envelope_and_reinjects() {
        let mem = MemoryBroker::new();
        dead_letter(&mem, 1);
        dead_letter(&mem, 2);

        let count = replay(&mem, STREAM_RAW, 10).unwrap();
        assert_eq!(count, 2);

        let entries = mem.dump(STREAM_RAW);
        assert_eq!(entries.len(), 2);
        for (_, fields) in entries {
            assert!(!fields.contains_key(DLQ_REASON_FIELD));
            assert!(!fields.contains_key(DLQ_SOURCE_FIELD));
            assert!(fields.contains_key("payload"));
        }
    }

    #[test]
    fn replay_honors_the_cap_and_resumes() {
        let mem = MemoryBroker::new();
        for n in 0..5 {
            dead_letter(&mem, n);
        }

        assert_eq!(replay(&mem, STREAM_RAW, 3).unwrap(), 3);
        assert_eq!(mem.dump(STREAM_RAW).len(), 3);

        // A later invocation picks up where the group cursor left off.
        assert_eq!(replay(&mem, STREAM_RAW, 10).unwrap(), 2);
        assert_eq!(mem.dump(STREAM_RAW).len(), 5);
    }

    #[test]
    fn replay_of_empty_dlq_is_a_noop() {
        let mem = MemoryBroker::new();
        assert_eq!(replay(&mem, STREAM_RAW, 10).unwrap(), 0);
    }

    #[test]
    fn monitor_acks_entries() {
        let mut monitor = DlqMonitor::new(STREAM_RAW);
        assert_eq!(monitor.stream(), "raw_emails.dlq.v1");
        let delivery = Delivery {
            stream: dlq_stream(STREAM_RAW),
            id: "1-0".into(),
            fields: Fields::from([(DLQ_REASON_FIELD.to_string(), "r".to_string())]),
            delivery_count: 1,
        };
        assert!(monitor.handle(&delivery).is_ok());
    }
}
