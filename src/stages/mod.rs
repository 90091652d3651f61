//! Stage workers and the shared read–process–ack harness.
//!
//! Every stage role is an [`EventHandler`] plugged into a [`Worker`]. The
//! harness owns the whole delivery discipline so each stage only writes its
//! domain logic:
//!
//! - read one entry under the stage's consumer group (bounded block),
//! - run the handler with panics contained,
//! - ack, retry, or drop strictly by the error's [`ErrorKind`],
//! - sweep stale pending entries back in via `claim_stale`, dead-lettering
//!   any that exhausted their redelivery budget,
//! - back off exponentially while the broker itself is down.

pub mod classifier;
pub mod filter;
pub mod normalizer;
pub mod persister;
pub mod poller;
pub mod replayer;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::{DLQ_REASON_FIELD, DLQ_SOURCE_FIELD, Delivery, StreamBroker, dlq_stream};
use crate::error::{ErrorKind, MailsiftResult};

/// Bounded block on the group read.
const READ_BLOCK: Duration = Duration::from_secs(1);

/// Pending entries idle this long are considered abandoned.
const REDELIVERY_IDLE: Duration = Duration::from_secs(30);

/// Stale entries examined per sweep.
const SWEEP_COUNT: usize = 16;

/// Backoff floor and ceiling for broker-level failures.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

// ── EventHandler ────────────────────────────────────────────────────────

/// One stage's domain logic, invoked per delivery.
///
/// A handler returns `Ok(())` when the delivery is fully handled (including
/// deliberate drops); the harness then acks. Errors are never handled inside
/// a stage — they bubble here and the [`ErrorKind`] decides.
pub trait EventHandler {
    /// Service label for structured logs.
    fn service(&self) -> &'static str;

    /// Input stream.
    fn stream(&self) -> String;

    /// Consumer-group name.
    fn group(&self) -> String;

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()>;
}

// ── Worker ──────────────────────────────────────────────────────────────

/// Read–process–ack loop around one [`EventHandler`].
pub struct Worker<H: EventHandler> {
    handler: H,
    broker: Arc<dyn StreamBroker>,
    stream: String,
    group: String,
    consumer: String,
    dlq_max_deliveries: u64,
    redelivery_idle: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<H: EventHandler> Worker<H> {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        handler: H,
        dlq_max_deliveries: u64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let consumer = format!("{}-{}", handler.service(), std::process::id());
        let stream = handler.stream();
        let group = handler.group();
        Self {
            handler,
            broker,
            stream,
            group,
            consumer,
            dlq_max_deliveries,
            redelivery_idle: REDELIVERY_IDLE,
            shutdown,
        }
    }

    /// Override the redelivery idle window (tests use zero).
    pub fn with_redelivery_idle(mut self, idle: Duration) -> Self {
        self.redelivery_idle = idle;
        self
    }

    /// Run until the shutdown flag is set.
    ///
    /// Broker-level failures (read, sweep) back off exponentially; everything
    /// per-event is handled inside [`Self::run_once`].
    pub fn run(&mut self) -> MailsiftResult<()> {
        let service = self.handler.service();
        info!(service, stream = %self.stream, "worker starting");

        let mut backoff = BACKOFF_MIN;
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.ensure_group().and_then(|()| self.run_once()) {
                Ok(_) => backoff = BACKOFF_MIN,
                Err(e) => {
                    warn!(service, error = %e, "broker unavailable, backing off");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        info!(service, "worker stopped");
        Ok(())
    }

    /// Create the consumer group (idempotent).
    pub fn ensure_group(&self) -> MailsiftResult<()> {
        self.broker.create_group(&self.stream, &self.group)?;
        Ok(())
    }

    /// One iteration: sweep stale pending entries, read one fresh entry,
    /// process them all. Returns how many deliveries were processed.
    ///
    /// Errors out only on broker-level failures; per-event errors are
    /// resolved here via the ack discipline.
    pub fn run_once(&mut self) -> MailsiftResult<usize> {
        let mut batch = self.sweep()?;
        batch.extend(self.broker.read_group(
            &self.stream,
            &self.group,
            &self.consumer,
            1,
            READ_BLOCK,
        )?);

        let processed = batch.len();
        for delivery in batch {
            self.process(delivery);
        }
        Ok(processed)
    }

    /// Reclaim abandoned pending entries; dead-letter the ones that have
    /// exhausted their redelivery budget, return the rest for processing.
    fn sweep(&mut self) -> MailsiftResult<Vec<Delivery>> {
        let stale = self.broker.claim_stale(
            &self.stream,
            &self.group,
            &self.consumer,
            self.redelivery_idle,
            SWEEP_COUNT,
        )?;

        let mut keep = Vec::new();
        for delivery in stale {
            if delivery.delivery_count > self.dlq_max_deliveries {
                let mut fields = delivery.fields.clone();
                fields.insert(
                    DLQ_REASON_FIELD.to_string(),
                    format!("exceeded {} deliveries", self.dlq_max_deliveries),
                );
                fields.insert(DLQ_SOURCE_FIELD.to_string(), self.stream.clone());
                self.broker.append(&dlq_stream(&self.stream), &fields)?;
                self.broker.ack(&self.stream, &self.group, &delivery.id)?;
                warn!(
                    service = self.handler.service(),
                    stream_message_id = %delivery.id,
                    delivery_count = delivery.delivery_count,
                    "dead-lettered"
                );
            } else {
                keep.push(delivery);
            }
        }
        Ok(keep)
    }

    /// Apply the uniform per-event discipline.
    fn process(&mut self, delivery: Delivery) {
        let service = self.handler.service();
        let id = delivery.id.clone();
        let trace_id = delivery.fields.get("trace_id").cloned().unwrap_or_default();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(&delivery)));

        let ack = match outcome {
            Err(_panic) => {
                error!(
                    service,
                    stream_message_id = %id,
                    trace_id = %trace_id,
                    "handler panicked; entry left pending for redelivery"
                );
                false
            }
            Ok(Ok(())) => true,
            Ok(Err(e)) => match e.kind() {
                ErrorKind::Transient => {
                    warn!(
                        service,
                        stream_message_id = %id,
                        trace_id = %trace_id,
                        error = %e,
                        "retried"
                    );
                    false
                }
                ErrorKind::Malformed => {
                    warn!(
                        service,
                        stream_message_id = %id,
                        trace_id = %trace_id,
                        error = %e,
                        "dropped"
                    );
                    true
                }
                ErrorKind::Permanent => {
                    error!(
                        service,
                        stream_message_id = %id,
                        trace_id = %trace_id,
                        error = %e,
                        "dropped; operator intervention needed"
                    );
                    true
                }
            },
        };

        if ack {
            match self.broker.ack(&self.stream, &self.group, &id) {
                Ok(()) => debug!(service, stream_message_id = %id, "acked"),
                Err(e) => warn!(service, stream_message_id = %id, error = %e, "ack failed"),
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, STREAM_RAW};
    use crate::error::{LlmError, NormalizeError};
    use crate::event::Fields;

    /// Scripted handler: each entry's "mode" field picks the outcome.
    struct ScriptedHandler {
        handled: Vec<String>,
    }

    impl EventHandler for ScriptedHandler {
        fn service(&self) -> &'static str {
            "scripted"
        }
        fn stream(&self) -> String {
            STREAM_RAW.to_string()
        }
        fn group(&self) -> String {
            "scripted-g".to_string()
        }
        fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
            self.handled.push(delivery.id.clone());
            match delivery.fields.get("mode").map(String::as_str) {
                Some("transient") => Err(LlmError::RequestFailed {
                    message: "down".into(),
                }
                .into()),
                Some("malformed") => Err(NormalizeError::Parse { bytes: 1 }.into()),
                Some("panic") => panic!("boom"),
                _ => Ok(()),
            }
        }
    }

    fn worker(broker: Arc<MemoryBroker>) -> Worker<ScriptedHandler> {
        Worker::new(
            broker,
            ScriptedHandler { handled: vec![] },
            3,
            Arc::new(AtomicBool::new(false)),
        )
        .with_redelivery_idle(Duration::ZERO)
    }

    fn inject(broker: &MemoryBroker, mode: &str) {
        let fields = Fields::from([
            ("mode".to_string(), mode.to_string()),
            ("trace_id".to_string(), "t".to_string()),
        ]);
        broker.append(STREAM_RAW, &fields).unwrap();
    }

    #[test]
    fn ok_outcome_acks() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = worker(Arc::clone(&broker));
        worker.ensure_group().unwrap();
        inject(&broker, "ok");

        assert_eq!(worker.run_once().unwrap(), 1);
        assert_eq!(broker.pending_len(STREAM_RAW, "scripted-g"), 0);
    }

    #[test]
    fn malformed_outcome_acks_and_drops() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = worker(Arc::clone(&broker));
        worker.ensure_group().unwrap();
        inject(&broker, "malformed");

        worker.run_once().unwrap();
        assert_eq!(broker.pending_len(STREAM_RAW, "scripted-g"), 0);
        // Nothing went to the DLQ.
        assert_eq!(broker.stream_len(&dlq_stream(STREAM_RAW)).unwrap(), 0);
    }

    #[test]
    fn transient_outcome_leaves_entry_pending_then_redelivers() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = worker(Arc::clone(&broker));
        worker.ensure_group().unwrap();
        inject(&broker, "transient");

        worker.run_once().unwrap();
        assert_eq!(broker.pending_len(STREAM_RAW, "scripted-g"), 1);

        // Next iteration reclaims it via the sweep.
        worker.run_once().unwrap();
        assert_eq!(worker.handler.handled.len(), 2);
    }

    #[test]
    fn panic_is_contained_and_entry_redelivered() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = worker(Arc::clone(&broker));
        worker.ensure_group().unwrap();
        inject(&broker, "panic");

        worker.run_once().unwrap();
        assert_eq!(broker.pending_len(STREAM_RAW, "scripted-g"), 1);
        worker.run_once().unwrap();
        assert_eq!(worker.handler.handled.len(), 2);
    }

    #[test]
    fn exhausted_redeliveries_move_to_dlq() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = worker(Arc::clone(&broker));
        worker.ensure_group().unwrap();
        inject(&broker, "transient");

        // Budget is 3 deliveries; keep failing until the sweep gives up.
        for _ in 0..8 {
            worker.run_once().unwrap();
        }

        assert_eq!(broker.pending_len(STREAM_RAW, "scripted-g"), 0);
        let dlq = broker.dump(&dlq_stream(STREAM_RAW));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].1[DLQ_SOURCE_FIELD], STREAM_RAW);
        assert!(dlq[0].1[DLQ_REASON_FIELD].contains("exceeded"));
        // The handler saw it exactly as many times as the budget allows.
        assert_eq!(worker.handler.handled.len(), 3);
    }
}
