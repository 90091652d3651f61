//! Poller: IMAP → `raw_emails.v1`.
//!
//! Runs a per-mailbox scan state machine. Until the initial backfill is
//! complete, each tick searches `SINCE <now − INITIAL_SCAN_DAYS>` and works
//! through the window in capped, ascending batches; afterwards it tails
//! `UID last+1:*`.
//!
//! Candidates pass a pluggable subject gate before the (much larger) body is
//! ever pulled into the pipeline. The default gate admits everything; the
//! LLM-backed gate keeps manifestly irrelevant promotional traffic out.
//!
//! The UID watermark advances only over successful publishes: a candidate the
//! gate or header parse deliberately skipped stays above it and is presented
//! again on later polls, and a poll that publishes nothing moves nothing. Any
//! failure aborts the batch before the watermark write — a crash between
//! publish and watermark write just republishes under the same `idemp_key`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::broker::{STREAM_RAW, StreamBroker};
use crate::config::ScanConfig;
use crate::error::MailsiftResult;
use crate::event::{RawEmail, build_idempotency_key, derive_provider, new_trace_id};
use crate::llm::{LlmClient, extract_json};
use crate::mail::{FetchedMessage, MailSource};
use crate::normalize::summarize;
use crate::storage::Storage;

/// Gate admission floor for the LLM-backed gate.
const GATE_CONFIDENCE_MIN: f64 = 0.7;

/// Backoff floor and ceiling for failed polls.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

// ── SubjectGate ─────────────────────────────────────────────────────────

/// Pre-publish predicate over `(from, subject)`.
pub trait SubjectGate: Send + Sync {
    fn admit(&self, from: &str, subject: &str) -> MailsiftResult<bool>;
}

/// Trivial gate: everything passes.
#[derive(Debug, Default)]
pub struct PassAllGate;

impl SubjectGate for PassAllGate {
    fn admit(&self, _from: &str, _subject: &str) -> MailsiftResult<bool> {
        Ok(true)
    }
}

/// LLM-backed gate returning `{is_subscription, confidence}`.
///
/// Admits iff `is_subscription && confidence ≥ 0.7`. A reply that is not
/// parseable JSON rejects the candidate with a warning; transport failures
/// propagate so the batch retries.
pub struct LlmSubjectGate {
    llm: Arc<dyn LlmClient>,
}

impl LlmSubjectGate {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(from: &str, subject: &str) -> String {
        format!(
            "You screen email headers for a subscription-tracking pipeline.\n\
             Decide from the headers alone whether this looks like subscription, \
             billing, renewal, or recurring-service mail.\n\n\
             From: {from}\n\
             Subject: {subject}\n\n\
             Return exactly one JSON object, with no text or explanations:\n\
             {{\"is_subscription\": <true|false>, \"confidence\": <float 0.0-1.0>}}"
        )
    }
}

impl SubjectGate for LlmSubjectGate {
    fn admit(&self, from: &str, subject: &str) -> MailsiftResult<bool> {
        let reply = self.llm.complete(&Self::prompt(from, subject))?;
        let json = match extract_json(&reply) {
            Ok(json) => json,
            Err(e) => {
                warn!(service = "imap_poller", error = %e, subject, "gate reply unusable, rejecting");
                return Ok(false);
            }
        };
        let is_subscription = json["is_subscription"].as_bool().unwrap_or(false);
        let confidence = json["confidence"].as_f64().unwrap_or(0.0);
        Ok(is_subscription && confidence >= GATE_CONFIDENCE_MIN)
    }
}

// ── Poller ──────────────────────────────────────────────────────────────

/// Which scan mode a poll ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Initial,
    Incremental,
}

/// Result of one poll tick.
#[derive(Debug, Clone)]
pub struct PollSummary {
    pub mode: ScanMode,
    /// Candidate UIDs this tick (after the watermark filter, before the cap).
    pub found: usize,
    /// Events actually published.
    pub published: usize,
    /// Watermark after this tick.
    pub watermark: u32,
    /// Whether the initial backfill is still running after this tick.
    pub initial_running: bool,
}

/// IMAP poller for one mailbox.
pub struct Poller {
    mailbox_id: String,
    provider: String,
    source: Box<dyn MailSource>,
    broker: Arc<dyn StreamBroker>,
    storage: Arc<dyn Storage>,
    gate: Box<dyn SubjectGate>,
    scan: ScanConfig,
    pool: rayon::ThreadPool,
    shutdown: Arc<AtomicBool>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox_id: impl Into<String>,
        provider_override: Option<String>,
        source: Box<dyn MailSource>,
        broker: Arc<dyn StreamBroker>,
        storage: Arc<dyn Storage>,
        gate: Box<dyn SubjectGate>,
        scan: ScanConfig,
        pool_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> MailsiftResult<Self> {
        let mailbox_id = mailbox_id.into();
        let provider = provider_override.unwrap_or_else(|| derive_provider(&mailbox_id));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size.max(1))
            .build()
            .map_err(|e| crate::error::ConfigError::InvalidVar {
                name: "WORKER_POOL_SIZE",
                value: e.to_string(),
            })?;
        Ok(Self {
            mailbox_id,
            provider,
            source,
            broker,
            storage,
            gate,
            scan,
            pool,
            shutdown,
        })
    }

    /// Poll until the shutdown flag is set, pacing by scan phase and backing
    /// off exponentially on failed ticks.
    pub fn run(&mut self) -> MailsiftResult<()> {
        info!(service = "imap_poller", mailbox_id = %self.mailbox_id, "poller starting");

        let mut backoff = BACKOFF_MIN;
        while !self.shutdown.load(Ordering::SeqCst) {
            let pause = match self.poll_once() {
                Ok(summary) => {
                    backoff = BACKOFF_MIN;
                    self.scan.interval(summary.initial_running)
                }
                Err(e) => {
                    warn!(service = "imap_poller", error = %e, "poll failed, backing off");
                    let pause = backoff;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    pause
                }
            };
            // Sleep in small slices so shutdown stays responsive.
            let mut remaining = pause;
            while remaining > Duration::ZERO && !self.shutdown.load(Ordering::SeqCst) {
                let slice = remaining.min(Duration::from_millis(250));
                std::thread::sleep(slice);
                remaining -= slice;
            }
        }

        info!(service = "imap_poller", "poller stopped");
        Ok(())
    }

    /// One tick of the scan state machine.
    pub fn poll_once(&mut self) -> MailsiftResult<PollSummary> {
        let status = self.storage.scan_status(&self.mailbox_id)?;
        if status.initial_scan_completed {
            self.incremental_scan(status.last_scan_uid)
        } else {
            self.initial_scan(status.last_scan_uid)
        }
    }

    /// INITIAL: work through the backfill window in capped ascending batches;
    /// a batch smaller than the cap exhausts the window and completes the scan.
    fn initial_scan(&mut self, last_uid: u32) -> MailsiftResult<PollSummary> {
        let since = (Utc::now() - chrono::Duration::days(self.scan.initial_scan_days))
            .date_naive();
        let uids: Vec<u32> = self
            .source
            .search_since(since)?
            .into_iter()
            .filter(|&u| u > last_uid)
            .collect();

        let exhausted = uids.len() <= self.scan.batch_cap;
        let batch: Vec<u32> = uids.iter().copied().take(self.scan.batch_cap).collect();
        let found = uids.len();

        let (published, max_published) = self.publish_batch(&batch)?;
        let watermark = last_uid.max(max_published);

        if exhausted {
            // Completion carries the watermark forward unchanged when nothing
            // was published; skipped candidates stay above it.
            self.storage
                .complete_initial_scan(&self.mailbox_id, watermark)?;
            info!(
                service = "imap_poller",
                mailbox_id = %self.mailbox_id,
                last_scan_uid = watermark,
                "initial scan complete"
            );
        } else if published > 0 {
            self.storage
                .advance_scan_uid(&self.mailbox_id, max_published)?;
        }

        Ok(PollSummary {
            mode: ScanMode::Initial,
            found,
            published,
            watermark,
            initial_running: !exhausted,
        })
    }

    /// INCREMENTAL: tail everything above the watermark, ascending.
    fn incremental_scan(&mut self, last_uid: u32) -> MailsiftResult<PollSummary> {
        let uids = self.source.search_above(last_uid)?;
        let found = uids.len();
        let batch: Vec<u32> = uids.into_iter().take(self.scan.batch_cap).collect();

        let (published, max_published) = self.publish_batch(&batch)?;
        let watermark = last_uid.max(max_published);
        if published > 0 {
            self.storage
                .advance_scan_uid(&self.mailbox_id, max_published)?;
        }

        Ok(PollSummary {
            mode: ScanMode::Incremental,
            found,
            published,
            watermark,
            initial_running: false,
        })
    }

    /// Fetch and publish one batch with bounded parallelism.
    ///
    /// Returns `(published, max_published_uid)` — the UID high-water mark is
    /// taken over successful publishes only, so a skipped candidate is
    /// re-presented on a later poll and a batch with zero publishes moves
    /// nothing. Any failure aborts the whole batch; republishing later is
    /// safe by `idemp_key`.
    fn publish_batch(&mut self, uids: &[u32]) -> MailsiftResult<(usize, u32)> {
        if uids.is_empty() {
            return Ok((0, 0));
        }

        let messages = self.source.fetch_batch(uids)?;
        let broker = &*self.broker;
        let gate = &*self.gate;
        let mailbox_id = self.mailbox_id.as_str();
        let provider = self.provider.as_str();

        let results: Vec<MailsiftResult<bool>> = self.pool.install(|| {
            messages
                .par_iter()
                .map(|message| publish_one(broker, gate, mailbox_id, provider, message))
                .collect()
        });

        let mut published = 0;
        let mut max_published_uid = 0;
        for (message, result) in messages.iter().zip(results) {
            if result? {
                published += 1;
                max_published_uid = max_published_uid.max(message.uid);
            }
        }
        Ok((published, max_published_uid))
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("mailbox_id", &self.mailbox_id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Gate and publish a single fetched message.
///
/// `Ok(true)` published, `Ok(false)` deliberately skipped (unparseable
/// headers or gate rejection); errors abort the batch.
fn publish_one(
    broker: &dyn StreamBroker,
    gate: &dyn SubjectGate,
    mailbox_id: &str,
    provider: &str,
    message: &FetchedMessage,
) -> MailsiftResult<bool> {
    let Some(summary) = summarize(&message.data) else {
        warn!(
            service = "imap_poller",
            uid = message.uid,
            "unparseable headers, skipping"
        );
        return Ok(false);
    };

    if !gate.admit(&summary.from, &summary.subject)? {
        info!(
            service = "imap_poller",
            uid = message.uid,
            subject = %summary.subject,
            "gated out"
        );
        return Ok(false);
    }

    let external_id = summary
        .message_id
        .clone()
        .unwrap_or_else(|| message.uid.to_string());
    let idemp_key = build_idempotency_key(provider, mailbox_id, &external_id);

    let event = RawEmail {
        trace_id: new_trace_id(),
        mailbox_id: mailbox_id.to_string(),
        external_id,
        received_ts: summary
            .date
            .unwrap_or_else(|| Utc::now().timestamp().max(0) as u64),
        idemp_key: idemp_key.clone(),
        subject: summary.subject.clone(),
        raw_email_b64: BASE64.encode(&message.data),
    };

    let stream_message_id = broker.append(STREAM_RAW, &event.to_fields())?;
    info!(
        service = "imap_poller",
        stream_message_id = %stream_message_id,
        idemp_key = %idemp_key,
        subject = %event.subject,
        "published"
    );
    Ok(true)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::ScanConfig;
    use crate::llm::MockLlm;
    use crate::mail::MockMailSource;
    use crate::storage::MemoryStorage;

    fn email(uid: u32, subject: &str) -> (u32, Vec<u8>) {
        let raw = format!(
            "From: Netflix <info@netflix.com>\r\n\
             To: alice@gmail.com\r\n\
             Subject: {subject}\r\n\
             Message-ID: <m-{uid}@netflix.com>\r\n\
             Date: Sat, 20 Nov 2021 14:22:01 -0800\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             body of {uid}\r\n"
        );
        (uid, raw.into_bytes())
    }

    fn scan_config(batch_cap: usize) -> ScanConfig {
        ScanConfig {
            batch_cap,
            poll_interval_secs: 30,
            initial_poll_interval_secs: 60,
            initial_scan_days: 450,
        }
    }

    struct Rig {
        broker: Arc<MemoryBroker>,
        storage: Arc<MemoryStorage>,
        poller: Poller,
    }

    fn rig(messages: Vec<(u32, Vec<u8>)>, batch_cap: usize, gate: Box<dyn SubjectGate>) -> Rig {
        let broker = Arc::new(MemoryBroker::new());
        let storage = Arc::new(MemoryStorage::new());
        let mut source = MockMailSource::new();
        for (uid, data) in messages {
            source.push(uid, data);
        }
        let poller = Poller::new(
            "alice@gmail.com",
            None,
            Box::new(source),
            Arc::clone(&broker) as Arc<dyn StreamBroker>,
            Arc::clone(&storage) as Arc<dyn Storage>,
            gate,
            scan_config(batch_cap),
            2,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        Rig {
            broker,
            storage,
            poller,
        }
    }

    #[test]
    fn initial_scan_publishes_and_completes_when_exhausted() {
        let mut rig = rig(
            vec![email(10, "a"), email(12, "b"), email(15, "c")],
            100,
            Box::new(PassAllGate),
        );

        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.mode, ScanMode::Initial);
        assert_eq!(summary.published, 3);
        assert_eq!(summary.watermark, 15);
        assert!(!summary.initial_running);

        let status = rig.storage.scan_status("alice@gmail.com").unwrap();
        assert!(status.initial_scan_completed);
        assert_eq!(status.last_scan_uid, 15);
        assert_eq!(rig.broker.stream_len(STREAM_RAW).unwrap(), 3);
    }

    #[test]
    fn initial_scan_respects_batch_cap_until_exhausted() {
        let messages: Vec<_> = (1..=5).map(|uid| email(uid, "s")).collect();
        let mut rig = rig(messages, 2, Box::new(PassAllGate));

        let first = rig.poller.poll_once().unwrap();
        assert_eq!(first.published, 2);
        assert!(first.initial_running);
        assert_eq!(
            rig.storage.scan_status("alice@gmail.com").unwrap().last_scan_uid,
            2
        );

        let second = rig.poller.poll_once().unwrap();
        assert_eq!(second.published, 2);
        assert!(second.initial_running);

        let third = rig.poller.poll_once().unwrap();
        assert_eq!(third.published, 1);
        assert!(!third.initial_running);
        assert!(
            rig.storage
                .scan_status("alice@gmail.com")
                .unwrap()
                .initial_scan_completed
        );
    }

    #[test]
    fn incremental_scan_ignores_uids_below_watermark() {
        let mut rig = rig(
            vec![email(10, "a"), email(12, "b"), email(15, "c")],
            100,
            Box::new(PassAllGate),
        );
        rig.poller.poll_once().unwrap(); // completes initial scan at 15

        // UID 11 shows up late: the range search 16:* never sees it.
        let mut source = MockMailSource::new();
        for (uid, data) in [email(10, "a"), email(11, "late"), email(12, "b"), email(15, "c")] {
            source.push(uid, data);
        }
        rig.poller.source = Box::new(source);
        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.mode, ScanMode::Incremental);
        assert_eq!(summary.published, 0);
        assert_eq!(summary.watermark, 15);
        assert_eq!(rig.broker.stream_len(STREAM_RAW).unwrap(), 3);
    }

    #[test]
    fn idle_incremental_scan_changes_nothing() {
        let mut rig = rig(vec![email(7, "a")], 100, Box::new(PassAllGate));
        rig.poller.poll_once().unwrap();
        let before = rig.storage.scan_status("alice@gmail.com").unwrap();

        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.found, 0);
        assert_eq!(summary.published, 0);
        let after = rig.storage.scan_status("alice@gmail.com").unwrap();
        assert_eq!(before.last_scan_uid, after.last_scan_uid);
    }

    #[test]
    fn republished_uid_keeps_its_idempotency_key() {
        let mut rig = rig(vec![email(10, "a")], 100, Box::new(PassAllGate));
        rig.poller.poll_once().unwrap();

        // Force a second publish of the same message (watermark reset).
        let mut source = MockMailSource::new();
        let (uid, data) = email(10, "a");
        source.push(uid, data);
        rig.poller.source = Box::new(source);
        rig.poller.incremental_scan(0).unwrap();

        let entries = rig.broker.dump(STREAM_RAW);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1["idemp_key"], entries[1].1["idemp_key"]);
    }

    #[test]
    fn llm_gate_blocks_non_subscription_mail() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::answering(
            r#"{"is_subscription": false, "confidence": 0.95}"#,
        ));
        let mut rig = rig(
            vec![email(3, "hey, lunch tomorrow?")],
            100,
            Box::new(LlmSubjectGate::new(llm)),
        );

        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.published, 0);
        assert_eq!(rig.broker.stream_len(STREAM_RAW).unwrap(), 0);
        // No publish succeeded, so the watermark must not move.
        assert_eq!(summary.watermark, 0);
        assert_eq!(
            rig.storage.scan_status("alice@gmail.com").unwrap().last_scan_uid,
            0
        );

        // The gated candidate is presented (and gated) again next tick.
        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.mode, ScanMode::Incremental);
        assert_eq!(summary.found, 1);
        assert_eq!(summary.published, 0);
        assert_eq!(summary.watermark, 0);
    }

    /// Test gate admitting only subjects with a given prefix.
    struct SubjectPrefixGate(&'static str);

    impl SubjectGate for SubjectPrefixGate {
        fn admit(&self, _from: &str, subject: &str) -> MailsiftResult<bool> {
            Ok(subject.starts_with(self.0))
        }
    }

    #[test]
    fn watermark_stops_at_the_highest_published_uid() {
        // UID 5 passes the gate, UID 6 above it does not.
        let mut rig = rig(
            vec![email(5, "sub: receipt"), email(6, "lunch?")],
            100,
            Box::new(SubjectPrefixGate("sub:")),
        );

        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.published, 1);
        assert_eq!(summary.watermark, 5);
        let status = rig.storage.scan_status("alice@gmail.com").unwrap();
        assert!(status.initial_scan_completed);
        assert_eq!(status.last_scan_uid, 5);

        // The skipped UID 6 stays above the watermark and comes back.
        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.found, 1);
        assert_eq!(summary.published, 0);
        assert_eq!(
            rig.storage.scan_status("alice@gmail.com").unwrap().last_scan_uid,
            5
        );
        assert_eq!(rig.broker.stream_len(STREAM_RAW).unwrap(), 1);
    }

    #[test]
    fn llm_gate_admits_confident_subscription_mail() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::answering(
            r#"{"is_subscription": true, "confidence": 0.9}"#,
        ));
        let mut rig = rig(
            vec![email(4, "Your Netflix receipt")],
            100,
            Box::new(LlmSubjectGate::new(llm)),
        );

        let summary = rig.poller.poll_once().unwrap();
        assert_eq!(summary.published, 1);
    }

    #[test]
    fn gate_on_confidence_boundary_admits() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::answering(
            r#"{"is_subscription": true, "confidence": 0.7}"#,
        ));
        let gate = LlmSubjectGate::new(llm);
        assert!(gate.admit("a@b.com", "Invoice").unwrap());
    }

    #[test]
    fn imap_failure_leaves_watermark_untouched() {
        let mut rig = rig(vec![email(9, "a")], 100, Box::new(PassAllGate));
        rig.poller.poll_once().unwrap();

        let mut source = MockMailSource::new();
        source.push(20, email(20, "b").1);
        source.fail_next();
        rig.poller.source = Box::new(source);

        assert!(rig.poller.poll_once().is_err());
        assert_eq!(
            rig.storage.scan_status("alice@gmail.com").unwrap().last_scan_uid,
            9
        );
    }
}
