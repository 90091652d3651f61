//! Normalizer: `raw_emails.v1` → `emails.normalized.v1`.
//!
//! Decodes the raw MIME blob, extracts clean text, fingerprints it, and
//! republishes with the `idemp_key` carried forward unchanged. Unparseable
//! messages are garbage, not retryable — the harness acks them on the
//! malformed error this handler returns.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::info;

use super::EventHandler;
use crate::broker::{Delivery, STREAM_NORMALIZED, STREAM_RAW, StreamBroker};
use crate::error::{BrokerError, MailsiftResult, NormalizeError};
use crate::event::{NormalizedEmail, RawEmail, TEXT_CONTENT_MAX};
use crate::normalize::{normalize, truncate_chars};

/// Normalizer stage handler.
pub struct Normalizer {
    broker: Arc<dyn StreamBroker>,
}

impl Normalizer {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self { broker }
    }
}

impl EventHandler for Normalizer {
    fn service(&self) -> &'static str {
        "normalizer"
    }

    fn stream(&self) -> String {
        STREAM_RAW.to_string()
    }

    fn group(&self) -> String {
        "normalizer-g".to_string()
    }

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
        let raw = RawEmail::from_fields(&delivery.fields).map_err(|e| {
            BrokerError::MalformedEntry {
                stream: delivery.stream.clone(),
                id: delivery.id.clone(),
                message: e.to_string(),
            }
        })?;

        let bytes = BASE64
            .decode(&raw.raw_email_b64)
            .map_err(|e| NormalizeError::Decode {
                message: e.to_string(),
            })?;

        let clean = normalize(&bytes)?;

        let event = NormalizedEmail {
            trace_id: raw.trace_id,
            mailbox_id: raw.mailbox_id,
            idemp_key: raw.idemp_key,
            body_hash: clean.body_hash,
            text_content: truncate_chars(&clean.text, TEXT_CONTENT_MAX),
            subject: raw.subject,
            external_id: raw.external_id,
            received_ts: raw.received_ts,
        };

        let out_id = self.broker.append(STREAM_NORMALIZED, &event.to_fields())?;
        info!(
            service = "normalizer",
            trace_id = %event.trace_id,
            idemp_key = %event.idemp_key,
            stream_message_id = %out_id,
            body_hash = %&event.body_hash[..16],
            text_length = event.text_content.chars().count(),
            "published"
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
