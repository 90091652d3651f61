//! Persister: `emails.classified.v1` → storage.
//!
//! Two upserts per event — message by `idemp_key`, classification by
//! `message_id` — with no distributed transaction between them. The handler
//! only returns `Ok` once both have landed, so a failure after the message
//! upsert leaves the entry pending and the redelivery retries the pair; the
//! message row survives and the classification fills in then.

use std::sync::Arc;

use chrono::DateTime;
use tracing::info;

use super::EventHandler;
use crate::broker::{Delivery, STREAM_CLASSIFIED};
use crate::error::{BrokerError, MailsiftResult};
use crate::event::ClassifiedEmail;
use crate::storage::{ClassificationUpsert, MessageUpsert, Storage};

/// Persister stage handler.
pub struct Persister {
    storage: Arc<dyn Storage>,
}

impl Persister {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl EventHandler for Persister {
    fn service(&self) -> &'static str {
        "persister"
    }

    fn stream(&self) -> String {
        STREAM_CLASSIFIED.to_string()
    }

    fn group(&self) -> String {
        "persister-g".to_string()
    }

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
        let event = ClassifiedEmail::from_fields(&delivery.fields).map_err(|e| {
            BrokerError::MalformedEntry {
                stream: delivery.stream.clone(),
                id: delivery.id.clone(),
                message: e.to_string(),
            }
        })?;

        let received_at = DateTime::from_timestamp(event.received_ts as i64, 0);
        let message = self.storage.upsert_message(&MessageUpsert {
            idemp_key: event.idemp_key.clone(),
            mailbox_id: event.mailbox_id.clone(),
            external_id: event.external_id.clone(),
            subject: event.subject.clone(),
            body_hash: event.body_hash.clone(),
            received_at,
        })?;

        self.storage.upsert_classification(&ClassificationUpsert {
            message_id: message.id,
            class: event.class.clone(),
            confidence: event.confidence,
            watcher_id: (!event.watcher_id.is_empty()).then(|| event.watcher_id.clone()),
            extracted_data: event.extracted_data.clone(),
        })?;

        info!(
            service = "persister",
            trace_id = %event.trace_id,
            idemp_key = %event.idemp_key,
            message_id = message.id,
            class = %event.class,
            "persisted"
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
