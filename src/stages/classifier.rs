//! Classifier: `emails.to_classify.v1` → `emails.classified.v1`.
//!
//! Builds a watcher-conditioned prompt, asks the LLM for one JSON object
//! `{class, confidence, extracted_data}`, and publishes when the semantic
//! filter vouched for the email (a watcher routed it), the model is
//! confident, or anything at all was extracted. The watcher name always wins
//! over whatever `class` the model set.

use std::sync::Arc;

use tracing::{info, warn};

use super::EventHandler;
use crate::broker::{Delivery, STREAM_CLASSIFIED, STREAM_TO_CLASSIFY, StreamBroker};
use crate::error::{BrokerError, MailsiftResult};
use crate::event::{ClassifiedEmail, RoutedEmail};
use crate::llm::{LlmClient, extract_json};
use crate::normalize::truncate_chars;

/// Publish floor when no other signal vouches for the classification.
const PUBLISH_CONFIDENCE_MIN: f64 = 0.7;

/// Body characters included in the prompt.
const PROMPT_BODY_LIMIT: usize = 2000;

fn classification_prompt(
    watcher_name: &str,
    query_text: &str,
    from: &str,
    subject: &str,
    body: &str,
) -> String {
    let body = truncate_chars(body, PROMPT_BODY_LIMIT);
    format!(
        "You classify emails based on user-defined intent (watchers).\n\n\
         USER INTENT:\n\
         - Watcher name: {watcher_name}\n\
         - User query: {query_text}\n\n\
         EMAIL INPUT:\n\
         From: {from}\n\
         Subject: {subject}\n\
         Body: {body}\n\n\
         TASK:\n\
         1. Determine if this email matches the user's intent (confidence 0.0-1.0).\n\
         2. Put ALL extracted info into extracted_data. Only include fields that are present.\n   \
            Examples by watcher type:\n   \
            - Billing: {{\"vendor\": \"Netflix\", \"amount_cents\": 1999, \"currency\": \"USD\", \"invoice_id\": \"...\"}}\n   \
            - Flights: {{\"airline\": \"United\", \"flight_number\": \"UA123\", \"departure\": \"2025-02-15\", \"confirmation\": \"...\"}}\n   \
            - Rentals: {{\"company\": \"Hertz\", \"pickup_date\": \"2025-02-20\"}}\n   \
            - Use empty {{}} if nothing to extract\n\
         3. Set class to exactly: \"{watcher_name}\"\n\
         4. Do not infer information not explicitly present.\n\n\
         OUTPUT FORMAT:\n\
         Return exactly one JSON object, with no text or explanations.\n\n\
         ```json\n\
         {{\n  \"class\": \"{watcher_name}\",\n  \"confidence\": <float between 0.0 and 1.0>,\n  \
         \"extracted_data\": {{ <all relevant key-value pairs for this watcher type> }}\n}}"
    )
}

/// Classifier stage handler.
pub struct Classifier {
    broker: Arc<dyn StreamBroker>,
    llm: Arc<dyn LlmClient>,
}

impl Classifier {
    pub fn new(broker: Arc<dyn StreamBroker>, llm: Arc<dyn LlmClient>) -> Self {
        Self { broker, llm }
    }
}

impl EventHandler for Classifier {
    fn service(&self) -> &'static str {
        "classifier"
    }

    fn stream(&self) -> String {
        STREAM_TO_CLASSIFY.to_string()
    }

    fn group(&self) -> String {
        "classifier-g".to_string()
    }

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
        let routed = RoutedEmail::from_fields(&delivery.fields).map_err(|e| {
            BrokerError::MalformedEntry {
                stream: delivery.stream.clone(),
                id: delivery.id.clone(),
                message: e.to_string(),
            }
        })?;
        let email = &routed.email;
        let route = routed.best();

        if email.text_content.trim().is_empty() {
            warn!(
                service = "classifier",
                trace_id = %email.trace_id,
                "no text content to classify, skipping"
            );
            return Ok(());
        }

        let prompt = classification_prompt(
            &route.watcher_name,
            &route.query_text,
            &email.mailbox_id,
            &email.subject,
            &email.text_content,
        );
        let reply = self.llm.complete(&prompt)?;
        let json = extract_json(&reply)?;

        let model_class = json["class"].as_str().unwrap_or_default().to_string();
        let confidence = json["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        let extracted_data = match &json["extracted_data"] {
            serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
            _ => serde_json::json!({}),
        };

        let has_extraction = extracted_data
            .as_object()
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        // The watcher routed it: that alone is enough to publish.
        if confidence < PUBLISH_CONFIDENCE_MIN && !has_extraction && route.watcher_name.is_empty()
        {
            info!(
                service = "classifier",
                trace_id = %email.trace_id,
                "no classification found, skipping"
            );
            return Ok(());
        }

        // `class` is exactly the routing watcher's name; the model's value
        // only stands in when no watcher name exists.
        let class = if route.watcher_name.is_empty() {
            model_class
        } else {
            route.watcher_name.clone()
        };

        let event = ClassifiedEmail {
            trace_id: email.trace_id.clone(),
            mailbox_id: email.mailbox_id.clone(),
            idemp_key: email.idemp_key.clone(),
            body_hash: email.body_hash.clone(),
            subject: email.subject.clone(),
            external_id: email.external_id.clone(),
            received_ts: email.received_ts,
            class,
            confidence,
            watcher_id: route.watcher_id.clone(),
            extracted_data,
        };

        let out_id = self.broker.append(STREAM_CLASSIFIED, &event.to_fields())?;
        info!(
            service = "classifier",
            trace_id = %event.trace_id,
            stream_message_id = %out_id,
            class = %event.class,
            confidence = event.confidence,
            "classified"
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::LlmError;
    use crate::event::{NormalizedEmail, RouteMatch};
    use crate::llm::MockLlm;

    fn routed() -> RoutedEmail {
        RoutedEmail {
            email: NormalizedEmail {
                trace_id: "t-1".into(),
                mailbox_id: "alice@gmail.com".into(),
                idemp_key: "k".into(),
                body_hash: "h".into(),
                text_content: "Thanks for your payment. amount $15.99 charged.".into(),
                subject: "Your Netflix receipt".into(),
                external_id: "10".into(),
                received_ts: 5,
            },
            routes: vec![RouteMatch {
                watcher_id: "w-1".into(),
                watcher_name: "Billing".into(),
                query_id: "q-1".into(),
                query_text: "invoice, payment, receipt".into(),
                similarity: 0.84,
            }],
        }
    }

    fn delivery(event: &RoutedEmail) -> Delivery {
        Delivery {
            stream: STREAM_TO_CLASSIFY.to_string(),
            id: "1-0".to_string(),
            fields: event.to_fields(),
            delivery_count: 1,
        }
    }

    fn rig(llm: MockLlm) -> (Arc<MemoryBroker>, Classifier) {
        let broker = Arc::new(MemoryBroker::new());
        let classifier = Classifier::new(
            Arc::clone(&broker) as Arc<dyn StreamBroker>,
            Arc::new(llm),
        );
        (broker, classifier)
    }

    #[test]
    fn publishes_extraction_with_watcher_class() {
        let llm = MockLlm::answering(
            "```json\n{\"class\": \"Billing\", \"confidence\": 0.92, \
             \"extracted_data\": {\"vendor\": \"Netflix\", \"amount_cents\": 1599}}\n```",
        );
        let (broker, mut classifier) = rig(llm);

        classifier.handle(&delivery(&routed())).unwrap();

        let out = broker.dump(STREAM_CLASSIFIED);
        assert_eq!(out.len(), 1);
        let event = ClassifiedEmail::from_fields(&out[0].1).unwrap();
        assert_eq!(event.class, "Billing");
        assert!(event.confidence >= 0.7);
        assert_eq!(event.extracted_data["vendor"], "Netflix");
        assert_eq!(event.watcher_id, "w-1");
    }

    #[test]
    fn watcher_name_overrides_model_class() {
        let llm = MockLlm::answering(
            "{\"class\": \"something-else\", \"confidence\": 0.9, \"extracted_data\": {}}",
        );
        let (broker, mut classifier) = rig(llm);

        classifier.handle(&delivery(&routed())).unwrap();

        let event = ClassifiedEmail::from_fields(&broker.dump(STREAM_CLASSIFIED)[0].1).unwrap();
        assert_eq!(event.class, "Billing");
    }

    #[test]
    fn missing_class_falls_back_to_watcher_name() {
        let llm = MockLlm::answering("{\"confidence\": 0.3, \"extracted_data\": {}}");
        let (broker, mut classifier) = rig(llm);

        // Low confidence, no extraction — but a watcher routed it, so publish.
        classifier.handle(&delivery(&routed())).unwrap();

        let out = broker.dump(STREAM_CLASSIFIED);
        assert_eq!(out.len(), 1);
        let event = ClassifiedEmail::from_fields(&out[0].1).unwrap();
        assert_eq!(event.class, "Billing");
        assert!((event.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn malformed_reply_is_dropped_not_retried() {
        let llm = MockLlm::answering("I could not classify this email, sorry!");
        let (broker, mut classifier) = rig(llm);

        let err = classifier.handle(&delivery(&routed())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
        assert!(broker.dump(STREAM_CLASSIFIED).is_empty());
    }

    #[test]
    fn llm_outage_is_transient() {
        let llm = MockLlm::answering("{}");
        llm.push_error(LlmError::RequestFailed {
            message: "connect timeout".into(),
        });
        let (broker, mut classifier) = rig(llm);

        let err = classifier.handle(&delivery(&routed())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
        assert!(broker.dump(STREAM_CLASSIFIED).is_empty());
    }

    #[test]
    fn confidence_is_clamped_into_unit_interval() {
        let llm = MockLlm::answering(
            "{\"class\": \"Billing\", \"confidence\": 1.7, \"extracted_data\": {}}",
        );
        let (broker, mut classifier) = rig(llm);

        classifier.handle(&delivery(&routed())).unwrap();
        let event = ClassifiedEmail::from_fields(&broker.dump(STREAM_CLASSIFIED)[0].1).unwrap();
        assert!((event.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_body_is_skipped_with_ack() {
        let llm = MockLlm::answering("{}");
        let (broker, mut classifier) = rig(llm);

        let mut event = routed();
        event.email.text_content = "   ".into();
        classifier.handle(&delivery(&event)).unwrap();
        assert!(broker.dump(STREAM_CLASSIFIED).is_empty());
    }

    #[test]
    fn prompt_carries_watcher_intent_and_email() {
        let llm = Arc::new(MockLlm::answering(
            "{\"class\": \"Billing\", \"confidence\": 0.9}",
        ));
        let broker = Arc::new(MemoryBroker::new());
        let mut classifier = Classifier::new(
            Arc::clone(&broker) as Arc<dyn StreamBroker>,
            Arc::clone(&llm) as Arc<dyn LlmClient>,
        );
        classifier.handle(&delivery(&routed())).unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Watcher name: Billing"));
        assert!(prompts[0].contains("invoice, payment, receipt"));
        assert!(prompts[0].contains("Your Netflix receipt"));
    }
}
