//! SemanticFilter: `emails.normalized.v1` → `emails.to_classify.v1`.
//!
//! The routing brain. Assembles `subject + "\n" + text`, resolves the email
//! embedding through the write-through cache, runs the top-K vector search
//! over the mailbox's watcher prototypes, and routes to the classifier iff
//! the best match clears its watcher's own threshold (≥, not >).
//!
//! Deliberate drops — too little text, no active watchers, cache-only miss,
//! below threshold — return `Ok(())` so the harness acks exactly once on
//! handler exit, whatever the decision was.

use std::sync::Arc;

use tracing::info;

use super::EventHandler;
use crate::broker::{Delivery, STREAM_NORMALIZED, STREAM_TO_CLASSIFY, StreamBroker};
use crate::embed::{EmbeddingClient, similarity_from_distance};
use crate::error::{BrokerError, MailsiftResult};
use crate::event::{NormalizedEmail, RouteMatch, RoutedEmail};
use crate::normalize::truncate_chars;
use crate::storage::Storage;
use crate::watchers::{WATCHER_CACHE_TTL, WatcherCache};

/// Prototype rows requested from the vector search.
const TOP_K: usize = 5;

/// Assembled email text shorter than this carries too little signal.
const MIN_EMAIL_TEXT: usize = 40;

/// Assembled email text ceiling (characters).
const EMAIL_TEXT_LIMIT: usize = 1000;

/// Build the text that gets embedded: `subject + "\n" + body`, capped.
fn build_email_text(subject: &str, text_content: &str) -> String {
    let assembled = format!("{}\n{}", subject.trim(), text_content.trim());
    truncate_chars(assembled.trim(), EMAIL_TEXT_LIMIT)
}

/// Semantic filter stage handler.
pub struct SemanticFilter {
    broker: Arc<dyn StreamBroker>,
    storage: Arc<dyn Storage>,
    /// Absent only in cache-only mode, where nothing is ever embedded.
    embedder: Option<Arc<dyn EmbeddingClient>>,
    /// When true, emails without a cached embedding are dropped instead of
    /// embedded (zero-cost test mode).
    cache_only: bool,
    watcher_cache: WatcherCache,
}

impl SemanticFilter {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        storage: Arc<dyn Storage>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
        cache_only: bool,
    ) -> Self {
        Self {
            broker,
            storage,
            embedder,
            cache_only,
            watcher_cache: WatcherCache::new(WATCHER_CACHE_TTL),
        }
    }

    /// Embedding for the event: cache hit, or embed-and-upsert.
    ///
    /// `None` means drop (cache-only mode and nothing cached).
    fn resolve_embedding(
        &self,
        event: &NormalizedEmail,
        email_text: &str,
    ) -> MailsiftResult<Option<Vec<f32>>> {
        if let Some(cached) = self
            .storage
            .cached_embedding(&event.mailbox_id, &event.body_hash)?
        {
            return Ok(Some(cached));
        }

        if self.cache_only {
            info!(
                service = "semantic_filter",
                trace_id = %event.trace_id,
                body_hash = event.body_hash.get(..16).unwrap_or(&event.body_hash),
                "dropped: not in cache (cache-only mode)"
            );
            return Ok(None);
        }

        let embedder = self
            .embedder
            .as_ref()
            .ok_or(crate::error::ConfigError::MissingVar { name: "EMBED_API_KEY" })?;
        let embedding = embedder.embed_one(email_text)?;
        self.storage
            .upsert_embedding(&event.mailbox_id, &event.body_hash, &embedding)?;
        Ok(Some(embedding))
    }
}

impl EventHandler for SemanticFilter {
    fn service(&self) -> &'static str {
        "semantic_filter"
    }

    fn stream(&self) -> String {
        STREAM_NORMALIZED.to_string()
    }

    fn group(&self) -> String {
        "semantic-filter-g".to_string()
    }

    fn handle(&mut self, delivery: &Delivery) -> MailsiftResult<()> {
        let event = NormalizedEmail::from_fields(&delivery.fields).map_err(|e| {
            BrokerError::MalformedEntry {
                stream: delivery.stream.clone(),
                id: delivery.id.clone(),
                message: e.to_string(),
            }
        })?;

        let email_text = build_email_text(&event.subject, &event.text_content);
        if email_text.chars().count() < MIN_EMAIL_TEXT {
            info!(
                service = "semantic_filter",
                trace_id = %event.trace_id,
                "dropped: too little signal"
            );
            return Ok(());
        }

        // No active watchers for this mailbox — skip the embedding spend.
        let storage = &self.storage;
        let mailbox_id = event.mailbox_id.clone();
        let watchers = self
            .watcher_cache
            .active_count(&event.mailbox_id, || {
                storage.active_watcher_count(&mailbox_id)
            })?;
        if watchers == 0 {
            info!(
                service = "semantic_filter",
                trace_id = %event.trace_id,
                mailbox_id = %event.mailbox_id,
                "dropped: no active watchers"
            );
            return Ok(());
        }

        let Some(embedding) = self.resolve_embedding(&event, &email_text)? else {
            return Ok(());
        };

        let candidates =
            self.storage
                .match_watcher_queries(&event.mailbox_id, &embedding, TOP_K)?;
        let Some(best) = candidates.first() else {
            info!(
                service = "semantic_filter",
                trace_id = %event.trace_id,
                "dropped: no prototype candidates"
            );
            return Ok(());
        };

        let similarity = similarity_from_distance(best.cosine_distance);
        if similarity >= best.watcher_threshold {
            let routed = RoutedEmail {
                routes: vec![RouteMatch {
                    watcher_id: best.watcher_id.clone(),
                    watcher_name: best.watcher_name.clone(),
                    query_id: best.query_id.clone(),
                    query_text: best.query_text.clone(),
                    similarity,
                }],
                email: event,
            };
            let out_id = self.broker.append(STREAM_TO_CLASSIFY, &routed.to_fields())?;
            info!(
                service = "semantic_filter",
                trace_id = %routed.email.trace_id,
                stream_message_id = %out_id,
                watcher = %best.watcher_name,
                similarity = format!("{similarity:.3}"),
                threshold = format!("{:.3}", best.watcher_threshold),
                "routed to classifier"
            );
        } else {
            info!(
                service = "semantic_filter",
                trace_id = %event.trace_id,
                watcher = %best.watcher_name,
                similarity = format!("{similarity:.3}"),
                threshold = format!("{:.3}", best.watcher_threshold),
                "Filtered out"
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for SemanticFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticFilter")
            .field("cache_only", &self.cache_only)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::embed::MockEmbedder;
    use crate::storage::MemoryStorage;
    use crate::watchers::create_watcher_bundle;

    fn normalized(subject: &str, text: &str) -> NormalizedEmail {
        NormalizedEmail {
            trace_id: "t-1".into(),
            mailbox_id: "alice@gmail.com".into(),
            idemp_key: "k".into(),
            body_hash: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .into(),
            text_content: text.into(),
            subject: subject.into(),
            external_id: "10".into(),
            received_ts: 5,
        }
    }

    fn delivery(event: &NormalizedEmail) -> Delivery {
        Delivery {
            stream: STREAM_NORMALIZED.to_string(),
            id: "1-0".to_string(),
            fields: event.to_fields(),
            delivery_count: 1,
        }
    }

    struct Rig {
        broker: Arc<MemoryBroker>,
        storage: Arc<MemoryStorage>,
        embedder: Arc<MockEmbedder>,
        filter: SemanticFilter,
    }

    fn rig(cache_only: bool) -> Rig {
        let broker = Arc::new(MemoryBroker::new());
        let storage = Arc::new(MemoryStorage::new());
        let embedder = Arc::new(MockEmbedder::new());
        let filter = SemanticFilter::new(
            Arc::clone(&broker) as Arc<dyn StreamBroker>,
            Arc::clone(&storage) as Arc<dyn Storage>,
            Some(Arc::clone(&embedder) as Arc<dyn EmbeddingClient>),
            cache_only,
        );
        Rig {
            broker,
            storage,
            embedder,
            filter,
        }
    }

    fn add_watcher(rig: &Rig, name: &str, query: &str, threshold: f64) {
        create_watcher_bundle(
            &*rig.storage,
            &*rig.embedder,
            None,
            "alice@gmail.com",
            name,
            query,
            threshold,
            0,
        )
        .unwrap();
    }

    #[test]
    fn matching_email_is_routed_with_metadata() {
        let rig = {
            let mut r = rig(false);
            add_watcher(&r, "Billing", "invoice payment receipt billing", 0.7);
            let event = normalized(
                "Your Netflix receipt",
                "Thanks for the payment. amount $15.99 charged for your subscription renewal.",
            );
            r.filter.handle(&delivery(&event)).unwrap();
            r
        };

        let out = rig.broker.dump(STREAM_TO_CLASSIFY);
        assert_eq!(out.len(), 1);
        let routed = RoutedEmail::from_fields(&out[0].1).unwrap();
        assert_eq!(routed.best().watcher_name, "Billing");
        assert!(routed.best().similarity >= 0.7);
        assert_eq!(routed.email.idemp_key, "k");
    }

    #[test]
    fn unrelated_email_is_filtered_out() {
        let mut r = rig(false);
        add_watcher(&r, "Flights", "flight booking airline departure", 0.8);
        let event = normalized(
            "Weekly newsletter digest",
            "Here is your weekly roundup of articles you might have missed this week.",
        );
        r.filter.handle(&delivery(&event)).unwrap();
        assert!(r.broker.dump(STREAM_TO_CLASSIFY).is_empty());
    }

    #[test]
    fn short_text_is_dropped_without_embedding() {
        let mut r = rig(false);
        add_watcher(&r, "Billing", "invoice", 0.7);
        let calls_after_setup = r.embedder.call_count();

        // 39 characters assembled, one short of the floor.
        let event = normalized("abcdefghij", "klmnopqrstuvwxyz0123456789ab");
        assert_eq!(
            build_email_text(&event.subject, &event.text_content)
                .chars()
                .count(),
            39
        );
        r.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(r.embedder.call_count(), calls_after_setup);
        assert!(r.broker.dump(STREAM_TO_CLASSIFY).is_empty());
    }

    #[test]
    fn threshold_boundary_routes_on_equality() {
        let r = rig(false);
        // Identical text gives similarity 1.0 against its own prototype;
        // a synthetic match at exactly the threshold must route.
        add_watcher(&r, "Billing", "invoice payment receipt", 1.0);
        let mut r = r;
        let event = normalized(
            "invoice payment receipt",
            "invoice payment receipt invoice payment receipt",
        );
        r.filter.handle(&delivery(&event)).unwrap();
        let out = r.broker.dump(STREAM_TO_CLASSIFY);
        assert_eq!(out.len(), 1, "similarity == threshold must route (>=, not >)");
    }

    #[test]
    fn routing_is_monotone_in_threshold() {
        // A moderately-similar candidate: one billing token diluted by noise.
        let event = normalized(
            "order update",
            "your receipt attached alongside various words about nothing in particular today",
        );

        // Dropped at a strict threshold...
        let mut strict = rig(false);
        add_watcher(&strict, "Billing", "invoice payment receipt", 0.9);
        strict.filter.handle(&delivery(&event)).unwrap();
        assert!(strict.broker.dump(STREAM_TO_CLASSIFY).is_empty());

        // ...routed at any laxer one.
        let mut lax = rig(false);
        add_watcher(&lax, "Billing", "invoice payment receipt", 0.6);
        lax.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(lax.broker.dump(STREAM_TO_CLASSIFY).len(), 1);
    }

    #[test]
    fn cache_hit_skips_the_embedding_service() {
        let mut r = rig(false);
        add_watcher(&r, "Billing", "invoice payment receipt billing", 0.5);
        let event = normalized(
            "Your Netflix receipt",
            "Thanks for the payment. amount $15.99 charged for your subscription.",
        );
        let email_text = build_email_text(&event.subject, &event.text_content);
        let calls_after_setup = r.embedder.call_count();
        r.storage
            .upsert_embedding(
                &event.mailbox_id,
                &event.body_hash,
                &MockEmbedder::vector_for(&email_text),
            )
            .unwrap();

        r.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(r.embedder.call_count(), calls_after_setup);
        assert_eq!(r.broker.dump(STREAM_TO_CLASSIFY).len(), 1);
    }

    #[test]
    fn cache_only_mode_drops_uncached_emails() {
        let mut r = rig(true);
        add_watcher(&r, "Billing", "invoice payment receipt billing", 0.5);
        let event = normalized(
            "Your Netflix receipt",
            "Thanks for the payment. amount $15.99 charged for your subscription.",
        );
        let calls_after_setup = r.embedder.call_count();

        r.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(r.embedder.call_count(), calls_after_setup);
        assert!(r.broker.dump(STREAM_TO_CLASSIFY).is_empty());
        assert_eq!(r.storage.embedding_rows(), 0);
    }

    #[test]
    fn miss_populates_the_cache_write_through() {
        let mut r = rig(false);
        add_watcher(&r, "Billing", "invoice payment receipt billing", 0.5);
        let event = normalized(
            "Your Netflix receipt",
            "Thanks for the payment. amount $15.99 charged for your subscription.",
        );

        r.filter.handle(&delivery(&event)).unwrap();
        assert!(
            r.storage
                .cached_embedding(&event.mailbox_id, &event.body_hash)
                .unwrap()
                .is_some()
        );

        // Re-routing the same email decides identically, now from cache.
        let calls = r.embedder.call_count();
        r.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(r.embedder.call_count(), calls);
        assert_eq!(r.broker.dump(STREAM_TO_CLASSIFY).len(), 2);
    }

    #[test]
    fn no_watchers_short_circuits_before_embedding() {
        let mut r = rig(false);
        let event = normalized(
            "Your Netflix receipt",
            "Thanks for the payment. amount $15.99 charged for your subscription.",
        );
        r.filter.handle(&delivery(&event)).unwrap();
        assert_eq!(r.embedder.call_count(), 0);
        assert!(r.broker.dump(STREAM_TO_CLASSIFY).is_empty());
    }
}
