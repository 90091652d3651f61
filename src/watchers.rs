//! Watcher registry helpers: bundle creation and the active-watcher TTL cache.
//!
//! A watcher is a user-declared intent (name + natural-language query +
//! similarity threshold). Creation embeds the seed query, registers the
//! watcher, and expands the seed into paraphrase prototypes with the LLM so
//! the top-K match has more than one sentence to hit. The seed itself is
//! always the first prototype.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::embed::EmbeddingClient;
use crate::error::MailsiftResult;
use crate::llm::{LlmClient, extract_json};
use crate::storage::{NewPrototype, NewWatcher, Storage, StorageResult, Watcher};

/// Default similarity threshold for new watchers.
pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// Default number of LLM-expanded paraphrase prototypes.
pub const DEFAULT_EXPANSIONS: usize = 10;

/// How long the filter trusts a cached active-watcher count.
pub const WATCHER_CACHE_TTL: Duration = Duration::from_secs(60);

// ── Bundle creation ─────────────────────────────────────────────────────

/// A freshly created watcher with its prototype sentences.
#[derive(Debug, Clone)]
pub struct WatcherBundle {
    pub watcher: Watcher,
    pub prototypes: Vec<String>,
}

fn expansion_prompt(seed: &str, n: usize) -> String {
    format!(
        "You are generating semantic prototypes for an email routing system.\n\
         Goal: produce {n} short, distinct prototype sentences that match emails \
         described below.\n\n\
         Constraints:\n\
         - Each item is ONE sentence (max ~18 words).\n\
         - Avoid comma keyword lists; write natural sentences.\n\
         - Include niche/industry phrasing and paraphrases where useful.\n\
         - Do NOT include personally identifying info.\n\n\
         Return ONLY valid JSON:\n\
         {{\"prototypes\": [\"...\", \"...\"]}}\n\n\
         What emails to match: {seed}"
    )
}

/// Ask the LLM for up to `n` paraphrase sentences of `seed`.
///
/// Deduplicated and trimmed; an unusable reply degrades to an empty list so
/// watcher creation still succeeds with the seed prototype alone.
fn expand_seed(llm: &dyn LlmClient, seed: &str, n: usize) -> Vec<String> {
    let reply = match llm.complete(&expansion_prompt(seed, n)) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "prototype expansion failed, keeping seed only");
            return Vec::new();
        }
    };
    let json = match extract_json(&reply) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "prototype expansion returned no JSON, keeping seed only");
            return Vec::new();
        }
    };

    let mut seen = std::collections::HashSet::new();
    seen.insert(seed.to_string());
    let mut prototypes = Vec::new();
    for value in json["prototypes"].as_array().into_iter().flatten() {
        let Some(text) = value.as_str() else { continue };
        let text = text.trim();
        if !text.is_empty() && seen.insert(text.to_string()) {
            prototypes.push(text.to_string());
        }
        if prototypes.len() >= n {
            break;
        }
    }
    prototypes
}

/// Create a watcher and its prototype rows.
///
/// The seed query is embedded once and stored both on the watcher row and as
/// the first prototype; `expansions > 0` adds LLM paraphrases after it.
pub fn create_watcher_bundle(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingClient,
    llm: Option<&dyn LlmClient>,
    mailbox_id: &str,
    name: &str,
    seed: &str,
    threshold: f64,
    expansions: usize,
) -> MailsiftResult<WatcherBundle> {
    let seed_embedding = embedder.embed_one(seed)?;

    let watcher = storage.insert_watcher(&NewWatcher {
        mailbox_id: mailbox_id.to_string(),
        name: name.to_string(),
        query_text: seed.to_string(),
        query_embedding: seed_embedding.clone(),
        threshold,
        is_active: true,
    })?;

    let mut sentences = vec![seed.to_string()];
    if let Some(llm) = llm
        && expansions > 0
    {
        sentences.extend(expand_seed(llm, seed, expansions));
    }

    // The seed vector is already known; embed only the paraphrases.
    let mut embeddings = vec![seed_embedding];
    if sentences.len() > 1 {
        embeddings.extend(embedder.embed(&sentences[1..])?);
    }

    let prototypes: Vec<NewPrototype> = sentences
        .iter()
        .zip(embeddings)
        .map(|(text, embedding)| NewPrototype {
            watcher_id: watcher.id.clone(),
            query_text: text.clone(),
            query_embedding: embedding,
        })
        .collect();
    storage.insert_prototypes(&prototypes)?;

    Ok(WatcherBundle {
        watcher,
        prototypes: sentences,
    })
}

// ── WatcherCache ────────────────────────────────────────────────────────

/// Short-TTL cache of the per-mailbox active-watcher count.
///
/// Lets the semantic filter skip the embedding spend for mailboxes that have
/// no active watchers at all, without hammering the store on every event.
/// Invalidation is lazy: a new watcher becomes visible within the TTL.
#[derive(Debug)]
pub struct WatcherCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, u64)>,
}

impl WatcherCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Cached count for `mailbox_id`, calling `fetch` on miss or expiry.
    pub fn active_count<F>(&self, mailbox_id: &str, fetch: F) -> StorageResult<u64>
    where
        F: FnOnce() -> StorageResult<u64>,
    {
        if let Some(entry) = self.entries.get(mailbox_id)
            && entry.0.elapsed() < self.ttl
        {
            return Ok(entry.1);
        }
        let count = fetch()?;
        self.entries
            .insert(mailbox_id.to_string(), (Instant::now(), count));
        Ok(count)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::MockEmbedder;
    use crate::llm::MockLlm;
    use crate::storage::MemoryStorage;

    #[test]
    fn bundle_includes_seed_and_paraphrases() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new();
        let llm = MockLlm::answering(
            r#"{"prototypes": ["Receipts for recurring charges", "Monthly invoice notifications"]}"#,
        );

        let bundle = create_watcher_bundle(
            &storage,
            &embedder,
            Some(&llm),
            "alice@gmail.com",
            "Billing",
            "invoice, payment, receipt",
            DEFAULT_THRESHOLD,
            10,
        )
        .unwrap();

        assert_eq!(bundle.watcher.name, "Billing");
        assert_eq!(bundle.prototypes.len(), 3);
        assert_eq!(bundle.prototypes[0], "invoice, payment, receipt");
        assert_eq!(storage.active_watcher_count("alice@gmail.com").unwrap(), 1);

        // All three prototypes are searchable.
        let email = MockEmbedder::vector_for("invoice payment receipt");
        let matches = storage
            .match_watcher_queries("alice@gmail.com", &email, 10)
            .unwrap();
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn bundle_survives_llm_garbage() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new();
        let llm = MockLlm::answering("sorry, I cannot help with that");

        let bundle = create_watcher_bundle(
            &storage,
            &embedder,
            Some(&llm),
            "alice@gmail.com",
            "Billing",
            "invoice, payment, receipt",
            DEFAULT_THRESHOLD,
            10,
        )
        .unwrap();

        assert_eq!(bundle.prototypes, vec!["invoice, payment, receipt"]);
    }

    #[test]
    fn bundle_without_llm_is_seed_only() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new();

        let bundle = create_watcher_bundle(
            &storage,
            &embedder,
            None,
            "alice@gmail.com",
            "Billing",
            "invoice, payment, receipt",
            0.8,
            10,
        )
        .unwrap();

        assert_eq!(bundle.prototypes.len(), 1);
        assert!((bundle.watcher.threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn expansion_dedupes_and_caps() {
        let llm = MockLlm::answering(
            r#"{"prototypes": ["a", "a", "b", " ", "c", "d"]}"#,
        );
        let expanded = expand_seed(&llm, "seed", 3);
        assert_eq!(expanded, vec!["a", "b", "c"]);
    }

    #[test]
    fn cache_serves_within_ttl_and_refetches_after() {
        let cache = WatcherCache::new(Duration::from_millis(20));
        let mut calls = 0;

        let count = cache
            .active_count("m", || {
                calls += 1;
                Ok(2)
            })
            .unwrap();
        assert_eq!((count, calls), (2, 1));

        let count = cache
            .active_count("m", || {
                calls += 1;
                Ok(5)
            })
            .unwrap();
        assert_eq!((count, calls), (2, 1)); // still cached

        std::thread::sleep(Duration::from_millis(25));
        let count = cache
            .active_count("m", || {
                calls += 1;
                Ok(5)
            })
            .unwrap();
        assert_eq!((count, calls), (5, 2));
    }

    #[test]
    fn cache_is_per_mailbox() {
        let cache = WatcherCache::new(Duration::from_secs(60));
        cache.active_count("a", || Ok(1)).unwrap();
        let count = cache.active_count("b", || Ok(7)).unwrap();
        assert_eq!(count, 7);
    }
}
