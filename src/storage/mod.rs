//! Durable storage abstraction: trait + HTTP data API and in-memory implementations.
//!
//! `Storage` is the pipeline's single view of the relational store: message
//! and classification upserts, the email-embedding cache, the watcher
//! registry with its vector-search primitive, and per-mailbox scan state.
//! Every write is an idempotent upsert on a unique key, which is what makes
//! at-least-once delivery safe downstream of the broker.
//!
//! - [`HttpStorage`] speaks a PostgREST-style data API.
//! - [`MemoryStorage`] is the in-process double used by unit and pipeline tests.

pub mod http;
pub mod mem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use http::HttpStorage;
pub use mem::MemoryStorage;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ── Messages ────────────────────────────────────────────────────────────

/// Input to the message upsert, keyed by `idemp_key`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageUpsert {
    pub idemp_key: String,
    pub mailbox_id: String,
    pub external_id: String,
    pub subject: String,
    pub body_hash: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub idemp_key: String,
    pub mailbox_id: String,
    pub external_id: String,
    pub subject: String,
    pub body_hash: String,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Classifications ─────────────────────────────────────────────────────

/// Input to the classification upsert, keyed by `message_id`.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationUpsert {
    pub message_id: i64,
    pub class: String,
    pub confidence: f64,
    pub watcher_id: Option<String>,
    pub extracted_data: serde_json::Value,
}

/// A persisted classification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRow {
    pub message_id: i64,
    pub class: String,
    pub confidence: f64,
    pub watcher_id: Option<String>,
    pub extracted_data: serde_json::Value,
}

// ── Watchers ────────────────────────────────────────────────────────────

/// Input to watcher creation; id and created_at are store-assigned.
#[derive(Debug, Clone, Serialize)]
pub struct NewWatcher {
    pub mailbox_id: String,
    pub name: String,
    pub query_text: String,
    pub query_embedding: Vec<f32>,
    pub threshold: f64,
    pub is_active: bool,
}

/// A registered watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watcher {
    pub id: String,
    pub mailbox_id: String,
    pub name: String,
    pub query_text: String,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One vector prototype belonging to a watcher.
#[derive(Debug, Clone, Serialize)]
pub struct NewPrototype {
    pub watcher_id: String,
    pub query_text: String,
    pub query_embedding: Vec<f32>,
}

/// One row returned by the vector-search primitive, ascending by distance.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherMatch {
    pub watcher_id: String,
    pub watcher_name: String,
    pub watcher_threshold: f64,
    pub query_id: String,
    pub query_text: String,
    pub cosine_distance: f64,
}

// ── Scan state ──────────────────────────────────────────────────────────

/// Per-mailbox incremental scan state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub mailbox_id: String,
    pub initial_scan_completed: bool,
    pub last_scan_uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_scan_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScanStatus {
    /// The zeroed row auto-inserted on first sight of a mailbox.
    pub fn zeroed(mailbox_id: &str) -> Self {
        Self {
            mailbox_id: mailbox_id.to_string(),
            initial_scan_completed: false,
            last_scan_uid: 0,
            initial_scan_date: None,
            updated_at: None,
        }
    }
}

// ── Storage trait ───────────────────────────────────────────────────────

/// Capability surface over the relational store.
pub trait Storage: Send + Sync {
    /// Upsert a message by `idemp_key`; on conflict the subject, body hash,
    /// received_at, and updated_at move forward. Returns the persisted row.
    fn upsert_message(&self, row: &MessageUpsert) -> StorageResult<MessageRow>;

    /// Upsert a classification by `message_id`.
    fn upsert_classification(&self, row: &ClassificationUpsert) -> StorageResult<()>;

    /// Embedding-cache read for `(mailbox_id, body_hash)`.
    fn cached_embedding(&self, mailbox_id: &str, body_hash: &str)
    -> StorageResult<Option<Vec<f32>>>;

    /// Embedding-cache write-through; duplicate keys never create new rows.
    fn upsert_embedding(
        &self,
        mailbox_id: &str,
        body_hash: &str,
        embedding: &[f32],
    ) -> StorageResult<()>;

    /// Register a watcher, returning it with its assigned id.
    fn insert_watcher(&self, watcher: &NewWatcher) -> StorageResult<Watcher>;

    /// Register prototype rows for existing watchers.
    fn insert_prototypes(&self, prototypes: &[NewPrototype]) -> StorageResult<()>;

    /// Number of active watchers for a mailbox (filter short-circuit).
    fn active_watcher_count(&self, mailbox_id: &str) -> StorageResult<u64>;

    /// Top-`limit` prototype matches for an email embedding, ascending by
    /// cosine distance, restricted to active watchers of `mailbox_id`.
    fn match_watcher_queries(
        &self,
        mailbox_id: &str,
        email_embedding: &[f32],
        limit: usize,
    ) -> StorageResult<Vec<WatcherMatch>>;

    /// Scan state for a mailbox; first sight auto-inserts a zeroed row.
    fn scan_status(&self, mailbox_id: &str) -> StorageResult<ScanStatus>;

    /// Raise the UID watermark. The stored value never decreases.
    fn advance_scan_uid(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()>;

    /// Mark the initial backfill finished and raise the watermark. One-way:
    /// a completed mailbox stays completed.
    fn complete_initial_scan(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()>;
}
