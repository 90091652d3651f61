//! In-memory storage double for unit and pipeline tests.
//!
//! Implements the full [`Storage`] contract with plain maps behind one mutex.
//! Timestamps are strictly monotonic per row so replay tests can assert that
//! `updated_at` advances without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use super::{
    ClassificationRow, ClassificationUpsert, MessageRow, MessageUpsert, NewPrototype, NewWatcher,
    ScanStatus, Storage, StorageResult, Watcher, WatcherMatch,
};
use crate::embed::cosine_distance;
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct PrototypeRow {
    id: String,
    watcher_id: String,
    query_text: String,
    query_embedding: Vec<f32>,
}

#[derive(Debug, Default)]
struct Inner {
    next_message_id: i64,
    /// idemp_key → row.
    messages: HashMap<String, MessageRow>,
    /// message_id → row.
    classifications: HashMap<i64, ClassificationRow>,
    /// (mailbox_id, body_hash) → vector.
    embeddings: HashMap<(String, String), Vec<f32>>,
    /// watcher id → watcher.
    watchers: HashMap<String, Watcher>,
    prototypes: Vec<PrototypeRow>,
    next_prototype_id: u64,
    /// mailbox_id → scan state.
    scan: HashMap<String, ScanStatus>,
    /// Logical clock floor, so repeated writes in the same instant still
    /// produce strictly increasing timestamps.
    clock_floor: Option<DateTime<Utc>>,
}

impl Inner {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock_floor {
            Some(floor) if now <= floor => floor + Duration::milliseconds(1),
            _ => now,
        };
        self.clock_floor = Some(next);
        next
    }
}

/// In-memory [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All message rows (for test assertions).
    pub fn messages(&self) -> Vec<MessageRow> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner.messages.values().cloned().collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// All classification rows (for test assertions).
    pub fn classifications(&self) -> Vec<ClassificationRow> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner.classifications.values().cloned().collect();
        rows.sort_by_key(|r| r.message_id);
        rows
    }

    /// Number of embedding-cache rows.
    pub fn embedding_rows(&self) -> usize {
        self.inner.lock().unwrap().embeddings.len()
    }

    /// Deactivate a watcher (soft delete).
    pub fn deactivate_watcher(&self, watcher_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(w) = inner.watchers.get_mut(watcher_id) {
            w.is_active = false;
        }
    }
}

impl Storage for MemoryStorage {
    fn upsert_message(&self, row: &MessageUpsert) -> StorageResult<MessageRow> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();

        if let Some(existing) = inner.messages.get_mut(&row.idemp_key) {
            existing.subject = row.subject.clone();
            existing.body_hash = row.body_hash.clone();
            existing.received_at = row.received_at;
            existing.updated_at = Some(now);
            return Ok(existing.clone());
        }

        inner.next_message_id += 1;
        let persisted = MessageRow {
            id: inner.next_message_id,
            idemp_key: row.idemp_key.clone(),
            mailbox_id: row.mailbox_id.clone(),
            external_id: row.external_id.clone(),
            subject: row.subject.clone(),
            body_hash: row.body_hash.clone(),
            received_at: row.received_at,
            created_at: Some(now),
            updated_at: Some(now),
        };
        inner
            .messages
            .insert(row.idemp_key.clone(), persisted.clone());
        Ok(persisted)
    }

    fn upsert_classification(&self, row: &ClassificationUpsert) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.classifications.insert(
            row.message_id,
            ClassificationRow {
                message_id: row.message_id,
                class: row.class.clone(),
                confidence: row.confidence,
                watcher_id: row.watcher_id.clone(),
                extracted_data: row.extracted_data.clone(),
            },
        );
        Ok(())
    }

    fn cached_embedding(
        &self,
        mailbox_id: &str,
        body_hash: &str,
    ) -> StorageResult<Option<Vec<f32>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .embeddings
            .get(&(mailbox_id.to_string(), body_hash.to_string()))
            .cloned())
    }

    fn upsert_embedding(
        &self,
        mailbox_id: &str,
        body_hash: &str,
        embedding: &[f32],
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.embeddings.insert(
            (mailbox_id.to_string(), body_hash.to_string()),
            embedding.to_vec(),
        );
        Ok(())
    }

    fn insert_watcher(&self, watcher: &NewWatcher) -> StorageResult<Watcher> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        let persisted = Watcher {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox_id: watcher.mailbox_id.clone(),
            name: watcher.name.clone(),
            query_text: watcher.query_text.clone(),
            threshold: watcher.threshold,
            is_active: watcher.is_active,
            created_at: Some(now),
        };
        inner
            .watchers
            .insert(persisted.id.clone(), persisted.clone());
        Ok(persisted)
    }

    fn insert_prototypes(&self, prototypes: &[NewPrototype]) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for proto in prototypes {
            if !inner.watchers.contains_key(&proto.watcher_id) {
                return Err(StorageError::Schema {
                    table: "watcher_queries".to_string(),
                    message: format!("unknown watcher_id {}", proto.watcher_id),
                });
            }
            inner.next_prototype_id += 1;
            let id = inner.next_prototype_id.to_string();
            inner.prototypes.push(PrototypeRow {
                id,
                watcher_id: proto.watcher_id.clone(),
                query_text: proto.query_text.clone(),
                query_embedding: proto.query_embedding.clone(),
            });
        }
        Ok(())
    }

    fn active_watcher_count(&self, mailbox_id: &str) -> StorageResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .watchers
            .values()
            .filter(|w| w.mailbox_id == mailbox_id && w.is_active)
            .count() as u64)
    }

    fn match_watcher_queries(
        &self,
        mailbox_id: &str,
        email_embedding: &[f32],
        limit: usize,
    ) -> StorageResult<Vec<WatcherMatch>> {
        let inner = self.inner.lock().unwrap();

        let mut matches = Vec::new();
        for proto in &inner.prototypes {
            let Some(watcher) = inner.watchers.get(&proto.watcher_id) else {
                continue;
            };
            if watcher.mailbox_id != mailbox_id || !watcher.is_active {
                continue;
            }
            let distance = cosine_distance(email_embedding, &proto.query_embedding)
                .map_err(|e| StorageError::Schema {
                    table: "watcher_queries".to_string(),
                    message: e.to_string(),
                })?;
            matches.push(WatcherMatch {
                watcher_id: watcher.id.clone(),
                watcher_name: watcher.name.clone(),
                watcher_threshold: watcher.threshold,
                query_id: proto.id.clone(),
                query_text: proto.query_text.clone(),
                cosine_distance: distance,
            });
        }

        matches.sort_by(|a, b| a.cosine_distance.total_cmp(&b.cosine_distance));
        matches.truncate(limit);
        Ok(matches)
    }

    fn scan_status(&self, mailbox_id: &str) -> StorageResult<ScanStatus> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .scan
            .entry(mailbox_id.to_string())
            .or_insert_with(|| ScanStatus::zeroed(mailbox_id))
            .clone())
    }

    fn advance_scan_uid(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        let status = inner
            .scan
            .entry(mailbox_id.to_string())
            .or_insert_with(|| ScanStatus::zeroed(mailbox_id));
        status.last_scan_uid = status.last_scan_uid.max(last_uid);
        status.updated_at = Some(now);
        Ok(())
    }

    fn complete_initial_scan(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        let status = inner
            .scan
            .entry(mailbox_id.to_string())
            .or_insert_with(|| ScanStatus::zeroed(mailbox_id));
        status.last_scan_uid = status.last_scan_uid.max(last_uid);
        status.updated_at = Some(now);
        if !status.initial_scan_completed {
            status.initial_scan_completed = true;
            status.initial_scan_date = Some(now);
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
