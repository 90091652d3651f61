//! PostgREST-style HTTP data API implementation of [`Storage`].
//!
//! Tables are addressed as `{base}/rest/v1/{table}`, upserts use the
//! `on_conflict` query parameter with `Prefer: resolution=merge-duplicates`,
//! and the vector-search primitive is a stored procedure at
//! `{base}/rest/v1/rpc/match_watcher_queries`. The API returns pgvector
//! columns either as JSON arrays or as array-shaped strings depending on the
//! reading role, so both are accepted.

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;

use super::{
    ClassificationUpsert, MessageRow, MessageUpsert, NewPrototype, NewWatcher, ScanStatus,
    Storage, StorageResult, Watcher, WatcherMatch,
};
use crate::config::StorageConfig;
use crate::error::StorageError;

/// Per-request deadline.
const STORAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP data API storage client.
pub struct HttpStorage {
    config: StorageConfig,
    agent: ureq::Agent,
}

impl HttpStorage {
    pub fn new(config: StorageConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(STORAGE_TIMEOUT).build();
        Self { config, agent }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    fn get(&self, table: &str, queries: &[(&str, &str)]) -> StorageResult<serde_json::Value> {
        let mut req = self
            .agent
            .get(&self.table_url(table))
            .set("apikey", &self.config.api_key)
            .set("Authorization", &format!("Bearer {}", self.config.api_key));
        for (k, v) in queries {
            req = req.query(k, v);
        }
        let resp = req.call().map_err(|e| api_error(table, e))?;
        decode(table, resp)
    }

    fn post(
        &self,
        table: &str,
        queries: &[(&str, &str)],
        prefer: Option<&str>,
        body: serde_json::Value,
    ) -> StorageResult<serde_json::Value> {
        let mut req = self
            .agent
            .post(&self.table_url(table))
            .set("apikey", &self.config.api_key)
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .set("Content-Type", "application/json");
        for (k, v) in queries {
            req = req.query(k, v);
        }
        if let Some(prefer) = prefer {
            req = req.set("Prefer", prefer);
        }
        let resp = req.send_json(body).map_err(|e| api_error(table, e))?;
        decode(table, resp)
    }
}

impl std::fmt::Debug for HttpStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStorage")
            .field("url", &self.config.url)
            .finish()
    }
}

impl Storage for HttpStorage {
    fn upsert_message(&self, row: &MessageUpsert) -> StorageResult<MessageRow> {
        let body = serde_json::json!({
            "idemp_key": row.idemp_key,
            "mailbox_id": row.mailbox_id,
            "external_id": row.external_id,
            "subject": row.subject,
            "body_hash": row.body_hash,
            "received_at": row.received_at,
            "updated_at": Utc::now(),
        });
        let reply = self.post(
            "messages",
            &[("on_conflict", "idemp_key")],
            Some("resolution=merge-duplicates,return=representation"),
            serde_json::json!([body]),
        )?;
        let rows: Vec<MessageRow> = from_value("messages", reply)?;
        rows.into_iter().next().ok_or(StorageError::EmptyUpsert {
            table: "messages".to_string(),
        })
    }

    fn upsert_classification(&self, row: &ClassificationUpsert) -> StorageResult<()> {
        let body = serde_json::json!([{
            "message_id": row.message_id,
            "class": row.class,
            "confidence": row.confidence,
            "watcher_id": row.watcher_id,
            "extracted_data": row.extracted_data,
        }]);
        self.post(
            "classifications",
            &[("on_conflict", "message_id")],
            Some("resolution=merge-duplicates"),
            body,
        )?;
        Ok(())
    }

    fn cached_embedding(
        &self,
        mailbox_id: &str,
        body_hash: &str,
    ) -> StorageResult<Option<Vec<f32>>> {
        let eq_mailbox = format!("eq.{mailbox_id}");
        let eq_hash = format!("eq.{body_hash}");
        let reply = self.get(
            "email_embeddings",
            &[
                ("select", "email_embedding"),
                ("mailbox_id", &eq_mailbox),
                ("body_hash", &eq_hash),
                ("limit", "1"),
            ],
        )?;
        let Some(row) = reply.as_array().and_then(|rows| rows.first()) else {
            return Ok(None);
        };
        parse_vector(&row["email_embedding"]).map(Some)
    }

    fn upsert_embedding(
        &self,
        mailbox_id: &str,
        body_hash: &str,
        embedding: &[f32],
    ) -> StorageResult<()> {
        let body = serde_json::json!([{
            "mailbox_id": mailbox_id,
            "body_hash": body_hash,
            "email_embedding": embedding,
        }]);
        self.post(
            "email_embeddings",
            &[("on_conflict", "mailbox_id,body_hash")],
            Some("resolution=merge-duplicates"),
            body,
        )?;
        Ok(())
    }

    fn insert_watcher(&self, watcher: &NewWatcher) -> StorageResult<Watcher> {
        let body = serde_json::json!([{
            "mailbox_id": watcher.mailbox_id,
            "name": watcher.name,
            "query_text": watcher.query_text,
            "query_embedding": watcher.query_embedding,
            "threshold": watcher.threshold,
            "is_active": watcher.is_active,
        }]);
        let reply = self.post(
            "watchers",
            &[],
            Some("return=representation"),
            body,
        )?;
        let rows: Vec<Watcher> = from_value("watchers", reply)?;
        rows.into_iter().next().ok_or(StorageError::EmptyUpsert {
            table: "watchers".to_string(),
        })
    }

    fn insert_prototypes(&self, prototypes: &[NewPrototype]) -> StorageResult<()> {
        if prototypes.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(prototypes).map_err(|e| StorageError::Decode {
            message: e.to_string(),
        })?;
        self.post("watcher_queries", &[], None, body)?;
        Ok(())
    }

    fn active_watcher_count(&self, mailbox_id: &str) -> StorageResult<u64> {
        let eq_mailbox = format!("eq.{mailbox_id}");
        let reply = self.get(
            "watchers",
            &[
                ("select", "id"),
                ("mailbox_id", &eq_mailbox),
                ("is_active", "eq.true"),
            ],
        )?;
        Ok(reply.as_array().map(|rows| rows.len() as u64).unwrap_or(0))
    }

    fn match_watcher_queries(
        &self,
        mailbox_id: &str,
        email_embedding: &[f32],
        limit: usize,
    ) -> StorageResult<Vec<WatcherMatch>> {
        let body = serde_json::json!({
            "p_mailbox_id": mailbox_id,
            "p_email_embedding": email_embedding,
            "p_limit": limit,
        });
        let reply = self.post("rpc/match_watcher_queries", &[], None, body)?;
        let rows = reply.as_array().cloned().unwrap_or_default();

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            matches.push(WatcherMatch {
                watcher_id: stringy(&row["watcher_id"]),
                watcher_name: stringy(&row["watcher_name"]),
                watcher_threshold: row["watcher_threshold"].as_f64().unwrap_or(1.0),
                query_id: stringy(&row["query_id"]),
                query_text: stringy(&row["query_text"]),
                cosine_distance: row["cosine_distance"].as_f64().unwrap_or(2.0),
            });
        }
        Ok(matches)
    }

    fn scan_status(&self, mailbox_id: &str) -> StorageResult<ScanStatus> {
        let eq_mailbox = format!("eq.{mailbox_id}");
        let reply = self.get(
            "mailbox_scan_status",
            &[("mailbox_id", &eq_mailbox), ("limit", "1")],
        )?;
        if let Some(row) = reply.as_array().and_then(|rows| rows.first()) {
            return from_value("mailbox_scan_status", row.clone());
        }

        // First sight of this mailbox: insert the zeroed row. merge-duplicates
        // keeps a racing sibling poller harmless.
        let zeroed = ScanStatus::zeroed(mailbox_id);
        self.post(
            "mailbox_scan_status",
            &[("on_conflict", "mailbox_id")],
            Some("resolution=merge-duplicates"),
            serde_json::json!([zeroed]),
        )?;
        Ok(zeroed)
    }

    fn advance_scan_uid(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()> {
        let current = self.scan_status(mailbox_id)?;
        let body = serde_json::json!([{
            "mailbox_id": mailbox_id,
            "last_scan_uid": current.last_scan_uid.max(last_uid),
            "updated_at": Utc::now(),
        }]);
        self.post(
            "mailbox_scan_status",
            &[("on_conflict", "mailbox_id")],
            Some("resolution=merge-duplicates"),
            body,
        )?;
        Ok(())
    }

    fn complete_initial_scan(&self, mailbox_id: &str, last_uid: u32) -> StorageResult<()> {
        let current = self.scan_status(mailbox_id)?;
        let initial_scan_date = current.initial_scan_date.unwrap_or_else(Utc::now);
        let body = serde_json::json!([{
            "mailbox_id": mailbox_id,
            "initial_scan_completed": true,
            "last_scan_uid": current.last_scan_uid.max(last_uid),
            "initial_scan_date": initial_scan_date,
            "updated_at": Utc::now(),
        }]);
        self.post(
            "mailbox_scan_status",
            &[("on_conflict", "mailbox_id")],
            Some("resolution=merge-duplicates"),
            body,
        )?;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn api_error(table: &str, e: ureq::Error) -> StorageError {
    match e {
        ureq::Error::Status(401 | 403, _) => StorageError::Authentication,
        ureq::Error::Status(code @ (400 | 404 | 409 | 422), resp) => StorageError::Schema {
            table: table.to_string(),
            message: format!("{code}: {}", resp.into_string().unwrap_or_default()),
        },
        ureq::Error::Status(code, _) => StorageError::RequestFailed {
            message: format!("status {code} from {table}"),
        },
        ureq::Error::Transport(t) => StorageError::RequestFailed {
            message: t.to_string(),
        },
    }
}

fn decode(table: &str, resp: ureq::Response) -> StorageResult<serde_json::Value> {
    let body = resp.into_string().map_err(|e| StorageError::RequestFailed {
        message: format!("{table}: response read failed: {e}"),
    })?;
    // Writes without return=representation come back with an empty body.
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| StorageError::Decode {
        message: format!("{table}: {e}"),
    })
}

fn from_value<T: DeserializeOwned>(table: &str, value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Decode {
        message: format!("{table}: {e}"),
    })
}

/// pgvector columns arrive as `[0.1, ...]` or as the string `"[0.1,...]"`.
fn parse_vector(value: &serde_json::Value) -> StorageResult<Vec<f32>> {
    match value {
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect()),
        serde_json::Value::String(raw) => {
            serde_json::from_str(raw).map_err(|e| StorageError::Decode {
                message: format!("email_embedding: {e}"),
            })
        }
        other => Err(StorageError::Decode {
            message: format!("email_embedding: unexpected {other}"),
        }),
    }
}

/// Id columns arrive as strings (uuid) or numbers (bigserial).
fn stringy(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vector_accepts_array_and_string() {
        let arr = serde_json::json!([0.5, -0.25]);
        assert_eq!(parse_vector(&arr).unwrap(), vec![0.5, -0.25]);

        let s = serde_json::json!("[0.5,-0.25]");
        assert_eq!(parse_vector(&s).unwrap(), vec![0.5, -0.25]);

        assert!(parse_vector(&serde_json::json!(42)).is_err());
    }

    #[test]
    fn stringy_normalizes_id_shapes() {
        assert_eq!(stringy(&serde_json::json!("abc-123")), "abc-123");
        assert_eq!(stringy(&serde_json::json!(77)), "77");
    }

    #[test]
    fn table_urls_are_rooted_at_rest_v1() {
        let storage = HttpStorage::new(StorageConfig {
            url: "https://db.example".to_string(),
            api_key: "k".to_string(),
        });
        assert_eq!(storage.table_url("messages"), "https://db.example/rest/v1/messages");
        assert_eq!(
            storage.table_url("rpc/match_watcher_queries"),
            "https://db.example/rest/v1/rpc/match_watcher_queries"
        );
    }
}
