//! Typed pipeline events and their broker wire representation.
//!
//! The broker speaks string→string field maps; the rest of the program speaks
//! these records. Conversion happens only at the boundary, in the explicit
//! `to_fields` / `from_fields` pairs below, so a renamed wire field is a
//! one-line change and nothing else in the program touches raw maps.
//!
//! Also home to the idempotency fingerprint: every replay of the same
//! upstream message produces the same `idemp_key`, which is what makes
//! at-least-once delivery safe end to end.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Broker wire representation of one event.
pub type Fields = BTreeMap<String, String>;

/// Ceiling on `text_content` published by the normalizer (characters).
pub const TEXT_CONTENT_MAX: usize = 1000;

// ── Field decoding ──────────────────────────────────────────────────────

/// A required wire field that was absent or unparseable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing or invalid field {}", self.field)
    }
}

impl std::error::Error for FieldError {}

fn req(fields: &Fields, field: &'static str) -> Result<String, FieldError> {
    match fields.get(field) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(FieldError { field }),
    }
}

fn opt(fields: &Fields, field: &str) -> String {
    fields.get(field).cloned().unwrap_or_default()
}

fn req_u64(fields: &Fields, field: &'static str) -> Result<u64, FieldError> {
    req(fields, field)?.parse().map_err(|_| FieldError { field })
}

fn req_f64(fields: &Fields, field: &'static str) -> Result<f64, FieldError> {
    req(fields, field)?.parse().map_err(|_| FieldError { field })
}

// ── Identity ────────────────────────────────────────────────────────────

/// Fresh trace id for a newly observed message.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Provider label for the idempotency key, derived from the mailbox domain.
///
/// `gmail` for `@gmail.com`, `outlook` for `@outlook.com` / `@hotmail.com`,
/// otherwise the leading domain label (`corp` for `@corp.example.org`).
pub fn derive_provider(mailbox_id: &str) -> String {
    let Some((_, domain)) = mailbox_id.rsplit_once('@') else {
        return "unknown".to_string();
    };
    match domain.to_ascii_lowercase().as_str() {
        "gmail.com" => "gmail".to_string(),
        "outlook.com" | "hotmail.com" => "outlook".to_string(),
        other => other
            .split('.')
            .next()
            .filter(|label| !label.is_empty())
            .unwrap_or("unknown")
            .to_string(),
    }
}

/// Deterministic message fingerprint: `sha256(provider ‖ mailbox_id ‖ external_id)`
/// as 64 lowercase hex characters.
pub fn build_idempotency_key(provider: &str, mailbox_id: &str, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(mailbox_id.as_bytes());
    hasher.update(external_id.as_bytes());
    hex::encode(hasher.finalize())
}

// ── RawEmail ────────────────────────────────────────────────────────────

/// A freshly polled message on `raw_emails.v1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEmail {
    pub trace_id: String,
    pub mailbox_id: String,
    /// IMAP Message-ID when present, else the UID as a string.
    pub external_id: String,
    /// Seconds since epoch.
    pub received_ts: u64,
    pub idemp_key: String,
    pub subject: String,
    /// Base64 of the original RFC 5322 bytes.
    pub raw_email_b64: String,
}

impl RawEmail {
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("trace_id".into(), self.trace_id.clone()),
            ("mailbox_id".into(), self.mailbox_id.clone()),
            ("external_id".into(), self.external_id.clone()),
            ("received_ts".into(), self.received_ts.to_string()),
            ("idemp_key".into(), self.idemp_key.clone()),
            ("subject".into(), self.subject.clone()),
            ("raw_email_b64".into(), self.raw_email_b64.clone()),
        ])
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, FieldError> {
        Ok(Self {
            trace_id: req(fields, "trace_id")?,
            mailbox_id: req(fields, "mailbox_id")?,
            external_id: req(fields, "external_id")?,
            received_ts: req_u64(fields, "received_ts")?,
            idemp_key: req(fields, "idemp_key")?,
            subject: opt(fields, "subject"),
            raw_email_b64: req(fields, "raw_email_b64")?,
        })
    }
}

// ── NormalizedEmail ─────────────────────────────────────────────────────

/// Cleaned text + body fingerprint on `emails.normalized.v1`.
///
/// Carries the producing raw event's `idemp_key` unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEmail {
    pub trace_id: String,
    pub mailbox_id: String,
    pub idemp_key: String,
    /// `sha256(clean_text)`, computed over the untruncated text.
    pub body_hash: String,
    /// Tracker-stripped plain text, at most [`TEXT_CONTENT_MAX`] characters.
    pub text_content: String,
    pub subject: String,
    pub external_id: String,
    pub received_ts: u64,
}

impl NormalizedEmail {
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("trace_id".into(), self.trace_id.clone()),
            ("mailbox_id".into(), self.mailbox_id.clone()),
            ("idemp_key".into(), self.idemp_key.clone()),
            ("body_hash".into(), self.body_hash.clone()),
            ("text_content".into(), self.text_content.clone()),
            ("subject".into(), self.subject.clone()),
            ("external_id".into(), self.external_id.clone()),
            ("received_ts".into(), self.received_ts.to_string()),
        ])
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, FieldError> {
        Ok(Self {
            trace_id: req(fields, "trace_id")?,
            mailbox_id: req(fields, "mailbox_id")?,
            idemp_key: req(fields, "idemp_key")?,
            body_hash: req(fields, "body_hash")?,
            text_content: opt(fields, "text_content"),
            subject: opt(fields, "subject"),
            external_id: req(fields, "external_id")?,
            received_ts: req_u64(fields, "received_ts")?,
        })
    }
}

// ── RoutedEmail ─────────────────────────────────────────────────────────

/// One watcher prototype the semantic filter matched.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub watcher_id: String,
    pub watcher_name: String,
    pub query_id: String,
    pub query_text: String,
    /// `1 − cosine_distance`, in `[0, 1]` for unit vectors.
    pub similarity: f64,
}

/// A normalized email plus routing metadata, on `emails.to_classify.v1`.
///
/// `routes` is list-typed so multi-watcher fan-out is a producer change, not
/// a schema break; today it always holds exactly the best match, and only
/// that row is written to the wire as the flat `filter_*` fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEmail {
    pub email: NormalizedEmail,
    pub routes: Vec<RouteMatch>,
}

impl RoutedEmail {
    /// The winning route. `routes` is never empty for a published event.
    pub fn best(&self) -> &RouteMatch {
        &self.routes[0]
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = self.email.to_fields();
        let best = self.best();
        fields.insert("filter_watcher_id".into(), best.watcher_id.clone());
        fields.insert("filter_watcher_name".into(), best.watcher_name.clone());
        fields.insert("filter_query_id".into(), best.query_id.clone());
        fields.insert("filter_query_text".into(), best.query_text.clone());
        fields.insert("filter_similarity".into(), format!("{:.4}", best.similarity));
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, FieldError> {
        Ok(Self {
            email: NormalizedEmail::from_fields(fields)?,
            routes: vec![RouteMatch {
                watcher_id: req(fields, "filter_watcher_id")?,
                watcher_name: req(fields, "filter_watcher_name")?,
                query_id: req(fields, "filter_query_id")?,
                query_text: opt(fields, "filter_query_text"),
                similarity: req_f64(fields, "filter_similarity")?,
            }],
        })
    }
}

// ── ClassifiedEmail ─────────────────────────────────────────────────────

/// Structured extraction result on `emails.classified.v1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEmail {
    pub trace_id: String,
    pub mailbox_id: String,
    pub idemp_key: String,
    pub body_hash: String,
    pub subject: String,
    pub external_id: String,
    pub received_ts: u64,
    /// Exactly the watcher name that routed this email.
    pub class: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub watcher_id: String,
    /// Watcher-defined free-shape map; stored verbatim.
    pub extracted_data: serde_json::Value,
}

impl ClassifiedEmail {
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("trace_id".into(), self.trace_id.clone()),
            ("mailbox_id".into(), self.mailbox_id.clone()),
            ("idemp_key".into(), self.idemp_key.clone()),
            ("body_hash".into(), self.body_hash.clone()),
            ("subject".into(), self.subject.clone()),
            ("external_id".into(), self.external_id.clone()),
            ("received_ts".into(), self.received_ts.to_string()),
            ("class".into(), self.class.clone()),
            ("confidence".into(), format!("{:.4}", self.confidence)),
            ("watcher_id".into(), self.watcher_id.clone()),
            ("extracted_data".into(), self.extracted_data.to_string()),
        ])
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, FieldError> {
        let extracted_data = fields
            .get("extracted_data")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        Ok(Self {
            trace_id: req(fields, "trace_id")?,
            mailbox_id: req(fields, "mailbox_id")?,
            idemp_key: req(fields, "idemp_key")?,
            body_hash: req(fields, "body_hash")?,
            subject: opt(fields, "subject"),
            external_id: req(fields, "external_id")?,
            received_ts: req_u64(fields, "received_ts")?,
            class: req(fields, "class")?,
            confidence: req_f64(fields, "confidence")?,
            watcher_id: opt(fields, "watcher_id"),
            extracted_data,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
