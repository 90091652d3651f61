//! Rich diagnostic error types for the mailsift pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so operators know exactly what went wrong
//! and how to fix it. Every subsystem error also classifies itself into an
//! [`ErrorKind`], which is the single input to the worker harness's
//! ack/redeliver/dead-letter decision.

use miette::Diagnostic;
use thiserror::Error;

/// How a failed event should be handled by the worker loop.
///
/// The classification is decided where the error is constructed; the harness
/// applies one uniform discipline per kind and never second-guesses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O that may succeed on retry (broker, storage, IMAP, LLM, embedding
    /// transport and timeouts). The event is left un-acked for redelivery.
    Transient,
    /// Garbage input that will never parse (bad MIME, bad LLM JSON).
    /// The event is acked and dropped with a warning.
    Malformed,
    /// Auth or schema faults needing operator intervention. The event is
    /// acked and logged at error level.
    Permanent,
}

/// Top-level error type for the mailsift pipeline.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text) through to the operator.
#[derive(Debug, Error, Diagnostic)]
pub enum MailsiftError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

impl MailsiftError {
    /// Classification used by the worker harness.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Permanent,
            Self::Broker(e) => e.kind(),
            Self::Mail(e) => e.kind(),
            Self::Normalize(e) => e.kind(),
            Self::Llm(e) => e.kind(),
            Self::Embed(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    #[diagnostic(
        code(mailsift::config::missing_var),
        help("Set {name} in the environment (or the .env loaded by your supervisor).")
    )]
    MissingVar { name: &'static str },

    #[error("invalid value for {name}: {value:?}")]
    #[diagnostic(
        code(mailsift::config::invalid_var),
        help("Check the expected format for {name} in the deployment docs.")
    )]
    InvalidVar { name: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Broker errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BrokerError {
    #[error("broker connection failed: {message}")]
    #[diagnostic(
        code(mailsift::broker::connection),
        help("Check that Redis is reachable at the configured host/port.")
    )]
    Connection { message: String },

    #[error("broker command failed on stream {stream}: {message}")]
    #[diagnostic(
        code(mailsift::broker::command),
        help("The stream command failed. Transient Redis faults resolve on retry.")
    )]
    Command { stream: String, message: String },

    #[error("malformed stream entry {id} on {stream}: {message}")]
    #[diagnostic(
        code(mailsift::broker::malformed_entry),
        help(
            "The entry's field map is missing required fields. \
             It was likely appended by an incompatible producer."
        )
    )]
    MalformedEntry {
        stream: String,
        id: String,
        message: String,
    },
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Command { .. } => ErrorKind::Transient,
            Self::MalformedEntry { .. } => ErrorKind::Malformed,
        }
    }
}

// ---------------------------------------------------------------------------
// Mail (IMAP) errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MailError {
    #[error("IMAP connection failed: {message}")]
    #[diagnostic(
        code(mailsift::mail::connection),
        help("Check IMAP_SERVER, network reachability, and that port 993 is open.")
    )]
    Connection { message: String },

    #[error("IMAP authentication failed for {user}")]
    #[diagnostic(
        code(mailsift::mail::auth),
        help(
            "Check IMAP_USER / IMAP_PASSWORD. Gmail and Outlook require an \
             app password, not the account password."
        )
    )]
    Authentication { user: String },

    #[error("IMAP protocol error: {message}")]
    #[diagnostic(
        code(mailsift::mail::protocol),
        help("The server rejected a SELECT/SEARCH/FETCH. Usually transient.")
    )]
    Protocol { message: String },
}

impl MailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Protocol { .. } => ErrorKind::Transient,
            Self::Authentication { .. } => ErrorKind::Permanent,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum NormalizeError {
    #[error("failed to parse MIME message ({bytes} bytes)")]
    #[diagnostic(
        code(mailsift::normalize::parse),
        help("The raw message is not valid RFC 5322. It is dropped, not retried.")
    )]
    Parse { bytes: usize },

    #[error("failed to decode raw_email_b64: {message}")]
    #[diagnostic(
        code(mailsift::normalize::decode),
        help("The producer published invalid base64. The event is dropped.")
    )]
    Decode { message: String },
}

impl NormalizeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Malformed
    }
}

// ---------------------------------------------------------------------------
// LLM errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("LLM request failed: {message}")]
    #[diagnostic(
        code(mailsift::llm::request_failed),
        help("Check network reachability to LLM_BASE_URL; timeouts resolve on retry.")
    )]
    RequestFailed { message: String },

    #[error("LLM rejected the API key")]
    #[diagnostic(
        code(mailsift::llm::auth),
        help("Check LLM_API_KEY. The key was rejected with a 401/403.")
    )]
    Authentication,

    #[error("no JSON object found in LLM response")]
    #[diagnostic(
        code(mailsift::llm::no_json),
        help("The model ignored the JSON-only instruction. The event is dropped.")
    )]
    NoJson,

    #[error("failed to parse LLM JSON: {message}")]
    #[diagnostic(
        code(mailsift::llm::bad_json),
        help("The model returned syntactically invalid JSON. The event is dropped.")
    )]
    BadJson { message: String },
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestFailed { .. } => ErrorKind::Transient,
            Self::Authentication => ErrorKind::Permanent,
            Self::NoJson | Self::BadJson { .. } => ErrorKind::Malformed,
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    #[error("embedding request failed: {message}")]
    #[diagnostic(
        code(mailsift::embed::request_failed),
        help("Check network reachability to EMBED_BASE_URL; timeouts resolve on retry.")
    )]
    RequestFailed { message: String },

    #[error("embedding service rejected the API key")]
    #[diagnostic(
        code(mailsift::embed::auth),
        help("Check EMBED_API_KEY. The key was rejected with a 401/403.")
    )]
    Authentication,

    #[error("embedding response malformed: {message}")]
    #[diagnostic(
        code(mailsift::embed::bad_response),
        help("The service returned an unexpected shape. The event is dropped.")
    )]
    BadResponse { message: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(mailsift::embed::dim_mismatch),
        help(
            "All vectors compared against each other must share one dimension. \
             EMBED_MODEL changed since the watcher prototypes were embedded — \
             re-embed the prototypes or revert the model."
        )
    )]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestFailed { .. } => ErrorKind::Transient,
            Self::Authentication | Self::DimensionMismatch { .. } => ErrorKind::Permanent,
            Self::BadResponse { .. } => ErrorKind::Malformed,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("storage request failed: {message}")]
    #[diagnostic(
        code(mailsift::storage::request_failed),
        help("Check network reachability to STORAGE_URL; timeouts resolve on retry.")
    )]
    RequestFailed { message: String },

    #[error("storage rejected the API key")]
    #[diagnostic(
        code(mailsift::storage::auth),
        help("Check STORAGE_API_KEY. The data API returned 401/403.")
    )]
    Authentication,

    #[error("storage schema error on table {table}: {message}")]
    #[diagnostic(
        code(mailsift::storage::schema),
        help(
            "The table or column shape does not match what the pipeline writes. \
             Run the pending migrations, then replay from the DLQ."
        )
    )]
    Schema { table: String, message: String },

    #[error("storage returned no row for upsert on {table}")]
    #[diagnostic(
        code(mailsift::storage::empty_upsert),
        help("An upsert with return=representation produced no rows; check RLS policies.")
    )]
    EmptyUpsert { table: String },

    #[error("failed to decode storage response: {message}")]
    #[diagnostic(
        code(mailsift::storage::decode),
        help("The data API response did not match the expected row shape.")
    )]
    Decode { message: String },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestFailed { .. } => ErrorKind::Transient,
            Self::Authentication
            | Self::Schema { .. }
            | Self::EmptyUpsert { .. }
            | Self::Decode { .. } => ErrorKind::Permanent,
        }
    }
}

/// Convenience alias for functions returning mailsift results.
pub type MailsiftResult<T> = std::result::Result<T, MailsiftError>;
