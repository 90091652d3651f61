//! # mailsift
//!
//! An email-intent routing pipeline: IMAP mailboxes are polled into a staged
//! stream fabric (ordered logs + consumer groups), normalized, filtered by
//! vector-semantic similarity against user-declared *watchers*, classified
//! with an LLM under the matched watcher's intent, and persisted as
//! structured rows.
//!
//! ## Architecture
//!
//! - **Events** (`event`): typed records with explicit wire (de)serialization
//!   and the SHA-256 idempotency fingerprint
//! - **Broker** (`broker`): Redis Streams consumer groups with pending-list
//!   redelivery and dead-lettering; in-memory double for tests
//! - **Stages** (`stages`): poller, normalizer, semantic filter, classifier,
//!   persister, and DLQ replayer on one read–process–ack harness
//! - **Capabilities** (`mail`, `llm`, `embed`, `storage`): one small trait per
//!   external collaborator, each with a production and an in-memory
//!   implementation
//!
//! ## Delivery semantics
//!
//! Every stream entry is delivered at least once; every side effect is an
//! idempotent upsert on a deterministic key, so replays are benign. Errors
//! are classified transient / malformed / permanent and the harness applies
//! one uniform ack discipline per kind.

pub mod broker;
pub mod config;
pub mod embed;
pub mod error;
pub mod event;
pub mod llm;
pub mod mail;
pub mod normalize;
pub mod stages;
pub mod storage;
pub mod watchers;
