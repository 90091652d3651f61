//! Environment-variable configuration surface.
//!
//! Every stage reads one [`Config`] built by [`Config::from_env`] at startup.
//! Collaborator credentials (IMAP, storage, LLM, embedding) are grouped and
//! optional at parse time — a stage demands the group it needs via the
//! accessor methods, so a normalizer does not require IMAP credentials.
//! A missing or malformed variable is the only process-fatal failure.

use std::time::Duration;

use crate::error::ConfigError;

/// Default messages fetched per poll.
const DEFAULT_SCAN_BATCH_CAP: usize = 100;

/// Default steady-state poll period (seconds).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default poll period while the initial backfill is running (seconds).
const DEFAULT_INITIAL_POLL_INTERVAL_SECS: u64 = 60;

/// Default initial backfill window (days).
const DEFAULT_INITIAL_SCAN_DAYS: i64 = 450;

/// Default bounded intra-batch parallelism.
const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default redelivery budget before an entry is dead-lettered.
const DEFAULT_DLQ_MAX_DELIVERIES: u64 = 5;

// ── Collaborator groups ─────────────────────────────────────────────────

/// Broker (Redis) address.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
}

impl BrokerConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// IMAP credentials. The login user doubles as the `mailbox_id`.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    /// Forces the provider label used in idempotency keys, overriding
    /// domain-based derivation.
    pub provider_override: Option<String>,
}

/// HTTP data API base + key.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub api_key: String,
}

/// LLM messages API.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Embedding API.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Poller scan pacing.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub batch_cap: usize,
    pub poll_interval_secs: u64,
    pub initial_poll_interval_secs: u64,
    pub initial_scan_days: i64,
}

impl ScanConfig {
    /// Poll period for the given scan phase.
    pub fn interval(&self, initial_scan_running: bool) -> Duration {
        if initial_scan_running {
            Duration::from_secs(self.initial_poll_interval_secs)
        } else {
            Duration::from_secs(self.poll_interval_secs)
        }
    }
}

/// Which subject pre-filter the poller runs before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectGateMode {
    /// Trivial predicate: every candidate passes.
    Off,
    /// LLM-backed `{is_subscription, confidence}` gate.
    Llm,
}

// ── Config ──────────────────────────────────────────────────────────────

/// Full configuration for one pipeline process.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    imap: Option<ImapConfig>,
    storage: Option<StorageConfig>,
    llm: Option<LlmConfig>,
    embed: Option<EmbedConfig>,
    /// When true the semantic filter drops uncached emails instead of
    /// calling the embedding service.
    pub cache_only: bool,
    pub scan: ScanConfig,
    pub subject_gate: SubjectGateMode,
    pub worker_pool_size: usize,
    pub dlq_max_deliveries: u64,
}

impl Config {
    /// Read the full environment surface.
    ///
    /// Collaborator groups are `None` when all of their variables are unset;
    /// a partially-set group is an error so a typo cannot silently disable a
    /// collaborator.
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker = BrokerConfig {
            host: var("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parsed_var("REDIS_PORT", 6379)?,
        };

        let imap = group3(
            ("IMAP_SERVER", var("IMAP_SERVER")),
            ("IMAP_USER", var("IMAP_USER")),
            ("IMAP_PASSWORD", var("IMAP_PASSWORD")),
        )?
        .map(|(server, user, password)| ImapConfig {
            server,
            user,
            password,
            provider_override: var("PROVIDER_OVERRIDE"),
        });

        let storage = group2(
            ("STORAGE_URL", var("STORAGE_URL")),
            ("STORAGE_API_KEY", var("STORAGE_API_KEY")),
        )?
        .map(|(url, api_key)| StorageConfig {
            url: url.trim_end_matches('/').to_string(),
            api_key,
        });

        let llm = group2(
            ("LLM_API_KEY", var("LLM_API_KEY")),
            ("LLM_MODEL", var("LLM_MODEL")),
        )?
        .map(|(api_key, model)| LlmConfig {
            api_key,
            model,
            base_url: var("LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        });

        let embed = group2(
            ("EMBED_API_KEY", var("EMBED_API_KEY")),
            ("EMBED_MODEL", var("EMBED_MODEL")),
        )?
        .map(|(api_key, model)| EmbedConfig {
            api_key,
            model,
            base_url: var("EMBED_BASE_URL")
                .unwrap_or_else(|| "https://api.voyageai.com".to_string()),
        });

        let subject_gate = match var("SUBJECT_GATE").as_deref() {
            None | Some("off") | Some("0") | Some("false") => SubjectGateMode::Off,
            Some("llm") => SubjectGateMode::Llm,
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "SUBJECT_GATE",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            broker,
            imap,
            storage,
            llm,
            embed,
            cache_only: bool_var("WATCHER_CACHE_ONLY"),
            scan: ScanConfig {
                batch_cap: parsed_var("SCAN_BATCH_CAP", DEFAULT_SCAN_BATCH_CAP)?,
                poll_interval_secs: parsed_var(
                    "POLL_INTERVAL_SECS",
                    DEFAULT_POLL_INTERVAL_SECS,
                )?,
                initial_poll_interval_secs: parsed_var(
                    "INITIAL_POLL_INTERVAL_SECS",
                    DEFAULT_INITIAL_POLL_INTERVAL_SECS,
                )?,
                initial_scan_days: parsed_var("INITIAL_SCAN_DAYS", DEFAULT_INITIAL_SCAN_DAYS)?,
            },
            subject_gate,
            worker_pool_size: parsed_var("WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE)?,
            dlq_max_deliveries: parsed_var("DLQ_MAX_DELIVERIES", DEFAULT_DLQ_MAX_DELIVERIES)?,
        })
    }

    /// IMAP credentials, required by the poller.
    pub fn imap(&self) -> Result<&ImapConfig, ConfigError> {
        self.imap
            .as_ref()
            .ok_or(ConfigError::MissingVar { name: "IMAP_SERVER" })
    }

    /// Storage credentials, required by filter, persister, and watcher CLI.
    pub fn storage(&self) -> Result<&StorageConfig, ConfigError> {
        self.storage
            .as_ref()
            .ok_or(ConfigError::MissingVar { name: "STORAGE_URL" })
    }

    /// LLM credentials, required by the classifier, the LLM subject gate,
    /// and watcher prototype expansion.
    pub fn llm(&self) -> Result<&LlmConfig, ConfigError> {
        self.llm
            .as_ref()
            .ok_or(ConfigError::MissingVar { name: "LLM_API_KEY" })
    }

    /// Embedding credentials, required by the filter (unless cache-only)
    /// and watcher creation.
    pub fn embed(&self) -> Result<&EmbedConfig, ConfigError> {
        self.embed
            .as_ref()
            .ok_or(ConfigError::MissingVar { name: "EMBED_API_KEY" })
    }

    /// Construct a config for tests without touching the environment.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            broker: BrokerConfig {
                host: "localhost".into(),
                port: 6379,
            },
            imap: None,
            storage: None,
            llm: None,
            embed: None,
            cache_only: false,
            scan: ScanConfig {
                batch_cap: DEFAULT_SCAN_BATCH_CAP,
                poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
                initial_poll_interval_secs: DEFAULT_INITIAL_POLL_INTERVAL_SECS,
                initial_scan_days: DEFAULT_INITIAL_SCAN_DAYS,
            },
            subject_gate: SubjectGateMode::Off,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            dlq_max_deliveries: DEFAULT_DLQ_MAX_DELIVERIES,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Non-empty environment variable, trimmed.
fn var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() { None } else { Some(v) }
        }
        Err(_) => None,
    }
}

/// Truthy flag: "1", "true", "yes" (case-insensitive).
fn bool_var(name: &str) -> bool {
    var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Parse a variable with a default when unset.
fn parsed_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}

/// All-or-nothing pair of variables.
fn group2(
    a: (&'static str, Option<String>),
    b: (&'static str, Option<String>),
) -> Result<Option<(String, String)>, ConfigError> {
    match (a.1, b.1) {
        (Some(x), Some(y)) => Ok(Some((x, y))),
        (None, None) => Ok(None),
        (None, Some(_)) => Err(ConfigError::MissingVar { name: a.0 }),
        (Some(_), None) => Err(ConfigError::MissingVar { name: b.0 }),
    }
}

/// All-or-nothing triple of variables.
fn group3(
    a: (&'static str, Option<String>),
    b: (&'static str, Option<String>),
    c: (&'static str, Option<String>),
) -> Result<Option<(String, String, String)>, ConfigError> {
    match (a.1, b.1, c.1) {
        (None, None, None) => Ok(None),
        (Some(x), Some(y), Some(z)) => Ok(Some((x, y, z))),
        (None, _, _) => Err(ConfigError::MissingVar { name: a.0 }),
        (_, None, _) => Err(ConfigError::MissingVar { name: b.0 }),
        (_, _, None) => Err(ConfigError::MissingVar { name: c.0 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_format() {
        let broker = BrokerConfig {
            host: "redis.internal".into(),
            port: 6380,
        };
        assert_eq!(broker.url(), "redis://redis.internal:6380/");
    }

    #[test]
    fn scan_interval_switches_on_phase() {
        let scan = ScanConfig {
            batch_cap: 100,
            poll_interval_secs: 30,
            initial_poll_interval_secs: 60,
            initial_scan_days: 450,
        };
        assert_eq!(scan.interval(true), Duration::from_secs(60));
        assert_eq!(scan.interval(false), Duration::from_secs(30));
    }

    #[test]
    fn group2_all_or_nothing() {
        assert!(group2(("A", None), ("B", None)).unwrap().is_none());
        assert!(group2(("A", Some("x".into())), ("B", Some("y".into()))).unwrap().is_some());
        assert!(group2(("A", Some("x".into())), ("B", None)).is_err());
    }

    #[test]
    fn group3_reports_first_missing() {
        let err = group3(
            ("A", Some("x".into())),
            ("B", None),
            ("C", Some("z".into())),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { name: "B" }));
    }

    #[test]
    fn missing_collaborators_surface_on_demand() {
        let config = Config::for_tests();
        assert!(config.imap().is_err());
        assert!(config.storage().is_err());
        assert!(config.llm().is_err());
        assert!(config.embed().is_err());
    }
}
