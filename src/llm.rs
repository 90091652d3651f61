//! LLM client abstraction: trait + HTTP messages-API implementation + mock.
//!
//! The pipeline uses the LLM for three things: the poller's subject gate, the
//! classifier's structured extraction, and watcher prototype expansion. All
//! three send a single user prompt with JSON-only instructions and parse the
//! reply with [`extract_json`].

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Per-request deadline.
const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion budget for extraction replies.
const MAX_TOKENS: u32 = 1000;

/// Low-but-nonzero sampling temperature for extraction.
const TEMPERATURE: f64 = 0.3;

/// Fenced ```json blocks, the preferred reply shape.
static RE_JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

/// Result type for LLM operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

// ── LlmClient trait ─────────────────────────────────────────────────────

/// Capability surface over the LLM: one prompt in, one text reply out.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> LlmResult<String>;
}

// ── extract_json ────────────────────────────────────────────────────────

/// Pull a JSON value out of an LLM reply.
///
/// Tries a fenced ```json block first, then falls back to the outermost
/// `{...}` span. Models asked for JSON-only still wrap it in fences or prose
/// often enough that both paths matter.
pub fn extract_json(text: &str) -> LlmResult<serde_json::Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(LlmError::NoJson);
    }

    let candidate = if let Some(caps) = RE_JSON_FENCE.captures(trimmed) {
        caps.get(1).map(|m| m.as_str()).unwrap_or_default()
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => return Err(LlmError::NoJson),
        }
    };

    serde_json::from_str(candidate).map_err(|e| LlmError::BadJson {
        message: e.to_string(),
    })
}

// ── HttpLlmClient ───────────────────────────────────────────────────────

/// Messages-API client over sync HTTP.
pub struct HttpLlmClient {
    config: LlmConfig,
    agent: ureq::Agent,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(LLM_TIMEOUT).build();
        Self { config, agent }
    }

    /// The model identifier in use.
    pub fn model(&self) -> &str {
        &self.config.model
    }
}

impl std::fmt::Debug for HttpLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl LlmClient for HttpLlmClient {
    fn complete(&self, prompt: &str) -> LlmResult<String> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .agent
            .post(&url)
            .set("x-api-key", &self.config.api_key)
            .set("anthropic-version", "2023-06-01")
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|e| match e {
                ureq::Error::Status(401 | 403, _) => LlmError::Authentication,
                other => LlmError::RequestFailed {
                    message: other.to_string(),
                },
            })?;

        let json: serde_json::Value =
            resp.into_json().map_err(|e| LlmError::RequestFailed {
                message: format!("response read failed: {e}"),
            })?;

        // Concatenate the text blocks of the reply.
        let text = json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(text)
    }
}

// ── MockLlm ─────────────────────────────────────────────────────────────

/// Scripted LLM for unit testing.
///
/// Pushed responses are consumed in order; once drained, every call returns
/// the constant fallback. All received prompts are recorded for assertions.
#[derive(Debug)]
pub struct MockLlm {
    queue: Mutex<VecDeque<LlmResult<String>>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    /// Mock answering every prompt with `fallback`.
    pub fn answering(fallback: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot response ahead of the fallback.
    pub fn push_response(&self, response: impl Into<String>) {
        self.queue.lock().unwrap().push_back(Ok(response.into()));
    }

    /// Queue a one-shot error ahead of the fallback.
    pub fn push_error(&self, error: LlmError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    /// All prompts seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlm {
    fn complete(&self, prompt: &str) -> LlmResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.queue.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(self.fallback.clone()),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
