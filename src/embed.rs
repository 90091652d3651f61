//! Embedding client abstraction: trait + HTTP implementation + mock, plus the
//! cosine helpers the routing decision is written in terms of.
//!
//! Vectors are fixed-dimension `f32`; the dimension is a property of the
//! configured model and must match what the watcher prototypes were embedded
//! with — a mismatch is a permanent error, not a retry.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::EmbedConfig;
use crate::error::EmbedError;

/// Per-request deadline.
const EMBED_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for embedding operations.
pub type EmbedResult<T> = std::result::Result<T, EmbedError>;

// ── EmbeddingClient trait ───────────────────────────────────────────────

/// Capability surface over the embedding service.
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, one vector per text, in order.
    fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed_one(&self, text: &str) -> EmbedResult<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string()))?;
        vectors.pop().ok_or_else(|| EmbedError::BadResponse {
            message: "empty embedding batch".to_string(),
        })
    }
}

// ── Cosine helpers ──────────────────────────────────────────────────────

/// Cosine distance `1 − cos(a, b)`, in `[0, 2]`.
///
/// A zero-norm vector carries no direction; its distance to anything is 1
/// (similarity 0), which routes nowhere.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> EmbedResult<f64> {
    if a.len() != b.len() {
        return Err(EmbedError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }
    Ok(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Routing similarity from a cosine distance.
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 - distance
}

// ── HttpEmbeddingClient ─────────────────────────────────────────────────

/// Embeddings-API client over sync HTTP.
pub struct HttpEmbeddingClient {
    config: EmbedConfig,
    agent: ureq::Agent,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbedConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(EMBED_TIMEOUT).build();
        Self { config, agent }
    }
}

impl std::fmt::Debug for HttpEmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl EmbeddingClient for HttpEmbeddingClient {
    fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/embeddings", self.config.base_url);
        let body = serde_json::json!({
            "input": texts,
            "model": self.config.model,
        });

        let resp = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|e| match e {
                ureq::Error::Status(401 | 403, _) => EmbedError::Authentication,
                other => EmbedError::RequestFailed {
                    message: other.to_string(),
                },
            })?;

        let json: serde_json::Value =
            resp.into_json().map_err(|e| EmbedError::RequestFailed {
                message: format!("response read failed: {e}"),
            })?;

        let data = json["data"].as_array().ok_or_else(|| EmbedError::BadResponse {
            message: "missing data array".to_string(),
        })?;

        let mut vectors = Vec::with_capacity(data.len());
        for row in data {
            let embedding = row["embedding"]
                .as_array()
                .ok_or_else(|| EmbedError::BadResponse {
                    message: "row missing embedding".to_string(),
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            vectors.push(embedding);
        }

        if vectors.len() != texts.len() {
            return Err(EmbedError::BadResponse {
                message: format!("asked for {} vectors, got {}", texts.len(), vectors.len()),
            });
        }
        Ok(vectors)
    }
}

// ── MockEmbedder ────────────────────────────────────────────────────────

/// Dimension of mock vectors.
const MOCK_DIM: usize = 32;

/// Keyword buckets: texts sharing a topic land on the same leading axis, so
/// topic overlap maps to high cosine similarity without any service call.
const TOPIC_AXES: [&[&str]; 4] = [
    &[
        "invoice", "payment", "receipt", "billing", "charged", "amount",
        "subscription", "renewal",
    ],
    &[
        "flight", "airline", "boarding", "departure", "itinerary", "booking",
    ],
    &["newsletter", "digest", "weekly", "unsubscribe", "roundup"],
    &["interview", "recruiter", "position", "offer", "application"],
];

/// Weight of the generic hashed-token tail relative to a topic hit.
const TOKEN_WEIGHT: f32 = 0.25;

/// Deterministic in-process embedder for unit testing.
///
/// Same text → same vector, topic-sharing texts → similar vectors. The call
/// counter lets tests assert that cache-only mode performs no embedding.
#[derive(Debug, Default)]
pub struct MockEmbedder {
    calls: AtomicUsize,
    embedded: Mutex<Vec<String>>,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `embed` calls observed.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// All texts embedded so far.
    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded.lock().unwrap().clone()
    }

    /// The deterministic vector for `text` without counting as a call.
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; MOCK_DIM];
        for token in text
            .to_ascii_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 2)
        {
            let mut hit_topic = false;
            for (axis, keywords) in TOPIC_AXES.iter().enumerate() {
                if keywords.contains(&token) {
                    vector[axis] += 1.0;
                    hit_topic = true;
                }
            }
            if !hit_topic {
                let axis = TOPIC_AXES.len() + token_bucket(token);
                vector[axis] += TOKEN_WEIGHT;
            }
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn token_bucket(token: &str) -> usize {
    let mut h: usize = 0;
    for b in token.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as usize);
    }
    h % (MOCK_DIM - TOPIC_AXES.len())
}

impl EmbeddingClient for MockEmbedder {
    fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
