//! MIME normalization: raw RFC 5322 bytes → clean text + body fingerprint.
//!
//! Uses `mail-parser` for MIME conformance, prefers `text/plain`, falls back
//! to a regex HTML-to-text conversion, strips tracking URLs and pixels, and
//! fingerprints the result with SHA-256. The fingerprint is computed over the
//! full cleaned text; only the published `text_content` is truncated.

use std::sync::LazyLock;

use mail_parser::MessageParser;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::NormalizeError;

static RE_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());

static RE_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// `<img ... src="...track..." ...>` tracking pixels, removed before tag
/// stripping so the URL never reaches the text.
static RE_TRACKING_IMG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]*src=["'][^"']*track[^"']*["'][^>]*>"#).unwrap()
});

/// URLs carrying `utm_` campaign parameters.
static RE_UTM_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S*utm_[^\s)]*").unwrap());

/// 1×1 pixel beacon URLs.
static RE_PIXEL_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S*1x1[^\s)]*").unwrap());

// ── CleanEmail ──────────────────────────────────────────────────────────

/// Result of normalizing one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanEmail {
    /// Full cleaned text (untruncated).
    pub text: String,
    /// `sha256(text)` as lowercase hex.
    pub body_hash: String,
}

// ── Header summary (used by the poller) ─────────────────────────────────

/// The headers the poller needs before the body is ever normalized.
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub subject: String,
    pub from: String,
    /// RFC 5322 Message-ID when present.
    pub message_id: Option<String>,
    /// Date header as seconds since epoch.
    pub date: Option<u64>,
}

/// Parse just the headers of a raw message.
///
/// Returns `None` when the bytes are not parseable MIME at all.
pub fn summarize(raw: &[u8]) -> Option<MessageSummary> {
    let message = MessageParser::default().parse(raw)?;

    let from = message
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .unwrap_or("unknown@unknown")
        .to_string();

    Some(MessageSummary {
        subject: message.subject().unwrap_or_default().to_string(),
        from,
        message_id: message.message_id().map(|s| s.to_string()),
        date: message.date().map(|dt| dt.to_timestamp().max(0) as u64),
    })
}

// ── normalize ───────────────────────────────────────────────────────────

/// Normalize a raw message into clean text and its fingerprint.
///
/// Prefers the plain-text body; an HTML-only message is converted. The same
/// input always yields the same `body_hash`.
pub fn normalize(raw: &[u8]) -> Result<CleanEmail, NormalizeError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(NormalizeError::Parse { bytes: raw.len() })?;

    let text = match message.body_text(0) {
        Some(plain) => plain.to_string(),
        None => html_to_text(message.body_html(0).as_deref().unwrap_or_default()),
    };

    let text = strip_trackers(&text);
    let body_hash = hex::encode(Sha256::digest(text.as_bytes()));

    Ok(CleanEmail { text, body_hash })
}

/// Convert an HTML body to plain text.
///
/// Drops script/style blocks and tracking pixels, removes the remaining tags,
/// decodes the common named entities, and collapses whitespace runs.
pub fn html_to_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let html = RE_SCRIPT.replace_all(html, "");
    let html = RE_STYLE.replace_all(&html, "");
    let html = RE_TRACKING_IMG.replace_all(&html, "");
    let text = RE_TAG.replace_all(&html, "");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");

    RE_WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Remove tracking URLs from already-extracted text.
pub fn strip_trackers(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = RE_UTM_URL.replace_all(text, "");
    let text = RE_PIXEL_URL.replace_all(&text, "");
    text.trim().to_string()
}

/// First `max` characters of `s` (not bytes — never splits a code point).
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TEXT_CONTENT_MAX;

    const PLAIN_EMAIL: &str = "\
From: Netflix <info@netflix.com>\r\n\
To: alice@gmail.com\r\n\
Subject: Your Netflix receipt\r\n\
Message-ID: <receipt-1@netflix.com>\r\n\
Date: Sat, 20 Nov 2021 14:22:01 -0800\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Thanks for your payment. amount $15.99 was charged.\r\n";

    const HTML_EMAIL: &str = "\
From: promo@shop.example\r\n\
To: alice@gmail.com\r\n\
Subject: Sale\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><head><style>p { color: red; }</style></head>\r\n\
<body><script>var x = 1;</script>\r\n\
<p>Big &amp; small &lt;deals&gt;&nbsp;today</p>\r\n\
<img src=\"https://shop.example/track/open.gif\" width=\"1\" height=\"1\">\r\n\
Visit https://shop.example/sale?utm_source=mail now.\r\n\
</body></html>\r\n";

    #[test]
    fn plain_body_passes_through() {
        let clean = normalize(PLAIN_EMAIL.as_bytes()).unwrap();
        assert!(clean.text.contains("amount $15.99"));
        assert_eq!(clean.body_hash.len(), 64);
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = normalize(PLAIN_EMAIL.as_bytes()).unwrap();
        let b = normalize(PLAIN_EMAIL.as_bytes()).unwrap();
        assert_eq!(a.body_hash, b.body_hash);
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn html_only_body_is_converted_and_non_empty() {
        let clean = normalize(HTML_EMAIL.as_bytes()).unwrap();
        assert!(!clean.text.is_empty());
        assert!(clean.text.contains("Big & small <deals> today"));
        // Tags and scripts are gone.
        assert!(!clean.text.contains('<') || !clean.text.contains("script"));
    }

    #[test]
    fn trackers_are_stripped() {
        let clean = normalize(HTML_EMAIL.as_bytes()).unwrap();
        assert!(!clean.text.contains("utm_source"));
        assert!(!clean.text.contains("track/open.gif"));
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        let err = normalize(b"").unwrap_err();
        assert!(matches!(err, NormalizeError::Parse { bytes: 0 }));
    }

    #[test]
    fn html_entities_decode_in_order() {
        assert_eq!(html_to_text("a&nbsp;&amp;&nbsp;b"), "a & b");
        assert_eq!(html_to_text("&lt;tag&gt;"), "<tag>");
        assert_eq!(html_to_text("say &quot;hi&quot;"), "say \"hi\"");
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert_eq!(html_to_text("<p>one</p>\n\n\t<p>two</p>"), "one two");
    }

    #[test]
    fn pixel_urls_are_removed_from_text() {
        let text = "see https://cdn.example/img/1x1.gif?u=5 end";
        assert_eq!(strip_trackers(text), "see  end");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld".repeat(200);
        let t = truncate_chars(&s, TEXT_CONTENT_MAX);
        assert_eq!(t.chars().count(), TEXT_CONTENT_MAX);
        // Still valid UTF-8 by construction; the prefix matches.
        assert!(s.starts_with(&t));
    }

    #[test]
    fn summarize_extracts_headers() {
        let summary = summarize(PLAIN_EMAIL.as_bytes()).unwrap();
        assert_eq!(summary.subject, "Your Netflix receipt");
        assert_eq!(summary.from, "info@netflix.com");
        assert_eq!(summary.message_id.as_deref(), Some("receipt-1@netflix.com"));
        assert!(summary.date.is_some());
    }
}
