//! Content canonicalization and fingerprinting.
//!
//! Two messages that differ only in case, spacing, URL casing, or the order
//! of their links/mentions/hashtags must produce the same cache key. The key
//! is a SHA-256 digest so no message text leaks through it.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhttps?://[^\s<>]+").expect("static regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)@(\w{2,})").expect("static regex"));
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)#(\w+)").expect("static regex"));

/// Normalized view of a message used for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalContent {
    pub text: String,
    pub urls: Vec<String>,
    pub mentions: Vec<String>,
    pub hashtags: Vec<String>,
}

impl CanonicalContent {
    /// Hex SHA-256 over the normalized text and the sorted, deduplicated
    /// entity lists. Field separators keep `("ab", [])` and `("a", ["b"])`
    /// from colliding.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        for list in [&self.urls, &self.mentions, &self.hashtags] {
            hasher.update([0x1e]);
            let mut sorted: Vec<&str> = list.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            for item in sorted {
                hasher.update(item.as_bytes());
                hasher.update([0x1f]);
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Normalizes raw message text before hashing.
pub trait Canonicalizer: Send + Sync {
    fn canonicalize(&self, text: &str) -> CanonicalContent;
}

/// Lowercases, collapses whitespace, and extracts URLs, @mentions and
/// #hashtags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCanonicalizer;

impl Canonicalizer for BasicCanonicalizer {
    fn canonicalize(&self, text: &str) -> CanonicalContent {
        let urls = URL_RE
            .find_iter(text)
            .map(|m| {
                m.as_str()
                    .trim_end_matches(['.', ',', ')', '!', '?', ';', ':'])
                    .trim_end_matches('/')
                    .to_lowercase()
            })
            .collect();
        let mentions = MENTION_RE
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .collect();
        let hashtags = HASHTAG_RE
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .collect();

        let text = text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        CanonicalContent {
            text,
            urls,
            mentions,
            hashtags,
        }
    }
}
