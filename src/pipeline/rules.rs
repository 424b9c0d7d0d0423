//! Local policy rules: the fallback evaluator.
//!
//! Always available, no I/O. Used whenever the classifier is skipped
//! (circuit open, rate limited) or fails.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{Outcome, Verdict};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhttps?://\S+|\bwww\.\S+").expect("static regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)@\w{2,}").expect("static regex"));

/// Policy rule set, loadable from TOML.
///
/// ```toml
/// block_terms = ["buy followers", "free crypto"]
/// review_terms = ["dm me"]
/// max_links = 3
/// max_mentions = 5
/// max_caps_ratio = 0.8
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    /// Case-insensitive substrings that block outright.
    pub block_terms: Vec<String>,
    /// Case-insensitive substrings that flag for review.
    pub review_terms: Vec<String>,
    /// More links than this flags for review.
    pub max_links: usize,
    /// More mentions than this flags for review.
    pub max_mentions: usize,
    /// Share of uppercase letters above which a long message is "shouting".
    pub max_caps_ratio: f32,
    /// Shouting is only judged on messages with at least this many letters.
    pub caps_min_letters: usize,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            block_terms: [
                "buy followers",
                "free crypto",
                "crypto giveaway",
                "double your bitcoin",
                "onlyfans.com",
                "t.me/joinchat",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            review_terms: ["dm me", "click here", "limited offer", "earn money fast"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_links: 3,
            max_mentions: 5,
            max_caps_ratio: 0.8,
            caps_min_letters: 20,
        }
    }
}

impl PolicyRules {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut rules: PolicyRules = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad policy rules: {e}")))?;
        rules.normalize();
        Ok(rules)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read policy rules {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn normalize(&mut self) {
        for term in self.block_terms.iter_mut().chain(self.review_terms.iter_mut()) {
            *term = term.to_lowercase();
        }
    }

    /// Evaluate `text` against the rules.
    pub fn evaluate(&self, text: &str) -> Verdict {
        let lowered = text.to_lowercase();

        let blocked: Vec<&String> = self
            .block_terms
            .iter()
            .filter(|t| !t.is_empty() && lowered.contains(t.as_str()))
            .collect();
        if !blocked.is_empty() {
            let mut verdict = Verdict::new(Outcome::Block, 0.9, "matched blocked term");
            for term in blocked {
                verdict = verdict.with_rule(format!("block_term:{term}"));
            }
            return verdict.with_score("policy", 1.0);
        }

        let mut flags = Vec::new();
        for term in &self.review_terms {
            if !term.is_empty() && lowered.contains(term.as_str()) {
                flags.push(format!("review_term:{term}"));
            }
        }

        let links = URL_RE.find_iter(text).count();
        if links > self.max_links {
            flags.push(format!("link_flood:{links}"));
        }

        let mentions = MENTION_RE.find_iter(text).count();
        if mentions > self.max_mentions {
            flags.push(format!("mention_flood:{mentions}"));
        }

        let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.len() >= self.caps_min_letters {
            let upper = letters.iter().filter(|c| c.is_uppercase()).count();
            let ratio = upper as f32 / letters.len() as f32;
            if ratio > self.max_caps_ratio {
                flags.push("shouting".to_string());
            }
        }

        if flags.is_empty() {
            return Verdict::new(Outcome::Allow, 0.6, "no policy rule matched")
                .with_score("policy", 0.0);
        }

        let score = (flags.len() as f32 * 0.35).min(1.0);
        let mut verdict = Verdict::new(Outcome::Review, 0.5 + score / 2.0, "matched review rule");
        for flag in flags {
            verdict = verdict.with_rule(flag);
        }
        verdict.with_score("policy", score)
    }
}
