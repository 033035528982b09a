//! Content filter: decides whether a post is worth a reply.
//!
//! Pure and deterministic. The same text always yields the same verdict.

use std::fmt;
use std::sync::Arc;

use crate::config::FilterConfig;

/// Why a post was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Matched a configured blocklist term.
    Blocklist(String),
    /// Mostly non-Latin script while a Latin ratio is required.
    Language,
    /// Too short, link/mention only, or shouting.
    LowSignal,
    /// Retweet- or reply-shaped text.
    NotGenuine,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocklist(term) => write!(f, "blocklist:{}", term),
            Self::Language => write!(f, "language"),
            Self::LowSignal => write!(f, "low-signal"),
            Self::NotGenuine => write!(f, "not-genuine"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Pluggable "is this a genuine post" check.
pub trait GenuinePostHeuristic: Send + Sync {
    fn is_genuine(&self, text: &str) -> bool;
}

/// Rejects retweets and text shaped like a reply to someone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeHeuristic;

impl GenuinePostHeuristic for ShapeHeuristic {
    fn is_genuine(&self, text: &str) -> bool {
        let text = text.trim_start();
        let lower = text.to_lowercase();
        !(lower.starts_with("rt @")
            || lower.starts_with("replying to")
            || text.starts_with('@'))
    }
}

#[derive(Clone)]
pub struct ContentFilter {
    blocklist: Vec<String>,
    min_chars: usize,
    shouting_min_chars: usize,
    min_latin_ratio: Option<f64>,
    heuristic: Arc<dyn GenuinePostHeuristic>,
}

impl fmt::Debug for ContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentFilter")
            .field("blocklist", &self.blocklist)
            .field("min_chars", &self.min_chars)
            .field("shouting_min_chars", &self.shouting_min_chars)
            .field("min_latin_ratio", &self.min_latin_ratio)
            .finish()
    }
}

impl ContentFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            blocklist: config
                .blocklist
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            min_chars: config.min_chars,
            shouting_min_chars: config.shouting_min_chars,
            min_latin_ratio: config.min_latin_ratio,
            heuristic: Arc::new(ShapeHeuristic),
        }
    }

    /// Swap in a different genuine-post heuristic.
    pub fn with_heuristic(mut self, heuristic: Arc<dyn GenuinePostHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    pub fn check(&self, text: &str) -> Verdict {
        if let Some(term) = self.blocklisted_term(text) {
            return Verdict::Reject(RejectReason::Blocklist(term.to_string()));
        }
        if self.is_low_signal(text) {
            return Verdict::Reject(RejectReason::LowSignal);
        }
        if let Some(min_ratio) = self.min_latin_ratio {
            if latin_ratio(text) < min_ratio {
                return Verdict::Reject(RejectReason::Language);
            }
        }
        if !self.heuristic.is_genuine(text) {
            return Verdict::Reject(RejectReason::NotGenuine);
        }
        Verdict::Accept
    }

    /// First blocklist term contained in `text`, case-insensitively.
    pub fn blocklisted_term(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.blocklist
            .iter()
            .find(|term| lower.contains(term.as_str()))
            .map(|t| t.as_str())
    }

    fn is_low_signal(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.min_chars {
            return true;
        }

        // Nothing left once links and mentions are removed.
        let has_content = trimmed.split_whitespace().any(|word| {
            !(word.starts_with("http://")
                || word.starts_with("https://")
                || word.starts_with("www.")
                || word.starts_with('@'))
        });
        if !has_content {
            return true;
        }

        let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
        trimmed.chars().count() > self.shouting_min_chars
            && !letters.is_empty()
            && letters.iter().all(|c| !c.is_lowercase())
            && letters.iter().any(|c| c.is_uppercase())
    }
}

/// Share of alphabetic characters that are ASCII Latin letters. Text without
/// letters counts as fully Latin.
fn latin_ratio(text: &str) -> f64 {
    let (latin, total) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(latin, total), c| {
            (latin + usize::from(c.is_ascii_alphabetic()), total + 1)
        });
    if total == 0 {
        return 1.0;
    }
    latin as f64 / total as f64
}
