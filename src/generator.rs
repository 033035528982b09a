//! Reply generation: one model call per attempt, then cleanup and validation.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::filter::ContentFilter;
use crate::llm::{LLMClient, LLMError, END_OF_TURN};
use crate::post::Post;

/// Classified generation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out: {0}")]
    Timeout(String),
    #[error("generation quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("malformed generation response: {0}")]
    MalformedResponse(String),
}

impl GenerationError {
    /// Short tag stored in history records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    QuotaExceeded,
    MalformedResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::QuotaExceeded => write!(f, "quota-exceeded"),
            Self::MalformedResponse => write!(f, "malformed-response"),
        }
    }
}

impl From<LLMError> for GenerationError {
    fn from(e: LLMError) -> Self {
        match e {
            LLMError::Timeout(msg) | LLMError::Unreachable(msg) => GenerationError::Timeout(msg),
            LLMError::Api { status, message } if status >= 500 => {
                GenerationError::Timeout(format!("{}: {}", status, message))
            }
            LLMError::Quota { status } => GenerationError::QuotaExceeded(format!("HTTP {}", status)),
            other => GenerationError::MalformedResponse(other.to_string()),
        }
    }
}

/// Produces a reply for a post. Each call is exactly one attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, post: &Post) -> Result<String, GenerationError>;
}

/// Generator backed by an LLM with a fixed persona.
pub struct LlmReplyGenerator {
    client: LLMClient,
    persona: String,
    blocklist: ContentFilter,
    max_reply_chars: usize,
    min_reply_chars: usize,
    max_tokens: u32,
}

impl LlmReplyGenerator {
    pub fn new(client: LLMClient, config: &GeneratorConfig, filter: ContentFilter) -> Self {
        Self {
            client,
            persona: config.persona.clone(),
            blocklist: filter,
            max_reply_chars: config.max_reply_chars,
            min_reply_chars: config.min_reply_chars,
            max_tokens: config.max_tokens,
        }
    }

    fn prompt(post: &Post) -> String {
        format!(
            "Post by @{} to reply to:\n\"{}\"\n\nWrite the reply as a software engineer would:",
            post.author, post.text
        )
    }

    /// Clean raw model output and check it is postable.
    pub fn finalize(&self, raw: &str) -> Result<String, GenerationError> {
        let reply = truncate_reply(&clean_reply(raw), self.max_reply_chars);

        let len = reply.chars().count();
        if len < self.min_reply_chars {
            return Err(GenerationError::MalformedResponse(format!(
                "reply too short ({} chars)",
                len
            )));
        }
        if let Some(term) = self.blocklist.blocklisted_term(&reply) {
            return Err(GenerationError::MalformedResponse(format!(
                "reply contains blocklisted term {:?}",
                term
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ReplyGenerator for LlmReplyGenerator {
    async fn generate(&self, post: &Post) -> Result<String, GenerationError> {
        debug!(post_id = %post.id, model = %self.client.model(), "generating reply");
        let response = self
            .client
            .complete(&Self::prompt(post), Some(&self.persona), self.max_tokens)
            .await?;

        let reply = self.finalize(&response.content)?;
        info!(post_id = %post.id, chars = reply.chars().count(), reply = %reply, "reply generated");
        Ok(reply)
    }
}

const STRIP_PREFIXES: [&str; 4] = ["reply:", "response:", "here's", "here is"];

/// Strip template tokens, wrapping quotes, chatty prefixes and emoji.
pub fn clean_reply(raw: &str) -> String {
    let mut reply = raw.replace(END_OF_TURN, "").trim().to_string();

    for quote in ['"', '\''] {
        if reply.len() >= 2 && reply.starts_with(quote) && reply.ends_with(quote) {
            reply = reply[1..reply.len() - 1].trim().to_string();
        }
    }

    for prefix in STRIP_PREFIXES {
        let matches = reply
            .get(..prefix.len())
            .map(|head| head.eq_ignore_ascii_case(prefix))
            .unwrap_or(false);
        if matches {
            reply = reply[prefix.len()..].trim_start().to_string();
            if let Some(rest) = reply.strip_prefix(':') {
                reply = rest.trim_start().to_string();
            }
        }
    }

    let without_emoji: String = reply.chars().filter(|c| !is_emoji(*c)).collect();
    // Emoji removal can leave doubled spaces behind.
    without_emoji.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bound `reply` to `max_chars`, preferring the last sentence end before the limit.
pub fn truncate_reply(reply: &str, max_chars: usize) -> String {
    if reply.chars().count() <= max_chars {
        return reply.to_string();
    }
    let head: String = reply.chars().take(max_chars.saturating_sub(3)).collect();
    match head.rfind('.') {
        Some(idx) => head[..=idx].to_string(),
        None => format!("{}...", head),
    }
}

fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, flags
            | 0x2600..=0x27BF // misc symbols, dingbats
            | 0x2B00..=0x2BFF // arrows and stars
            | 0xFE00..=0xFE0F // variation selectors
            | 0x200D          // zero-width joiner
    )
}
